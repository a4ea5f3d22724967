//! Separation-style byte memory.
//!
//! The memory component of a program-point annotation is a set of
//! points-to assertions `address byte ↦ value byte`, where a byte names
//! one of the four bytes of the 32-bit cell addressed (or produced) by
//! a variable. A store writes four consecutive assertions; a load reads
//! them back and only succeeds when all four agree on the same source
//! variable. Anything else is top: the absence of an assertion means
//! nothing is known about that byte.

use std::collections::BTreeMap;
use std::fmt;

use crate::ssa::Var;

pub const BYTES_PER_CELL: u8 = 4;

/// One byte of the cell associated with a variable. Address bytes carry
/// the static offset of the access; value bytes have offset 0.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemByte {
    pub base: Var,
    pub offset: u64,
    pub idx: u8,
}

impl fmt::Display for MemByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset != 0 {
            write!(f, "{}+{}@{}", self.base, self.offset, self.idx)
        } else {
            write!(f, "{}@{}", self.base, self.idx)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SymMemory {
    points_to: BTreeMap<MemByte, MemByte>,
}

impl SymMemory {
    pub fn new() -> SymMemory {
        SymMemory::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points_to.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MemByte, &MemByte)> {
        self.points_to.iter()
    }

    /// Record a 32-bit store of `value` at `addr + offset`, one
    /// assertion per byte. Later stores to the same address shadow
    /// earlier ones.
    pub fn store(&mut self, addr: Var, offset: u64, value: Var) {
        for idx in 0..BYTES_PER_CELL {
            self.points_to.insert(
                MemByte { base: addr.clone(), offset, idx },
                MemByte { base: value.clone(), offset: 0, idx },
            );
        }
    }

    /// Read the cell at `addr + offset`: all four bytes must be present
    /// and agree on the same source variable, byte for byte.
    pub fn load(&self, addr: &Var, offset: u64) -> Option<Var> {
        let mut source: Option<Var> = None;
        for idx in 0..BYTES_PER_CELL {
            let got = self.points_to.get(&MemByte { base: addr.clone(), offset, idx })?;
            if got.idx != idx {
                return None;
            }
            match &source {
                None => source = Some(got.base.clone()),
                Some(v) if *v == got.base => {}
                Some(_) => return None,
            }
        }
        source
    }

    /// Join: keep assertions both sides agree on (or only one side
    /// knows); a conflicting address byte falls to top by dropping the
    /// assertion.
    pub fn join(&self, other: &SymMemory) -> SymMemory {
        let mut points_to = self.points_to.clone();
        for (k, v) in &other.points_to {
            match points_to.get(k) {
                None => {
                    points_to.insert(k.clone(), v.clone());
                }
                Some(existing) if existing == v => {}
                Some(_) => {
                    points_to.remove(k);
                }
            }
        }
        SymMemory { points_to }
    }

    /// Every variable appearing as a store address in the formula.
    pub fn addresses(&self) -> Vec<Var> {
        let mut out: Vec<Var> = self.points_to.keys().map(|b| b.base.clone()).collect();
        out.dedup();
        out
    }
}

impl fmt::Display for SymMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.points_to {
            if !first {
                write!(f, " * ")?;
            }
            write!(f, "{k}↦{v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::Label;

    fn var(id: u32) -> Var {
        Var::Instr(Label::function(id))
    }

    #[test]
    fn store_then_load_round_trips() {
        let mut mem = SymMemory::new();
        mem.store(var(0), 0, var(1));
        assert_eq!(mem.load(&var(0), 0), Some(var(1)));
        assert_eq!(mem.load(&var(0), 4), None);
        assert_eq!(mem.load(&var(9), 0), None);
    }

    #[test]
    fn later_store_shadows() {
        let mut mem = SymMemory::new();
        mem.store(var(0), 0, var(1));
        mem.store(var(0), 0, var(2));
        assert_eq!(mem.load(&var(0), 0), Some(var(2)));
    }

    #[test]
    fn join_is_commutative_idempotent_and_drops_conflicts() {
        let mut a = SymMemory::new();
        a.store(var(0), 0, var(1));
        a.store(var(5), 0, var(6));
        let mut b = SymMemory::new();
        b.store(var(0), 0, var(2));
        b.store(var(7), 0, var(8));

        assert_eq!(a.join(&a), a);
        assert_eq!(a.join(&b), b.join(&a));

        let joined = a.join(&b);
        // Conflict at var(0) falls to top; the one-sided facts survive.
        assert_eq!(joined.load(&var(0), 0), None);
        assert_eq!(joined.load(&var(5), 0), Some(var(6)));
        assert_eq!(joined.load(&var(7), 0), Some(var(8)));
    }
}
