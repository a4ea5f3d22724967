//! Function summaries, the contract with the inter-procedural driver.
//!
//! A summary exposes what a callee leaves behind in its caller's terms:
//! result-stack values and a globals snapshot, both phrased over
//! `Parameter i` / `Global i` leaves that `adapt` re-keys to the call
//! site, plus a memory snapshot. The intra-procedural analysis is
//! monotone in its summary input; a map full of trivial summaries is
//! always a sound starting point.

use std::collections::BTreeMap;

use crate::memory::SymMemory;
use crate::value::{Sym, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Number of parameters the callee takes.
    pub nargs: usize,
    /// Ordered result-stack values, in the callee's naming.
    pub results: Vec<Value>,
    /// Per-global value after the call, in the callee's naming.
    pub globals: Vec<Value>,
    /// What the callee is known to leave in memory.
    pub memory: SymMemory,
}

pub type SummaryMap = BTreeMap<u32, Summary>;

impl Summary {
    /// The summary that knows nothing: top results, untouched globals.
    pub fn trivial(nargs: usize, nresults: usize, nglobals: usize) -> Summary {
        Summary {
            nargs,
            results: vec![Value::top(); nresults],
            globals: (0..nglobals as u32).map(Value::global).collect(),
            memory: SymMemory::new(),
        }
    }

    /// Instantiate the summary at a call site: `Parameter i` becomes
    /// the i-th argument value, `Global i` the caller's current global
    /// value. Returns (results, globals) in the caller's naming.
    pub fn apply(&self, args: &[Value], caller_globals: &[Value]) -> (Vec<Value>, Vec<Value>) {
        let mut subst: BTreeMap<Sym, Value> = BTreeMap::new();
        for (i, arg) in args.iter().enumerate() {
            subst.insert(Sym::Parameter(i as u32), arg.clone());
        }
        for (i, g) in caller_globals.iter().enumerate() {
            subst.insert(Sym::Global(i as u32), g.clone());
        }
        let results = self.results.iter().map(|v| v.adapt(&subst)).collect();
        let globals = self.globals.iter().map(|v| v.adapt(&subst)).collect();
        (results, globals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SymOp;

    #[test]
    fn trivial_summary_keeps_globals() {
        let s = Summary::trivial(2, 1, 2);
        let args = vec![Value::constant(1), Value::constant(2)];
        let globals = vec![Value::constant(7), Value::parameter(0)];
        let (results, new_globals) = s.apply(&args, &globals);
        assert_eq!(results, vec![Value::top()]);
        assert_eq!(new_globals, globals);
    }

    #[test]
    fn apply_substitutes_parameters() {
        let s = Summary {
            nargs: 1,
            results: vec![Value::Symbolic(Sym::op(
                SymOp::Add,
                Sym::Parameter(0),
                Sym::Const(1),
            ))],
            globals: vec![],
            memory: SymMemory::new(),
        };
        let (results, _) = s.apply(&[Value::constant(41)], &[]);
        assert_eq!(results, vec![Value::constant(42)]);
    }
}
