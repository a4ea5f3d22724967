//! Store→load may-alias dependences.
//!
//! A store is a predecessor of a load when its abstract byte range
//! cannot be distinguished from the load's: addresses are resolved to
//! symbolic expressions and compared after simplification, constant
//! ranges are checked for overlap, and anything unresolvable is
//! conservatively included.

use std::collections::{BTreeMap, BTreeSet};

use crate::cfg::{BlockContent, BlockIdx, Cfg};
use crate::error::Result;
use crate::instr::{Data, InstrKind};
use crate::label::Label;
use crate::ssa::{Var, VarState};
use crate::types::MemOp;
use crate::value::{Sym, SymOp};

const RESOLVE_DEPTH: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq)]
enum MemOpKind {
    Load,
    Store,
}

/// A memory access site: its label plus the resolved address and width.
struct Access {
    label: Label,
    block: BlockIdx,
    pos_in_block: usize,
    addr: Option<Sym>,
    offset: u64,
    width: u64,
}

fn access_width(op: &MemOp) -> u64 {
    match op.pack {
        Some((size, _)) => (size.bits() / 8) as u64,
        None => match op.typ {
            crate::types::ValType::I32 => 4,
            crate::types::ValType::I64 => 8,
        },
    }
}

/// Resolve the symbolic address a variable stands for, chasing plain
/// data definitions. Merge vars and anything deeper than the budget
/// stay unresolved.
fn resolve_var(cfg: &Cfg<VarState>, var: &Var, depth: usize) -> Option<Sym> {
    if depth == 0 {
        return None;
    }
    match var {
        Var::Const(c) => Some(Sym::Const(c.as_i64())),
        Var::Local(i) => {
            if (*i as usize) < cfg.arg_types.len() {
                Some(Sym::Parameter(*i))
            } else {
                // Non-parameter locals start zeroed.
                Some(Sym::Const(0))
            }
        }
        Var::Global(i) => Some(Sym::Global(*i)),
        Var::Merge(..) | Var::Return => None,
        Var::Instr(label) => {
            let instr = cfg.find_instr(*label).ok()?;
            match &instr.kind {
                InstrKind::Data(Data::Const(c)) => Some(Sym::Const(c.as_i64())),
                InstrKind::Data(Data::Binary(b)) => {
                    let op = match b.op {
                        crate::types::BinaryKind::Add => SymOp::Add,
                        crate::types::BinaryKind::Sub => SymOp::Sub,
                        crate::types::BinaryKind::Mul => SymOp::Mul,
                        _ => return None,
                    };
                    let stack = &instr.before.vstack;
                    let n = stack.len();
                    let a = resolve_var(cfg, stack.get(n.checked_sub(2)?)?, depth - 1)?;
                    let b = resolve_var(cfg, stack.get(n - 1)?, depth - 1)?;
                    Some(Sym::op(op, a, b).simplify())
                }
                InstrKind::Data(Data::LocalGet(i)) => {
                    resolve_var(cfg, instr.before.locals.get(*i as usize)?, depth - 1)
                }
                InstrKind::Data(Data::GlobalGet(i)) => {
                    resolve_var(cfg, instr.before.globals.get(*i as usize)?, depth - 1)
                }
                InstrKind::Data(Data::LocalSet(_) | Data::LocalTee(_)) => {
                    resolve_var(cfg, instr.before.vstack.last()?, depth - 1)
                }
                InstrKind::Data(Data::Load(op)) => {
                    let addr = resolve_var(cfg, instr.before.vstack.last()?, depth - 1)?;
                    let shifted = if op.offset != 0 {
                        Sym::op(SymOp::Add, addr, Sym::Const(op.offset as i64)).simplify()
                    } else {
                        addr
                    };
                    Some(Sym::Deref(Box::new(shifted)))
                }
                _ => None,
            }
        }
    }
}

fn collect_accesses(cfg: &Cfg<VarState>, kind: MemOpKind) -> Result<Vec<Access>> {
    let mut out = Vec::new();
    for (idx, block) in &cfg.blocks {
        let BlockContent::Data(labels) = &block.content else {
            continue;
        };
        for (pos, label) in labels.iter().enumerate() {
            let instr = cfg.find_instr(*label)?;
            let op = match (&instr.kind, kind) {
                (InstrKind::Data(Data::Load(op)), MemOpKind::Load) => op,
                (InstrKind::Data(Data::Store(op)), MemOpKind::Store) => op,
                _ => continue,
            };
            // The address operand: top for loads, below the value for
            // stores.
            let stack = &instr.before.vstack;
            let addr_var = match kind {
                MemOpKind::Load => stack.last(),
                MemOpKind::Store => stack.len().checked_sub(2).and_then(|i| stack.get(i)),
            };
            out.push(Access {
                label: *label,
                block: *idx,
                pos_in_block: pos,
                addr: addr_var.and_then(|v| resolve_var(cfg, v, RESOLVE_DEPTH)),
                offset: op.offset,
                width: access_width(op),
            });
        }
    }
    Ok(out)
}

/// Whether the store may happen before the load on some path.
fn precedes(cfg: &Cfg<VarState>, store: &Access, load: &Access) -> bool {
    if store.block == load.block {
        return store.pos_in_block < load.pos_in_block;
    }
    // Forward reachability from the store's block.
    let mut seen = BTreeSet::new();
    let mut stack = vec![store.block];
    while let Some(b) = stack.pop() {
        if !seen.insert(b) {
            continue;
        }
        if b == load.block {
            return true;
        }
        for (succ, _) in cfg.successors(b) {
            stack.push(*succ);
        }
    }
    false
}

/// May the two byte ranges overlap?
fn may_overlap(store: &Access, load: &Access) -> bool {
    match (&store.addr, &load.addr) {
        (Some(Sym::Const(a)), Some(Sym::Const(b))) => {
            let s0 = *a as i128 + store.offset as i128;
            let s1 = s0 + store.width as i128;
            let l0 = *b as i128 + load.offset as i128;
            let l1 = l0 + load.width as i128;
            s0 < l1 && l0 < s1
        }
        (Some(a), Some(b)) if a == b => {
            // Same symbolic base: compare static offsets.
            let s0 = store.offset as i128;
            let s1 = s0 + store.width as i128;
            let l0 = load.offset as i128;
            let l1 = l0 + load.width as i128;
            s0 < l1 && l0 < s1
        }
        // Distinct or unresolved symbolic addresses cannot be told
        // apart; stay conservative.
        _ => true,
    }
}

/// For every load, the set of stores it may depend on.
pub fn memory_dependencies(cfg: &Cfg<VarState>) -> Result<BTreeMap<Label, BTreeSet<Label>>> {
    let loads = collect_accesses(cfg, MemOpKind::Load)?;
    let stores = collect_accesses(cfg, MemOpKind::Store)?;

    let mut deps: BTreeMap<Label, BTreeSet<Label>> = BTreeMap::new();
    for load in &loads {
        let entry = deps.entry(load.label).or_default();
        for store in &stores {
            if precedes(cfg, store, load) && may_overlap(store, load) {
                entry.insert(store.label);
            }
        }
    }
    Ok(deps)
}
