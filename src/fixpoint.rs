//! The intra-procedural worklist fixpoint.
//!
//! The engine is parameterised by a transfer: analyses supply their
//! state type, the per-block transfer function and the merge policy,
//! and share the iteration mechanics. Blocks are processed smallest
//! index first; a block whose joined result changed pushes its
//! successors back onto the worklist.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use log::warn;

use crate::cfg::{BasicBlock, BlockIdx, Cfg};
use crate::error::Result;

/// Outcome of transferring one basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult<S> {
    /// Block not analysed yet; the unit of `join_result`.
    Uninitialized,
    /// Straight-line block, or a control block that does not branch on
    /// a condition.
    Simple(S),
    /// A conditionally branching block: (true state, false state).
    Branch(S, S),
}

impl<S: Clone> TransferResult<S> {
    /// The states this result contributes along an edge with the given
    /// branch tag.
    pub fn flow_along(&self, tag: Option<bool>) -> Vec<S> {
        match (self, tag) {
            (TransferResult::Uninitialized, _) => Vec::new(),
            (TransferResult::Simple(s), _) => vec![s.clone()],
            (TransferResult::Branch(t, _), Some(true)) => vec![t.clone()],
            (TransferResult::Branch(_, f), Some(false)) => vec![f.clone()],
            (TransferResult::Branch(t, f), None) => vec![t.clone(), f.clone()],
        }
    }
}

/// A dataflow analysis over a CFG annotated with `A`.
pub trait Transfer<A> {
    type State: Clone + PartialEq + Debug;

    fn entry_state(&self, cfg: &Cfg<A>) -> Result<Self::State>;

    /// Merge the incoming flows into the block's in-state. Called with
    /// at least one flow.
    fn merge_flows(
        &self,
        cfg: &Cfg<A>,
        block: &BasicBlock<A>,
        flows: Vec<Self::State>,
    ) -> Result<Self::State>;

    fn transfer_block(
        &self,
        cfg: &Cfg<A>,
        block: &BasicBlock<A>,
        state: Self::State,
    ) -> Result<TransferResult<Self::State>>;

    /// How a freshly computed state absorbs the previous round's state
    /// at the same point. The default replaces; widening analyses
    /// override this with their lattice join.
    fn join_state(&self, _old: &Self::State, new: Self::State) -> Result<Self::State> {
        Ok(new)
    }
}

#[derive(Debug, Clone)]
pub struct BlockResult<S> {
    pub in_state: S,
    pub out: TransferResult<S>,
}

/// `join_result` per the result lattice: `Uninitialized` is the unit,
/// `Simple` joins pointwise, `Branch` joins componentwise, and a mixed
/// pair promotes the `Simple` side to both arms.
pub fn join_result<A, T: Transfer<A>>(
    t: &T,
    old: &TransferResult<T::State>,
    new: TransferResult<T::State>,
) -> Result<TransferResult<T::State>> {
    Ok(match (old, new) {
        (TransferResult::Uninitialized, n) => n,
        (o, TransferResult::Uninitialized) => o.clone(),
        (TransferResult::Simple(a), TransferResult::Simple(b)) => {
            TransferResult::Simple(t.join_state(a, b)?)
        }
        (TransferResult::Branch(at, af), TransferResult::Branch(bt, bf)) => {
            TransferResult::Branch(t.join_state(at, bt)?, t.join_state(af, bf)?)
        }
        (TransferResult::Simple(a), TransferResult::Branch(bt, bf)) => {
            TransferResult::Branch(t.join_state(a, bt)?, t.join_state(a, bf)?)
        }
        (TransferResult::Branch(at, af), TransferResult::Simple(b)) => {
            TransferResult::Branch(t.join_state(at, b.clone())?, t.join_state(af, b)?)
        }
    })
}

/// Run the fixpoint over every block reachable from entry.
pub fn intra_fixpoint<A, T: Transfer<A>>(
    cfg: &Cfg<A>,
    t: &T,
) -> Result<BTreeMap<BlockIdx, BlockResult<T::State>>> {
    let mut results: BTreeMap<BlockIdx, BlockResult<T::State>> = BTreeMap::new();
    let mut worklist: BTreeSet<BlockIdx> = BTreeSet::new();
    worklist.insert(cfg.entry_block);

    // Widening keeps reducible CFGs finite; for anything pathological
    // the step cap turns divergence into a warning.
    let max_steps = 64 * (cfg.blocks.len() + 1);
    let mut steps = 0usize;

    while let Some(&b) = worklist.iter().next() {
        worklist.remove(&b);
        steps += 1;
        if steps > max_steps {
            warn!("fixpoint did not stabilise after {max_steps} steps; capping");
            break;
        }

        let block = cfg.find_block(b)?;

        let mut flows: Vec<T::State> = Vec::new();
        if b == cfg.entry_block {
            flows.push(t.entry_state(cfg)?);
        }
        for (pred, tag) in cfg.predecessors(b) {
            if let Some(r) = results.get(pred) {
                flows.extend(r.out.flow_along(*tag));
            }
        }
        if flows.is_empty() {
            // No analysed predecessor yet; a pred change will requeue us.
            continue;
        }

        let in_state = t.merge_flows(cfg, block, flows)?;
        let raw = t.transfer_block(cfg, block, in_state.clone())?;

        let (changed, joined) = match results.get(&b) {
            None => (true, raw),
            Some(prev) => {
                let joined = join_result(t, &prev.out, raw)?;
                (joined != prev.out || in_state != prev.in_state, joined)
            }
        };

        results.insert(b, BlockResult { in_state, out: joined });
        if changed {
            for (succ, _) in cfg.successors(b) {
                worklist.insert(*succ);
            }
        }
    }

    Ok(results)
}
