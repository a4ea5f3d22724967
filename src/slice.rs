//! Backward slicing.
//!
//! Phase 1 computes the transitive dependence closure of the criterion
//! under use-def, control and memory dependences. Phases 2–4 rebuild a
//! CFG around the surviving instructions: kept data blocks are padded
//! with dummy instructions so every local stack delta is preserved,
//! removed blocks are rewired around, inter-block height differences
//! are repaired with dummy blocks, and merge discipline is restored.
//! The result re-annotates cleanly or slicing reports a validation
//! error.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::trace;

use crate::cfg::{BasicBlock, BlockContent, BlockIdx, Cfg};
use crate::config::Options;
use crate::controldep::control_dependencies;
use crate::error::{AnalysisError, Result};
use crate::instr::{Control, Data, Instr, InstrKind};
use crate::label::{Label, LabelPool};
use crate::memdep::memory_dependencies;
use crate::ssa::{annotate, merge_sources_for, Var, VarState};
use crate::types::PrimValue;
use crate::usedef::{use_def_chains, uses, Definition};

/// A worklist item: an instruction, plus the merge variable whose
/// incoming arms are of interest when the instruction is a merge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct InSlice {
    label: Label,
    reason: Option<Var>,
}

/// Phase 1: the labels of every instruction the criterion transitively
/// depends on.
pub fn instructions_to_keep(cfg: &Cfg<VarState>, criterion: Label) -> Result<BTreeSet<Label>> {
    cfg.find_instr(criterion)?;

    let chains = use_def_chains(cfg)?;
    let cdeps = control_dependencies(cfg)?;
    let mdeps = memory_dependencies(cfg)?;
    let label_to_block = cfg.label_to_block();

    let mut kept: BTreeSet<Label> = BTreeSet::new();
    let mut visited: BTreeSet<InSlice> = BTreeSet::new();
    let mut worklist: VecDeque<InSlice> = VecDeque::new();
    worklist.push_back(InSlice { label: criterion, reason: None });

    while let Some(item) = worklist.pop_front() {
        if !visited.insert(item.clone()) {
            continue;
        }
        kept.insert(item.label);

        // Use-def: chase the definitions of whatever this instruction
        // reads. A merge followed for a specific reason only pulls in
        // the arms merged into that variable.
        let used: Vec<Var> = match (&item.reason, item.label.is_merge()) {
            (Some(reason), true) => merge_sources_for(cfg, item.label.id, reason)?,
            _ => uses(cfg, item.label)?,
        };
        for u in used {
            if let Some(Definition::Instruction(def_label, var)) = chains.defs.get(&u) {
                let reason = match var {
                    Var::Merge(..) => Some(*var),
                    _ => None,
                };
                worklist.push_back(InSlice { label: *def_label, reason });
            }
        }

        // Control dependences of this instruction's block.
        if let Some(block) = label_to_block.get(&item.label) {
            if let Some(predicates) = cdeps.get(block) {
                for (pred_label, pred_var) in predicates {
                    worklist.push_back(InSlice {
                        label: *pred_label,
                        reason: Some(*pred_var),
                    });
                }
            }
        }

        // Memory dependences.
        if let Some(stores) = mdeps.get(&item.label) {
            for store in stores {
                worklist.push_back(InSlice { label: *store, reason: None });
            }
        }
    }

    Ok(kept)
}

/// Original (before, after) stack heights per block.
type Heights = BTreeMap<BlockIdx, (usize, usize)>;

/// Backward-slice the function to the given criterion. The result is a
/// fresh CFG with unit annotations that re-annotates cleanly.
pub fn slice(original: &Cfg<VarState>, criterion: Label, opts: &Options) -> Result<Cfg<()>> {
    let mut kept = instructions_to_keep(original, criterion)?;
    if opts.keep_entire_blocks {
        for block in original.blocks.values() {
            let labels = block.labels();
            if labels.iter().any(|l| kept.contains(l)) {
                kept.extend(labels);
            }
        }
    }
    trace!("slice of {criterion}: keeping {} instructions", kept.len());

    let heights: Heights = original
        .blocks
        .iter()
        .map(|(i, b)| (*i, (b.before.vstack.len(), b.after.vstack.len())))
        .collect();

    let floor = original
        .instructions
        .keys()
        .filter(|l| l.is_dummy())
        .map(|l| l.id + 1)
        .max()
        .unwrap_or(0);
    let mut pool = LabelPool::with_dummy_floor(floor);

    let mut out = original.clear_annotations();
    let mut new_instrs: BTreeMap<Label, Instr<()>> = BTreeMap::new();

    // ==== PHASE 2: block-level construction ====
    let in_slice = blocks_in_slice(original, &kept);

    let block_indices: Vec<BlockIdx> = out.blocks.keys().copied().collect();
    for idx in block_indices {
        if in_slice.contains(&idx) {
            let content = original.find_block(idx)?.content.clone();
            if let BlockContent::Data(labels) = content {
                let rewritten =
                    rewrite_data_block(original, idx, &labels, &kept, &mut pool, &mut new_instrs)?;
                out.blocks.get_mut(&idx).expect("block present").content =
                    BlockContent::Data(rewritten);
            }
        } else if idx == out.entry_block {
            // The entry survives as a dummy block with the same net
            // stack effect.
            let (before, after) = heights[&idx];
            let mut labels = Vec::new();
            pad(&mut labels, before, after, &mut pool, &mut new_instrs);
            out.blocks.get_mut(&idx).expect("block present").content = BlockContent::Data(labels);
        } else {
            // Remove and rewire around: every predecessor inherits an
            // edge to each successor, keeping its own branch tag.
            let preds: Vec<(BlockIdx, Option<bool>)> = out.predecessors(idx).to_vec();
            let succs: Vec<(BlockIdx, Option<bool>)> = out.successors(idx).to_vec();
            for (p, tag) in &preds {
                for (s, _) in &succs {
                    out.add_edge(*p, *s, *tag);
                }
            }
            out.remove_block(idx);
        }
    }

    // ==== PHASE 3: inter-block stack repair ====
    repair_stack_heights(&mut out, &heights, &mut pool, &mut new_instrs)?;

    // ==== PHASE 4: merge restoration ====
    restore_merge_discipline(&mut out, &mut new_instrs);

    // Rebuild the instruction map from what the blocks reference.
    let mut instructions: BTreeMap<Label, Instr<()>> = BTreeMap::new();
    for block in out.blocks.values() {
        for label in block.labels() {
            let instr = match new_instrs.get(&label) {
                Some(i) => i.clone(),
                None => original.find_instr(label)?.clear_annotations(),
            };
            instructions.insert(label, instr);
        }
    }
    out.instructions = instructions;

    out.validate()?;
    // The slice must re-annotate; anything else is a bug in the phases
    // above.
    annotate(&out, opts).map_err(|e| AnalysisError::SliceValidation(e.to_string()))?;

    Ok(out)
}

/// A block survives when it holds a kept instruction, is the exit, is a
/// structural marker (merge blocks: loop heads and loop/block exits),
/// or branches into a surviving merge.
fn blocks_in_slice(cfg: &Cfg<VarState>, kept: &BTreeSet<Label>) -> BTreeSet<BlockIdx> {
    let mut in_slice: BTreeSet<BlockIdx> = BTreeSet::new();
    for (idx, block) in &cfg.blocks {
        let keep = *idx == cfg.exit_block
            || block.is_merge()
            || block.labels().iter().any(|l| kept.contains(l));
        if keep {
            in_slice.insert(*idx);
        }
    }
    // Branching blocks whose merge successor survives keep the branch
    // structure alive.
    for (idx, block) in &cfg.blocks {
        if in_slice.contains(idx) || !matches!(block.content, BlockContent::Control(_)) {
            continue;
        }
        let succs = cfg.successors(*idx);
        if succs.len() > 1
            && succs.iter().any(|(s, _)| {
                in_slice.contains(s)
                    && cfg.blocks.get(s).map(|b| b.is_merge()).unwrap_or(false)
            })
        {
            in_slice.insert(*idx);
        }
    }
    in_slice
}

fn dummy_push(pool: &mut LabelPool, new_instrs: &mut BTreeMap<Label, Instr<()>>) -> Label {
    let label = pool.fresh_dummy();
    new_instrs.insert(label, Instr::new_data(label, Data::Const(PrimValue::I32(0))));
    label
}

fn dummy_drop(pool: &mut LabelPool, new_instrs: &mut BTreeMap<Label, Instr<()>>) -> Label {
    let label = pool.fresh_dummy();
    new_instrs.insert(label, Instr::new_data(label, Data::Drop));
    label
}

/// Append dummies moving the stack height from `from` to `to`.
fn pad(
    labels: &mut Vec<Label>,
    from: usize,
    to: usize,
    pool: &mut LabelPool,
    new_instrs: &mut BTreeMap<Label, Instr<()>>,
) {
    let mut cur = from;
    while cur < to {
        labels.push(dummy_push(pool, new_instrs));
        cur += 1;
    }
    while cur > to {
        labels.push(dummy_drop(pool, new_instrs));
        cur -= 1;
    }
}

/// Keep the kept instructions of a data block in order, padding with
/// dummies so each survivor sees its original entry height and the
/// block keeps its original tail height.
fn rewrite_data_block(
    original: &Cfg<VarState>,
    idx: BlockIdx,
    labels: &[Label],
    kept: &BTreeSet<Label>,
    pool: &mut LabelPool,
    new_instrs: &mut BTreeMap<Label, Instr<()>>,
) -> Result<Vec<Label>> {
    let block = original.find_block(idx)?;
    let mut out = Vec::new();
    let mut cur = block.before.vstack.len();
    for label in labels {
        if !kept.contains(label) {
            continue;
        }
        let instr = original.find_instr(*label)?;
        pad(&mut out, cur, instr.before.vstack.len(), pool, new_instrs);
        out.push(*label);
        cur = instr.after.vstack.len();
    }
    pad(&mut out, cur, block.after.vstack.len(), pool, new_instrs);
    Ok(out)
}

/// Phase 3: for every retained edge whose endpoints' original heights
/// disagree, make up the difference with dummies, either prepended to
/// the destination or on a fresh intermediate block.
fn repair_stack_heights(
    out: &mut Cfg<()>,
    heights: &Heights,
    pool: &mut LabelPool,
    new_instrs: &mut BTreeMap<Label, Instr<()>>,
) -> Result<()> {
    // Destinations whose surviving predecessors all leave the same
    // height can absorb the fix themselves.
    let targets: Vec<BlockIdx> = out.blocks.keys().copied().collect();
    for v in targets {
        let Some(&(v_before, _)) = heights.get(&v) else { continue };
        let preds: Vec<(BlockIdx, Option<bool>)> = out.predecessors(v).to_vec();
        if preds.is_empty() {
            continue;
        }
        let pred_heights: Vec<usize> = preds
            .iter()
            .filter_map(|(p, _)| heights.get(p).map(|(_, after)| *after))
            .collect();
        if pred_heights.len() != preds.len() {
            continue; // some predecessor is already a repair block
        }
        let uniform = pred_heights.windows(2).all(|w| w[0] == w[1]);
        let is_data = matches!(out.find_block(v)?.content, BlockContent::Data(_));

        if uniform && is_data {
            let from = pred_heights[0];
            if from != v_before {
                let mut fix = Vec::new();
                pad(&mut fix, from, v_before, pool, new_instrs);
                if let BlockContent::Data(labels) =
                    &mut out.blocks.get_mut(&v).expect("block present").content
                {
                    fix.extend(labels.iter().copied());
                    *labels = fix;
                }
            }
            continue;
        }

        // Heterogeneous predecessors, or a control/merge destination:
        // one intermediate dummy block per mismatched predecessor.
        let mut seen: BTreeSet<BlockIdx> = BTreeSet::new();
        for (p, _) in preds {
            if !seen.insert(p) {
                continue;
            }
            let Some(&(_, p_after)) = heights.get(&p) else { continue };
            if p_after == v_before {
                continue;
            }
            let tags: Vec<Option<bool>> = out
                .predecessors(v)
                .iter()
                .filter(|(q, _)| *q == p)
                .map(|(_, t)| *t)
                .collect();
            let mut labels = Vec::new();
            pad(&mut labels, p_after, v_before, pool, new_instrs);
            let d = out.next_block_idx();
            out.blocks.insert(
                d,
                BasicBlock { idx: d, content: BlockContent::Data(labels), before: (), after: () },
            );
            out.remove_edge(p, v);
            for tag in tags {
                out.add_edge(p, d, tag);
            }
            out.add_edge(d, v, None);
        }
    }
    Ok(())
}

/// Phase 4: any block that gathered several predecessors without being
/// a merge gets a fresh merge block in front of it.
fn restore_merge_discipline(out: &mut Cfg<()>, new_instrs: &mut BTreeMap<Label, Instr<()>>) {
    let indices: Vec<BlockIdx> = out.blocks.keys().copied().collect();
    for idx in indices {
        let block_is_merge = out.blocks.get(&idx).map(|b| b.is_merge()).unwrap_or(true);
        if block_is_merge || out.in_degree(idx) <= 1 {
            continue;
        }
        let m = out.next_block_idx();
        let label = Label::merge(m);
        out.blocks.insert(
            m,
            BasicBlock { idx: m, content: BlockContent::Merge(label), before: (), after: () },
        );
        new_instrs.insert(
            label,
            Instr { label, kind: InstrKind::Control(Control::Merge), before: (), after: () },
        );

        let incoming: Vec<(BlockIdx, Option<bool>)> = out.predecessors(idx).to_vec();
        let pred_set: BTreeSet<BlockIdx> = incoming.iter().map(|(p, _)| *p).collect();
        for p in pred_set {
            out.remove_edge(p, idx);
        }
        for (p, tag) in incoming {
            out.add_edge(p, m, tag);
        }
        out.add_edge(m, idx, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_cfg;
    use crate::ingest::Function;
    use crate::types::{Binary, BinaryKind, ValType};

    fn ms() -> Data {
        Data::MemorySize
    }

    fn add() -> Data {
        Data::Binary(Binary { typ: ValType::I32, op: BinaryKind::Add })
    }

    /// memory.size; memory.size; i32.add; drop; memory.size;
    /// memory.size; i32.add
    fn straight_line() -> Cfg<VarState> {
        let body = vec![
            Instr::new_data(Label::function(0), ms()),
            Instr::new_data(Label::function(1), ms()),
            Instr::new_data(Label::function(2), add()),
            Instr::new_data(Label::function(3), Data::Drop),
            Instr::new_data(Label::function(4), ms()),
            Instr::new_data(Label::function(5), ms()),
            Instr::new_data(Label::function(6), add()),
        ];
        let f = Function {
            idx: 0,
            name: None,
            exported: false,
            arg_types: vec![],
            return_types: vec![ValType::I32],
            local_types: vec![],
            global_types: vec![],
            body,
        };
        let cfg = build_cfg(&f).unwrap();
        annotate(&cfg, &Options::default()).unwrap()
    }

    #[test]
    fn keeps_exactly_the_chain_feeding_the_criterion() {
        let cfg = straight_line();
        let kept = instructions_to_keep(&cfg, Label::function(2)).unwrap();
        let expected: BTreeSet<Label> =
            [Label::function(0), Label::function(1), Label::function(2)].into_iter().collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn sliced_cfg_pads_the_tail_and_drops_the_rest() {
        let cfg = straight_line();
        let sliced = slice(&cfg, Label::function(2), &Options::default()).unwrap();

        for gone in [3u32, 4, 5, 6] {
            assert!(
                !sliced.instructions.contains_key(&Label::function(gone)),
                "label {gone} should be sliced away"
            );
        }
        // Stack-valid by construction: re-annotation succeeds and every
        // retained edge agrees on heights.
        let annotated = annotate(&sliced, &Options::default()).unwrap();
        assert!(annotated.instructions.contains_key(&Label::function(2)));
        for block in annotated.blocks.values() {
            for (succ, _) in annotated.successors(block.idx) {
                let v = annotated.find_block(*succ).unwrap();
                assert_eq!(block.after.vstack.len(), v.before.vstack.len());
            }
        }
    }

    #[test]
    fn slicing_twice_is_isomorphic() {
        let cfg = straight_line();
        let opts = Options::default();
        let once = slice(&cfg, Label::function(2), &opts).unwrap();
        let once_annotated = annotate(&once, &opts).unwrap();
        let twice = slice(&once_annotated, Label::function(2), &opts).unwrap();

        let non_dummy = |c: &Cfg<()>| -> BTreeSet<Label> {
            c.instructions.keys().filter(|l| !l.is_dummy()).copied().collect()
        };
        assert_eq!(non_dummy(&once), non_dummy(&twice));
        assert_eq!(once.blocks.len(), twice.blocks.len());
    }

    #[test]
    fn non_dummy_instructions_are_in_the_closure() {
        let cfg = straight_line();
        let kept = instructions_to_keep(&cfg, Label::function(2)).unwrap();
        let sliced = slice(&cfg, Label::function(2), &Options::default()).unwrap();
        for label in sliced.instructions.keys() {
            assert!(
                label.is_dummy() || label.is_merge() || kept.contains(label),
                "{label} survived without being kept"
            );
        }
    }
}
