//! Lowering of nested instruction trees into flat basic-block graphs.
//!
//! One pass walks the structured body. Straight-line data instructions
//! accumulate into a data block; every control instruction terminates
//! the current block. Structured constructs push a break target onto a
//! label stack: forward targets (block/if continuations) collect the
//! edges of the `br`s that name them and are materialised as merge
//! blocks once the construct closes; loop heads are materialised up
//! front so back edges can point at them directly.

use std::collections::{BTreeMap, BTreeSet};

use crate::cfg::{BasicBlock, BlockContent, BlockIdx, Cfg};
use crate::error::{AnalysisError, Result};
use crate::ingest::Function;
use crate::instr::{Control, Instr, InstrKind};
use crate::label::Label;

/// A dangling edge waiting for its destination block.
type Pending = (BlockIdx, Option<bool>);

enum BreakTarget {
    /// Continuation of a `block`/`if`: edges collected until the
    /// construct closes.
    Forward(Vec<Pending>),
    /// Head of a `loop`: the merge block already exists.
    Head(BlockIdx),
}

struct Builder {
    blocks: BTreeMap<BlockIdx, BasicBlock<()>>,
    instructions: BTreeMap<Label, Instr<()>>,
    edges: Vec<(BlockIdx, BlockIdx, Option<bool>)>,
    loop_heads: BTreeSet<BlockIdx>,
    breaks: Vec<BreakTarget>,
    exit_pending: Vec<Pending>,
    next_idx: BlockIdx,
}

/// Build the CFG of a single ingested function.
pub fn build_cfg(func: &Function) -> Result<Cfg<()>> {
    let mut b = Builder {
        blocks: BTreeMap::new(),
        instructions: BTreeMap::new(),
        edges: Vec::new(),
        loop_heads: BTreeSet::new(),
        breaks: Vec::new(),
        exit_pending: Vec::new(),
        next_idx: 0,
    };

    let tail = b.lower_seq(&func.body, Vec::new())?;
    b.exit_pending.extend(tail);

    // The exit block is uniformly a merge block, fed by the function
    // tail and by every return/unreachable.
    let exit_pending = std::mem::take(&mut b.exit_pending);
    let exit_block = b.new_merge_block(exit_pending);

    let entry_block = match b.blocks.keys().next() {
        Some(first) => *first,
        None => exit_block,
    };

    let mut cfg = Cfg {
        func_idx: func.idx,
        exported: func.exported,
        name: func.name.clone(),
        global_types: func.global_types.clone(),
        arg_types: func.arg_types.clone(),
        local_types: func.local_types.clone(),
        return_types: func.return_types.clone(),
        blocks: b.blocks,
        instructions: b.instructions,
        edges: BTreeMap::new(),
        back_edges: BTreeMap::new(),
        entry_block,
        exit_block,
        loop_heads: b.loop_heads,
    };
    for (src, dst, tag) in b.edges {
        cfg.add_edge(src, dst, tag);
    }

    if cfg.in_degree(cfg.entry_block) != 0 {
        return Err(AnalysisError::SliceValidation(format!(
            "entry block {} has incoming edges",
            cfg.entry_block
        )));
    }
    cfg.validate()?;
    Ok(cfg)
}

impl Builder {
    fn fresh_idx(&mut self) -> BlockIdx {
        let idx = self.next_idx;
        self.next_idx += 1;
        idx
    }

    fn connect(&mut self, pending: &[Pending], dst: BlockIdx) {
        for (src, tag) in pending {
            self.edges.push((*src, dst, *tag));
        }
    }

    fn new_data_block(&mut self, labels: Vec<Label>, pending: Vec<Pending>) -> BlockIdx {
        let idx = self.fresh_idx();
        self.connect(&pending, idx);
        self.blocks.insert(
            idx,
            BasicBlock { idx, content: BlockContent::Data(labels), before: (), after: () },
        );
        idx
    }

    fn new_control_block(&mut self, instr: Instr<()>, pending: Vec<Pending>) -> BlockIdx {
        let idx = self.fresh_idx();
        self.connect(&pending, idx);
        self.blocks.insert(
            idx,
            BasicBlock { idx, content: BlockContent::Control(instr.label), before: (), after: () },
        );
        self.instructions.insert(instr.label, instr);
        idx
    }

    /// Merge blocks carry a synthetic merge instruction labelled with
    /// the block index, so joins are addressable by the slicer.
    fn new_merge_block(&mut self, pending: Vec<Pending>) -> BlockIdx {
        let idx = self.fresh_idx();
        self.connect(&pending, idx);
        let label = Label::merge(idx);
        self.blocks.insert(
            idx,
            BasicBlock { idx, content: BlockContent::Merge(label), before: (), after: () },
        );
        self.instructions.insert(
            label,
            Instr { label, kind: InstrKind::Control(Control::Merge), before: (), after: () },
        );
        idx
    }

    fn resolve_break(&mut self, depth: u32, from: Pending) -> Result<()> {
        let pos = self
            .breaks
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| AnalysisError::unsupported(format!("branch depth {depth} too deep")))?;
        match &mut self.breaks[pos] {
            BreakTarget::Forward(edges) => edges.push(from),
            BreakTarget::Head(head) => {
                let head = *head;
                self.edges.push((from.0, head, from.1));
            }
        }
        Ok(())
    }

    /// Lower a sequence, starting from the given dangling edges.
    /// Returns the dangling edges at its end; empty when every path
    /// through the sequence terminated.
    fn lower_seq(&mut self, instrs: &[Instr<()>], frontier: Vec<Pending>) -> Result<Vec<Pending>> {
        let mut frontier = frontier;
        let mut pending_data: Vec<Label> = Vec::new();

        macro_rules! flush_data {
            () => {
                if !pending_data.is_empty() {
                    let labels = std::mem::take(&mut pending_data);
                    let taken = std::mem::take(&mut frontier);
                    let idx = self.new_data_block(labels, taken);
                    frontier = vec![(idx, None)];
                }
            };
        }

        for instr in instrs {
            match &instr.kind {
                InstrKind::Data(_) => {
                    pending_data.push(instr.label);
                    self.instructions.insert(instr.label, instr.clone());
                }
                InstrKind::Control(control) => {
                    flush_data!();
                    match control {
                        Control::Block { block_type, arity, body } => {
                            let stub = Instr {
                                label: instr.label,
                                kind: InstrKind::Control(Control::Block {
                                    block_type: *block_type,
                                    arity: *arity,
                                    body: Vec::new(),
                                }),
                                before: (),
                                after: (),
                            };
                            let taken = std::mem::take(&mut frontier);
                            let b = self.new_control_block(stub, taken);
                            self.breaks.push(BreakTarget::Forward(Vec::new()));
                            let tail = self.lower_seq(body, vec![(b, None)])?;
                            let Some(BreakTarget::Forward(mut edges)) = self.breaks.pop() else {
                                unreachable!("break stack out of sync");
                            };
                            edges.extend(tail);
                            frontier = self.close_construct(edges);
                        }
                        Control::Loop { block_type, arity, body } => {
                            let stub = Instr {
                                label: instr.label,
                                kind: InstrKind::Control(Control::Loop {
                                    block_type: *block_type,
                                    arity: *arity,
                                    body: Vec::new(),
                                }),
                                before: (),
                                after: (),
                            };
                            let taken = std::mem::take(&mut frontier);
                            let l = self.new_control_block(stub, taken);
                            let head = self.new_merge_block(vec![(l, None)]);
                            self.loop_heads.insert(head);
                            self.breaks.push(BreakTarget::Head(head));
                            let tail = self.lower_seq(body, vec![(head, None)])?;
                            self.breaks.pop();
                            frontier = self.close_construct(tail);
                        }
                        Control::If { block_type, arity, then_body, else_body } => {
                            let stub = Instr {
                                label: instr.label,
                                kind: InstrKind::Control(Control::If {
                                    block_type: *block_type,
                                    arity: *arity,
                                    then_body: Vec::new(),
                                    else_body: Vec::new(),
                                }),
                                before: (),
                                after: (),
                            };
                            let taken = std::mem::take(&mut frontier);
                            let i = self.new_control_block(stub, taken);
                            self.breaks.push(BreakTarget::Forward(Vec::new()));
                            let then_tail = self.lower_seq(then_body, vec![(i, Some(true))])?;
                            let else_tail = self.lower_seq(else_body, vec![(i, Some(false))])?;
                            let Some(BreakTarget::Forward(mut edges)) = self.breaks.pop() else {
                                unreachable!("break stack out of sync");
                            };
                            edges.extend(then_tail);
                            edges.extend(else_tail);
                            frontier = self.close_construct(edges);
                        }
                        Control::Br(depth) => {
                            let taken = std::mem::take(&mut frontier);
                            let b = self.new_control_block(instr.clone(), taken);
                            self.resolve_break(*depth, (b, None))?;
                            // Anything after an unconditional branch is dead.
                            return Ok(Vec::new());
                        }
                        Control::BrIf(depth) => {
                            let taken = std::mem::take(&mut frontier);
                            let b = self.new_control_block(instr.clone(), taken);
                            self.resolve_break(*depth, (b, Some(true)))?;
                            frontier = vec![(b, Some(false))];
                        }
                        Control::BrTable { targets, default } => {
                            let taken = std::mem::take(&mut frontier);
                            let b = self.new_control_block(instr.clone(), taken);
                            let mut seen = BTreeSet::new();
                            for depth in targets.iter().chain(std::iter::once(default)) {
                                if seen.insert(*depth) {
                                    self.resolve_break(*depth, (b, None))?;
                                }
                            }
                            return Ok(Vec::new());
                        }
                        Control::Return | Control::Unreachable => {
                            let taken = std::mem::take(&mut frontier);
                            let b = self.new_control_block(instr.clone(), taken);
                            self.exit_pending.push((b, None));
                            return Ok(Vec::new());
                        }
                        Control::Call { .. } | Control::CallIndirect { .. } => {
                            let taken = std::mem::take(&mut frontier);
                            let b = self.new_control_block(instr.clone(), taken);
                            frontier = vec![(b, None)];
                        }
                        Control::Merge => {
                            return Err(AnalysisError::unsupported(
                                "merge instruction in source body",
                            ));
                        }
                    }
                }
            }
        }

        flush_data!();
        Ok(frontier)
    }

    /// Close a structured construct: its continuation is a merge block
    /// when any path reaches it; a construct no path leaves produces an
    /// empty frontier.
    fn close_construct(&mut self, edges: Vec<Pending>) -> Vec<Pending> {
        if edges.is_empty() {
            Vec::new()
        } else {
            let c = self.new_merge_block(edges);
            vec![(c, None)]
        }
    }
}
