//! Spec inference: forward abstract interpretation naming every stack
//! slot, local, global and memory cell with an SSA variable.
//!
//! Each value-producing instruction defines a variable named by its
//! label; merge blocks mint fresh merge variables at exactly the
//! positions where their incoming flows disagree. Three knobs control
//! whether `local.get`/`global.get`/`const` re-use existing variables
//! or define fresh ones.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cfg::{BasicBlock, BlockContent, BlockIdx, Cfg};
use crate::config::Options;
use crate::error::{AnalysisError, Result};
use crate::fixpoint::{intra_fixpoint, Transfer, TransferResult};
use crate::instr::{Control, Data, Instr, InstrKind};
use crate::label::Label;
use crate::memory::SymMemory;
use crate::types::PrimValue;

/// An SSA variable: a name for a runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Var {
    /// A local as it was at function entry.
    Local(u32),
    /// A global as it was at function entry.
    Global(u32),
    /// A constant (only minted when constant collapsing is on).
    Const(PrimValue),
    /// The value defined by the instruction with this label.
    Instr(Label),
    /// The value minted by a merge block at the given position.
    Merge(BlockIdx, usize),
    /// The function result, bound at the exit block.
    Return,
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Local(i) => write!(f, "l{i}"),
            Var::Global(i) => write!(f, "g{i}"),
            Var::Const(c) => write!(f, "c{c}"),
            Var::Instr(l) => write!(f, "v{l}"),
            Var::Merge(b, p) => write!(f, "m{b}#{p}"),
            Var::Return => write!(f, "ret"),
        }
    }
}

/// Per-program-point state: the variables naming every stack slot,
/// local, global, and what is known about memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarState {
    pub vstack: Vec<Var>,
    pub locals: Vec<Var>,
    pub globals: Vec<Var>,
    pub memory: SymMemory,
}

impl VarState {
    pub fn entry(cfg: &Cfg<()>) -> VarState {
        let num_locals = cfg.arg_types.len() + cfg.local_types.len();
        VarState {
            vstack: Vec::new(),
            locals: (0..num_locals as u32).map(Var::Local).collect(),
            globals: (0..cfg.global_types.len() as u32).map(Var::Global).collect(),
            memory: SymMemory::new(),
        }
    }

    fn pop(&mut self, at: Label) -> Result<Var> {
        self.vstack.pop().ok_or_else(|| {
            AnalysisError::SliceValidation(format!("value stack underflow at {at}"))
        })
    }

    /// The variable at a flat position: stack slots first (bottom up),
    /// then locals, then globals.
    pub fn var_at(&self, pos: usize) -> Option<&Var> {
        let n = self.vstack.len();
        let l = self.locals.len();
        if pos < n {
            self.vstack.get(pos)
        } else if pos < n + l {
            self.locals.get(pos - n)
        } else {
            self.globals.get(pos - n - l)
        }
    }

    fn positions(&self) -> usize {
        self.vstack.len() + self.locals.len() + self.globals.len()
    }
}

impl fmt::Display for VarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.vstack.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

/// The inference itself, an instance of the intra-procedural fixpoint.
pub struct Inference<'a> {
    pub opts: &'a Options,
}

impl<'a> Inference<'a> {
    fn fresh(&self, label: Label) -> Var {
        Var::Instr(label)
    }

    fn transfer_data(&self, label: Label, data: &Data, state: &mut VarState) -> Result<()> {
        match data {
            Data::Nop => {}
            Data::Drop => {
                state.pop(label)?;
            }
            Data::Select => {
                state.pop(label)?;
                state.pop(label)?;
                state.pop(label)?;
                state.vstack.push(self.fresh(label));
            }
            Data::MemorySize => state.vstack.push(self.fresh(label)),
            Data::MemoryGrow => {
                state.pop(label)?;
                state.vstack.push(self.fresh(label));
            }
            Data::Const(c) => {
                let var = if self.opts.use_const { Var::Const(*c) } else { self.fresh(label) };
                state.vstack.push(var);
            }
            Data::Unary(_) | Data::Test(_) | Data::Convert(_) => {
                state.pop(label)?;
                state.vstack.push(self.fresh(label));
            }
            Data::Binary(_) | Data::Compare(_) => {
                state.pop(label)?;
                state.pop(label)?;
                state.vstack.push(self.fresh(label));
            }
            Data::LocalGet(i) => {
                let var = if self.opts.propagate_locals {
                    *state.locals.get(*i as usize).ok_or_else(|| {
                        AnalysisError::SliceValidation(format!("local {i} out of range at {label}"))
                    })?
                } else {
                    self.fresh(label)
                };
                state.vstack.push(var);
            }
            Data::LocalSet(i) => {
                let v = state.pop(label)?;
                let slot = if self.opts.propagate_locals { v } else { self.fresh(label) };
                state.locals[*i as usize] = slot;
            }
            Data::LocalTee(i) => {
                let v = state.pop(label)?;
                let slot = if self.opts.propagate_locals { v } else { self.fresh(label) };
                state.locals[*i as usize] = slot;
                state.vstack.push(slot);
            }
            Data::GlobalGet(i) => {
                let var = if self.opts.propagate_globals {
                    *state.globals.get(*i as usize).ok_or_else(|| {
                        AnalysisError::SliceValidation(format!(
                            "global {i} out of range at {label}"
                        ))
                    })?
                } else {
                    self.fresh(label)
                };
                state.vstack.push(var);
            }
            Data::GlobalSet(i) => {
                let v = state.pop(label)?;
                let slot = if self.opts.propagate_globals { v } else { self.fresh(label) };
                state.globals[*i as usize] = slot;
            }
            Data::Load(_) => {
                state.pop(label)?;
                state.vstack.push(self.fresh(label));
            }
            Data::Store(op) => {
                let value = state.pop(label)?;
                let addr = state.pop(label)?;
                if op.pack.is_none() {
                    state.memory.store(addr, op.offset, value);
                }
            }
        }
        Ok(())
    }

    fn transfer_control(
        &self,
        cfg: &Cfg<()>,
        instr: &Instr<()>,
        mut state: VarState,
    ) -> Result<TransferResult<VarState>> {
        let label = instr.label;
        let control = match &instr.kind {
            InstrKind::Control(c) => c,
            InstrKind::Data(_) => {
                return Err(AnalysisError::SliceValidation(format!(
                    "data instruction {label} in a control block"
                )))
            }
        };
        Ok(match control {
            Control::Block { .. } | Control::Loop { .. } | Control::Br(_) | Control::Merge => {
                TransferResult::Simple(state)
            }
            Control::If { .. } | Control::BrIf(_) => {
                state.pop(label)?;
                TransferResult::Branch(state.clone(), state)
            }
            Control::BrTable { .. } => {
                state.pop(label)?;
                TransferResult::Simple(state)
            }
            Control::Call { arity, .. } => {
                self.transfer_call(label, arity.0, arity.1, &mut state)?;
                TransferResult::Simple(state)
            }
            Control::CallIndirect { arity, .. } => {
                self.transfer_call(label, arity.0 + 1, arity.1, &mut state)?;
                TransferResult::Simple(state)
            }
            Control::Return => {
                let n = cfg.return_types.len();
                if state.vstack.len() < n {
                    return Err(AnalysisError::SliceValidation(format!(
                        "return at {label} with stack of {}",
                        state.vstack.len()
                    )));
                }
                let keep = state.vstack.split_off(state.vstack.len() - n);
                state.vstack = keep;
                TransferResult::Simple(state)
            }
            Control::Unreachable => {
                state.vstack.clear();
                TransferResult::Simple(state)
            }
        })
    }

    fn transfer_call(
        &self,
        label: Label,
        pops: usize,
        pushes: usize,
        state: &mut VarState,
    ) -> Result<()> {
        for _ in 0..pops {
            state.pop(label)?;
        }
        if pushes == 1 {
            state.vstack.push(self.fresh(label));
        }
        // Whatever the callee wrote to memory shadows our knowledge.
        state.memory = SymMemory::new();
        Ok(())
    }

    /// Merge policy for merge blocks: the per-position diff of the
    /// incoming states, with a fresh merge var minted wherever they
    /// disagree.
    fn merge_states(
        &self,
        cfg: &Cfg<()>,
        block: &BasicBlock<()>,
        mut flows: Vec<VarState>,
    ) -> Result<VarState> {
        if block.idx == cfg.exit_block {
            // Paths ending in `unreachable` carry an emptied stack;
            // they do not constrain the exit height.
            let expected = cfg.return_types.len();
            if flows.iter().any(|s| s.vstack.len() == expected) {
                flows.retain(|s| s.vstack.len() == expected);
            } else {
                let min = flows.iter().map(|s| s.vstack.len()).min().unwrap_or(0);
                for s in &mut flows {
                    s.vstack.truncate(min);
                }
            }
        }

        let first = &flows[0];
        for other in &flows[1..] {
            if other.vstack.len() != first.vstack.len() {
                return Err(AnalysisError::MergeMismatch {
                    left: first.vstack.len(),
                    right: other.vstack.len(),
                });
            }
        }

        let positions = first.positions();
        let mut merged = first.clone();
        for pos in 0..positions {
            let v0 = first.var_at(pos).copied();
            let disagree = flows[1..].iter().any(|s| s.var_at(pos).copied() != v0);
            if disagree {
                let var = Var::Merge(block.idx, pos);
                let n = merged.vstack.len();
                let l = merged.locals.len();
                if pos < n {
                    merged.vstack[pos] = var;
                } else if pos < n + l {
                    merged.locals[pos - n] = var;
                } else {
                    merged.globals[pos - n - l] = var;
                }
            }
        }

        let mut memory = flows[0].memory.clone();
        for other in &flows[1..] {
            memory = memory.join(&other.memory);
        }
        merged.memory = memory;
        Ok(merged)
    }
}

impl<'a> Transfer<()> for Inference<'a> {
    type State = VarState;

    fn entry_state(&self, cfg: &Cfg<()>) -> Result<VarState> {
        Ok(VarState::entry(cfg))
    }

    fn merge_flows(
        &self,
        cfg: &Cfg<()>,
        block: &BasicBlock<()>,
        flows: Vec<VarState>,
    ) -> Result<VarState> {
        if block.is_merge() {
            self.merge_states(cfg, block, flows)
        } else if flows.len() == 1 {
            Ok(flows.into_iter().next().unwrap())
        } else {
            Err(AnalysisError::SliceValidation(format!(
                "block {} has {} incoming flows but is not a merge block",
                block.idx,
                flows.len()
            )))
        }
    }

    fn transfer_block(
        &self,
        cfg: &Cfg<()>,
        block: &BasicBlock<()>,
        state: VarState,
    ) -> Result<TransferResult<VarState>> {
        match &block.content {
            BlockContent::Data(labels) => {
                let mut state = state;
                for label in labels {
                    let instr = cfg.find_instr(*label)?;
                    let data = instr.data().ok_or_else(|| {
                        AnalysisError::SliceValidation(format!(
                            "control instruction {label} in a data block"
                        ))
                    })?;
                    self.transfer_data(*label, data, &mut state)?;
                }
                Ok(TransferResult::Simple(state))
            }
            BlockContent::Control(label) => {
                let instr = cfg.find_instr(*label)?;
                self.transfer_control(cfg, instr, state)
            }
            BlockContent::Merge(_) => Ok(TransferResult::Simple(state)),
        }
    }
}

/// Annotate a CFG with inferred variable states at every program point.
pub fn annotate(cfg: &Cfg<()>, opts: &Options) -> Result<Cfg<VarState>> {
    let inference = Inference { opts };
    let results = intra_fixpoint(cfg, &inference)?;

    let empty = VarState::default();
    let mut blocks = BTreeMap::new();
    let mut instructions: BTreeMap<Label, Instr<VarState>> = BTreeMap::new();

    for (idx, block) in &cfg.blocks {
        let reached = results.contains_key(idx);
        let in_state =
            results.get(idx).map(|r| r.in_state.clone()).unwrap_or_else(|| empty.clone());

        let annotate_instr = |label: Label, before: VarState, after: VarState| -> Result<Instr<VarState>> {
            let instr = cfg.find_instr(label)?;
            let mut out = instr.map_annotations(&mut |_| empty.clone());
            out.before = before;
            out.after = after;
            Ok(out)
        };

        let after_state = match &block.content {
            BlockContent::Data(labels) => {
                let mut st = in_state.clone();
                for label in labels {
                    let instr = cfg.find_instr(*label)?;
                    let before = st.clone();
                    if reached {
                        let data = instr.data().ok_or_else(|| {
                            AnalysisError::SliceValidation(format!(
                                "control instruction {label} in a data block"
                            ))
                        })?;
                        inference.transfer_data(*label, data, &mut st)?;
                    }
                    instructions.insert(*label, annotate_instr(*label, before, st.clone())?);
                }
                st
            }
            BlockContent::Control(label) => {
                let after = if reached {
                    let instr = cfg.find_instr(*label)?;
                    match inference.transfer_control(cfg, instr, in_state.clone())? {
                        TransferResult::Simple(s) => s,
                        TransferResult::Branch(t, _) => t,
                        TransferResult::Uninitialized => in_state.clone(),
                    }
                } else {
                    in_state.clone()
                };
                instructions.insert(*label, annotate_instr(*label, in_state.clone(), after.clone())?);
                after
            }
            BlockContent::Merge(label) => {
                instructions
                    .insert(*label, annotate_instr(*label, in_state.clone(), in_state.clone())?);
                in_state.clone()
            }
        };

        blocks.insert(
            *idx,
            BasicBlock {
                idx: *idx,
                content: block.content.clone(),
                before: in_state,
                after: after_state,
            },
        );
    }

    Ok(Cfg {
        func_idx: cfg.func_idx,
        exported: cfg.exported,
        name: cfg.name.clone(),
        global_types: cfg.global_types.clone(),
        arg_types: cfg.arg_types.clone(),
        local_types: cfg.local_types.clone(),
        return_types: cfg.return_types.clone(),
        blocks,
        instructions,
        edges: cfg.edges.clone(),
        back_edges: cfg.back_edges.clone(),
        entry_block: cfg.entry_block,
        exit_block: cfg.exit_block,
        loop_heads: cfg.loop_heads.clone(),
    })
}

/// Static stack height at a block's entry.
pub fn stack_before(cfg: &Cfg<VarState>, idx: BlockIdx) -> Result<usize> {
    Ok(cfg.find_block(idx)?.before.vstack.len())
}

/// Static stack height at a block's exit.
pub fn stack_after(cfg: &Cfg<VarState>, idx: BlockIdx) -> Result<usize> {
    Ok(cfg.find_block(idx)?.after.vstack.len())
}

/// The ordered pairs `(incoming var, merge var)` minted by a merge
/// block. Recomputed on demand; the association is derived from the
/// annotations, never stored.
pub fn new_merge_variables(cfg: &Cfg<VarState>, idx: BlockIdx) -> Result<Vec<(Var, Var)>> {
    let block = cfg.find_block(idx)?;
    if !block.is_merge() {
        return Ok(Vec::new());
    }
    let minted = &block.before;
    let mut pairs: Vec<(Var, Var)> = Vec::new();
    for (pred, _) in cfg.predecessors(idx) {
        let pred_out = &cfg.find_block(*pred)?.after;
        if pred_out.vstack.len() != minted.vstack.len() {
            // A path that trapped carries an emptied stack into the
            // exit merge; its positions do not line up.
            continue;
        }
        for pos in 0..minted.positions() {
            if let Some(Var::Merge(b, p)) = minted.var_at(pos) {
                if *b == idx && *p == pos {
                    if let Some(old) = pred_out.var_at(pos) {
                        let pair = (*old, Var::Merge(*b, *p));
                        if !pairs.contains(&pair) {
                            pairs.push(pair);
                        }
                    }
                }
            }
        }
    }
    Ok(pairs)
}

/// The incoming vars a merge block merges into `reason`.
pub fn merge_sources_for(cfg: &Cfg<VarState>, idx: BlockIdx, reason: &Var) -> Result<Vec<Var>> {
    Ok(new_merge_variables(cfg, idx)?
        .into_iter()
        .filter(|(_, merged)| merged == reason)
        .map(|(old, _)| old)
        .collect())
}

/// Number of distinct variables mentioned anywhere in the annotations.
pub fn count_vars(cfg: &Cfg<VarState>) -> usize {
    let mut vars: BTreeSet<Var> = BTreeSet::new();
    let mut add_state = |s: &VarState| {
        vars.extend(s.vstack.iter().copied());
        vars.extend(s.locals.iter().copied());
        vars.extend(s.globals.iter().copied());
        for (k, v) in s.memory.iter() {
            vars.insert(k.base);
            vars.insert(v.base);
        }
    };
    for block in cfg.blocks.values() {
        add_state(&block.before);
        add_state(&block.after);
    }
    for instr in cfg.instructions.values() {
        add_state(&instr.before);
        add_state(&instr.after);
    }
    vars.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_cfg;
    use crate::ingest::Function;
    use crate::types::{Binary, BinaryKind, ValType};

    fn func(arg_types: Vec<ValType>, return_types: Vec<ValType>, body: Vec<Instr<()>>) -> Function {
        Function {
            idx: 0,
            name: None,
            exported: false,
            arg_types,
            return_types,
            local_types: vec![],
            global_types: vec![],
            body,
        }
    }

    fn add_i32() -> Data {
        Data::Binary(Binary { typ: ValType::I32, op: BinaryKind::Add })
    }

    /// local.get 0; local.get 1; i32.add
    fn add_args_func() -> Function {
        func(
            vec![ValType::I32, ValType::I32],
            vec![ValType::I32],
            vec![
                Instr::new_data(Label::function(0), Data::LocalGet(0)),
                Instr::new_data(Label::function(1), Data::LocalGet(1)),
                Instr::new_data(Label::function(2), add_i32()),
            ],
        )
    }

    #[test]
    fn straight_line_names_stack_slots() {
        let cfg = build_cfg(&add_args_func()).unwrap();
        let annotated = annotate(&cfg, &Options::default()).unwrap();

        let add = annotated.find_instr(Label::function(2)).unwrap();
        assert_eq!(add.before.vstack, vec![Var::Local(0), Var::Local(1)]);
        assert_eq!(add.after.vstack, vec![Var::Instr(Label::function(2))]);
        assert_eq!(stack_after(&annotated, annotated.exit_block).unwrap(), 1);
    }

    #[test]
    fn propagation_off_mints_fresh_vars() {
        let cfg = build_cfg(&add_args_func()).unwrap();
        let opts = Options { propagate_locals: false, ..Options::default() };
        let annotated = annotate(&cfg, &opts).unwrap();
        let add = annotated.find_instr(Label::function(2)).unwrap();
        assert_eq!(
            add.before.vstack,
            vec![Var::Instr(Label::function(0)), Var::Instr(Label::function(1))]
        );
    }

    #[test]
    fn annotation_is_idempotent() {
        let cfg = build_cfg(&add_args_func()).unwrap();
        let opts = Options::default();
        let once = annotate(&cfg, &opts).unwrap();
        let again = annotate(&once.clear_annotations(), &opts).unwrap();
        assert_eq!(once, again);
    }

    #[test]
    fn if_diamond_mints_merge_vars() {
        use crate::instr::block_arity;
        // local.get 0; if (result i32) i32.const 1 else i32.const 2 end
        let body = vec![
            Instr::new_data(Label::function(0), Data::LocalGet(0)),
            Instr::new_control(
                Label::function(1),
                Control::If {
                    block_type: Some(ValType::I32),
                    arity: block_arity(&Some(ValType::I32)),
                    then_body: vec![Instr::new_data(
                        Label::function(2),
                        Data::Const(PrimValue::I32(1)),
                    )],
                    else_body: vec![Instr::new_data(
                        Label::function(3),
                        Data::Const(PrimValue::I32(2)),
                    )],
                },
            ),
        ];
        let f = func(vec![ValType::I32], vec![ValType::I32], body);
        let cfg = build_cfg(&f).unwrap();
        let annotated = annotate(&cfg, &Options::default()).unwrap();

        // The if continuation merges two distinct constants.
        let merge_idx = annotated
            .blocks
            .values()
            .find(|b| b.is_merge() && b.idx != annotated.exit_block)
            .map(|b| b.idx)
            .unwrap();
        let pairs = new_merge_variables(&annotated, merge_idx).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|(_, m)| matches!(m, Var::Merge(b, _) if *b == merge_idx)));
        let merged_block = annotated.find_block(merge_idx).unwrap();
        assert_eq!(merged_block.before.vstack.len(), 1);
        assert!(matches!(merged_block.before.vstack[0], Var::Merge(_, 0)));
    }

    #[test]
    fn vstack_heights_match_forward_simulation() {
        let cfg = build_cfg(&add_args_func()).unwrap();
        let annotated = annotate(&cfg, &Options::default()).unwrap();
        for block in annotated.blocks.values() {
            // Re-simulate from the entry annotation.
            let mut h = block.before.vstack.len() as isize;
            if let BlockContent::Data(labels) = &block.content {
                for l in labels {
                    let d = annotated.find_instr(*l).unwrap().data().unwrap().clone();
                    h += d.net_effect();
                }
            }
            assert_eq!(h as usize, block.after.vstack.len());
        }
    }
}
