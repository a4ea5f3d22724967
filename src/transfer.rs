//! The value-domain transfer function: constraints on SSA variables.
//!
//! Runs after spec inference, over the annotated CFG: every program
//! point already names its stack slots, so the state is simply a map
//! from variable to abstract value. Branching blocks produce a
//! `Branch` result whose false arm meets the condition with zero (and
//! flips a symbolic comparison); call sites instantiate the callee's
//! summary.

use std::collections::BTreeMap;

use crate::cfg::{BasicBlock, BlockContent, BlockIdx, Cfg};
use crate::error::{AnalysisError, Result};
use crate::fixpoint::{intra_fixpoint, BlockResult, Transfer, TransferResult};
use crate::instr::{Control, Data, Instr, InstrKind};
use crate::ssa::{new_merge_variables, Var, VarState};
use crate::summary::{Summary, SummaryMap};
use crate::types::{BinaryKind, CompareKind};
use crate::value::{Sym, SymOp, Value};

/// Abstract values for every variable in scope. A variable absent from
/// the map has not been bound on this path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueEnv {
    pub env: BTreeMap<Var, Value>,
}

impl ValueEnv {
    pub fn get(&self, var: &Var) -> Value {
        match var {
            Var::Const(c) => Value::constant(c.as_i64()),
            _ => self.env.get(var).cloned().unwrap_or(Value::OpenInterval),
        }
    }

    fn bind(&mut self, var: Var, value: Value) {
        self.env.insert(var, value.simplify());
    }

    fn join(&self, other: &ValueEnv) -> ValueEnv {
        let mut env = self.env.clone();
        for (k, v) in &other.env {
            match env.get(k) {
                None => {
                    env.insert(*k, v.clone());
                }
                Some(existing) => {
                    let joined = existing.join(v);
                    env.insert(*k, joined);
                }
            }
        }
        ValueEnv { env }
    }
}

pub struct ValueAnalysis<'a> {
    pub summaries: &'a SummaryMap,
}

impl<'a> ValueAnalysis<'a> {
    fn sym_binop(&self, op: BinaryKind) -> Option<SymOp> {
        match op {
            BinaryKind::Add => Some(SymOp::Add),
            BinaryKind::Sub => Some(SymOp::Sub),
            BinaryKind::Mul => Some(SymOp::Mul),
            _ => None,
        }
    }

    fn sym_relop(&self, op: CompareKind) -> Option<SymOp> {
        match op {
            CompareKind::Eq => Some(SymOp::Eq),
            CompareKind::LtS => Some(SymOp::Lt),
            CompareKind::LeS => Some(SymOp::Le),
            CompareKind::GtS => Some(SymOp::Gt),
            CompareKind::GeS => Some(SymOp::Ge),
            _ => None,
        }
    }

    fn binary_value(&self, op: Option<SymOp>, a: &Value, b: &Value) -> Value {
        match (op, a, b) {
            (Some(op), Value::Symbolic(sa), Value::Symbolic(sb)) => {
                Value::Symbolic(Sym::op(op, sa.clone(), sb.clone()).simplify())
            }
            (Some(SymOp::Add), Value::Symbolic(Sym::Const(c)), other)
            | (Some(SymOp::Add), other, Value::Symbolic(Sym::Const(c))) => other.add_offset(*c),
            _ => Value::OpenInterval,
        }
    }

    fn transfer_data(&self, instr: &Instr<VarState>, data: &Data, env: &mut ValueEnv) {
        let before = &instr.before;
        let after = &instr.after;
        let result = after.vstack.last();
        match data {
            Data::Nop | Data::Drop | Data::Store(_) => {}
            Data::Const(c) => {
                if let Some(r) = result {
                    env.bind(*r, Value::constant(c.as_i64()));
                }
            }
            Data::Binary(b) => {
                let n = before.vstack.len();
                if let (Some(r), true) = (result, n >= 2) {
                    let (x, y) = (&before.vstack[n - 2], &before.vstack[n - 1]);
                    let v = self.binary_value(self.sym_binop(b.op), &env.get(x), &env.get(y));
                    env.bind(*r, v);
                }
            }
            Data::Compare(c) => {
                let n = before.vstack.len();
                if let (Some(r), true) = (result, n >= 2) {
                    let (x, y) = (&before.vstack[n - 2], &before.vstack[n - 1]);
                    let v = self.binary_value(self.sym_relop(c.op), &env.get(x), &env.get(y));
                    env.bind(*r, v);
                }
            }
            Data::Test(_) => {
                if let (Some(r), Some(x)) = (result, before.vstack.last()) {
                    let v = match env.get(x) {
                        Value::Symbolic(s) => {
                            Value::Symbolic(Sym::op(SymOp::Eq, s, Sym::Const(0)).simplify())
                        }
                        _ => Value::OpenInterval,
                    };
                    env.bind(*r, v);
                }
            }
            Data::LocalGet(i) => {
                if let (Some(r), Some(slot)) = (result, before.locals.get(*i as usize)) {
                    if r != slot {
                        let v = env.get(slot);
                        env.bind(*r, v);
                    }
                }
            }
            Data::GlobalGet(i) => {
                if let (Some(r), Some(slot)) = (result, before.globals.get(*i as usize)) {
                    if r != slot {
                        let v = env.get(slot);
                        env.bind(*r, v);
                    }
                }
            }
            Data::LocalSet(i) | Data::LocalTee(i) => {
                if let (Some(slot), Some(v)) =
                    (after.locals.get(*i as usize), before.vstack.last())
                {
                    if slot != v {
                        let value = env.get(v);
                        env.bind(*slot, value);
                    }
                }
            }
            Data::GlobalSet(i) => {
                if let (Some(slot), Some(v)) =
                    (after.globals.get(*i as usize), before.vstack.last())
                {
                    if slot != v {
                        let value = env.get(v);
                        env.bind(*slot, value);
                    }
                }
            }
            Data::Load(op) => {
                if let (Some(r), Some(addr)) = (result, before.vstack.last()) {
                    // The byte formula first, a symbolic dereference as
                    // fallback.
                    let v = match before.memory.load(addr, op.offset) {
                        Some(src) => env.get(&src),
                        None => match env.get(addr) {
                            Value::Symbolic(a) => {
                                let shifted = if op.offset != 0 {
                                    Sym::op(SymOp::Add, a, Sym::Const(op.offset as i64)).simplify()
                                } else {
                                    a
                                };
                                Value::Symbolic(Sym::Deref(Box::new(shifted)))
                            }
                            _ => Value::OpenInterval,
                        },
                    };
                    env.bind(*r, v);
                }
            }
            Data::Select | Data::MemorySize | Data::MemoryGrow | Data::Unary(_)
            | Data::Convert(_) => {
                if let Some(r) = result {
                    env.bind(*r, Value::OpenInterval);
                }
            }
        }
    }

    fn transfer_call(
        &self,
        instr: &Instr<VarState>,
        callee: Option<u32>,
        nargs: usize,
        nresults: usize,
        env: &mut ValueEnv,
    ) {
        let before = &instr.before;
        let args: Vec<Value> = {
            let n = before.vstack.len();
            let start = n.saturating_sub(nargs);
            before.vstack[start..].iter().map(|v| env.get(v)).collect()
        };
        let caller_globals: Vec<Value> = before.globals.iter().map(|v| env.get(v)).collect();

        let trivial = Summary::trivial(nargs, nresults, caller_globals.len());
        let summary = callee.and_then(|f| self.summaries.get(&f)).unwrap_or(&trivial);

        let (results, globals) = summary.apply(&args, &caller_globals);
        if let (Some(r), Some(value)) = (instr.after.vstack.last(), results.first()) {
            env.bind(*r, value.clone());
        }
        for (slot, value) in instr.after.globals.iter().zip(globals) {
            env.bind(*slot, value);
        }
    }

    /// The false arm learns the condition was zero; a symbolic
    /// comparison is flipped outright by the simplifier.
    fn refine_branch(&self, cond: &Var, env: &ValueEnv) -> (ValueEnv, ValueEnv) {
        let mut true_env = env.clone();
        let mut false_env = env.clone();
        let v = env.get(cond);
        if v.is_zero() {
            true_env.bind(*cond, Value::Bottom);
        }
        match &v {
            Value::Symbolic(s @ Sym::Op(..)) => {
                let flipped = Sym::op(SymOp::Eq, s.clone(), Sym::Const(0)).simplify();
                false_env.bind(*cond, Value::Symbolic(flipped));
            }
            _ => {
                let met = v.meet(&Value::constant(0));
                false_env.bind(*cond, met);
            }
        }
        (true_env, false_env)
    }
}

impl<'a> Transfer<VarState> for ValueAnalysis<'a> {
    type State = ValueEnv;

    fn entry_state(&self, cfg: &Cfg<VarState>) -> Result<ValueEnv> {
        let mut env = ValueEnv::default();
        let nargs = cfg.arg_types.len();
        let total = nargs + cfg.local_types.len();
        for i in 0..total as u32 {
            let v = if (i as usize) < nargs { Value::parameter(i) } else { Value::constant(0) };
            env.bind(Var::Local(i), v);
        }
        for i in 0..cfg.global_types.len() as u32 {
            env.bind(Var::Global(i), Value::global(i));
        }
        Ok(env)
    }

    fn merge_flows(
        &self,
        cfg: &Cfg<VarState>,
        block: &BasicBlock<VarState>,
        flows: Vec<ValueEnv>,
    ) -> Result<ValueEnv> {
        let mut merged = flows[0].clone();
        for other in &flows[1..] {
            merged = merged.join(other);
        }
        if block.is_merge() {
            // A minted merge var takes the join of whatever it merges.
            for (old, minted) in new_merge_variables(cfg, block.idx)? {
                let incoming = merged.get(&old);
                let current = merged.env.get(&minted).cloned().unwrap_or(Value::Bottom);
                merged.bind(minted, current.join(&incoming));
            }
        }
        Ok(merged)
    }

    fn transfer_block(
        &self,
        cfg: &Cfg<VarState>,
        block: &BasicBlock<VarState>,
        state: ValueEnv,
    ) -> Result<TransferResult<ValueEnv>> {
        let mut env = state;
        match &block.content {
            BlockContent::Data(labels) => {
                for label in labels {
                    let instr = cfg.find_instr(*label)?;
                    let data = instr.data().cloned().ok_or_else(|| {
                        AnalysisError::SliceValidation(format!(
                            "control instruction {label} in a data block"
                        ))
                    })?;
                    self.transfer_data(instr, &data, &mut env);
                }
                Ok(TransferResult::Simple(env))
            }
            BlockContent::Control(label) => {
                let instr = cfg.find_instr(*label)?;
                let InstrKind::Control(control) = &instr.kind else {
                    return Err(AnalysisError::SliceValidation(format!(
                        "data instruction {label} in a control block"
                    )));
                };
                match control {
                    Control::If { .. } | Control::BrIf(_) => {
                        let cond = instr.before.vstack.last().copied();
                        match cond {
                            Some(c) => {
                                let (t, f) = self.refine_branch(&c, &env);
                                Ok(TransferResult::Branch(t, f))
                            }
                            None => Ok(TransferResult::Branch(env.clone(), env)),
                        }
                    }
                    Control::Call { arity, index } => {
                        self.transfer_call(instr, Some(*index), arity.0, arity.1, &mut env);
                        Ok(TransferResult::Simple(env))
                    }
                    Control::CallIndirect { arity, .. } => {
                        self.transfer_call(instr, None, arity.0 + 1, arity.1, &mut env);
                        Ok(TransferResult::Simple(env))
                    }
                    _ => Ok(TransferResult::Simple(env)),
                }
            }
            BlockContent::Merge(_) => {
                if block.idx == cfg.exit_block && !cfg.return_types.is_empty() {
                    // Bind the function result to the top of the stack.
                    if let Some(top) = block.before.vstack.last() {
                        let v = env.get(top);
                        env.bind(Var::Return, v);
                    }
                }
                Ok(TransferResult::Simple(env))
            }
        }
    }

    fn join_state(&self, old: &ValueEnv, new: ValueEnv) -> Result<ValueEnv> {
        Ok(old.join(&new))
    }
}

/// Run the value analysis over an annotated CFG.
pub fn value_analysis(
    cfg: &Cfg<VarState>,
    summaries: &SummaryMap,
) -> Result<BTreeMap<BlockIdx, BlockResult<ValueEnv>>> {
    let analysis = ValueAnalysis { summaries };
    intra_fixpoint(cfg, &analysis)
}

/// Build a summary of a function from its value-analysis result.
pub fn summarize(
    cfg: &Cfg<VarState>,
    results: &BTreeMap<BlockIdx, BlockResult<ValueEnv>>,
) -> Summary {
    let exit_env = results
        .get(&cfg.exit_block)
        .map(|r| match &r.out {
            TransferResult::Simple(s) => s.clone(),
            TransferResult::Branch(t, f) => t.join(f),
            TransferResult::Uninitialized => ValueEnv::default(),
        })
        .unwrap_or_default();

    let results_stack: Vec<Value> = if cfg.return_types.is_empty() {
        Vec::new()
    } else {
        vec![exit_env.get(&Var::Return)]
    };
    let exit_block = cfg.blocks.get(&cfg.exit_block);
    let globals = match exit_block {
        Some(b) => b.before.globals.iter().map(|v| exit_env.get(v)).collect(),
        None => Vec::new(),
    };
    let memory = exit_block.map(|b| b.before.memory.clone()).unwrap_or_default();

    Summary { nargs: cfg.arg_types.len(), results: results_stack, globals, memory }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_cfg;
    use crate::config::Options;
    use crate::ingest::Function;
    use crate::label::Label;
    use crate::ssa::annotate;
    use crate::types::{Binary, PrimValue, ValType};

    #[test]
    fn add_of_param_and_const_is_symbolic() {
        // local.get 0; i32.const 1; i32.add
        let f = Function {
            idx: 0,
            name: None,
            exported: false,
            arg_types: vec![ValType::I32],
            return_types: vec![ValType::I32],
            local_types: vec![],
            global_types: vec![],
            body: vec![
                Instr::new_data(Label::function(0), Data::LocalGet(0)),
                Instr::new_data(Label::function(1), Data::Const(PrimValue::I32(1))),
                Instr::new_data(
                    Label::function(2),
                    Data::Binary(Binary { typ: ValType::I32, op: BinaryKind::Add }),
                ),
            ],
        };
        let cfg = build_cfg(&f).unwrap();
        let annotated = annotate(&cfg, &Options::default()).unwrap();
        let summaries = SummaryMap::new();
        let results = value_analysis(&annotated, &summaries).unwrap();
        let summary = summarize(&annotated, &results);
        assert_eq!(
            summary.results,
            vec![Value::Symbolic(Sym::op(SymOp::Add, Sym::Parameter(0), Sym::Const(1)))]
        );
    }
}
