//! Per-instruction def/use tables and use-def chains over SSA vars.
//!
//! Every variable that is neither a function-entry local/global nor a
//! constant has exactly one defining instruction; merge blocks define
//! their merge vars and use the vars they merge.

use std::collections::{BTreeMap, BTreeSet};

use crate::cfg::{BlockIdx, Cfg};
use crate::error::{AnalysisError, Result};
use crate::instr::{Control, Data, Instr, InstrKind};
use crate::label::Label;
use crate::ssa::{new_merge_variables, Var, VarState};
use crate::types::PrimValue;

/// Where a variable comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition {
    /// Defined by the instruction with this label.
    Instruction(Label, Var),
    /// Live at function entry (parameters, initial locals, globals).
    Entry(Var),
    /// A constant literal.
    Constant(PrimValue),
}

/// Variables this instruction defines. Top of the after-stack for
/// value-producing instructions, the rebound local/global slot for
/// set/tee when propagation is off, the minted vars for merge blocks;
/// empty for stores and branches.
pub fn defs(cfg: &Cfg<VarState>, label: Label) -> Result<Vec<Var>> {
    if label.is_merge() {
        let idx: BlockIdx = label.id;
        return Ok(new_merge_variables(cfg, idx)?
            .into_iter()
            .map(|(_, minted)| minted)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect());
    }
    let instr = cfg.find_instr(label)?;
    let mut out = Vec::new();
    match &instr.kind {
        InstrKind::Data(d) => {
            let (_, pushes) = d.arity();
            if pushes > 0 {
                if let Some(v) = instr.after.vstack.last() {
                    // A propagated get pushes somebody else's var; only
                    // a var named after this instruction (or a constant
                    // collapsed here) is a definition of ours.
                    let own = match v {
                        Var::Instr(l) => *l == label,
                        Var::Const(_) => matches!(d, Data::Const(_)),
                        _ => false,
                    };
                    if own {
                        out.push(*v);
                    }
                }
            }
            // A set/tee that minted a fresh slot var defines it.
            if let Data::LocalSet(i) | Data::LocalTee(i) = d {
                if let Some(v) = instr.after.locals.get(*i as usize) {
                    if *v == Var::Instr(label) && !out.contains(v) {
                        out.push(*v);
                    }
                }
            }
            if let Data::GlobalSet(i) = d {
                if let Some(v) = instr.after.globals.get(*i as usize) {
                    if *v == Var::Instr(label) && !out.contains(v) {
                        out.push(*v);
                    }
                }
            }
        }
        InstrKind::Control(c) => {
            if let Control::Call { arity, .. } | Control::CallIndirect { arity, .. } = c {
                if arity.1 > 0 {
                    if let Some(v) = instr.after.vstack.last() {
                        out.push(*v);
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Variables this instruction reads: the consumed stack slots, the
/// local/global slot for get operations, the incoming vars for merge
/// blocks, and the result vars for the exit merge.
pub fn uses(cfg: &Cfg<VarState>, label: Label) -> Result<Vec<Var>> {
    if label.is_merge() {
        let idx: BlockIdx = label.id;
        if idx == cfg.exit_block {
            return Ok(cfg.find_block(idx)?.before.vstack.clone());
        }
        let mut out = Vec::new();
        for (old, _) in new_merge_variables(cfg, idx)? {
            if !out.contains(&old) {
                out.push(old);
            }
        }
        return Ok(out);
    }

    let instr = cfg.find_instr(label)?;
    let pops = match &instr.kind {
        InstrKind::Data(d) => match d {
            Data::LocalGet(i) => {
                return Ok(instr.before.locals.get(*i as usize).copied().into_iter().collect());
            }
            Data::GlobalGet(i) => {
                return Ok(instr.before.globals.get(*i as usize).copied().into_iter().collect());
            }
            other => other.arity().0,
        },
        InstrKind::Control(c) => match c {
            Control::If { .. } | Control::BrIf(_) | Control::BrTable { .. } => 1,
            Control::Call { arity, .. } => arity.0,
            Control::CallIndirect { arity, .. } => arity.0 + 1,
            Control::Return => cfg.return_types.len(),
            Control::Block { .. }
            | Control::Loop { .. }
            | Control::Br(_)
            | Control::Unreachable
            | Control::Merge => 0,
        },
    };
    let stack = &instr.before.vstack;
    let start = stack.len().saturating_sub(pops);
    Ok(stack[start..].to_vec())
}

/// Use-def relations for a whole annotated CFG.
#[derive(Debug, Clone, Default)]
pub struct UseDefChains {
    pub defs: BTreeMap<Var, Definition>,
    pub uses: BTreeMap<Var, BTreeSet<Label>>,
}

impl UseDefChains {
    /// The unique definition reaching a use of `var`.
    pub fn def_of(&self, var: &Var) -> Result<&Definition> {
        self.defs.get(var).ok_or(AnalysisError::UseWithoutDef(*var))
    }
}

pub fn use_def_chains(cfg: &Cfg<VarState>) -> Result<UseDefChains> {
    let mut chains = UseDefChains::default();

    // Entry definitions.
    let entry = &cfg.find_block(cfg.entry_block)?.before;
    for v in entry.locals.iter().chain(entry.globals.iter()) {
        chains.defs.insert(*v, Definition::Entry(*v));
    }

    for label in cfg.instructions.keys().copied().collect::<Vec<_>>() {
        for v in defs(cfg, label)? {
            let definition = match v {
                Var::Const(c) => Definition::Constant(c),
                Var::Local(_) | Var::Global(_) => Definition::Entry(v),
                _ => Definition::Instruction(label, v),
            };
            if let Some(Definition::Instruction(existing, _)) = chains.defs.get(&v) {
                if *existing != label {
                    return Err(AnalysisError::SliceValidation(format!(
                        "variable {v} defined at both {existing} and {label}"
                    )));
                }
            }
            chains.defs.insert(v, definition);
        }
        for v in uses(cfg, label)? {
            chains.uses.entry(v).or_default().insert(label);
            // Constants and entry vars are defined even if no
            // instruction introduced them.
            if let Var::Const(c) = v {
                chains.defs.entry(v).or_insert(Definition::Constant(c));
            }
        }
    }

    Ok(chains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_cfg;
    use crate::config::Options;
    use crate::ingest::Function;
    use crate::ssa::annotate;
    use crate::types::{Binary, BinaryKind, ValType};

    /// local.get 0; local.get 1; i32.add
    fn add_args() -> Cfg<VarState> {
        let f = Function {
            idx: 0,
            name: None,
            exported: false,
            arg_types: vec![ValType::I32, ValType::I32],
            return_types: vec![ValType::I32],
            local_types: vec![],
            global_types: vec![],
            body: vec![
                Instr::new_data(Label::function(0), Data::LocalGet(0)),
                Instr::new_data(Label::function(1), Data::LocalGet(1)),
                Instr::new_data(
                    Label::function(2),
                    Data::Binary(Binary { typ: ValType::I32, op: BinaryKind::Add }),
                ),
            ],
        };
        let cfg = build_cfg(&f).unwrap();
        annotate(&cfg, &Options::default()).unwrap()
    }

    #[test]
    fn chains_for_add_of_two_locals() {
        let cfg = add_args();
        let chains = use_def_chains(&cfg).unwrap();

        let add = Label::function(2);
        assert_eq!(uses(&cfg, add).unwrap(), vec![Var::Local(0), Var::Local(1)]);
        assert_eq!(chains.def_of(&Var::Local(0)).unwrap(), &Definition::Entry(Var::Local(0)));
        assert_eq!(chains.def_of(&Var::Local(1)).unwrap(), &Definition::Entry(Var::Local(1)));

        // The final merge (exit) uses the add's result.
        let exit_label = Label::merge(cfg.exit_block);
        assert_eq!(uses(&cfg, exit_label).unwrap(), vec![Var::Instr(add)]);
        assert_eq!(
            chains.def_of(&Var::Instr(add)).unwrap(),
            &Definition::Instruction(add, Var::Instr(add))
        );
    }

    #[test]
    fn every_instr_var_has_one_def() {
        let cfg = add_args();
        let chains = use_def_chains(&cfg).unwrap();
        for (var, users) in &chains.uses {
            if matches!(var, Var::Instr(_) | Var::Merge(..)) {
                assert!(!users.is_empty());
                assert!(
                    matches!(chains.def_of(var), Ok(Definition::Instruction(..))),
                    "{var} should have an instruction definition"
                );
            }
        }
    }
}
