//! Control dependences from the post-dominator tree.
//!
//! A block B is control-dependent on a predicate block P when P has a
//! successor that B post-dominates and another that it does not; the
//! predicate variable is whatever P's terminator branches on.

use std::collections::BTreeMap;

use crate::cfg::{BlockContent, BlockIdx, Cfg};
use crate::error::Result;
use crate::instr::{Control, InstrKind};
use crate::label::Label;
use crate::ssa::{Var, VarState};
use crate::tree::{dominator_tree, Adjacency, Tree};

/// `(label of the predicate's terminator, predicate variable)`.
pub type Predicate = (Label, Var);

fn forward_adjacency(cfg: &Cfg<VarState>) -> Adjacency {
    let mut adj = Adjacency::new();
    for (src, out) in &cfg.edges {
        let entry = adj.entry(*src).or_default();
        for (dst, _) in out {
            if !entry.contains(dst) {
                entry.push(*dst);
            }
        }
    }
    adj
}

fn reverse_adjacency(cfg: &Cfg<VarState>) -> Adjacency {
    let mut adj = Adjacency::new();
    for (dst, inc) in &cfg.back_edges {
        let entry = adj.entry(*dst).or_default();
        for (src, _) in inc {
            if !entry.contains(src) {
                entry.push(*src);
            }
        }
    }
    adj
}

/// The post-dominator tree, rooted at the exit block.
pub fn post_dominator_tree(cfg: &Cfg<VarState>) -> Tree {
    dominator_tree(&reverse_adjacency(cfg), &forward_adjacency(cfg), cfg.exit_block)
}

/// The condition a control block branches on, if it is a predicate
/// (`br_if`, `if` or `br_table` terminator).
pub fn predicate_of(cfg: &Cfg<VarState>, idx: BlockIdx) -> Result<Option<Predicate>> {
    let block = cfg.find_block(idx)?;
    let BlockContent::Control(label) = &block.content else {
        return Ok(None);
    };
    let instr = cfg.find_instr(*label)?;
    let is_predicate = matches!(
        &instr.kind,
        InstrKind::Control(Control::BrIf(_))
            | InstrKind::Control(Control::If { .. })
            | InstrKind::Control(Control::BrTable { .. })
    );
    if !is_predicate {
        return Ok(None);
    }
    Ok(instr.before.vstack.last().map(|v| (*label, *v)))
}

/// For every block, the predicates it is control-dependent on.
pub fn control_dependencies(cfg: &Cfg<VarState>) -> Result<BTreeMap<BlockIdx, Vec<Predicate>>> {
    let pdom = post_dominator_tree(cfg);
    let mut deps: BTreeMap<BlockIdx, Vec<Predicate>> = BTreeMap::new();

    for (&p, _) in &cfg.blocks {
        let Some(predicate) = predicate_of(cfg, p)? else {
            continue;
        };
        let stop = pdom.parent.get(&p).copied();
        for (succ, _) in cfg.successors(p) {
            // Every block post-dominating this successor, up to but not
            // including P's own immediate post-dominator, depends on P.
            let mut cur = Some(*succ);
            while let Some(b) = cur {
                if Some(b) == stop {
                    break;
                }
                let entry = deps.entry(b).or_default();
                if !entry.contains(&predicate) {
                    entry.push(predicate);
                }
                cur = pdom.parent.get(&b).copied();
                if cur.is_none() {
                    break;
                }
            }
        }
    }
    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_cfg;
    use crate::config::Options;
    use crate::ingest::Function;
    use crate::instr::{block_arity, Data, Instr};
    use crate::ssa::annotate;
    use crate::types::{PrimValue, ValType};

    /// local.get 0; if (result i32) i32.const 1 else i32.const 2 end
    fn diamond() -> Cfg<VarState> {
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
        let f = Function {
            idx: 0,
            name: None,
            exported: false,
            arg_types: vec![ValType::I32],
            return_types: vec![ValType::I32],
            local_types: vec![],
            global_types: vec![],
            body,
        };
        let cfg = build_cfg(&f).unwrap();
        annotate(&cfg, &Options::default()).unwrap()
    }

    #[test]
    fn arms_depend_on_the_if_but_the_join_does_not() {
        let cfg = diamond();
        let deps = control_dependencies(&cfg).unwrap();

        let if_label = Label::function(1);
        let then_block = *cfg.label_to_block().get(&Label::function(2)).unwrap();
        let else_block = *cfg.label_to_block().get(&Label::function(3)).unwrap();

        let then_deps = deps.get(&then_block).unwrap();
        assert!(then_deps.iter().any(|(l, v)| *l == if_label && *v == Var::Local(0)));
        let else_deps = deps.get(&else_block).unwrap();
        assert!(else_deps.iter().any(|(l, _)| *l == if_label));

        // The continuation post-dominates the branch: no dependence.
        let merge = cfg
            .blocks
            .values()
            .find(|b| b.is_merge() && b.idx != cfg.exit_block)
            .unwrap()
            .idx;
        assert!(deps.get(&merge).map(Vec::is_empty).unwrap_or(true));
    }
}
