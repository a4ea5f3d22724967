use std::collections::BTreeSet;

use wasm_slice::cfg::Cfg;
use wasm_slice::config::Options;
use wasm_slice::label::Label;
use wasm_slice::slice::{instructions_to_keep, slice};
use wasm_slice::ssa::{annotate, count_vars};
use wasm_slice::usedef::{use_def_chains, uses, Definition};
use wasm_slice::Var;

use crate::utils::{annotated, annotated_with, fl};

mod utils;

fn function_labels(kept: &BTreeSet<Label>) -> BTreeSet<u32> {
    kept.iter()
        .filter(|l| matches!(l.section, wasm_slice::Section::Function))
        .map(|l| l.id)
        .collect()
}

fn assert_stack_valid(cfg: &Cfg<wasm_slice::VarState>) {
    for block in cfg.blocks.values() {
        for (succ, _) in cfg.successors(block.idx) {
            let v = cfg.find_block(*succ).unwrap();
            assert_eq!(
                block.after.vstack.len(),
                v.before.vstack.len(),
                "edge {} -> {} disagrees on stack height",
                block.idx,
                succ
            );
        }
    }
}

#[test]
fn straight_line_slice_keeps_the_feeding_chain() {
    let cfg = annotated(
        r#"(module (memory 1) (func (result i32)
            memory.size memory.size i32.add drop
            memory.size memory.size i32.add))"#,
    );
    let kept = instructions_to_keep(&cfg, fl(2)).unwrap();
    assert_eq!(function_labels(&kept), [0, 1, 2].into_iter().collect());

    let sliced = slice(&cfg, fl(2), &Options::default()).unwrap();
    for gone in [3u32, 4, 5, 6] {
        assert!(!sliced.instructions.contains_key(&fl(gone)));
    }
    assert_stack_valid(&annotate(&sliced, &Options::default()).unwrap());
}

#[test]
fn use_def_chains_of_two_locals() {
    let cfg = annotated(
        r#"(module (func (param i32 i32) (result i32)
            local.get 0 local.get 1 i32.add))"#,
    );
    let chains = use_def_chains(&cfg).unwrap();

    let add = fl(2);
    assert_eq!(uses(&cfg, add).unwrap(), vec![Var::Local(0), Var::Local(1)]);
    assert_eq!(chains.def_of(&Var::Local(0)).unwrap(), &Definition::Entry(Var::Local(0)));
    assert_eq!(chains.def_of(&Var::Local(1)).unwrap(), &Definition::Entry(Var::Local(1)));

    // The final merge consumes the add's result, defined at the add.
    let exit = Label::merge(cfg.exit_block);
    assert_eq!(uses(&cfg, exit).unwrap(), vec![Var::Instr(add)]);
    assert_eq!(
        chains.def_of(&Var::Instr(add)).unwrap(),
        &Definition::Instruction(add, Var::Instr(add))
    );
}

#[test]
fn if_diamond_slice_keeps_both_arms_and_the_condition() {
    let cfg = annotated(
        r#"(module (memory 1) (func (result i32)
            memory.size               ;; 0
            if (result i32)           ;; 1
              memory.size             ;; 2
            else
              memory.size             ;; 3
            end
            memory.size               ;; 4
            memory.size               ;; 5
            i32.add                   ;; 6
            drop                      ;; 7
            memory.size               ;; 8
            i32.add))"#,
    );
    let kept = instructions_to_keep(&cfg, fl(9)).unwrap();
    assert_eq!(function_labels(&kept), [0, 1, 2, 3, 8, 9].into_iter().collect());
    // The synthetic merge of the diamond is in the slice too.
    assert!(kept.iter().any(|l| l.is_merge()), "no merge label kept: {kept:?}");

    // 4..7 are gone from the sliced instruction map.
    let sliced = slice(&cfg, fl(9), &Options::default()).unwrap();
    for gone in [4u32, 5, 6, 7] {
        assert!(!sliced.instructions.contains_key(&fl(gone)));
    }
    for stays in [0u32, 1, 2, 3, 8, 9] {
        assert!(sliced.instructions.contains_key(&fl(stays)));
    }
    assert_stack_valid(&annotate(&sliced, &Options::default()).unwrap());
}

#[test]
fn load_depends_on_overlapping_store() {
    let cfg = annotated(
        r#"(module (memory 1) (func
            memory.size               ;; 0 (address)
            memory.size               ;; 1 (value)
            i32.store                 ;; 2
            memory.size               ;; 3
            i32.load                  ;; 4
            drop))"#,
    );
    let kept = instructions_to_keep(&cfg, fl(4)).unwrap();
    assert!(
        kept.contains(&fl(2)),
        "store should be kept through the memory dependence, kept = {kept:?}"
    );
}

#[test]
fn constant_chain_past_the_criterion_is_dropped() {
    let cfg = annotated(
        r#"(module (func (result i32)
            i32.const 0               ;; 0
            i32.const 1               ;; 1
            i32.add                   ;; 2
            i32.const 2               ;; 3
            i32.const 3               ;; 4
            i32.add                   ;; 5
            drop))"#,
    );
    let sliced = slice(&cfg, fl(2), &Options::default()).unwrap();
    for gone in [3u32, 4, 5] {
        assert!(
            !sliced.instructions.contains_key(&fl(gone)),
            "label {gone} should be absent from the sliced instruction map"
        );
    }
    assert!(sliced.instructions.contains_key(&fl(2)));
}

#[test]
fn call_indirect_slice_shrinks_the_variable_count() {
    let cfg = annotated(
        r#"(module
            (type $t (func (param i32) (result i32)))
            (table 1 funcref)
            (memory 1)
            (func (param i32) (result i32)
              memory.size             ;; 0
              memory.size             ;; 1
              i32.add                 ;; 2
              drop                    ;; 3
              local.get 0             ;; 4
              i32.const 0             ;; 5
              call_indirect (type $t) ;; 6
            ))"#,
    );
    let sliced = slice(&cfg, fl(6), &Options::default()).unwrap();
    let resliced = annotate(&sliced, &Options::default()).unwrap();
    assert!(
        count_vars(&resliced) < count_vars(&cfg),
        "slice should strictly reduce the variable count ({} vs {})",
        count_vars(&resliced),
        count_vars(&cfg)
    );
}

#[test]
fn loop_head_merges_the_counter() {
    let cfg = annotated(
        r#"(module (func (param i32) (result i32)
            loop $l                   ;; 0
              local.get 0             ;; 1
              i32.const 1             ;; 2
              i32.sub                 ;; 3
              local.set 0             ;; 4
              local.get 0             ;; 5
              br_if $l                ;; 6
            end
            local.get 0))"#,
    );
    assert!(!cfg.loop_heads.is_empty());

    // The counter local is merged at the loop head, so the final read
    // depends on the subtraction through the merge.
    let kept = instructions_to_keep(&cfg, fl(7)).unwrap();
    assert!(kept.contains(&fl(3)), "kept = {kept:?}");
    assert!(kept.iter().any(|l| l.is_merge()));

    let sliced = slice(&cfg, fl(7), &Options::default()).unwrap();
    assert_stack_valid(&annotate(&sliced, &Options::default()).unwrap());
}

#[test]
fn singleton_drop_block_is_legal() {
    let cfg = annotated(
        r#"(module (memory 1) (func
            memory.size drop))"#,
    );
    let kept = instructions_to_keep(&cfg, fl(1)).unwrap();
    assert!(kept.contains(&fl(1)));
    let sliced = slice(&cfg, fl(1), &Options::default()).unwrap();
    assert_stack_valid(&annotate(&sliced, &Options::default()).unwrap());
}

#[test]
fn slicing_twice_is_isomorphic() {
    let cfg = annotated(
        r#"(module (memory 1) (func (result i32)
            memory.size memory.size i32.add drop
            memory.size memory.size i32.add))"#,
    );
    let opts = Options::default();
    let once = slice(&cfg, fl(2), &opts).unwrap();
    let twice = slice(&annotate(&once, &opts).unwrap(), fl(2), &opts).unwrap();

    let non_dummy = |c: &Cfg<()>| -> BTreeSet<Label> {
        c.instructions.keys().filter(|l| !l.is_dummy()).copied().collect()
    };
    assert_eq!(non_dummy(&once), non_dummy(&twice));
    assert_eq!(once.blocks.len(), twice.blocks.len());
}

#[test]
fn merge_discipline_holds_on_every_cfg() {
    for src in [
        r#"(module (memory 1) (func (result i32)
            memory.size if (result i32) memory.size else memory.size end))"#,
        r#"(module (func (param i32)
            block $b local.get 0 br_if $b end))"#,
        r#"(module (func (param i32) (result i32)
            loop $l local.get 0 br_if $l end local.get 0))"#,
    ] {
        let cfg = annotated(src);
        for block in cfg.blocks.values() {
            if cfg.in_degree(block.idx) > 1 {
                assert!(block.is_merge(), "block {} violates merge discipline", block.idx);
            }
        }
        assert_stack_valid(&cfg);
    }
}

#[test]
fn propagation_knobs_change_the_naming() {
    let src = r#"(module (func (param i32) (result i32)
        local.get 0 local.get 0 i32.add))"#;
    let with = annotated(src);
    let without = annotated_with(
        src,
        &Options { propagate_locals: false, ..Options::default() },
    );
    let add_with = with.find_instr(fl(2)).unwrap();
    let add_without = without.find_instr(fl(2)).unwrap();
    assert_eq!(add_with.before.vstack, vec![Var::Local(0), Var::Local(0)]);
    assert_eq!(
        add_without.before.vstack,
        vec![Var::Instr(fl(0)), Var::Instr(fl(1))]
    );
}

#[test]
fn dot_output_is_deterministic() {
    let src = r#"(module (memory 1) (func (result i32)
        memory.size memory.size i32.add))"#;
    let a = annotated(src).to_dot(|s| s.to_string());
    let b = annotated(src).to_dot(|s| s.to_string());
    assert_eq!(a, b);
    assert!(a.starts_with("digraph"));
    assert!(a.contains("i32.add"));
}
