//! Basic blocks and the function-scoped control-flow graph.
//!
//! All maps are ordered so that iteration (and therefore `.dot` output
//! and slicing) is deterministic run to run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::error::{AnalysisError, Result};
use crate::instr::Instr;
use crate::label::Label;
use crate::types::ValType;

pub type BlockIdx = u32;

/// What a basic block holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockContent {
    /// Ordered sequence of data instructions. Non-empty, except in a
    /// CFG produced by the slicer.
    Data(Vec<Label>),
    /// A single control instruction.
    Control(Label),
    /// An SSA join. Carries the label of its synthetic merge
    /// instruction (allocated in the merge section, id = block index).
    Merge(Label),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock<A> {
    pub idx: BlockIdx,
    pub content: BlockContent,
    pub before: A,
    pub after: A,
}

impl<A> BasicBlock<A> {
    pub fn is_merge(&self) -> bool {
        matches!(self.content, BlockContent::Merge(_))
    }

    /// Labels referenced by this block, in program order.
    pub fn labels(&self) -> Vec<Label> {
        match &self.content {
            BlockContent::Data(ls) => ls.clone(),
            BlockContent::Control(l) | BlockContent::Merge(l) => vec![*l],
        }
    }
}

/// A function-scoped control-flow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfg<A> {
    pub func_idx: u32,
    pub exported: bool,
    pub name: Option<String>,
    pub global_types: Vec<ValType>,
    pub arg_types: Vec<ValType>,
    pub local_types: Vec<ValType>,
    pub return_types: Vec<ValType>,
    pub blocks: BTreeMap<BlockIdx, BasicBlock<A>>,
    /// Denormalised label lookup; the single store for instructions.
    pub instructions: BTreeMap<Label, Instr<A>>,
    /// Forward edges keyed by source. A pair of edges between the same
    /// blocks with distinct booleans is allowed and meaningful.
    pub edges: BTreeMap<BlockIdx, Vec<(BlockIdx, Option<bool>)>>,
    /// Reverse edges keyed by destination.
    pub back_edges: BTreeMap<BlockIdx, Vec<(BlockIdx, Option<bool>)>>,
    pub entry_block: BlockIdx,
    pub exit_block: BlockIdx,
    pub loop_heads: BTreeSet<BlockIdx>,
}

impl<A> Cfg<A> {
    pub fn find_block(&self, idx: BlockIdx) -> Result<&BasicBlock<A>> {
        self.blocks.get(&idx).ok_or(AnalysisError::BlockNotFound(idx))
    }

    pub fn find_instr(&self, label: Label) -> Result<&Instr<A>> {
        self.instructions.get(&label).ok_or(AnalysisError::InstrNotFound(label))
    }

    pub fn successors(&self, idx: BlockIdx) -> &[(BlockIdx, Option<bool>)] {
        self.edges.get(&idx).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, idx: BlockIdx) -> &[(BlockIdx, Option<bool>)] {
        self.back_edges.get(&idx).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_degree(&self, idx: BlockIdx) -> usize {
        self.predecessors(idx).len()
    }

    pub fn add_edge(&mut self, src: BlockIdx, dst: BlockIdx, tag: Option<bool>) {
        let out = self.edges.entry(src).or_default();
        if !out.contains(&(dst, tag)) {
            out.push((dst, tag));
        }
        let inc = self.back_edges.entry(dst).or_default();
        if !inc.contains(&(src, tag)) {
            inc.push((src, tag));
        }
    }

    /// Removes every edge between `src` and `dst`, whatever its tag.
    pub fn remove_edge(&mut self, src: BlockIdx, dst: BlockIdx) {
        if let Some(out) = self.edges.get_mut(&src) {
            out.retain(|(d, _)| *d != dst);
        }
        if let Some(inc) = self.back_edges.get_mut(&dst) {
            inc.retain(|(s, _)| *s != src);
        }
    }

    /// Removes a block together with all its incident edges.
    pub fn remove_block(&mut self, idx: BlockIdx) {
        let succs: Vec<BlockIdx> = self.successors(idx).iter().map(|(d, _)| *d).collect();
        let preds: Vec<BlockIdx> = self.predecessors(idx).iter().map(|(s, _)| *s).collect();
        for d in succs {
            self.remove_edge(idx, d);
        }
        for s in preds {
            self.remove_edge(s, idx);
        }
        self.edges.remove(&idx);
        self.back_edges.remove(&idx);
        self.blocks.remove(&idx);
    }

    pub fn next_block_idx(&self) -> BlockIdx {
        self.blocks.keys().next_back().map(|i| i + 1).unwrap_or(0)
    }

    /// Derived map from instruction label to containing block.
    pub fn label_to_block(&self) -> BTreeMap<Label, BlockIdx> {
        let mut map = BTreeMap::new();
        for (idx, block) in &self.blocks {
            for label in block.labels() {
                map.insert(label, *idx);
            }
        }
        map
    }

    /// Block indices reachable from entry, in order.
    pub fn reachable(&self) -> BTreeSet<BlockIdx> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.entry_block];
        while let Some(b) = stack.pop() {
            if !seen.insert(b) {
                continue;
            }
            for (succ, _) in self.successors(b) {
                if !seen.contains(succ) {
                    stack.push(*succ);
                }
            }
        }
        seen
    }

    pub fn map_annotations<B, F: FnMut(&A) -> B>(&self, f: &mut F) -> Cfg<B> {
        Cfg {
            func_idx: self.func_idx,
            exported: self.exported,
            name: self.name.clone(),
            global_types: self.global_types.clone(),
            arg_types: self.arg_types.clone(),
            local_types: self.local_types.clone(),
            return_types: self.return_types.clone(),
            blocks: self
                .blocks
                .iter()
                .map(|(idx, b)| {
                    (
                        *idx,
                        BasicBlock {
                            idx: b.idx,
                            content: b.content.clone(),
                            before: f(&b.before),
                            after: f(&b.after),
                        },
                    )
                })
                .collect(),
            instructions: self
                .instructions
                .iter()
                .map(|(l, i)| (*l, i.map_annotations(f)))
                .collect(),
            edges: self.edges.clone(),
            back_edges: self.back_edges.clone(),
            entry_block: self.entry_block,
            exit_block: self.exit_block,
            loop_heads: self.loop_heads.clone(),
        }
    }

    /// Same skeleton, unit annotations.
    pub fn clear_annotations(&self) -> Cfg<()> {
        self.map_annotations(&mut |_| ())
    }

    /// Structural invariant check: edge endpoints present, multi-in
    /// blocks are merges, labels resolved.
    pub fn validate(&self) -> Result<()> {
        for (src, out) in &self.edges {
            self.find_block(*src)?;
            for (dst, _) in out {
                self.find_block(*dst)?;
            }
        }
        for (idx, block) in &self.blocks {
            if self.in_degree(*idx) > 1 && !block.is_merge() {
                return Err(AnalysisError::SliceValidation(format!(
                    "block {idx} has in-degree {} but is not a merge block",
                    self.in_degree(*idx)
                )));
            }
            for label in block.labels() {
                self.find_instr(label)?;
            }
        }
        Ok(())
    }

    /// Number of non-dummy instructions.
    pub fn instruction_count(&self) -> usize {
        self.instructions.keys().filter(|l| !l.is_dummy()).count()
    }

    /// `.dot` rendering. `render` turns an annotation into a (possibly
    /// empty) string appended to each block record.
    pub fn to_dot<F: Fn(&A) -> String>(&self, render: F) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph cfg_{} {{", self.func_idx);
        let _ = writeln!(out, "  node [shape=record];");
        for (idx, block) in &self.blocks {
            let mut body = match &block.content {
                BlockContent::Data(labels) => {
                    let lines: Vec<String> = labels
                        .iter()
                        .filter_map(|l| self.instructions.get(l).map(|i| format!("{l}: {i}")))
                        .collect();
                    lines.join("\\l")
                }
                BlockContent::Control(l) => match self.instructions.get(l) {
                    Some(i) => format!("{l}: {i}"),
                    None => format!("{l}: ?"),
                },
                BlockContent::Merge(l) => format!("{l}: merge"),
            };
            let annot = render(&block.after);
            if !annot.is_empty() {
                body.push_str("\\l");
                body.push_str(&annot);
            }
            let shape = if *idx == self.entry_block {
                "block (entry)"
            } else if *idx == self.exit_block {
                "block (exit)"
            } else {
                "block"
            };
            let _ = writeln!(
                out,
                "  b{idx} [label=\"{{{shape} {idx}|{}}}\"];",
                escape_dot(&body)
            );
        }
        for (src, outgoing) in &self.edges {
            for (dst, tag) in outgoing {
                let label = match tag {
                    Some(true) => " [label=\"t\"]",
                    Some(false) => " [label=\"f\"]",
                    None => "",
                };
                let _ = writeln!(out, "  b{src} -> b{dst}{label};");
            }
        }
        out.push_str("}\n");
        out
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('<', "\\<").replace('>', "\\>").replace('"', "\\\"").replace('|', "\\|")
}
