//! The labelled, annotated instruction sum type.
//!
//! Instructions are split into data instructions (pure stack rewrites)
//! and control instructions. Structured control instructions own their
//! bodies; the CFG builder drains those bodies into basic blocks, so
//! instructions stored in a CFG always have empty bodies.
//!
//! Every instruction carries two annotation slots, `before` and `after`.
//! A freshly ingested function is annotated with `()`; spec inference
//! rewrites the annotations to per-point variable states.

use std::fmt;

use crate::label::Label;
use crate::types::{Binary, Compare, Convert, MemOp, PrimValue, Test, Unary, ValType};

/// Data instructions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Data {
    Nop,
    Drop,
    Select,
    MemorySize,
    MemoryGrow,
    Const(PrimValue),
    Unary(Unary),
    Binary(Binary),
    Compare(Compare),
    Test(Test),
    Convert(Convert),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load(MemOp),
    Store(MemOp),
}

impl Data {
    /// (pops, pushes) on the value stack.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Data::Nop => (0, 0),
            Data::Drop => (1, 0),
            Data::Select => (3, 1),
            Data::MemorySize => (0, 1),
            Data::MemoryGrow => (1, 1),
            Data::Const(_) => (0, 1),
            Data::Unary(_) => (1, 1),
            Data::Binary(_) => (2, 1),
            Data::Compare(_) => (2, 1),
            Data::Test(_) => (1, 1),
            Data::Convert(_) => (1, 1),
            Data::LocalGet(_) => (0, 1),
            Data::LocalSet(_) => (1, 0),
            Data::LocalTee(_) => (1, 1),
            Data::GlobalGet(_) => (0, 1),
            Data::GlobalSet(_) => (1, 0),
            Data::Load(_) => (1, 1),
            Data::Store(_) => (2, 0),
        }
    }

    /// Net stack effect, used by the slicer's repair phase.
    pub fn net_effect(&self) -> isize {
        let (pops, pushes) = self.arity();
        pushes as isize - pops as isize
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Data::Nop => write!(f, "nop"),
            Data::Drop => write!(f, "drop"),
            Data::Select => write!(f, "select"),
            Data::MemorySize => write!(f, "memory.size"),
            Data::MemoryGrow => write!(f, "memory.grow"),
            Data::Const(v) => write!(f, "{}.const {v}", v.typ()),
            Data::Unary(op) => write!(f, "{op}"),
            Data::Binary(op) => write!(f, "{op}"),
            Data::Compare(op) => write!(f, "{op}"),
            Data::Test(op) => write!(f, "{op}"),
            Data::Convert(op) => write!(f, "{op}"),
            Data::LocalGet(i) => write!(f, "local.get {i}"),
            Data::LocalSet(i) => write!(f, "local.set {i}"),
            Data::LocalTee(i) => write!(f, "local.tee {i}"),
            Data::GlobalGet(i) => write!(f, "global.get {i}"),
            Data::GlobalSet(i) => write!(f, "global.set {i}"),
            Data::Load(op) => write!(f, "{}", op.display_load()),
            Data::Store(op) => write!(f, "{}", op.display_store()),
        }
    }
}

/// Control instructions. `Merge` is synthetic: it is not a wasm
/// instruction, but is emitted at join points to carry the phi-like
/// definitions of merge blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Control<A> {
    Block {
        block_type: Option<ValType>,
        arity: (usize, usize),
        body: Vec<Instr<A>>,
    },
    Loop {
        block_type: Option<ValType>,
        arity: (usize, usize),
        body: Vec<Instr<A>>,
    },
    If {
        block_type: Option<ValType>,
        arity: (usize, usize),
        then_body: Vec<Instr<A>>,
        else_body: Vec<Instr<A>>,
    },
    Call {
        arity: (usize, usize),
        index: u32,
    },
    CallIndirect {
        arity: (usize, usize),
        type_index: u32,
    },
    Br(u32),
    BrIf(u32),
    BrTable {
        targets: Vec<u32>,
        default: u32,
    },
    Return,
    Unreachable,
    Merge,
}

impl<A> Control<A> {
    /// Short mnemonic, without bodies or immediates.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Control::Block { .. } => "block",
            Control::Loop { .. } => "loop",
            Control::If { .. } => "if",
            Control::Call { .. } => "call",
            Control::CallIndirect { .. } => "call_indirect",
            Control::Br(_) => "br",
            Control::BrIf(_) => "br_if",
            Control::BrTable { .. } => "br_table",
            Control::Return => "return",
            Control::Unreachable => "unreachable",
            Control::Merge => "merge",
        }
    }
}

impl<A> fmt::Display for Control<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Call { index, .. } => write!(f, "call {index}"),
            Control::CallIndirect { type_index, .. } => {
                write!(f, "call_indirect {type_index}")
            }
            Control::Br(n) => write!(f, "br {n}"),
            Control::BrIf(n) => write!(f, "br_if {n}"),
            Control::BrTable { targets, default } => {
                write!(f, "br_table")?;
                for t in targets {
                    write!(f, " {t}")?;
                }
                write!(f, " {default}")
            }
            other => write!(f, "{}", other.mnemonic()),
        }
    }
}

/// A labelled instruction with its two annotation slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instr<A> {
    pub label: Label,
    pub kind: InstrKind<A>,
    pub before: A,
    pub after: A,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstrKind<A> {
    Data(Data),
    Control(Control<A>),
}

impl<A> Instr<A> {
    pub fn is_data(&self) -> bool {
        matches!(self.kind, InstrKind::Data(_))
    }

    pub fn data(&self) -> Option<&Data> {
        match &self.kind {
            InstrKind::Data(d) => Some(d),
            InstrKind::Control(_) => None,
        }
    }

    pub fn control(&self) -> Option<&Control<A>> {
        match &self.kind {
            InstrKind::Control(c) => Some(c),
            InstrKind::Data(_) => None,
        }
    }

    /// Structural fold rewriting every annotation slot, recursing into
    /// control bodies. Labels and payloads are untouched.
    pub fn map_annotations<B, F: FnMut(&A) -> B>(&self, f: &mut F) -> Instr<B> {
        let before = f(&self.before);
        let after = f(&self.after);
        let kind = match &self.kind {
            InstrKind::Data(d) => InstrKind::Data(d.clone()),
            InstrKind::Control(c) => InstrKind::Control(match c {
                Control::Block { block_type, arity, body } => Control::Block {
                    block_type: *block_type,
                    arity: *arity,
                    body: body.iter().map(|i| i.map_annotations(f)).collect(),
                },
                Control::Loop { block_type, arity, body } => Control::Loop {
                    block_type: *block_type,
                    arity: *arity,
                    body: body.iter().map(|i| i.map_annotations(f)).collect(),
                },
                Control::If { block_type, arity, then_body, else_body } => Control::If {
                    block_type: *block_type,
                    arity: *arity,
                    then_body: then_body.iter().map(|i| i.map_annotations(f)).collect(),
                    else_body: else_body.iter().map(|i| i.map_annotations(f)).collect(),
                },
                Control::Call { arity, index } => Control::Call { arity: *arity, index: *index },
                Control::CallIndirect { arity, type_index } => {
                    Control::CallIndirect { arity: *arity, type_index: *type_index }
                }
                Control::Br(n) => Control::Br(*n),
                Control::BrIf(n) => Control::BrIf(*n),
                Control::BrTable { targets, default } => {
                    Control::BrTable { targets: targets.clone(), default: *default }
                }
                Control::Return => Control::Return,
                Control::Unreachable => Control::Unreachable,
                Control::Merge => Control::Merge,
            }),
        };
        Instr { label: self.label, kind, before, after }
    }

    pub fn clear_annotations(&self) -> Instr<()> {
        self.map_annotations(&mut |_| ())
    }
}

impl Instr<()> {
    pub fn new_data(label: Label, data: Data) -> Instr<()> {
        Instr { label, kind: InstrKind::Data(data), before: (), after: () }
    }

    pub fn new_control(label: Label, control: Control<()>) -> Instr<()> {
        Instr { label, kind: InstrKind::Control(control), before: (), after: () }
    }
}

impl<A> fmt::Display for Instr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InstrKind::Data(d) => write!(f, "{d}"),
            InstrKind::Control(c) => write!(f, "{c}"),
        }
    }
}

/// Arity of a structured construct from its block type. Input arity is
/// always 0 and output arity at most 1 in the supported subset.
pub fn block_arity(block_type: &Option<ValType>) -> (usize, usize) {
    match block_type {
        None => (0, 0),
        Some(_) => (0, 1),
    }
}
