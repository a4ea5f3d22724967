//! Value types, constants and operator records.
//!
//! Operator records identify an operation for display and hashing; the
//! analyses only ever look at their arity. Floating-point operators are
//! rejected at ingestion, so everything here is integral.

use std::fmt;

/// Supported wasm value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValType {
    I32,
    I64,
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
        }
    }
}

/// A constant literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrimValue {
    I32(i32),
    I64(i64),
}

impl PrimValue {
    pub fn typ(&self) -> ValType {
        match self {
            PrimValue::I32(_) => ValType::I32,
            PrimValue::I64(_) => ValType::I64,
        }
    }

    /// The constant widened to i64, for symbolic arithmetic.
    pub fn as_i64(&self) -> i64 {
        match *self {
            PrimValue::I32(v) => v as i64,
            PrimValue::I64(v) => v,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_i64() == 0
    }
}

impl fmt::Display for PrimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimValue::I32(v) => write!(f, "{v}"),
            PrimValue::I64(v) => write!(f, "{v}"),
        }
    }
}

// ==== Operator records ====

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnaryKind {
    Clz,
    Ctz,
    Popcnt,
    Extend8S,
    Extend16S,
    Extend32S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Unary {
    pub typ: ValType,
    pub op: UnaryKind,
}

impl fmt::Display for Unary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            UnaryKind::Clz => "clz",
            UnaryKind::Ctz => "ctz",
            UnaryKind::Popcnt => "popcnt",
            UnaryKind::Extend8S => "extend8_s",
            UnaryKind::Extend16S => "extend16_s",
            UnaryKind::Extend32S => "extend32_s",
        };
        write!(f, "{}.{op}", self.typ)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binary {
    pub typ: ValType,
    pub op: BinaryKind,
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            BinaryKind::Add => "add",
            BinaryKind::Sub => "sub",
            BinaryKind::Mul => "mul",
            BinaryKind::DivS => "div_s",
            BinaryKind::DivU => "div_u",
            BinaryKind::RemS => "rem_s",
            BinaryKind::RemU => "rem_u",
            BinaryKind::And => "and",
            BinaryKind::Or => "or",
            BinaryKind::Xor => "xor",
            BinaryKind::Shl => "shl",
            BinaryKind::ShrS => "shr_s",
            BinaryKind::ShrU => "shr_u",
            BinaryKind::Rotl => "rotl",
            BinaryKind::Rotr => "rotr",
        };
        write!(f, "{}.{op}", self.typ)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompareKind {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Compare {
    pub typ: ValType,
    pub op: CompareKind,
}

impl fmt::Display for Compare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            CompareKind::Eq => "eq",
            CompareKind::Ne => "ne",
            CompareKind::LtS => "lt_s",
            CompareKind::LtU => "lt_u",
            CompareKind::GtS => "gt_s",
            CompareKind::GtU => "gt_u",
            CompareKind::LeS => "le_s",
            CompareKind::LeU => "le_u",
            CompareKind::GeS => "ge_s",
            CompareKind::GeU => "ge_u",
        };
        write!(f, "{}.{op}", self.typ)
    }
}

/// `eqz` is the only test operator in the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Test {
    pub typ: ValType,
}

impl fmt::Display for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.eqz", self.typ)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Convert {
    I32WrapI64,
    I64ExtendI32S,
    I64ExtendI32U,
}

impl Convert {
    pub fn result_type(&self) -> ValType {
        match self {
            Convert::I32WrapI64 => ValType::I32,
            Convert::I64ExtendI32S | Convert::I64ExtendI32U => ValType::I64,
        }
    }
}

impl fmt::Display for Convert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Convert::I32WrapI64 => write!(f, "i32.wrap_i64"),
            Convert::I64ExtendI32S => write!(f, "i64.extend_i32_s"),
            Convert::I64ExtendI32U => write!(f, "i64.extend_i32_u"),
        }
    }
}

// ==== Memory operations ====

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PackSize {
    Pack8,
    Pack16,
    Pack32,
}

impl PackSize {
    pub fn bits(&self) -> u32 {
        match self {
            PackSize::Pack8 => 8,
            PackSize::Pack16 => 16,
            PackSize::Pack32 => 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Extension {
    SignExtend,
    ZeroExtend,
}

/// A memory load or store: value type, static offset, optional packing.
/// Alignment from the wasm encoding is intentionally discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemOp {
    pub typ: ValType,
    pub offset: u64,
    pub pack: Option<(PackSize, Extension)>,
}

impl MemOp {
    /// Mnemonic suffix: "", "8_s", "16_u", "32_s"... loads only; stores
    /// drop the extension.
    fn pack_suffix(&self, store: bool) -> String {
        match self.pack {
            None => String::new(),
            Some((size, ext)) => {
                if store {
                    format!("{}", size.bits())
                } else {
                    let e = match ext {
                        Extension::SignExtend => "s",
                        Extension::ZeroExtend => "u",
                    };
                    format!("{}_{e}", size.bits())
                }
            }
        }
    }

    pub fn display_load(&self) -> String {
        let mut s = format!("{}.load{}", self.typ, self.pack_suffix(false));
        if self.offset != 0 {
            s.push_str(&format!(" offset={}", self.offset));
        }
        s
    }

    pub fn display_store(&self) -> String {
        let mut s = format!("{}.store{}", self.typ, self.pack_suffix(true));
        if self.offset != 0 {
            s.push_str(&format!(" offset={}", self.offset));
        }
        s
    }
}
