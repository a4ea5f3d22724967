//! Front-end boundary: convert a pre-parsed `wirm` module into labelled
//! instruction trees.
//!
//! The walk mirrors the module iterator discipline: a single pass over
//! every instruction of every local function, detecting function starts
//! at instruction offset 0. Operators are translated eagerly into the
//! owned instruction IR so nothing borrows from the module afterwards.

use wirm::ir::id::{FunctionID, TypeID};
use wirm::ir::module::module_globals::{GlobalKind, ImportedGlobal, LocalGlobal};
use wirm::ir::module::module_types::Types;
use wirm::iterator::iterator_trait::Iterator;
use wirm::iterator::module_iterator::ModuleIterator;
use wirm::wasmparser::{BlockType, Operator};
use wirm::{DataType, Location, Module};

use crate::error::{AnalysisError, Result};
use crate::instr::{Control, Data, Instr};
use crate::label::{Label, LabelPool};
use crate::types::{
    Binary, BinaryKind, Compare, CompareKind, Convert, Extension, MemOp, PackSize, PrimValue,
    Test, Unary, UnaryKind, ValType,
};

/// A function delivered by the front-end: signature, locals and the
/// nested, labelled instruction tree.
#[derive(Debug, Clone)]
pub struct Function {
    pub idx: u32,
    pub name: Option<String>,
    pub exported: bool,
    pub arg_types: Vec<ValType>,
    pub return_types: Vec<ValType>,
    pub local_types: Vec<ValType>,
    pub global_types: Vec<ValType>,
    pub body: Vec<Instr<()>>,
}

/// Translate every local function of the module.
pub fn ingest_module(wasm: &mut Module) -> Result<Vec<Function>> {
    let global_types = module_global_types(wasm)?;

    // Collect (function id, flat ops) per function in one iterator pass.
    let mut flat: Vec<(u32, Vec<FlatOp>)> = Vec::new();
    let mut mi = ModuleIterator::new(wasm, &vec![]);
    let mut first = true;
    let mut current: Option<(u32, Vec<FlatOp>)> = None;
    while first || mi.next().is_some() {
        let (
            Location::Module { func_idx, instr_idx }
            | Location::Component { func_idx, instr_idx, .. },
            ..
        ) = mi.curr_loc();

        if instr_idx == 0 {
            if let Some(done) = current.take() {
                flat.push(done);
            }
            current = Some((*func_idx, Vec::new()));
            first = false;
        }

        let op = mi
            .curr_op()
            .ok_or_else(|| AnalysisError::unsupported("module iterator yielded no operator"))?;
        let translated = translate_op(op, mi.module)?;
        if let Some((_, ops)) = current.as_mut() {
            ops.push(translated);
        }
    }
    if let Some(done) = current.take() {
        flat.push(done);
    }

    let mut funcs = Vec::new();
    for (fid, ops) in flat {
        funcs.push(ingest_function(wasm, fid, ops, &global_types)?);
    }
    Ok(funcs)
}

fn ingest_function(
    wasm: &Module,
    fid: u32,
    ops: Vec<FlatOp>,
    global_types: &[ValType],
) -> Result<Function> {
    let tid = wasm.functions.get(FunctionID(fid)).get_type_id();
    let (arg_types, return_types) = func_type(wasm, tid)?;
    if return_types.len() > 1 {
        return Err(AnalysisError::unsupported(format!(
            "function {fid} returns {} values",
            return_types.len()
        )));
    }

    let mut local_types = Vec::new();
    let lf = wasm
        .functions
        .unwrap_local(FunctionID(fid))
        .map_err(|e| AnalysisError::unsupported(e.to_string()))?;
    for (count, dt) in lf.body.locals.iter() {
        let ty = val_type(dt)?;
        for _ in 0..*count {
            local_types.push(ty);
        }
    }

    let mut pool = LabelPool::new();
    let body = nest(&ops, &mut pool)?;

    Ok(Function {
        idx: fid,
        name: None,
        exported: false,
        arg_types,
        return_types,
        local_types,
        global_types: global_types.to_vec(),
        body,
    })
}

fn module_global_types(wasm: &Module) -> Result<Vec<ValType>> {
    let mut types = Vec::new();
    for gid in 0..wasm.globals.len() as u32 {
        let kind = wasm.globals.get_kind(wirm::ir::id::GlobalID(gid));
        let (GlobalKind::Local(LocalGlobal { ty, .. })
        | GlobalKind::Import(ImportedGlobal { ty, .. })) = kind;
        types.push(val_type(&DataType::from(ty.content_type))?);
    }
    Ok(types)
}

fn func_type(wasm: &Module, tid: TypeID) -> Result<(Vec<ValType>, Vec<ValType>)> {
    let Some(Types::FuncType { params, results, .. }) = wasm.types.get(tid) else {
        return Err(AnalysisError::unsupported(format!("type {} is not a function type", *tid)));
    };
    let params = params.iter().map(val_type).collect::<Result<Vec<_>>>()?;
    let results = results.iter().map(val_type).collect::<Result<Vec<_>>>()?;
    Ok((params, results))
}

fn val_type(dt: &DataType) -> Result<ValType> {
    match dt {
        DataType::I32 => Ok(ValType::I32),
        DataType::I64 => Ok(ValType::I64),
        other => Err(AnalysisError::unsupported(format!("value type {other:?}"))),
    }
}

// ==== Flat operator translation ====

/// Owned, lifetime-free mirror of the supported operator subset.
#[derive(Debug, Clone)]
enum FlatOp {
    Data(Data),
    BlockStart(Option<ValType>),
    LoopStart(Option<ValType>),
    IfStart(Option<ValType>),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable { targets: Vec<u32>, default: u32 },
    Return,
    Unreachable,
    Call { arity: (usize, usize), index: u32 },
    CallIndirect { arity: (usize, usize), type_index: u32 },
}

fn block_val_type(blockty: &BlockType, wasm: &Module) -> Result<Option<ValType>> {
    match blockty {
        BlockType::Empty => Ok(None),
        BlockType::Type(vt) => Ok(Some(val_type(&DataType::from(*vt))?)),
        BlockType::FuncType(tid) => {
            let (params, results) = func_type(wasm, TypeID(*tid))?;
            if !params.is_empty() || results.len() > 1 {
                return Err(AnalysisError::unsupported(format!(
                    "block type with {} inputs and {} outputs",
                    params.len(),
                    results.len()
                )));
            }
            Ok(results.first().copied())
        }
    }
}

fn call_arity(wasm: &Module, tid: TypeID) -> Result<(usize, usize)> {
    let (params, results) = func_type(wasm, tid)?;
    if results.len() > 1 {
        return Err(AnalysisError::unsupported(format!(
            "call with {} return values",
            results.len()
        )));
    }
    Ok((params.len(), results.len()))
}

fn translate_op(op: &Operator, wasm: &Module) -> Result<FlatOp> {
    use Operator as O;

    let data = |d: Data| Ok(FlatOp::Data(d));
    let unary = |typ, op| data(Data::Unary(Unary { typ, op }));
    let binary = |typ, op| data(Data::Binary(Binary { typ, op }));
    let compare = |typ, op| data(Data::Compare(Compare { typ, op }));
    let load = |typ, offset, pack| data(Data::Load(MemOp { typ, offset, pack }));
    let store = |typ, offset, pack| data(Data::Store(MemOp { typ, offset, pack }));

    match op {
        O::Nop => data(Data::Nop),
        O::Drop => data(Data::Drop),
        O::Select => data(Data::Select),
        O::MemorySize { .. } => data(Data::MemorySize),
        O::MemoryGrow { .. } => data(Data::MemoryGrow),
        O::I32Const { value } => data(Data::Const(PrimValue::I32(*value))),
        O::I64Const { value } => data(Data::Const(PrimValue::I64(*value))),

        O::LocalGet { local_index } => data(Data::LocalGet(*local_index)),
        O::LocalSet { local_index } => data(Data::LocalSet(*local_index)),
        O::LocalTee { local_index } => data(Data::LocalTee(*local_index)),
        O::GlobalGet { global_index } => data(Data::GlobalGet(*global_index)),
        O::GlobalSet { global_index } => data(Data::GlobalSet(*global_index)),

        O::I32Load { memarg } => load(ValType::I32, memarg.offset, None),
        O::I64Load { memarg } => load(ValType::I64, memarg.offset, None),
        O::I32Load8S { memarg } => {
            load(ValType::I32, memarg.offset, Some((PackSize::Pack8, Extension::SignExtend)))
        }
        O::I32Load8U { memarg } => {
            load(ValType::I32, memarg.offset, Some((PackSize::Pack8, Extension::ZeroExtend)))
        }
        O::I32Load16S { memarg } => {
            load(ValType::I32, memarg.offset, Some((PackSize::Pack16, Extension::SignExtend)))
        }
        O::I32Load16U { memarg } => {
            load(ValType::I32, memarg.offset, Some((PackSize::Pack16, Extension::ZeroExtend)))
        }
        O::I64Load8S { memarg } => {
            load(ValType::I64, memarg.offset, Some((PackSize::Pack8, Extension::SignExtend)))
        }
        O::I64Load8U { memarg } => {
            load(ValType::I64, memarg.offset, Some((PackSize::Pack8, Extension::ZeroExtend)))
        }
        O::I64Load16S { memarg } => {
            load(ValType::I64, memarg.offset, Some((PackSize::Pack16, Extension::SignExtend)))
        }
        O::I64Load16U { memarg } => {
            load(ValType::I64, memarg.offset, Some((PackSize::Pack16, Extension::ZeroExtend)))
        }
        O::I64Load32S { memarg } => {
            load(ValType::I64, memarg.offset, Some((PackSize::Pack32, Extension::SignExtend)))
        }
        O::I64Load32U { memarg } => {
            load(ValType::I64, memarg.offset, Some((PackSize::Pack32, Extension::ZeroExtend)))
        }

        O::I32Store { memarg } => store(ValType::I32, memarg.offset, None),
        O::I64Store { memarg } => store(ValType::I64, memarg.offset, None),
        O::I32Store8 { memarg } => {
            store(ValType::I32, memarg.offset, Some((PackSize::Pack8, Extension::ZeroExtend)))
        }
        O::I32Store16 { memarg } => {
            store(ValType::I32, memarg.offset, Some((PackSize::Pack16, Extension::ZeroExtend)))
        }
        O::I64Store8 { memarg } => {
            store(ValType::I64, memarg.offset, Some((PackSize::Pack8, Extension::ZeroExtend)))
        }
        O::I64Store16 { memarg } => {
            store(ValType::I64, memarg.offset, Some((PackSize::Pack16, Extension::ZeroExtend)))
        }
        O::I64Store32 { memarg } => {
            store(ValType::I64, memarg.offset, Some((PackSize::Pack32, Extension::ZeroExtend)))
        }

        O::I32Clz => unary(ValType::I32, UnaryKind::Clz),
        O::I32Ctz => unary(ValType::I32, UnaryKind::Ctz),
        O::I32Popcnt => unary(ValType::I32, UnaryKind::Popcnt),
        O::I64Clz => unary(ValType::I64, UnaryKind::Clz),
        O::I64Ctz => unary(ValType::I64, UnaryKind::Ctz),
        O::I64Popcnt => unary(ValType::I64, UnaryKind::Popcnt),
        O::I32Extend8S => unary(ValType::I32, UnaryKind::Extend8S),
        O::I32Extend16S => unary(ValType::I32, UnaryKind::Extend16S),
        O::I64Extend8S => unary(ValType::I64, UnaryKind::Extend8S),
        O::I64Extend16S => unary(ValType::I64, UnaryKind::Extend16S),
        O::I64Extend32S => unary(ValType::I64, UnaryKind::Extend32S),

        O::I32Add => binary(ValType::I32, BinaryKind::Add),
        O::I32Sub => binary(ValType::I32, BinaryKind::Sub),
        O::I32Mul => binary(ValType::I32, BinaryKind::Mul),
        O::I32DivS => binary(ValType::I32, BinaryKind::DivS),
        O::I32DivU => binary(ValType::I32, BinaryKind::DivU),
        O::I32RemS => binary(ValType::I32, BinaryKind::RemS),
        O::I32RemU => binary(ValType::I32, BinaryKind::RemU),
        O::I32And => binary(ValType::I32, BinaryKind::And),
        O::I32Or => binary(ValType::I32, BinaryKind::Or),
        O::I32Xor => binary(ValType::I32, BinaryKind::Xor),
        O::I32Shl => binary(ValType::I32, BinaryKind::Shl),
        O::I32ShrS => binary(ValType::I32, BinaryKind::ShrS),
        O::I32ShrU => binary(ValType::I32, BinaryKind::ShrU),
        O::I32Rotl => binary(ValType::I32, BinaryKind::Rotl),
        O::I32Rotr => binary(ValType::I32, BinaryKind::Rotr),
        O::I64Add => binary(ValType::I64, BinaryKind::Add),
        O::I64Sub => binary(ValType::I64, BinaryKind::Sub),
        O::I64Mul => binary(ValType::I64, BinaryKind::Mul),
        O::I64DivS => binary(ValType::I64, BinaryKind::DivS),
        O::I64DivU => binary(ValType::I64, BinaryKind::DivU),
        O::I64RemS => binary(ValType::I64, BinaryKind::RemS),
        O::I64RemU => binary(ValType::I64, BinaryKind::RemU),
        O::I64And => binary(ValType::I64, BinaryKind::And),
        O::I64Or => binary(ValType::I64, BinaryKind::Or),
        O::I64Xor => binary(ValType::I64, BinaryKind::Xor),
        O::I64Shl => binary(ValType::I64, BinaryKind::Shl),
        O::I64ShrS => binary(ValType::I64, BinaryKind::ShrS),
        O::I64ShrU => binary(ValType::I64, BinaryKind::ShrU),
        O::I64Rotl => binary(ValType::I64, BinaryKind::Rotl),
        O::I64Rotr => binary(ValType::I64, BinaryKind::Rotr),

        O::I32Eqz => data(Data::Test(Test { typ: ValType::I32 })),
        O::I64Eqz => data(Data::Test(Test { typ: ValType::I64 })),

        O::I32Eq => compare(ValType::I32, CompareKind::Eq),
        O::I32Ne => compare(ValType::I32, CompareKind::Ne),
        O::I32LtS => compare(ValType::I32, CompareKind::LtS),
        O::I32LtU => compare(ValType::I32, CompareKind::LtU),
        O::I32GtS => compare(ValType::I32, CompareKind::GtS),
        O::I32GtU => compare(ValType::I32, CompareKind::GtU),
        O::I32LeS => compare(ValType::I32, CompareKind::LeS),
        O::I32LeU => compare(ValType::I32, CompareKind::LeU),
        O::I32GeS => compare(ValType::I32, CompareKind::GeS),
        O::I32GeU => compare(ValType::I32, CompareKind::GeU),
        O::I64Eq => compare(ValType::I64, CompareKind::Eq),
        O::I64Ne => compare(ValType::I64, CompareKind::Ne),
        O::I64LtS => compare(ValType::I64, CompareKind::LtS),
        O::I64LtU => compare(ValType::I64, CompareKind::LtU),
        O::I64GtS => compare(ValType::I64, CompareKind::GtS),
        O::I64GtU => compare(ValType::I64, CompareKind::GtU),
        O::I64LeS => compare(ValType::I64, CompareKind::LeS),
        O::I64LeU => compare(ValType::I64, CompareKind::LeU),
        O::I64GeS => compare(ValType::I64, CompareKind::GeS),
        O::I64GeU => compare(ValType::I64, CompareKind::GeU),

        O::I32WrapI64 => data(Data::Convert(Convert::I32WrapI64)),
        O::I64ExtendI32S => data(Data::Convert(Convert::I64ExtendI32S)),
        O::I64ExtendI32U => data(Data::Convert(Convert::I64ExtendI32U)),

        O::Block { blockty, .. } => Ok(FlatOp::BlockStart(block_val_type(blockty, wasm)?)),
        O::Loop { blockty, .. } => Ok(FlatOp::LoopStart(block_val_type(blockty, wasm)?)),
        O::If { blockty, .. } => Ok(FlatOp::IfStart(block_val_type(blockty, wasm)?)),
        O::Else => Ok(FlatOp::Else),
        O::End => Ok(FlatOp::End),
        O::Br { relative_depth } => Ok(FlatOp::Br(*relative_depth)),
        O::BrIf { relative_depth } => Ok(FlatOp::BrIf(*relative_depth)),
        O::BrTable { targets, .. } => {
            let mut ts = Vec::new();
            for t in targets.targets() {
                ts.push(t.map_err(|e| AnalysisError::unsupported(format!("br_table: {e}")))?);
            }
            Ok(FlatOp::BrTable { targets: ts, default: targets.default() })
        }
        O::Return => Ok(FlatOp::Return),
        O::Unreachable => Ok(FlatOp::Unreachable),
        O::Call { function_index } => {
            let tid = wasm.functions.get_type_id(FunctionID(*function_index));
            Ok(FlatOp::Call { arity: call_arity(wasm, tid)?, index: *function_index })
        }
        O::CallIndirect { type_index, .. } => Ok(FlatOp::CallIndirect {
            arity: call_arity(wasm, TypeID(*type_index))?,
            type_index: *type_index,
        }),

        other => Err(AnalysisError::unsupported(format!("operator {other:?}"))),
    }
}

// ==== Nesting reconstruction ====

enum FrameKind {
    Block,
    Loop,
    If,
}

struct Frame {
    kind: FrameKind,
    block_type: Option<ValType>,
    label: Label,
    body: Vec<Instr<()>>,
    else_body: Vec<Instr<()>>,
    in_else: bool,
}

/// Rebuild the nested instruction tree from the flat operator list.
/// Labels are assigned in encounter order; `else`/`end` markers carry
/// none.
fn nest(ops: &[FlatOp], pool: &mut LabelPool) -> Result<Vec<Instr<()>>> {
    use crate::instr::block_arity;

    let mut frames: Vec<Frame> = Vec::new();
    let mut top: Vec<Instr<()>> = Vec::new();

    let mut push = |frames: &mut Vec<Frame>, top: &mut Vec<Instr<()>>, instr: Instr<()>| {
        match frames.last_mut() {
            Some(frame) if frame.in_else => frame.else_body.push(instr),
            Some(frame) => frame.body.push(instr),
            None => top.push(instr),
        }
    };

    for (i, op) in ops.iter().enumerate() {
        match op {
            FlatOp::BlockStart(bt) | FlatOp::LoopStart(bt) | FlatOp::IfStart(bt) => {
                let kind = match op {
                    FlatOp::BlockStart(_) => FrameKind::Block,
                    FlatOp::LoopStart(_) => FrameKind::Loop,
                    _ => FrameKind::If,
                };
                frames.push(Frame {
                    kind,
                    block_type: *bt,
                    label: pool.fresh_function(),
                    body: Vec::new(),
                    else_body: Vec::new(),
                    in_else: false,
                });
            }
            FlatOp::Else => {
                let frame = frames
                    .last_mut()
                    .ok_or_else(|| AnalysisError::unsupported("else outside of if"))?;
                if !matches!(frame.kind, FrameKind::If) || frame.in_else {
                    return Err(AnalysisError::unsupported("misplaced else"));
                }
                frame.in_else = true;
            }
            FlatOp::End => {
                match frames.pop() {
                    Some(frame) => {
                        let arity = block_arity(&frame.block_type);
                        let control = match frame.kind {
                            FrameKind::Block => Control::Block {
                                block_type: frame.block_type,
                                arity,
                                body: frame.body,
                            },
                            FrameKind::Loop => Control::Loop {
                                block_type: frame.block_type,
                                arity,
                                body: frame.body,
                            },
                            FrameKind::If => Control::If {
                                block_type: frame.block_type,
                                arity,
                                then_body: frame.body,
                                else_body: frame.else_body,
                            },
                        };
                        push(&mut frames, &mut top, Instr {
                            label: frame.label,
                            kind: crate::instr::InstrKind::Control(control),
                            before: (),
                            after: (),
                        });
                    }
                    None => {
                        // Function-closing end; anything after it is malformed.
                        if i != ops.len() - 1 {
                            return Err(AnalysisError::unsupported(
                                "instructions after function end",
                            ));
                        }
                    }
                }
            }
            FlatOp::Data(d) => {
                let instr = Instr::new_data(pool.fresh_function(), d.clone());
                push(&mut frames, &mut top, instr);
            }
            FlatOp::Br(n) => {
                let instr = Instr::new_control(pool.fresh_function(), Control::Br(*n));
                push(&mut frames, &mut top, instr);
            }
            FlatOp::BrIf(n) => {
                let instr = Instr::new_control(pool.fresh_function(), Control::BrIf(*n));
                push(&mut frames, &mut top, instr);
            }
            FlatOp::BrTable { targets, default } => {
                let instr = Instr::new_control(
                    pool.fresh_function(),
                    Control::BrTable { targets: targets.clone(), default: *default },
                );
                push(&mut frames, &mut top, instr);
            }
            FlatOp::Return => {
                let instr = Instr::new_control(pool.fresh_function(), Control::Return);
                push(&mut frames, &mut top, instr);
            }
            FlatOp::Unreachable => {
                let instr = Instr::new_control(pool.fresh_function(), Control::Unreachable);
                push(&mut frames, &mut top, instr);
            }
            FlatOp::Call { arity, index } => {
                let instr = Instr::new_control(
                    pool.fresh_function(),
                    Control::Call { arity: *arity, index: *index },
                );
                push(&mut frames, &mut top, instr);
            }
            FlatOp::CallIndirect { arity, type_index } => {
                let instr = Instr::new_control(
                    pool.fresh_function(),
                    Control::CallIndirect { arity: *arity, type_index: *type_index },
                );
                push(&mut frames, &mut top, instr);
            }
        }
    }

    if !frames.is_empty() {
        return Err(AnalysisError::unsupported("unclosed block at function end"));
    }
    Ok(top)
}
