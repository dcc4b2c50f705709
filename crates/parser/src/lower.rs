//! Lowers validated function bodies into the straight-line operation stream
//! defined in `zerowasm_types`.
//!
//! The lowering walks each body once, mirroring the Wasm operand stack with
//! a compile-time stack of slot kinds. Structured control flow is flattened
//! into numbered labels; every branch carries the range of stack slots to
//! discard so the target always sees its expected stack shape.

use alloc::collections::BTreeSet;
use alloc::{format, string::ToString, vec, vec::Vec};
use wasmparser::{FuncValidator, FuncValidatorAllocations, FunctionBody, Operator, ValidatorResources};
use zerowasm_types::*;

use crate::conversion::{convert_heaptype, convert_valtype};
use crate::{ParseError, Result};

pub(crate) struct LowerContext<'a> {
    pub(crate) types: &'a [FuncType],
    /// Type index of every function, imports first.
    pub(crate) func_type_indices: &'a [u32],
    /// Type of every global, imports first.
    pub(crate) global_types: &'a [GlobalType],
    /// Function indexes declared referenceable by an element segment,
    /// export, global initializer, or start declaration. All of those
    /// sections precede the code section, so the set is complete here.
    pub(crate) declared_funcrefs: &'a BTreeSet<u32>,
}

/// One 64-bit slot on the compile-time stack. v128 values occupy a lo/hi
/// pair so widths survive polymorphic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    One,
    V128Lo,
    V128Hi,
}

fn slots_of(ty: ValType) -> &'static [Slot] {
    match ty {
        ValType::V128 => &[Slot::V128Lo, Slot::V128Hi],
        _ => &[Slot::One],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If { in_else: bool },
}

#[derive(Debug)]
struct Frame {
    id: u32,
    /// Slot height at which the frame's parameters begin.
    origin: u32,
    ty: FuncType,
    kind: FrameKind,
}

/// Label kinds per frame: a loop header (or then-entry of an `if`), the
/// else-branch entry, and the continuation after `end`.
const LABEL_HEADER: u32 = 0;
const LABEL_ELSE: u32 = 1;
const LABEL_CONTINUATION: u32 = 2;
const LABELS_PER_FRAME: u32 = 3;

fn label_id(frame_id: u32, kind: u32) -> u32 {
    frame_id * LABELS_PER_FRAME + kind
}

struct FunctionLowering<'a, 'b> {
    ctx: &'b LowerContext<'a>,
    validator: FuncValidator<ValidatorResources>,
    ops: Vec<Operation>,
    stack: Vec<Slot>,
    max_height: u32,
    frames: Vec<Frame>,
    next_frame_id: u32,
    label_callers: Vec<u32>,
    /// Slot offset and width of every local (parameters included).
    local_layout: Vec<(u32, bool)>,
    reachable: bool,
    unreachable_depth: u32,
    flags: FunctionFlags,
}

pub(crate) fn lower_function(
    body: FunctionBody<'_>,
    mut validator: FuncValidator<ValidatorResources>,
    ctx: &LowerContext<'_>,
    type_idx: u32,
) -> Result<(CompiledFunction, FuncValidatorAllocations)> {
    let ty = ctx
        .types
        .get(type_idx as usize)
        .cloned()
        .ok_or_else(|| ParseError::Other(format!("function type {type_idx} out of range")))?;

    // declared locals
    let locals_reader = body.get_locals_reader()?;
    let pos = locals_reader.original_position();
    let mut locals = Vec::new();
    for (i, local) in locals_reader.into_iter().enumerate() {
        let (count, val_type) = local?;
        validator.define_locals(pos + i, count, val_type)?;
        let val_type = convert_valtype(&val_type)?;
        for _ in 0..count {
            locals.push(val_type);
        }
    }

    let mut lowering = FunctionLowering::new(ctx, validator, &ty, &locals);

    let mut reader = body.get_operators_reader()?;
    while !reader.eof() {
        let pos = reader.original_position();
        let op = reader.read()?;
        lowering.validator.op(pos, &op)?;
        lowering.lower_op(&op)?;
    }
    let end_pos = reader.original_position();
    lowering.validator.finish(end_pos)?;

    if !lowering.frames.is_empty() {
        return Err(ParseError::Other("unbalanced control frames".to_string()));
    }

    let local_slots = locals.iter().map(|l| l.slot_count()).sum();
    let function = CompiledFunction {
        type_idx,
        locals: locals.into_boxed_slice(),
        local_slots,
        ops: lowering.ops.into_boxed_slice(),
        label_count: lowering.next_frame_id * LABELS_PER_FRAME,
        label_callers: lowering.label_callers.into_boxed_slice(),
        stack_ceil: lowering.max_height,
        flags: lowering.flags,
    };
    Ok((function, lowering.validator.into_allocations()))
}

impl<'a, 'b> FunctionLowering<'a, 'b> {
    fn new(
        ctx: &'b LowerContext<'a>,
        validator: FuncValidator<ValidatorResources>,
        ty: &FuncType,
        locals: &[ValType],
    ) -> Self {
        let mut stack = Vec::new();
        let mut local_layout = Vec::with_capacity(ty.params.len() + locals.len());
        for local in ty.params.iter().chain(locals.iter()) {
            local_layout.push((stack.len() as u32, *local == ValType::V128));
            stack.extend_from_slice(slots_of(*local));
        }

        let origin = stack.len() as u32;
        let mut lowering = Self {
            ctx,
            validator,
            ops: Vec::new(),
            max_height: origin,
            stack,
            frames: Vec::new(),
            next_frame_id: 0,
            label_callers: Vec::new(),
            local_layout,
            reachable: true,
            unreachable_depth: 0,
            flags: FunctionFlags::default(),
        };
        let id = lowering.alloc_frame_id();
        lowering.frames.push(Frame { id, origin, ty: ty.clone(), kind: FrameKind::Function });
        lowering
    }

    fn height(&self) -> u32 {
        self.stack.len() as u32
    }

    fn push(&mut self, slot: Slot) {
        self.stack.push(slot);
        self.max_height = self.max_height.max(self.stack.len() as u32);
    }

    fn push_type(&mut self, ty: ValType) {
        for slot in slots_of(ty) {
            self.push(*slot);
        }
    }

    fn pop(&mut self) -> Slot {
        self.stack.pop().unwrap_or(Slot::One)
    }

    fn pop_type(&mut self, ty: ValType) {
        for _ in 0..ty.slot_count() {
            self.pop();
        }
    }

    fn top_is_wide(&self) -> bool {
        matches!(self.stack.last(), Some(Slot::V128Hi))
    }

    fn alloc_frame_id(&mut self) -> u32 {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.label_callers.resize((self.next_frame_id * LABELS_PER_FRAME) as usize, 0);
        id
    }

    fn add_caller(&mut self, label: u32) {
        self.label_callers[label as usize] += 1;
    }

    fn emit(&mut self, op: Operation) {
        self.ops.push(op);
    }

    fn resolve_blocktype(&self, bt: wasmparser::BlockType) -> Result<FuncType> {
        Ok(match bt {
            wasmparser::BlockType::Empty => FuncType::empty(),
            wasmparser::BlockType::Type(ty) => {
                FuncType { params: [].into(), results: [convert_valtype(&ty)?].into() }
            }
            wasmparser::BlockType::FuncType(idx) => self
                .ctx
                .types
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| ParseError::Other(format!("block type {idx} out of range")))?,
        })
    }

    fn func_type_of(&self, func_index: u32) -> Result<FuncType> {
        let type_idx = self
            .ctx
            .func_type_indices
            .get(func_index as usize)
            .copied()
            .ok_or_else(|| ParseError::Other(format!("function {func_index} out of range")))?;
        self.ctx
            .types
            .get(type_idx as usize)
            .cloned()
            .ok_or_else(|| ParseError::Other(format!("function type {type_idx} out of range")))
    }

    /// The branch target for the frame `depth` frames below the innermost,
    /// with the drop range that reshapes the stack for it.
    fn branch_target(&mut self, depth: u32) -> Result<BranchTarget> {
        let index = self
            .frames
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| ParseError::Other(format!("branch depth {depth} out of range")))?;
        let frame = &self.frames[index];
        let (kind, arity) = match frame.kind {
            FrameKind::Loop => (LABEL_HEADER, frame.ty.param_slots()),
            _ => (LABEL_CONTINUATION, frame.ty.result_slots()),
        };
        let label = label_id(frame.id, kind);
        let drop = drop_range(self.height(), frame.origin, arity);
        self.add_caller(label);
        Ok(BranchTarget { label, drop })
    }

    fn set_unreachable(&mut self) {
        self.reachable = false;
        self.unreachable_depth = 0;
    }

    /// Resets the stack to `origin` plus the given value types, as happens
    /// when control rejoins at an `else` or `end`.
    fn restore_stack(&mut self, origin: u32, tys: &[ValType]) {
        self.stack.truncate(origin as usize);
        for ty in tys {
            self.push_type(*ty);
        }
    }

    fn lower_op(&mut self, op: &Operator<'_>) -> Result<()> {
        if !self.reachable {
            return self.skip_op(op);
        }

        match op {
            Operator::Unreachable => {
                self.emit(Operation::Unreachable);
                self.set_unreachable();
            }
            Operator::Nop => {}

            Operator::Block { blockty } => {
                let ty = self.resolve_blocktype(*blockty)?;
                let id = self.alloc_frame_id();
                let origin = self.height() - ty.param_slots();
                self.frames.push(Frame { id, origin, ty, kind: FrameKind::Block });
            }
            Operator::Loop { blockty } => {
                let ty = self.resolve_blocktype(*blockty)?;
                let id = self.alloc_frame_id();
                let origin = self.height() - ty.param_slots();
                self.frames.push(Frame { id, origin, ty, kind: FrameKind::Loop });
                self.emit(Operation::Label(label_id(id, LABEL_HEADER)));
            }
            Operator::If { blockty } => {
                self.pop(); // condition
                let ty = self.resolve_blocktype(*blockty)?;
                let id = self.alloc_frame_id();
                let origin = self.height() - ty.param_slots();
                self.frames.push(Frame { id, origin, ty, kind: FrameKind::If { in_else: false } });

                let then_label = label_id(id, LABEL_HEADER);
                let else_label = label_id(id, LABEL_ELSE);
                self.add_caller(then_label);
                self.add_caller(else_label);
                self.emit(Operation::BrIf {
                    then: BranchTarget { label: then_label, drop: None },
                    els: BranchTarget { label: else_label, drop: None },
                });
                self.emit(Operation::Label(then_label));
            }
            Operator::Else => {
                let frame = self.frames.last_mut().ok_or_else(|| ParseError::Other("else without if".into()))?;
                let FrameKind::If { in_else } = &mut frame.kind else {
                    return Err(ParseError::Other("else without if".into()));
                };
                *in_else = true;
                let (id, origin) = (frame.id, frame.origin);
                let (params, results) = (frame.ty.params.clone(), frame.ty.result_slots());

                // skip over the else branch when the then branch falls through
                let continuation = label_id(id, LABEL_CONTINUATION);
                let drop = drop_range(self.height(), origin, results);
                self.add_caller(continuation);
                self.emit(Operation::Br(BranchTarget { label: continuation, drop }));
                self.emit(Operation::Label(label_id(id, LABEL_ELSE)));
                self.restore_stack(origin, &params);
            }
            Operator::End => self.lower_end()?,

            Operator::Br { relative_depth } => {
                let target = self.branch_target(*relative_depth)?;
                self.emit(Operation::Br(target));
                self.set_unreachable();
            }
            Operator::BrIf { relative_depth } => {
                self.pop(); // condition
                let then = self.branch_target(*relative_depth)?;
                let fallthrough_id = self.alloc_frame_id();
                let els = label_id(fallthrough_id, LABEL_CONTINUATION);
                self.add_caller(els);
                self.emit(Operation::BrIf { then, els: BranchTarget { label: els, drop: None } });
                self.emit(Operation::Label(els));
            }
            Operator::BrTable { targets } => {
                self.pop(); // index
                let table = targets
                    .targets()
                    .map(|depth| self.branch_target(depth?))
                    .collect::<Result<Vec<_>>>()?
                    .into_boxed_slice();
                let default = self.branch_target(targets.default())?;
                self.emit(Operation::BrTable { targets: table, default });
                self.set_unreachable();
            }
            Operator::Return => {
                let target = self.branch_target(self.frames.len() as u32 - 1)?;
                self.emit(Operation::Br(target));
                self.set_unreachable();
            }

            Operator::Call { function_index } => {
                let ty = self.func_type_of(*function_index)?;
                for param in ty.params.iter().rev() {
                    self.pop_type(*param);
                }
                for result in ty.results.iter() {
                    self.push_type(*result);
                }
                self.emit(Operation::Call(*function_index));
            }
            Operator::CallIndirect { type_index, table_index } => {
                self.pop(); // table element index
                let ty = self
                    .ctx
                    .types
                    .get(*type_index as usize)
                    .cloned()
                    .ok_or_else(|| ParseError::Other(format!("type {type_index} out of range")))?;
                for param in ty.params.iter().rev() {
                    self.pop_type(*param);
                }
                for result in ty.results.iter() {
                    self.push_type(*result);
                }
                self.flags.uses_table = true;
                self.emit(Operation::CallIndirect { type_idx: *type_index, table: *table_index });
            }

            Operator::Drop => {
                if self.top_is_wide() {
                    self.pop();
                    self.pop();
                    self.emit(Operation::Drop(Some(DropRange { start: 0, end: 1 })));
                } else {
                    self.pop();
                    self.emit(Operation::Drop(Some(DropRange { start: 0, end: 0 })));
                }
            }
            Operator::Select | Operator::TypedSelect { .. } => {
                self.pop(); // condition
                if self.top_is_wide() {
                    for _ in 0..4 {
                        self.pop();
                    }
                    self.push(Slot::V128Lo);
                    self.push(Slot::V128Hi);
                    self.emit(Operation::Select { wide: true });
                } else {
                    self.pop();
                    self.pop();
                    self.push(Slot::One);
                    self.emit(Operation::Select { wide: false });
                }
            }

            Operator::LocalGet { local_index } => {
                let (offset, wide) = self.local_layout[*local_index as usize];
                let depth = self.height() - 1 - offset;
                self.emit(Operation::Pick { depth, wide: false });
                if wide {
                    // same depth twice: the first pick raises the stack by one
                    self.emit(Operation::Pick { depth, wide: false });
                    self.push(Slot::V128Lo);
                    self.push(Slot::V128Hi);
                } else {
                    self.push(Slot::One);
                }
            }
            Operator::LocalSet { local_index } => {
                let (offset, wide) = self.local_layout[*local_index as usize];
                if wide {
                    let depth = self.height() - 2 - offset;
                    self.emit(Operation::Set { depth, wide: false });
                    self.emit(Operation::Set { depth, wide: false });
                    self.pop();
                    self.pop();
                } else {
                    let depth = self.height() - 1 - offset;
                    self.emit(Operation::Set { depth, wide: false });
                    self.pop();
                }
            }
            Operator::LocalTee { local_index } => {
                let (offset, wide) = self.local_layout[*local_index as usize];
                let depth = self.height() - offset;
                if wide {
                    self.emit(Operation::Pick { depth: 1, wide: false });
                    self.emit(Operation::Pick { depth: 1, wide: false });
                    self.emit(Operation::Set { depth, wide: false });
                    self.emit(Operation::Set { depth, wide: false });
                    // the duplicated pair exists transiently
                    self.push(Slot::V128Lo);
                    self.push(Slot::V128Hi);
                    self.pop_n(2);
                } else {
                    self.emit(Operation::Pick { depth: 0, wide: false });
                    self.emit(Operation::Set { depth, wide: false });
                    self.push(Slot::One);
                    self.pop();
                }
            }

            Operator::GlobalGet { global_index } => {
                let ty = self.global_type(*global_index)?;
                self.push_type(ty);
                self.emit(Operation::GlobalGet { index: *global_index, wide: ty == ValType::V128 });
            }
            Operator::GlobalSet { global_index } => {
                let ty = self.global_type(*global_index)?;
                self.pop_type(ty);
                self.emit(Operation::GlobalSet { index: *global_index, wide: ty == ValType::V128 });
            }

            // memory access
            Operator::I32Load { memarg } => self.lower_load(memarg, |o| Operation::Load { ty: NumTy::I32, offset: o })?,
            Operator::I64Load { memarg } => self.lower_load(memarg, |o| Operation::Load { ty: NumTy::I64, offset: o })?,
            Operator::F32Load { memarg } => self.lower_load(memarg, |o| Operation::Load { ty: NumTy::F32, offset: o })?,
            Operator::F64Load { memarg } => self.lower_load(memarg, |o| Operation::Load { ty: NumTy::F64, offset: o })?,
            Operator::I32Load8S { memarg } => {
                self.lower_load(memarg, |o| Operation::Load8 { ty: IntTy::I32, signed: true, offset: o })?
            }
            Operator::I32Load8U { memarg } => {
                self.lower_load(memarg, |o| Operation::Load8 { ty: IntTy::I32, signed: false, offset: o })?
            }
            Operator::I32Load16S { memarg } => {
                self.lower_load(memarg, |o| Operation::Load16 { ty: IntTy::I32, signed: true, offset: o })?
            }
            Operator::I32Load16U { memarg } => {
                self.lower_load(memarg, |o| Operation::Load16 { ty: IntTy::I32, signed: false, offset: o })?
            }
            Operator::I64Load8S { memarg } => {
                self.lower_load(memarg, |o| Operation::Load8 { ty: IntTy::I64, signed: true, offset: o })?
            }
            Operator::I64Load8U { memarg } => {
                self.lower_load(memarg, |o| Operation::Load8 { ty: IntTy::I64, signed: false, offset: o })?
            }
            Operator::I64Load16S { memarg } => {
                self.lower_load(memarg, |o| Operation::Load16 { ty: IntTy::I64, signed: true, offset: o })?
            }
            Operator::I64Load16U { memarg } => {
                self.lower_load(memarg, |o| Operation::Load16 { ty: IntTy::I64, signed: false, offset: o })?
            }
            Operator::I64Load32S { memarg } => self.lower_load(memarg, |o| Operation::Load32 { signed: true, offset: o })?,
            Operator::I64Load32U { memarg } => self.lower_load(memarg, |o| Operation::Load32 { signed: false, offset: o })?,

            Operator::I32Store { memarg } => self.lower_store(memarg, |o| Operation::Store { ty: NumTy::I32, offset: o })?,
            Operator::I64Store { memarg } => self.lower_store(memarg, |o| Operation::Store { ty: NumTy::I64, offset: o })?,
            Operator::F32Store { memarg } => self.lower_store(memarg, |o| Operation::Store { ty: NumTy::F32, offset: o })?,
            Operator::F64Store { memarg } => self.lower_store(memarg, |o| Operation::Store { ty: NumTy::F64, offset: o })?,
            Operator::I32Store8 { memarg } | Operator::I64Store8 { memarg } => {
                self.lower_store(memarg, |o| Operation::Store8 { offset: o })?
            }
            Operator::I32Store16 { memarg } | Operator::I64Store16 { memarg } => {
                self.lower_store(memarg, |o| Operation::Store16 { offset: o })?
            }
            Operator::I64Store32 { memarg } => self.lower_store(memarg, |o| Operation::Store32 { offset: o })?,

            Operator::MemorySize { .. } => {
                self.flags.uses_memory = true;
                self.push(Slot::One);
                self.emit(Operation::MemorySize);
            }
            Operator::MemoryGrow { .. } => {
                self.flags.uses_memory = true;
                self.emit(Operation::MemoryGrow);
            }
            Operator::MemoryInit { data_index, .. } => {
                self.flags.uses_memory = true;
                self.flags.uses_data_instances = true;
                self.pop_n(3);
                self.emit(Operation::MemoryInit(*data_index));
            }
            Operator::DataDrop { data_index } => {
                self.flags.uses_data_instances = true;
                self.emit(Operation::DataDrop(*data_index));
            }
            Operator::MemoryCopy { .. } => {
                self.flags.uses_memory = true;
                self.pop_n(3);
                self.emit(Operation::MemoryCopy);
            }
            Operator::MemoryFill { .. } => {
                self.flags.uses_memory = true;
                self.pop_n(3);
                self.emit(Operation::MemoryFill);
            }

            // tables
            Operator::TableGet { table } => {
                self.flags.uses_table = true;
                self.emit(Operation::TableGet(*table));
            }
            Operator::TableSet { table } => {
                self.flags.uses_table = true;
                self.pop_n(2);
                self.emit(Operation::TableSet(*table));
            }
            Operator::TableSize { table } => {
                self.flags.uses_table = true;
                self.push(Slot::One);
                self.emit(Operation::TableSize(*table));
            }
            Operator::TableGrow { table } => {
                self.flags.uses_table = true;
                self.pop_n(2);
                self.push(Slot::One);
                self.emit(Operation::TableGrow(*table));
            }
            Operator::TableFill { table } => {
                self.flags.uses_table = true;
                self.pop_n(3);
                self.emit(Operation::TableFill(*table));
            }
            Operator::TableInit { elem_index, table } => {
                self.flags.uses_table = true;
                self.flags.uses_element_instances = true;
                self.pop_n(3);
                self.emit(Operation::TableInit { elem: *elem_index, table: *table });
            }
            Operator::TableCopy { dst_table, src_table } => {
                self.flags.uses_table = true;
                self.pop_n(3);
                self.emit(Operation::TableCopy { dst: *dst_table, src: *src_table });
            }
            Operator::ElemDrop { elem_index } => {
                self.flags.uses_element_instances = true;
                self.emit(Operation::ElemDrop(*elem_index));
            }

            Operator::RefNull { hty } => {
                convert_heaptype(hty)?;
                self.push(Slot::One);
                self.emit(Operation::RefNull);
            }
            Operator::RefIsNull => {
                self.emit(Operation::RefIsNull);
            }
            Operator::RefFunc { function_index } => {
                // only functions the module declares referenceable may be
                // turned into first-class references
                if !self.ctx.declared_funcrefs.contains(function_index) {
                    return Err(ParseError::Other(format!(
                        "ref.func on function {function_index}, which no element segment, export, \
                         global, or start declaration references"
                    )));
                }
                self.push(Slot::One);
                self.emit(Operation::RefFunc(*function_index));
            }

            // constants
            Operator::I32Const { value } => {
                self.push(Slot::One);
                self.emit(Operation::Const32(*value as u32));
            }
            Operator::I64Const { value } => {
                self.push(Slot::One);
                self.emit(Operation::Const64(*value as u64));
            }
            Operator::F32Const { value } => {
                self.push(Slot::One);
                self.emit(Operation::Const32(value.bits()));
            }
            Operator::F64Const { value } => {
                self.push(Slot::One);
                self.emit(Operation::Const64(value.bits()));
            }

            // comparisons: pop operands, push an i32
            Operator::I32Eqz => self.unop(Operation::Eqz(IntTy::I32)),
            Operator::I64Eqz => self.unop(Operation::Eqz(IntTy::I64)),
            Operator::I32Eq => self.binop(Operation::Eq(NumTy::I32)),
            Operator::I64Eq => self.binop(Operation::Eq(NumTy::I64)),
            Operator::F32Eq => self.binop(Operation::Eq(NumTy::F32)),
            Operator::F64Eq => self.binop(Operation::Eq(NumTy::F64)),
            Operator::I32Ne => self.binop(Operation::Ne(NumTy::I32)),
            Operator::I64Ne => self.binop(Operation::Ne(NumTy::I64)),
            Operator::F32Ne => self.binop(Operation::Ne(NumTy::F32)),
            Operator::F64Ne => self.binop(Operation::Ne(NumTy::F64)),
            Operator::I32LtS => self.binop(Operation::Lt(SignedTy::I32)),
            Operator::I32LtU => self.binop(Operation::Lt(SignedTy::U32)),
            Operator::I64LtS => self.binop(Operation::Lt(SignedTy::I64)),
            Operator::I64LtU => self.binop(Operation::Lt(SignedTy::U64)),
            Operator::F32Lt => self.binop(Operation::Lt(SignedTy::F32)),
            Operator::F64Lt => self.binop(Operation::Lt(SignedTy::F64)),
            Operator::I32GtS => self.binop(Operation::Gt(SignedTy::I32)),
            Operator::I32GtU => self.binop(Operation::Gt(SignedTy::U32)),
            Operator::I64GtS => self.binop(Operation::Gt(SignedTy::I64)),
            Operator::I64GtU => self.binop(Operation::Gt(SignedTy::U64)),
            Operator::F32Gt => self.binop(Operation::Gt(SignedTy::F32)),
            Operator::F64Gt => self.binop(Operation::Gt(SignedTy::F64)),
            Operator::I32LeS => self.binop(Operation::Le(SignedTy::I32)),
            Operator::I32LeU => self.binop(Operation::Le(SignedTy::U32)),
            Operator::I64LeS => self.binop(Operation::Le(SignedTy::I64)),
            Operator::I64LeU => self.binop(Operation::Le(SignedTy::U64)),
            Operator::F32Le => self.binop(Operation::Le(SignedTy::F32)),
            Operator::F64Le => self.binop(Operation::Le(SignedTy::F64)),
            Operator::I32GeS => self.binop(Operation::Ge(SignedTy::I32)),
            Operator::I32GeU => self.binop(Operation::Ge(SignedTy::U32)),
            Operator::I64GeS => self.binop(Operation::Ge(SignedTy::I64)),
            Operator::I64GeU => self.binop(Operation::Ge(SignedTy::U64)),
            Operator::F32Ge => self.binop(Operation::Ge(SignedTy::F32)),
            Operator::F64Ge => self.binop(Operation::Ge(SignedTy::F64)),

            // arithmetic
            Operator::I32Add => self.binop(Operation::Add(NumTy::I32)),
            Operator::I64Add => self.binop(Operation::Add(NumTy::I64)),
            Operator::F32Add => self.binop(Operation::Add(NumTy::F32)),
            Operator::F64Add => self.binop(Operation::Add(NumTy::F64)),
            Operator::I32Sub => self.binop(Operation::Sub(NumTy::I32)),
            Operator::I64Sub => self.binop(Operation::Sub(NumTy::I64)),
            Operator::F32Sub => self.binop(Operation::Sub(NumTy::F32)),
            Operator::F64Sub => self.binop(Operation::Sub(NumTy::F64)),
            Operator::I32Mul => self.binop(Operation::Mul(NumTy::I32)),
            Operator::I64Mul => self.binop(Operation::Mul(NumTy::I64)),
            Operator::F32Mul => self.binop(Operation::Mul(NumTy::F32)),
            Operator::F64Mul => self.binop(Operation::Mul(NumTy::F64)),
            Operator::I32DivS => self.binop(Operation::Div(SignedTy::I32)),
            Operator::I32DivU => self.binop(Operation::Div(SignedTy::U32)),
            Operator::I64DivS => self.binop(Operation::Div(SignedTy::I64)),
            Operator::I64DivU => self.binop(Operation::Div(SignedTy::U64)),
            Operator::F32Div => self.binop(Operation::Div(SignedTy::F32)),
            Operator::F64Div => self.binop(Operation::Div(SignedTy::F64)),
            Operator::I32RemS => self.binop(Operation::Rem { ty: IntTy::I32, signed: true }),
            Operator::I32RemU => self.binop(Operation::Rem { ty: IntTy::I32, signed: false }),
            Operator::I64RemS => self.binop(Operation::Rem { ty: IntTy::I64, signed: true }),
            Operator::I64RemU => self.binop(Operation::Rem { ty: IntTy::I64, signed: false }),
            Operator::I32Clz => self.unop(Operation::Clz(IntTy::I32)),
            Operator::I64Clz => self.unop(Operation::Clz(IntTy::I64)),
            Operator::I32Ctz => self.unop(Operation::Ctz(IntTy::I32)),
            Operator::I64Ctz => self.unop(Operation::Ctz(IntTy::I64)),
            Operator::I32Popcnt => self.unop(Operation::Popcnt(IntTy::I32)),
            Operator::I64Popcnt => self.unop(Operation::Popcnt(IntTy::I64)),
            Operator::I32And => self.binop(Operation::And(IntTy::I32)),
            Operator::I64And => self.binop(Operation::And(IntTy::I64)),
            Operator::I32Or => self.binop(Operation::Or(IntTy::I32)),
            Operator::I64Or => self.binop(Operation::Or(IntTy::I64)),
            Operator::I32Xor => self.binop(Operation::Xor(IntTy::I32)),
            Operator::I64Xor => self.binop(Operation::Xor(IntTy::I64)),
            Operator::I32Shl => self.binop(Operation::Shl(IntTy::I32)),
            Operator::I64Shl => self.binop(Operation::Shl(IntTy::I64)),
            Operator::I32ShrS => self.binop(Operation::Shr { ty: IntTy::I32, signed: true }),
            Operator::I32ShrU => self.binop(Operation::Shr { ty: IntTy::I32, signed: false }),
            Operator::I64ShrS => self.binop(Operation::Shr { ty: IntTy::I64, signed: true }),
            Operator::I64ShrU => self.binop(Operation::Shr { ty: IntTy::I64, signed: false }),
            Operator::I32Rotl => self.binop(Operation::Rotl(IntTy::I32)),
            Operator::I64Rotl => self.binop(Operation::Rotl(IntTy::I64)),
            Operator::I32Rotr => self.binop(Operation::Rotr(IntTy::I32)),
            Operator::I64Rotr => self.binop(Operation::Rotr(IntTy::I64)),

            Operator::F32Abs => self.unop(Operation::Abs(FloatTy::F32)),
            Operator::F64Abs => self.unop(Operation::Abs(FloatTy::F64)),
            Operator::F32Neg => self.unop(Operation::Neg(FloatTy::F32)),
            Operator::F64Neg => self.unop(Operation::Neg(FloatTy::F64)),
            Operator::F32Ceil => self.unop(Operation::Ceil(FloatTy::F32)),
            Operator::F64Ceil => self.unop(Operation::Ceil(FloatTy::F64)),
            Operator::F32Floor => self.unop(Operation::Floor(FloatTy::F32)),
            Operator::F64Floor => self.unop(Operation::Floor(FloatTy::F64)),
            Operator::F32Trunc => self.unop(Operation::Trunc(FloatTy::F32)),
            Operator::F64Trunc => self.unop(Operation::Trunc(FloatTy::F64)),
            Operator::F32Nearest => self.unop(Operation::Nearest(FloatTy::F32)),
            Operator::F64Nearest => self.unop(Operation::Nearest(FloatTy::F64)),
            Operator::F32Sqrt => self.unop(Operation::Sqrt(FloatTy::F32)),
            Operator::F64Sqrt => self.unop(Operation::Sqrt(FloatTy::F64)),
            Operator::F32Min => self.binop(Operation::Min(FloatTy::F32)),
            Operator::F64Min => self.binop(Operation::Min(FloatTy::F64)),
            Operator::F32Max => self.binop(Operation::Max(FloatTy::F32)),
            Operator::F64Max => self.binop(Operation::Max(FloatTy::F64)),
            Operator::F32Copysign => self.binop(Operation::Copysign(FloatTy::F32)),
            Operator::F64Copysign => self.binop(Operation::Copysign(FloatTy::F64)),

            // conversions
            Operator::I32WrapI64 => self.unop(Operation::I32WrapI64),
            Operator::I32TruncF32S => self.unop(trunc(IntTy::I32, true, FloatTy::F32, false)),
            Operator::I32TruncF32U => self.unop(trunc(IntTy::I32, false, FloatTy::F32, false)),
            Operator::I32TruncF64S => self.unop(trunc(IntTy::I32, true, FloatTy::F64, false)),
            Operator::I32TruncF64U => self.unop(trunc(IntTy::I32, false, FloatTy::F64, false)),
            Operator::I64TruncF32S => self.unop(trunc(IntTy::I64, true, FloatTy::F32, false)),
            Operator::I64TruncF32U => self.unop(trunc(IntTy::I64, false, FloatTy::F32, false)),
            Operator::I64TruncF64S => self.unop(trunc(IntTy::I64, true, FloatTy::F64, false)),
            Operator::I64TruncF64U => self.unop(trunc(IntTy::I64, false, FloatTy::F64, false)),
            Operator::I32TruncSatF32S => self.unop(trunc(IntTy::I32, true, FloatTy::F32, true)),
            Operator::I32TruncSatF32U => self.unop(trunc(IntTy::I32, false, FloatTy::F32, true)),
            Operator::I32TruncSatF64S => self.unop(trunc(IntTy::I32, true, FloatTy::F64, true)),
            Operator::I32TruncSatF64U => self.unop(trunc(IntTy::I32, false, FloatTy::F64, true)),
            Operator::I64TruncSatF32S => self.unop(trunc(IntTy::I64, true, FloatTy::F32, true)),
            Operator::I64TruncSatF32U => self.unop(trunc(IntTy::I64, false, FloatTy::F32, true)),
            Operator::I64TruncSatF64S => self.unop(trunc(IntTy::I64, true, FloatTy::F64, true)),
            Operator::I64TruncSatF64U => self.unop(trunc(IntTy::I64, false, FloatTy::F64, true)),
            Operator::F32ConvertI32S => self.unop(convert(FloatTy::F32, true, IntTy::I32)),
            Operator::F32ConvertI32U => self.unop(convert(FloatTy::F32, false, IntTy::I32)),
            Operator::F32ConvertI64S => self.unop(convert(FloatTy::F32, true, IntTy::I64)),
            Operator::F32ConvertI64U => self.unop(convert(FloatTy::F32, false, IntTy::I64)),
            Operator::F64ConvertI32S => self.unop(convert(FloatTy::F64, true, IntTy::I32)),
            Operator::F64ConvertI32U => self.unop(convert(FloatTy::F64, false, IntTy::I32)),
            Operator::F64ConvertI64S => self.unop(convert(FloatTy::F64, true, IntTy::I64)),
            Operator::F64ConvertI64U => self.unop(convert(FloatTy::F64, false, IntTy::I64)),
            Operator::F32DemoteF64 => self.unop(Operation::F32DemoteF64),
            Operator::F64PromoteF32 => self.unop(Operation::F64PromoteF32),
            Operator::I64ExtendI32S => self.unop(Operation::I64ExtendI32 { signed: true }),
            Operator::I64ExtendI32U => self.unop(Operation::I64ExtendI32 { signed: false }),
            Operator::I32Extend8S => self.unop(Operation::SignExtend { ty: IntTy::I32, bits: 8 }),
            Operator::I32Extend16S => self.unop(Operation::SignExtend { ty: IntTy::I32, bits: 16 }),
            Operator::I64Extend8S => self.unop(Operation::SignExtend { ty: IntTy::I64, bits: 8 }),
            Operator::I64Extend16S => self.unop(Operation::SignExtend { ty: IntTy::I64, bits: 16 }),
            Operator::I64Extend32S => self.unop(Operation::SignExtend { ty: IntTy::I64, bits: 32 }),

            // bit-preserving; types are erased on the value stack
            Operator::I32ReinterpretF32
            | Operator::I64ReinterpretF64
            | Operator::F32ReinterpretI32
            | Operator::F64ReinterpretI64 => {}

            // the illustrative SIMD subset
            Operator::V128Const { value } => {
                let bits = value.i128() as u128;
                self.push(Slot::V128Lo);
                self.push(Slot::V128Hi);
                self.emit(Operation::ConstV128 { lo: bits as u64, hi: (bits >> 64) as u64 });
            }
            Operator::I32x4Add => {
                self.pop_n(2);
                self.emit(Operation::V128Add);
            }

            other => {
                return Err(ParseError::UnsupportedOperator(format!("{other:?}")));
            }
        }
        Ok(())
    }

    fn lower_end(&mut self) -> Result<()> {
        let frame = self.frames.pop().ok_or_else(|| ParseError::Other("end without frame".into()))?;
        if let FrameKind::If { in_else: false } = frame.kind {
            // no else branch: the empty else shares the continuation
            self.emit(Operation::Label(label_id(frame.id, LABEL_ELSE)));
        }
        self.emit(Operation::Label(label_id(frame.id, LABEL_CONTINUATION)));
        let results = frame.ty.results.clone();
        self.restore_stack(frame.origin, &results);
        Ok(())
    }

    /// Consumes operators while the translator is in the unreachable state:
    /// nothing is emitted until control rejoins at an `else` or `end`.
    fn skip_op(&mut self, op: &Operator<'_>) -> Result<()> {
        match op {
            Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                self.unreachable_depth += 1;
            }
            Operator::Else if self.unreachable_depth == 0 => {
                let frame = self.frames.last_mut().ok_or_else(|| ParseError::Other("else without if".into()))?;
                let FrameKind::If { in_else } = &mut frame.kind else {
                    return Err(ParseError::Other("else without if".into()));
                };
                *in_else = true;
                let (id, origin) = (frame.id, frame.origin);
                let params = frame.ty.params.clone();
                self.emit(Operation::Label(label_id(id, LABEL_ELSE)));
                self.restore_stack(origin, &params);
                self.reachable = true;
            }
            Operator::End => {
                if self.unreachable_depth > 0 {
                    self.unreachable_depth -= 1;
                } else {
                    let rejoins = {
                        let frame = self.frames.last().ok_or_else(|| ParseError::Other("end without frame".into()))?;
                        let else_falls_through = matches!(frame.kind, FrameKind::If { in_else: false });
                        let continuation_called =
                            self.label_callers[label_id(frame.id, LABEL_CONTINUATION) as usize] > 0;
                        else_falls_through || continuation_called
                    };
                    self.lower_end()?;
                    self.reachable = rejoins;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn global_type(&self, index: u32) -> Result<ValType> {
        self.ctx
            .global_types
            .get(index as usize)
            .map(|g| g.ty)
            .ok_or_else(|| ParseError::Other(format!("global {index} out of range")))
    }

    fn pop_n(&mut self, n: u32) {
        for _ in 0..n {
            self.pop();
        }
    }

    /// pops one slot, pushes one
    fn unop(&mut self, op: Operation) {
        self.emit(op);
    }

    /// pops two slots, pushes one
    fn binop(&mut self, op: Operation) {
        self.pop();
        self.emit(op);
    }

    fn lower_load(&mut self, memarg: &wasmparser::MemArg, make: impl Fn(u32) -> Operation) -> Result<()> {
        self.flags.uses_memory = true;
        let offset = memarg_offset(memarg)?;
        self.emit(make(offset));
        Ok(())
    }

    fn lower_store(&mut self, memarg: &wasmparser::MemArg, make: impl Fn(u32) -> Operation) -> Result<()> {
        self.flags.uses_memory = true;
        let offset = memarg_offset(memarg)?;
        self.pop_n(2);
        self.emit(make(offset));
        Ok(())
    }
}

fn memarg_offset(memarg: &wasmparser::MemArg) -> Result<u32> {
    memarg
        .offset
        .try_into()
        .map_err(|_| ParseError::TooLarge(format!("memory offset {}", memarg.offset)))
}

fn trunc(int: IntTy, signed: bool, float: FloatTy, saturating: bool) -> Operation {
    Operation::ITruncF { int, signed, float, saturating }
}

fn convert(float: FloatTy, signed: bool, int: IntTy) -> Operation {
    Operation::FConvertI { float, signed, int }
}

fn drop_range(height: u32, origin: u32, arity: u32) -> Option<DropRange> {
    if height <= origin + arity {
        None
    } else {
        Some(DropRange { start: arity, end: height - origin - 1 })
    }
}

#[cfg(test)]
mod tests {
    use super::drop_range;
    use zerowasm_types::DropRange;

    #[test]
    fn drop_range_keeps_the_branch_arity() {
        // stack of 5 slots, block entered at height 2, one result slot:
        // keep the top slot, discard the two below it
        assert_eq!(drop_range(5, 2, 1), Some(DropRange { start: 1, end: 2 }));
        // nothing between the results and the frame origin
        assert_eq!(drop_range(3, 2, 1), None);
        // zero-arity branch discards everything above the origin
        assert_eq!(drop_range(4, 2, 0), Some(DropRange { start: 0, end: 1 }));
    }
}
