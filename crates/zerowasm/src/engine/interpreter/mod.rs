//! The interpreter engine: a dispatch loop over the lowered operation
//! stream, with an explicit call-frame stack so deep call chains never
//! touch the host stack.

mod num_helpers;

use std::any::Any;
use std::sync::Arc;

use zerowasm_types::{
    BranchTarget, DropRange, FloatTy, FuncType, IntTy, Module, NumTy, Operation, RawValue, SignedTy, WasmValue,
};

use self::num_helpers::*;
use crate::engine::{
    slots_to_value, value_to_slots, CompiledArtifact, Engine, FunctionHandle, ModuleEngine, HANDLE_KIND_HOST,
};
use crate::host::HostContext;
use crate::instance::ModuleInstance;
use crate::{Error, Result, Trap};

/// Upper bound on interpreted call frames per call engine.
const CALL_STACK_CEILING: usize = 2048;

#[derive(Debug, Default)]
pub(crate) struct InterpreterEngine;

impl Engine for InterpreterEngine {
    fn compile_module(&self, module: &Module) -> Result<Arc<dyn CompiledArtifact>> {
        // resolve label ids to operation indexes once per module
        let label_pcs = module
            .functions
            .iter()
            .map(|function| {
                let mut pcs = vec![0u32; function.label_count as usize];
                for (pc, op) in function.ops.iter().enumerate() {
                    if let Operation::Label(id) = op {
                        pcs[*id as usize] = pc as u32;
                    }
                }
                pcs.into_boxed_slice()
            })
            .collect();
        Ok(Arc::new(InterpArtifact { label_pcs }))
    }

    fn new_module_engine(
        &self,
        _instance: &Arc<ModuleInstance>,
        artifact: &Arc<dyn CompiledArtifact>,
    ) -> Result<Box<dyn ModuleEngine>> {
        Ok(Box::new(InterpModuleEngine { artifact: artifact.clone() }))
    }
}

#[derive(Debug)]
struct InterpArtifact {
    /// Per function: label id to operation index.
    label_pcs: Box<[Box<[u32]>]>,
}

impl CompiledArtifact for InterpArtifact {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn code_addr(&self, _index: u32) -> usize {
        0
    }
}

#[derive(Debug)]
struct InterpModuleEngine {
    artifact: Arc<dyn CompiledArtifact>,
}

impl InterpModuleEngine {
    fn artifact(&self) -> &InterpArtifact {
        self.artifact.as_any().downcast_ref().expect("interpreter artifact")
    }
}

/// The label-pc table of an instance's own function, reached through its
/// module engine.
fn label_pcs_of(owner: &ModuleInstance, func: u32) -> &[u32] {
    let engine = owner
        .engine()
        .as_any()
        .downcast_ref::<InterpModuleEngine>()
        .expect("store uses one engine for every module");
    &engine.artifact().label_pcs[func as usize]
}

impl ModuleEngine for InterpModuleEngine {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn call(&self, instance: &Arc<ModuleInstance>, func_index: u32, args: &[WasmValue]) -> Result<Vec<WasmValue>> {
        let handle = instance
            .handle(func_index)
            .ok_or_else(|| Error::Other(format!("function {func_index} not found")))?;
        let ty = instance
            .function_type(func_index)
            .ok_or_else(|| Error::Other(format!("function {func_index} not found")))?;

        if handle.kind == HANDLE_KIND_HOST {
            let host = &handle.owner().hosts()[handle.index as usize];
            let ctx = HostContext { caller: instance };
            return host.call(&ctx, args);
        }

        let mut executor = Executor { stack: Vec::with_capacity(64), frames: Vec::new() };
        for value in args {
            executor.push_value(instance, value);
        }
        executor.push_wasm_frame(handle)?;
        executor.run()?;
        Ok(executor.collect_results(&ty))
    }
}

struct Frame {
    owner: *const ModuleInstance,
    /// Own-function index in the owner.
    func: u32,
    pc: usize,
    /// Absolute slot index of the frame's first parameter.
    base: usize,
    result_slots: u32,
}

/// What ended a frame-local dispatch run.
enum Switch {
    Call(*const FunctionHandle),
    Return,
}

struct Executor {
    stack: Vec<RawValue>,
    frames: Vec<Frame>,
}

impl Executor {
    fn push_value(&mut self, instance: &ModuleInstance, value: &WasmValue) {
        let (lo, hi) = value_to_slots(instance, value);
        self.stack.push(lo);
        if let Some(hi) = hi {
            self.stack.push(hi);
        }
    }

    fn collect_results(&self, ty: &FuncType) -> Vec<WasmValue> {
        let mut results = Vec::with_capacity(ty.results.len());
        let mut slot = 0usize;
        for result in ty.results.iter() {
            let lo = self.stack[slot];
            let hi = if result.slot_count() == 2 { self.stack[slot + 1] } else { RawValue::ZERO };
            results.push(slots_to_value(*result, lo, hi));
            slot += result.slot_count() as usize;
        }
        results
    }

    /// Pushes a call frame for a wasm function: the parameters are already
    /// on the stack, locals are zeroed, and the frame's worst-case stack
    /// space is reserved up front.
    fn push_wasm_frame(&mut self, handle: &FunctionHandle) -> Result<()> {
        if self.frames.len() >= CALL_STACK_CEILING {
            return Err(Trap::CallStackExhausted.into());
        }
        let owner = handle.owner();
        let base = self.stack.len() - handle.param_slots as usize;
        self.stack.reserve(handle.stack_ceil as usize);
        let local_slots = owner.module().functions[handle.index as usize].local_slots;
        self.stack.extend(std::iter::repeat(RawValue::ZERO).take(local_slots as usize));
        self.frames.push(Frame {
            owner: handle.owner,
            func: handle.index,
            pc: 0,
            base,
            result_slots: handle.result_slots,
        });
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        while let Some(frame) = self.frames.last() {
            let owner = unsafe { &*frame.owner };
            let module = owner.module().clone();
            let func = frame.func;
            let base = frame.base;
            let mut pc = frame.pc;

            let ops = &module.functions[func as usize].ops;
            let label_pcs = label_pcs_of(owner, func);

            match self.dispatch(owner, ops, label_pcs, base, &mut pc)? {
                Switch::Call(callee) => {
                    self.frames.last_mut().expect("frame present").pc = pc;
                    let callee = unsafe { &*callee };
                    self.push_wasm_frame(callee)?;
                }
                Switch::Return => {
                    let frame = self.frames.pop().expect("frame present");
                    let results = frame.result_slots as usize;
                    let from = self.stack.len() - results;
                    for i in 0..results {
                        self.stack[frame.base + i] = self.stack[from + i];
                    }
                    self.stack.truncate(frame.base + results);
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, value: impl Into<RawValue>) {
        self.stack.push(value.into());
    }

    fn pop(&mut self) -> RawValue {
        self.stack.pop().unwrap_or(RawValue::ZERO)
    }

    fn apply_drop(&mut self, range: &DropRange) {
        let len = self.stack.len();
        let keep_from = len - range.start as usize;
        let drop_from = len - 1 - range.end as usize;
        self.stack.drain(drop_from..keep_from);
    }

    fn branch(&mut self, target: &BranchTarget, label_pcs: &[u32]) -> usize {
        if let Some(range) = &target.drop {
            self.apply_drop(range);
        }
        label_pcs[target.label as usize] as usize
    }

    fn binop_i32(&mut self, f: impl FnOnce(u32, u32) -> u32) {
        let b = self.pop().as_u32();
        let a = self.pop().as_u32();
        self.push(f(a, b));
    }

    fn binop_i64(&mut self, f: impl FnOnce(u64, u64) -> u64) {
        let b = self.pop().as_u64();
        let a = self.pop().as_u64();
        self.push(f(a, b));
    }

    fn binop_f32(&mut self, f: impl FnOnce(f32, f32) -> f32) {
        let b = self.pop().as_f32();
        let a = self.pop().as_f32();
        self.push(f(a, b));
    }

    fn binop_f64(&mut self, f: impl FnOnce(f64, f64) -> f64) {
        let b = self.pop().as_f64();
        let a = self.pop().as_f64();
        self.push(f(a, b));
    }

    fn unop_f32(&mut self, f: impl FnOnce(f32) -> f32) {
        let v = self.pop().as_f32();
        self.push(f(v));
    }

    fn unop_f64(&mut self, f: impl FnOnce(f64) -> f64) {
        let v = self.pop().as_f64();
        self.push(f(v));
    }

    fn cmp<T: PartialOrd>(&mut self, a: T, b: T, f: impl FnOnce(T, T) -> bool) {
        self.push(f(a, b) as u32);
    }

    fn compare(&mut self, ty: SignedTy, f: impl Fn(std::cmp::Ordering) -> bool) {
        let b = self.pop();
        let a = self.pop();
        let result = match ty {
            SignedTy::I32 => a.as_i32().partial_cmp(&b.as_i32()).map(&f),
            SignedTy::U32 => a.as_u32().partial_cmp(&b.as_u32()).map(&f),
            SignedTy::I64 => a.as_i64().partial_cmp(&b.as_i64()).map(&f),
            SignedTy::U64 => a.as_u64().partial_cmp(&b.as_u64()).map(&f),
            SignedTy::F32 => a.as_f32().partial_cmp(&b.as_f32()).map(&f),
            SignedTy::F64 => a.as_f64().partial_cmp(&b.as_f64()).map(&f),
        };
        self.push(result.unwrap_or(false) as u32);
    }

    fn call_host_inline(&mut self, caller: &ModuleInstance, handle: &FunctionHandle) -> Result<()> {
        let owner = handle.owner();
        let host = &owner.hosts()[handle.index as usize];

        // slots back to typed values, first parameter deepest
        let param_slots = handle.param_slots as usize;
        let first = self.stack.len() - param_slots;
        let mut params = Vec::with_capacity(host.ty.params.len());
        let mut slot = first;
        for ty in host.ty.params.iter() {
            let lo = self.stack[slot];
            let hi = if ty.slot_count() == 2 { self.stack[slot + 1] } else { RawValue::ZERO };
            params.push(slots_to_value(*ty, lo, hi));
            slot += ty.slot_count() as usize;
        }
        self.stack.truncate(first);

        let ctx = HostContext { caller };
        let results = host.call(&ctx, &params)?;
        for (value, _ty) in results.iter().zip(host.ty.results.iter()) {
            let (lo, hi) = value_to_slots(caller, value);
            self.stack.push(lo);
            if let Some(hi) = hi {
                self.stack.push(hi);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &mut self,
        owner: &ModuleInstance,
        ops: &[Operation],
        label_pcs: &[u32],
        base: usize,
        pc: &mut usize,
    ) -> Result<Switch> {
        loop {
            if *pc >= ops.len() {
                return Ok(Switch::Return);
            }
            let op = &ops[*pc];
            *pc += 1;

            match op {
                Operation::Unreachable => return Err(Trap::Unreachable.into()),
                Operation::Label(_) => {}

                Operation::Br(target) => {
                    *pc = self.branch(target, label_pcs);
                }
                Operation::BrIf { then, els } => {
                    let cond = self.pop().as_u32();
                    let target = if cond != 0 { then } else { els };
                    *pc = self.branch(target, label_pcs);
                }
                Operation::BrTable { targets, default } => {
                    let index = self.pop().as_u32() as usize;
                    let target = targets.get(index).unwrap_or(default);
                    *pc = self.branch(target, label_pcs);
                }

                Operation::Call(func_index) => {
                    let handle = owner
                        .handle(*func_index)
                        .ok_or_else(|| Error::Other(format!("function {func_index} not found")))?;
                    if handle.kind == HANDLE_KIND_HOST {
                        self.call_host_inline(owner, handle)?;
                    } else {
                        return Ok(Switch::Call(handle));
                    }
                }
                Operation::CallIndirect { type_idx, table } => {
                    let index = self.pop().as_u32();
                    let table = &owner.tables()[*table as usize];
                    let raw = table.get(index).map_err(Error::Trap)?;
                    if raw == 0 {
                        return Err(Trap::NullFuncRef.into());
                    }
                    let handle = unsafe { &*(raw as *const FunctionHandle) };
                    if handle.type_id != owner.type_ids()[*type_idx as usize] {
                        return Err(Trap::IndirectCallTypeMismatch.into());
                    }
                    if handle.kind == HANDLE_KIND_HOST {
                        self.call_host_inline(owner, handle)?;
                    } else {
                        return Ok(Switch::Call(handle));
                    }
                }

                Operation::Drop(range) => {
                    if let Some(range) = range {
                        self.apply_drop(range);
                    }
                }
                Operation::Select { wide } => {
                    let cond = self.pop().as_u32();
                    if *wide {
                        let b_hi = self.pop();
                        let b_lo = self.pop();
                        if cond == 0 {
                            let len = self.stack.len();
                            self.stack[len - 2] = b_lo;
                            self.stack[len - 1] = b_hi;
                        }
                    } else {
                        let b = self.pop();
                        if cond == 0 {
                            *self.stack.last_mut().expect("operand on stack") = b;
                        }
                    }
                }
                Operation::Pick { depth, .. } => {
                    let value = self.stack[self.stack.len() - 1 - *depth as usize];
                    self.stack.push(value);
                }
                Operation::Set { depth, .. } => {
                    let len = self.stack.len();
                    let value = self.stack[len - 1];
                    self.stack[len - 1 - *depth as usize] = value;
                    self.stack.pop();
                }

                Operation::GlobalGet { index, wide } => {
                    let (lo, hi) = owner.globals()[*index as usize].get();
                    self.stack.push(lo);
                    if *wide {
                        self.stack.push(hi);
                    }
                }
                Operation::GlobalSet { index, wide } => {
                    let global = &owner.globals()[*index as usize];
                    if *wide {
                        let hi = self.pop();
                        let lo = self.pop();
                        global.set(lo, hi);
                    } else {
                        let lo = self.pop();
                        global.set(lo, RawValue::ZERO);
                    }
                }

                Operation::Load { ty, offset } => {
                    let size = match ty {
                        NumTy::I32 | NumTy::F32 => 4,
                        NumTy::I64 | NumTy::F64 => 8,
                    };
                    let value = self.mem_load(owner, *offset, size)?;
                    self.push(value);
                }
                Operation::Load8 { ty, signed, offset } => {
                    let raw = self.mem_load(owner, *offset, 1)?;
                    let value = match (ty, signed) {
                        (IntTy::I32, true) => RawValue::from(raw as u8 as i8 as i32),
                        (IntTy::I32, false) => RawValue::from(raw as u8 as u32),
                        (IntTy::I64, true) => RawValue::from(raw as u8 as i8 as i64),
                        (IntTy::I64, false) => RawValue::from(raw as u8 as u64),
                    };
                    self.stack.push(value);
                }
                Operation::Load16 { ty, signed, offset } => {
                    let raw = self.mem_load(owner, *offset, 2)?;
                    let value = match (ty, signed) {
                        (IntTy::I32, true) => RawValue::from(raw as u16 as i16 as i32),
                        (IntTy::I32, false) => RawValue::from(raw as u16 as u32),
                        (IntTy::I64, true) => RawValue::from(raw as u16 as i16 as i64),
                        (IntTy::I64, false) => RawValue::from(raw as u16 as u64),
                    };
                    self.stack.push(value);
                }
                Operation::Load32 { signed, offset } => {
                    let raw = self.mem_load(owner, *offset, 4)?;
                    let value = if *signed {
                        RawValue::from(raw as u32 as i32 as i64)
                    } else {
                        RawValue::from(raw as u32 as u64)
                    };
                    self.stack.push(value);
                }
                Operation::Store { ty, offset } => {
                    let size = match ty {
                        NumTy::I32 | NumTy::F32 => 4,
                        NumTy::I64 | NumTy::F64 => 8,
                    };
                    self.mem_store(owner, *offset, size)?;
                }
                Operation::Store8 { offset } => self.mem_store(owner, *offset, 1)?,
                Operation::Store16 { offset } => self.mem_store(owner, *offset, 2)?,
                Operation::Store32 { offset } => self.mem_store(owner, *offset, 4)?,

                Operation::MemorySize => {
                    let memory = owner.memory().expect("lowering proved memory access");
                    self.push(memory.page_count());
                }
                Operation::MemoryGrow => {
                    let memory = owner.memory().expect("lowering proved memory access");
                    let delta = self.pop().as_u32();
                    match memory.grow(delta) {
                        Some(previous) => self.push(previous),
                        None => self.push(-1i32),
                    }
                }
                Operation::MemoryInit(data_index) => {
                    let len = self.pop().as_u32() as u64;
                    let src = self.pop().as_u32() as u64;
                    let dst = self.pop().as_u32() as u64;
                    let data = &owner.datas()[*data_index as usize];
                    let bytes = data.read(src, len).map_err(Error::Trap)?.to_vec();
                    let memory = owner.memory().expect("lowering proved memory access");
                    memory.write(dst, &bytes).map_err(Error::Trap)?;
                }
                Operation::DataDrop(index) => {
                    owner.datas()[*index as usize].drop_contents_shared();
                }
                Operation::MemoryCopy => {
                    let len = self.pop().as_u32() as u64;
                    let src = self.pop().as_u32() as u64;
                    let dst = self.pop().as_u32() as u64;
                    let memory = owner.memory().expect("lowering proved memory access");
                    memory.copy_within(dst, src, len).map_err(Error::Trap)?;
                }
                Operation::MemoryFill => {
                    let len = self.pop().as_u32() as u64;
                    let value = self.pop().as_u32() as u8;
                    let dst = self.pop().as_u32() as u64;
                    let memory = owner.memory().expect("lowering proved memory access");
                    memory.fill(dst, len, value).map_err(Error::Trap)?;
                }

                Operation::TableGet(table) => {
                    let index = self.pop().as_u32();
                    let raw = owner.tables()[*table as usize].get(index).map_err(Error::Trap)?;
                    self.push(raw);
                }
                Operation::TableSet(table) => {
                    let value = self.pop().as_u64();
                    let index = self.pop().as_u32();
                    owner.tables()[*table as usize].set(index, value).map_err(Error::Trap)?;
                }
                Operation::TableSize(table) => {
                    self.push(owner.tables()[*table as usize].len());
                }
                Operation::TableGrow(table) => {
                    let delta = self.pop().as_u32();
                    let init = self.pop().as_u64();
                    match owner.tables()[*table as usize].grow(delta, init) {
                        Some(previous) => self.push(previous),
                        None => self.push(-1i32),
                    }
                }
                Operation::TableFill(table) => {
                    let len = self.pop().as_u32();
                    let value = self.pop().as_u64();
                    let index = self.pop().as_u32();
                    owner.tables()[*table as usize].fill(index, len, value).map_err(Error::Trap)?;
                }
                Operation::TableInit { elem, table } => {
                    let len = self.pop().as_u32() as u64;
                    let src = self.pop().as_u32() as u64;
                    let dst = self.pop().as_u32();
                    let items = owner.elements()[*elem as usize].read(src, len).map_err(Error::Trap)?.to_vec();
                    owner.tables()[*table as usize].init(dst, &items).map_err(Error::Trap)?;
                }
                Operation::TableCopy { dst, src } => {
                    let len = self.pop().as_u32();
                    let src_off = self.pop().as_u32();
                    let dst_off = self.pop().as_u32();
                    let tables = owner.tables();
                    if dst == src {
                        tables[*dst as usize].copy_within(dst_off, src_off, len).map_err(Error::Trap)?;
                    } else {
                        let (dst_table, src_table) = (&tables[*dst as usize], &tables[*src as usize]);
                        dst_table.copy_from(src_table, dst_off, src_off, len).map_err(Error::Trap)?;
                    }
                }
                Operation::ElemDrop(index) => {
                    owner.elements()[*index as usize].drop_contents_shared();
                }

                Operation::RefNull => self.push(0u64),
                Operation::RefFunc(index) => {
                    let raw = owner
                        .handle(*index)
                        .map(|handle| handle as *const FunctionHandle as u64)
                        .unwrap_or(0);
                    self.push(raw);
                }
                Operation::RefIsNull => {
                    let value = self.pop().as_u64();
                    self.push((value == 0) as u32);
                }

                Operation::Const32(value) => self.push(*value),
                Operation::Const64(value) => self.push(*value),
                Operation::ConstV128 { lo, hi } => {
                    self.push(*lo);
                    self.push(*hi);
                }

                Operation::Eqz(IntTy::I32) => {
                    let v = self.pop().as_u32();
                    self.push((v == 0) as u32);
                }
                Operation::Eqz(IntTy::I64) => {
                    let v = self.pop().as_u64();
                    self.push((v == 0) as u32);
                }
                Operation::Eq(ty) => {
                    let b = self.pop();
                    let a = self.pop();
                    match ty {
                        NumTy::I32 => self.cmp(a.as_u32(), b.as_u32(), |a, b| a == b),
                        NumTy::I64 => self.cmp(a.as_u64(), b.as_u64(), |a, b| a == b),
                        NumTy::F32 => self.cmp(a.as_f32(), b.as_f32(), |a, b| a == b),
                        NumTy::F64 => self.cmp(a.as_f64(), b.as_f64(), |a, b| a == b),
                    }
                }
                Operation::Ne(ty) => {
                    let b = self.pop();
                    let a = self.pop();
                    match ty {
                        NumTy::I32 => self.cmp(a.as_u32(), b.as_u32(), |a, b| a != b),
                        NumTy::I64 => self.cmp(a.as_u64(), b.as_u64(), |a, b| a != b),
                        NumTy::F32 => self.cmp(a.as_f32(), b.as_f32(), |a, b| a != b),
                        NumTy::F64 => self.cmp(a.as_f64(), b.as_f64(), |a, b| a != b),
                    }
                }
                Operation::Lt(ty) => self.compare(*ty, |ord| ord == std::cmp::Ordering::Less),
                Operation::Gt(ty) => self.compare(*ty, |ord| ord == std::cmp::Ordering::Greater),
                Operation::Le(ty) => self.compare(*ty, |ord| ord != std::cmp::Ordering::Greater),
                Operation::Ge(ty) => self.compare(*ty, |ord| ord != std::cmp::Ordering::Less),

                Operation::Add(NumTy::I32) => self.binop_i32(u32::wrapping_add),
                Operation::Add(NumTy::I64) => self.binop_i64(u64::wrapping_add),
                Operation::Add(NumTy::F32) => self.binop_f32(|a, b| a + b),
                Operation::Add(NumTy::F64) => self.binop_f64(|a, b| a + b),
                Operation::Sub(NumTy::I32) => self.binop_i32(u32::wrapping_sub),
                Operation::Sub(NumTy::I64) => self.binop_i64(u64::wrapping_sub),
                Operation::Sub(NumTy::F32) => self.binop_f32(|a, b| a - b),
                Operation::Sub(NumTy::F64) => self.binop_f64(|a, b| a - b),
                Operation::Mul(NumTy::I32) => self.binop_i32(u32::wrapping_mul),
                Operation::Mul(NumTy::I64) => self.binop_i64(u64::wrapping_mul),
                Operation::Mul(NumTy::F32) => self.binop_f32(|a, b| a * b),
                Operation::Mul(NumTy::F64) => self.binop_f64(|a, b| a * b),

                Operation::Clz(IntTy::I32) => {
                    let v = self.pop().as_u32();
                    self.push(v.leading_zeros());
                }
                Operation::Clz(IntTy::I64) => {
                    let v = self.pop().as_u64();
                    self.push(v.leading_zeros() as u64);
                }
                Operation::Ctz(IntTy::I32) => {
                    let v = self.pop().as_u32();
                    self.push(v.trailing_zeros());
                }
                Operation::Ctz(IntTy::I64) => {
                    let v = self.pop().as_u64();
                    self.push(v.trailing_zeros() as u64);
                }
                Operation::Popcnt(IntTy::I32) => {
                    let v = self.pop().as_u32();
                    self.push(v.count_ones());
                }
                Operation::Popcnt(IntTy::I64) => {
                    let v = self.pop().as_u64();
                    self.push(v.count_ones() as u64);
                }

                Operation::Div(ty) => {
                    let b = self.pop();
                    let a = self.pop();
                    match ty {
                        SignedTy::I32 => {
                            let (a, b) = (a.as_i32(), b.as_i32());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            let v = a.checked_div(b).ok_or(Trap::IntegerOverflow)?;
                            self.push(v);
                        }
                        SignedTy::U32 => {
                            let (a, b) = (a.as_u32(), b.as_u32());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            self.push(a / b);
                        }
                        SignedTy::I64 => {
                            let (a, b) = (a.as_i64(), b.as_i64());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            let v = a.checked_div(b).ok_or(Trap::IntegerOverflow)?;
                            self.push(v);
                        }
                        SignedTy::U64 => {
                            let (a, b) = (a.as_u64(), b.as_u64());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            self.push(a / b);
                        }
                        SignedTy::F32 => {
                            self.push(a.as_f32() / b.as_f32());
                        }
                        SignedTy::F64 => {
                            self.push(a.as_f64() / b.as_f64());
                        }
                    }
                }
                Operation::Rem { ty, signed } => {
                    let b = self.pop();
                    let a = self.pop();
                    match (ty, signed) {
                        (IntTy::I32, true) => {
                            let (a, b) = (a.as_i32(), b.as_i32());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            self.push(a.wrapping_rem(b));
                        }
                        (IntTy::I32, false) => {
                            let (a, b) = (a.as_u32(), b.as_u32());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            self.push(a % b);
                        }
                        (IntTy::I64, true) => {
                            let (a, b) = (a.as_i64(), b.as_i64());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            self.push(a.wrapping_rem(b));
                        }
                        (IntTy::I64, false) => {
                            let (a, b) = (a.as_u64(), b.as_u64());
                            if b == 0 {
                                return Err(Trap::DivisionByZero.into());
                            }
                            self.push(a % b);
                        }
                    }
                }

                Operation::And(IntTy::I32) => self.binop_i32(|a, b| a & b),
                Operation::And(IntTy::I64) => self.binop_i64(|a, b| a & b),
                Operation::Or(IntTy::I32) => self.binop_i32(|a, b| a | b),
                Operation::Or(IntTy::I64) => self.binop_i64(|a, b| a | b),
                Operation::Xor(IntTy::I32) => self.binop_i32(|a, b| a ^ b),
                Operation::Xor(IntTy::I64) => self.binop_i64(|a, b| a ^ b),
                Operation::Shl(IntTy::I32) => self.binop_i32(|a, b| a.wrapping_shl(b)),
                Operation::Shl(IntTy::I64) => self.binop_i64(|a, b| a.wrapping_shl(b as u32)),
                Operation::Shr { ty: IntTy::I32, signed: false } => self.binop_i32(|a, b| a.wrapping_shr(b)),
                Operation::Shr { ty: IntTy::I64, signed: false } => {
                    self.binop_i64(|a, b| a.wrapping_shr(b as u32))
                }
                Operation::Shr { ty: IntTy::I32, signed: true } => {
                    let b = self.pop().as_u32();
                    let a = self.pop().as_i32();
                    self.push(a.wrapping_shr(b));
                }
                Operation::Shr { ty: IntTy::I64, signed: true } => {
                    let b = self.pop().as_u64();
                    let a = self.pop().as_i64();
                    self.push(a.wrapping_shr(b as u32));
                }
                Operation::Rotl(IntTy::I32) => self.binop_i32(|a, b| a.rotate_left(b & 31)),
                Operation::Rotl(IntTy::I64) => self.binop_i64(|a, b| a.rotate_left(b as u32 & 63)),
                Operation::Rotr(IntTy::I32) => self.binop_i32(|a, b| a.rotate_right(b & 31)),
                Operation::Rotr(IntTy::I64) => self.binop_i64(|a, b| a.rotate_right(b as u32 & 63)),

                Operation::Abs(FloatTy::F32) => self.unop_f32(f32::abs),
                Operation::Abs(FloatTy::F64) => self.unop_f64(f64::abs),
                Operation::Neg(FloatTy::F32) => self.unop_f32(|v| -v),
                Operation::Neg(FloatTy::F64) => self.unop_f64(|v| -v),
                Operation::Ceil(FloatTy::F32) => self.unop_f32(f32::ceil),
                Operation::Ceil(FloatTy::F64) => self.unop_f64(f64::ceil),
                Operation::Floor(FloatTy::F32) => self.unop_f32(f32::floor),
                Operation::Floor(FloatTy::F64) => self.unop_f64(f64::floor),
                Operation::Trunc(FloatTy::F32) => self.unop_f32(f32::trunc),
                Operation::Trunc(FloatTy::F64) => self.unop_f64(f64::trunc),
                Operation::Nearest(FloatTy::F32) => self.unop_f32(f32::round_ties_even),
                Operation::Nearest(FloatTy::F64) => self.unop_f64(f64::round_ties_even),
                Operation::Sqrt(FloatTy::F32) => self.unop_f32(f32::sqrt),
                Operation::Sqrt(FloatTy::F64) => self.unop_f64(f64::sqrt),
                Operation::Min(FloatTy::F32) => self.binop_f32(WasmFloat::wasm_min),
                Operation::Min(FloatTy::F64) => self.binop_f64(WasmFloat::wasm_min),
                Operation::Max(FloatTy::F32) => self.binop_f32(WasmFloat::wasm_max),
                Operation::Max(FloatTy::F64) => self.binop_f64(WasmFloat::wasm_max),
                Operation::Copysign(FloatTy::F32) => self.binop_f32(f32::copysign),
                Operation::Copysign(FloatTy::F64) => self.binop_f64(f64::copysign),

                Operation::I32WrapI64 => {
                    let v = self.pop().as_u64();
                    self.push(v as u32);
                }
                Operation::ITruncF { int, signed, float, saturating } => {
                    let value = match float {
                        FloatTy::F32 => self.pop().as_f32() as f64,
                        FloatTy::F64 => self.pop().as_f64(),
                    };
                    let result = match (int, signed, saturating) {
                        (IntTy::I32, true, false) => RawValue::from(trunc_to_i32(value).map_err(Error::Trap)?),
                        (IntTy::I32, false, false) => RawValue::from(trunc_to_u32(value).map_err(Error::Trap)?),
                        (IntTy::I64, true, false) => RawValue::from(trunc_to_i64(value).map_err(Error::Trap)?),
                        (IntTy::I64, false, false) => RawValue::from(trunc_to_u64(value).map_err(Error::Trap)?),
                        (IntTy::I32, true, true) => RawValue::from(value as i32),
                        (IntTy::I32, false, true) => RawValue::from(value as u32),
                        (IntTy::I64, true, true) => RawValue::from(value as i64),
                        (IntTy::I64, false, true) => RawValue::from(value as u64),
                    };
                    self.stack.push(result);
                }
                Operation::FConvertI { float, signed, int } => {
                    let v = self.pop();
                    let value = match (int, signed) {
                        (IntTy::I32, true) => v.as_i32() as f64,
                        (IntTy::I32, false) => v.as_u32() as f64,
                        (IntTy::I64, true) => v.as_i64() as f64,
                        (IntTy::I64, false) => v.as_u64() as f64,
                    };
                    match float {
                        FloatTy::F32 => {
                            // convert from the integer directly so rounding
                            // happens once
                            let single = match (int, signed) {
                                (IntTy::I32, true) => v.as_i32() as f32,
                                (IntTy::I32, false) => v.as_u32() as f32,
                                (IntTy::I64, true) => v.as_i64() as f32,
                                (IntTy::I64, false) => v.as_u64() as f32,
                            };
                            self.push(single);
                        }
                        FloatTy::F64 => self.push(value),
                    }
                }
                Operation::F32DemoteF64 => {
                    let v = self.pop().as_f64();
                    self.push(v as f32);
                }
                Operation::F64PromoteF32 => {
                    let v = self.pop().as_f32();
                    self.push(v as f64);
                }
                Operation::I64ExtendI32 { signed } => {
                    let v = self.pop();
                    if *signed {
                        self.push(v.as_i32() as i64);
                    } else {
                        self.push(v.as_u32() as u64);
                    }
                }
                Operation::SignExtend { ty, bits } => {
                    let v = self.pop();
                    let value = match (ty, bits) {
                        (IntTy::I32, 8) => RawValue::from(v.as_i32() as i8 as i32),
                        (IntTy::I32, _) => RawValue::from(v.as_i32() as i16 as i32),
                        (IntTy::I64, 8) => RawValue::from(v.as_i64() as i8 as i64),
                        (IntTy::I64, 16) => RawValue::from(v.as_i64() as i16 as i64),
                        (IntTy::I64, _) => RawValue::from(v.as_i64() as i32 as i64),
                    };
                    self.stack.push(value);
                }

                Operation::V128Add => {
                    let b_hi = self.pop().as_u64();
                    let b_lo = self.pop().as_u64();
                    let len = self.stack.len();
                    let a_lo = self.stack[len - 2].as_u64();
                    let a_hi = self.stack[len - 1].as_u64();
                    self.stack[len - 2] = RawValue(add_i32x2(a_lo, b_lo));
                    self.stack[len - 1] = RawValue(add_i32x2(a_hi, b_hi));
                }
            }

            // the frame's operand region must never dip below its base
            debug_assert!(self.stack.len() >= base);
        }
    }

    fn mem_load(&mut self, owner: &ModuleInstance, offset: u32, size: u32) -> Result<u64> {
        let memory = owner.memory().expect("lowering proved memory access");
        let addr = self.pop().as_u32() as u64 + offset as u64;
        memory.load_int(addr, size).map_err(Error::Trap)
    }

    fn mem_store(&mut self, owner: &ModuleInstance, offset: u32, size: u32) -> Result<()> {
        let memory = owner.memory().expect("lowering proved memory access");
        let value = self.pop().as_u64();
        let addr = self.pop().as_u32() as u64 + offset as u64;
        memory.store_int(addr, size, value).map_err(Error::Trap)
    }
}

/// Adds the two i32 lanes packed in each half of a v128.
fn add_i32x2(a: u64, b: u64) -> u64 {
    let lo = (a as u32).wrapping_add(b as u32) as u64;
    let hi = ((a >> 32) as u32).wrapping_add((b >> 32) as u32) as u64;
    lo | (hi << 32)
}

#[cfg(test)]
mod tests {
    use super::add_i32x2;

    #[test]
    fn v128_lanes_add_independently() {
        // lane overflow must not carry into the neighbour
        let a = 0x0000_0001_ffff_ffff_u64;
        let b = 0x0000_0002_0000_0001_u64;
        assert_eq!(add_i32x2(a, b), 0x0000_0003_0000_0000);
    }
}
