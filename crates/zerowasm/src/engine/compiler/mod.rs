//! The native-code engine: lowered operations are compiled to machine code
//! for the host architecture (`x86_64` or `aarch64`).
//!
//! Compiled code runs inside a small register convention and talks to the
//! runtime through a status-code exit protocol: on return the call engine
//! holds either a normal-return status, a trap, or a callback request
//! (grow the value stack, grow the frame stack, call a host function, run
//! a builtin like `memory.grow`). The runtime services the request and
//! re-enters at the continuation address the code saved before exiting.

mod code;
mod location;

#[cfg(target_arch = "x86_64")]
mod amd64;
#[cfg(target_arch = "aarch64")]
mod arm64;

use std::any::Any;
use std::sync::Arc;

use zerowasm_types::{Module, RawValue, WasmValue};

use crate::engine::{
    slots_to_value, value_to_slots, CompiledArtifact, Engine, FunctionHandle, ModuleContextData, ModuleEngine,
    HANDLE_KIND_HOST,
};
use crate::host::HostContext;
use crate::instance::ModuleInstance;
use crate::{Error, Result, Trap};

use code::CodeMemory;

/// Exit statuses compiled code reports through the call engine.
pub(crate) const STATUS_RETURNED: u32 = 0;
pub(crate) const STATUS_GROW_VALUE_STACK: u32 = 1;
pub(crate) const STATUS_GROW_FRAME_STACK: u32 = 2;
pub(crate) const STATUS_CALL_HOST: u32 = 3;
pub(crate) const STATUS_CALL_BUILTIN: u32 = 4;
/// Traps are `STATUS_TRAP_BASE + TRAP_*`.
pub(crate) const STATUS_TRAP_BASE: u32 = 16;

pub(crate) const TRAP_UNREACHABLE: u32 = 0;
pub(crate) const TRAP_MEMORY_OOB: u32 = 1;
pub(crate) const TRAP_TABLE_OOB: u32 = 2;
pub(crate) const TRAP_DIV_BY_ZERO: u32 = 3;
pub(crate) const TRAP_INT_OVERFLOW: u32 = 4;
pub(crate) const TRAP_INVALID_CONVERSION: u32 = 5;
pub(crate) const TRAP_NULL_REF: u32 = 6;
pub(crate) const TRAP_INDIRECT_MISMATCH: u32 = 7;

fn trap_of(code: u32) -> Trap {
    match code {
        TRAP_MEMORY_OOB => Trap::MemoryOutOfBounds,
        TRAP_TABLE_OOB => Trap::TableOutOfBounds,
        TRAP_DIV_BY_ZERO => Trap::DivisionByZero,
        TRAP_INT_OVERFLOW => Trap::IntegerOverflow,
        TRAP_INVALID_CONVERSION => Trap::InvalidConversionToInt,
        TRAP_NULL_REF => Trap::NullFuncRef,
        TRAP_INDIRECT_MISMATCH => Trap::IndirectCallTypeMismatch,
        _ => Trap::Unreachable,
    }
}

/// Builtins serviced by the runtime between exits. The operands are on the
/// value stack; immediates travel in `exit_value`.
pub(crate) const BUILTIN_MEMORY_GROW: u32 = 0;
pub(crate) const BUILTIN_MEMORY_INIT: u32 = 1;
pub(crate) const BUILTIN_DATA_DROP: u32 = 2;
pub(crate) const BUILTIN_MEMORY_COPY: u32 = 3;
pub(crate) const BUILTIN_MEMORY_FILL: u32 = 4;
pub(crate) const BUILTIN_TABLE_GROW: u32 = 5;
pub(crate) const BUILTIN_TABLE_FILL: u32 = 6;
pub(crate) const BUILTIN_TABLE_INIT: u32 = 7;
pub(crate) const BUILTIN_TABLE_COPY: u32 = 8;
pub(crate) const BUILTIN_ELEM_DROP: u32 = 9;

/// One native call frame: where to resume in the caller, the caller's
/// frame base, and the caller's module context. A zero return address
/// marks the outermost frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CallFrame {
    pub(crate) return_addr: u64,
    pub(crate) saved_bp: u64,
    pub(crate) saved_ctx: u64,
}

#[allow(dead_code)] // the emitters hard-code the 24-byte stride
pub(crate) const CALL_FRAME_SIZE: usize = 24;

/// The per-call engine record compiled code works against. The leading
/// fields are addressed directly by emitted code; the trailing `Vec`s own
/// the buffers the raw fields point into.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct CallEngine {
    stack_ptr: *mut u64,
    stack_len: u64,
    sp: u64,
    bp: u64,
    frames_ptr: *mut CallFrame,
    frames_cap: u64,
    frames_len: u64,
    ctx: *const ModuleContextData,
    status: u32,
    exit_arg: u32,
    exit_value: u64,
    continuation: u64,

    stack: Vec<u64>,
    frames: Vec<CallFrame>,
}

/// Slots the value stack may grow to before the call is aborted.
const MAX_VALUE_STACK_SLOTS: usize = 1 << 22;
/// Native call frames per call engine.
const CALL_FRAME_CEILING: usize = 2048;

impl CallEngine {
    fn new(initial_slots: usize) -> Self {
        let mut engine = Self {
            stack_ptr: std::ptr::null_mut(),
            stack_len: 0,
            sp: 0,
            bp: 0,
            frames_ptr: std::ptr::null_mut(),
            frames_cap: 0,
            frames_len: 0,
            ctx: std::ptr::null(),
            status: STATUS_RETURNED,
            exit_arg: 0,
            exit_value: 0,
            continuation: 0,
            stack: vec![0; initial_slots.max(64)],
            frames: vec![CallFrame::default(); 32],
        };
        engine.sync_raw();
        engine
    }

    fn sync_raw(&mut self) {
        self.stack_ptr = self.stack.as_mut_ptr();
        self.stack_len = self.stack.len() as u64;
        self.frames_ptr = self.frames.as_mut_ptr();
        self.frames_cap = self.frames.len() as u64;
    }

    fn grow_value_stack(&mut self, needed_ceil: usize) -> Result<()> {
        let required = self.bp as usize + needed_ceil;
        let new_len = (self.stack.len() * 2).max(required);
        if new_len > MAX_VALUE_STACK_SLOTS {
            return Err(Trap::CallStackExhausted.into());
        }
        self.stack.resize(new_len, 0);
        self.sync_raw();
        Ok(())
    }

    fn grow_frame_stack(&mut self) -> Result<()> {
        let new_len = self.frames.len() * 2;
        if new_len > CALL_FRAME_CEILING {
            return Err(Trap::CallStackExhausted.into());
        }
        self.frames.resize(new_len, CallFrame::default());
        self.sync_raw();
        Ok(())
    }

    fn push_slot(&mut self, value: u64) {
        self.stack[self.sp as usize] = value;
        self.sp += 1;
    }

    fn pop_slot(&mut self) -> u64 {
        self.sp -= 1;
        self.stack[self.sp as usize]
    }
}

/// The instance whose code is currently executing, recovered from the
/// module context saved at the exit. The lifetime is detached from the
/// engine borrow: the instance outlives the call by construction.
fn exit_instance<'a>(engine: &CallEngine) -> &'a ModuleInstance {
    unsafe { &*(*engine.ctx).instance }
}

#[derive(Debug)]
pub(crate) struct CompilerEngine;

impl CompilerEngine {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl Engine for CompilerEngine {
    fn compile_module(&self, module: &Module) -> Result<Arc<dyn CompiledArtifact>> {
        log::debug!("compiling {} functions to native code", module.functions.len());
        // assembler bugs must surface as errors, not unwind into the caller
        let compiled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            #[cfg(target_arch = "x86_64")]
            {
                amd64::compile(module)
            }
            #[cfg(target_arch = "aarch64")]
            {
                arm64::compile(module)
            }
        }))
        .map_err(|cause| {
            let msg = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "assembler invariant violated".to_string());
            Error::CompilationFailed(msg)
        })??;

        let (bytes, offsets) = compiled;
        let code = CodeMemory::new(&bytes)?;
        Ok(Arc::new(NativeArtifact { code, offsets }))
    }

    fn new_module_engine(
        &self,
        _instance: &Arc<ModuleInstance>,
        artifact: &Arc<dyn CompiledArtifact>,
    ) -> Result<Box<dyn ModuleEngine>> {
        Ok(Box::new(CompilerModuleEngine { _artifact: artifact.clone() }))
    }
}

#[derive(Debug)]
struct NativeArtifact {
    code: CodeMemory,
    /// Per own-function offset of its entry point in the code region.
    offsets: Vec<u32>,
}

impl CompiledArtifact for NativeArtifact {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn code_addr(&self, index: u32) -> usize {
        self.code.base() + self.offsets[index as usize] as usize
    }
}

#[derive(Debug)]
struct CompilerModuleEngine {
    _artifact: Arc<dyn CompiledArtifact>,
}

impl ModuleEngine for CompilerModuleEngine {
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

        let mut engine = CallEngine::new(handle.param_slots as usize + handle.stack_ceil as usize);
        for value in args {
            let (lo, hi) = value_to_slots(instance, value);
            engine.push_slot(lo.0);
            if let Some(hi) = hi {
                engine.push_slot(hi.0);
            }
        }
        engine.bp = 0;
        engine.ctx = handle.module_ctx;
        // the sentinel frame's zero return address ends the call
        engine.frames[0] = CallFrame::default();
        engine.frames_len = 1;

        let mut entry = handle.code_addr;
        loop {
            unsafe { native_call(entry, &mut engine) };
            match engine.status {
                STATUS_RETURNED => break,
                STATUS_GROW_VALUE_STACK => {
                    engine.grow_value_stack(engine.exit_arg as usize)?;
                    entry = engine.continuation as usize;
                }
                STATUS_GROW_FRAME_STACK => {
                    engine.grow_frame_stack()?;
                    entry = engine.continuation as usize;
                }
                STATUS_CALL_HOST => {
                    call_host(&mut engine)?;
                    entry = engine.continuation as usize;
                }
                STATUS_CALL_BUILTIN => {
                    run_builtin(&mut engine)?;
                    entry = engine.continuation as usize;
                }
                trap => return Err(trap_of(trap - STATUS_TRAP_BASE).into()),
            }
        }

        // results sit at the frame base
        let mut results = Vec::with_capacity(ty.results.len());
        let mut slot = 0usize;
        for result in ty.results.iter() {
            let lo = RawValue(engine.stack[slot]);
            let hi = if result.slot_count() == 2 { RawValue(engine.stack[slot + 1]) } else { RawValue::ZERO };
            results.push(slots_to_value(*result, lo, hi));
            slot += result.slot_count() as usize;
        }
        Ok(results)
    }
}

/// Services a host-function exit: marshal arguments off the value stack,
/// run the function, copy results back.
fn call_host(engine: &mut CallEngine) -> Result<()> {
    let handle = unsafe { &*(engine.exit_value as *const FunctionHandle) };
    let host = &handle.owner().hosts()[handle.index as usize];
    let caller = exit_instance(engine);

    // an indirect call leaves the table index above the arguments
    let indirect = engine.exit_arg == 1;
    let extra = indirect as u64;
    let first = engine.sp - extra - handle.param_slots as u64;

    let mut params = Vec::with_capacity(host.ty.params.len());
    let mut slot = first as usize;
    for ty in host.ty.params.iter() {
        let lo = RawValue(engine.stack[slot]);
        let hi = if ty.slot_count() == 2 { RawValue(engine.stack[slot + 1]) } else { RawValue::ZERO };
        params.push(slots_to_value(*ty, lo, hi));
        slot += ty.slot_count() as usize;
    }
    engine.sp = first;

    let ctx = HostContext { caller };
    let results = host.call(&ctx, &params)?;
    for value in &results {
        let (lo, hi) = value_to_slots(caller, value);
        engine.push_slot(lo.0);
        if let Some(hi) = hi {
            engine.push_slot(hi.0);
        }
    }
    Ok(())
}

fn run_builtin(engine: &mut CallEngine) -> Result<()> {
    let instance = exit_instance(engine);
    let imm = engine.exit_value;
    match engine.exit_arg {
        BUILTIN_MEMORY_GROW => {
            let delta = engine.pop_slot() as u32;
            let memory = instance.memory().expect("lowering proved memory access");
            match memory.grow(delta) {
                Some(previous) => engine.push_slot(previous as u64),
                None => engine.push_slot(u32::MAX as u64),
            }
        }
        BUILTIN_MEMORY_INIT => {
            let len = engine.pop_slot() as u32 as u64;
            let src = engine.pop_slot() as u32 as u64;
            let dst = engine.pop_slot() as u32 as u64;
            let data = &instance.datas()[imm as usize];
            let bytes = data.read(src, len).map_err(Error::Trap)?.to_vec();
            instance.memory().expect("lowering proved memory access").write(dst, &bytes).map_err(Error::Trap)?;
        }
        BUILTIN_DATA_DROP => instance.datas()[imm as usize].drop_contents_shared(),
        BUILTIN_MEMORY_COPY => {
            let len = engine.pop_slot() as u32 as u64;
            let src = engine.pop_slot() as u32 as u64;
            let dst = engine.pop_slot() as u32 as u64;
            instance.memory().expect("lowering proved memory access").copy_within(dst, src, len).map_err(Error::Trap)?;
        }
        BUILTIN_MEMORY_FILL => {
            let len = engine.pop_slot() as u32 as u64;
            let value = engine.pop_slot() as u8;
            let dst = engine.pop_slot() as u32 as u64;
            instance.memory().expect("lowering proved memory access").fill(dst, len, value).map_err(Error::Trap)?;
        }
        BUILTIN_TABLE_GROW => {
            let delta = engine.pop_slot() as u32;
            let init = engine.pop_slot();
            let table = &instance.tables()[imm as usize];
            match table.grow(delta, init) {
                Some(previous) => engine.push_slot(previous as u64),
                None => engine.push_slot(u32::MAX as u64),
            }
        }
        BUILTIN_TABLE_FILL => {
            let len = engine.pop_slot() as u32;
            let value = engine.pop_slot();
            let index = engine.pop_slot() as u32;
            instance.tables()[imm as usize].fill(index, len, value).map_err(Error::Trap)?;
        }
        BUILTIN_TABLE_INIT => {
            let len = engine.pop_slot() as u32 as u64;
            let src = engine.pop_slot() as u32 as u64;
            let dst = engine.pop_slot() as u32;
            let elem = (imm >> 32) as usize;
            let table = (imm & 0xffff_ffff) as usize;
            let items = instance.elements()[elem].read(src, len).map_err(Error::Trap)?.to_vec();
            instance.tables()[table].init(dst, &items).map_err(Error::Trap)?;
        }
        BUILTIN_TABLE_COPY => {
            let len = engine.pop_slot() as u32;
            let src_off = engine.pop_slot() as u32;
            let dst_off = engine.pop_slot() as u32;
            let dst = (imm >> 32) as usize;
            let src = (imm & 0xffff_ffff) as usize;
            let tables = instance.tables();
            if dst == src {
                tables[dst].copy_within(dst_off, src_off, len).map_err(Error::Trap)?;
            } else {
                tables[dst].copy_from(&tables[src], dst_off, src_off, len).map_err(Error::Trap)?;
            }
        }
        BUILTIN_ELEM_DROP => instance.elements()[imm as usize].drop_contents_shared(),
        other => return Err(Error::Other(format!("unknown builtin {other}"))),
    }
    Ok(())
}

/// Enters compiled code: saves the callee-saved registers the emitted code
/// uses, loads the engine registers from the call engine, and calls the
/// entry point. Exits come back through the emitted `ret`.
#[cfg(target_arch = "x86_64")]
unsafe fn native_call(entry: usize, engine: *mut CallEngine) {
    std::arch::asm!(
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rbx, rdi",
        "mov r13, qword ptr [rbx + 0x00]", // value stack base
        "mov r14, qword ptr [rbx + 0x10]", // sp
        "mov r15, qword ptr [rbx + 0x18]", // bp
        "mov r12, qword ptr [rbx + 0x38]", // module context
        "call rax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        in("rax") entry,
        in("rdi") engine,
        clobber_abi("sysv64"),
    );
}

#[cfg(target_arch = "aarch64")]
unsafe fn native_call(entry: usize, engine: *mut CallEngine) {
    std::arch::asm!(
        "stp x19, x20, [sp, #-64]!",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x29, x30, [sp, #48]",
        "mov x19, x1",
        "ldr x21, [x19, #0x00]", // value stack base
        "ldr x22, [x19, #0x10]", // sp
        "ldr x23, [x19, #0x18]", // bp
        "ldr x20, [x19, #0x38]", // module context
        "blr x0",
        "ldp x29, x30, [sp, #48]",
        "ldp x23, x24, [sp, #32]",
        "ldp x21, x22, [sp, #16]",
        "ldp x19, x20, [sp], #64",
        in("x0") entry,
        in("x1") engine,
        clobber_abi("C"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    // The emitters hard-code these offsets.
    #[test]
    fn call_engine_layout() {
        assert_eq!(offset_of!(CallEngine, stack_ptr), 0x00);
        assert_eq!(offset_of!(CallEngine, stack_len), 0x08);
        assert_eq!(offset_of!(CallEngine, sp), 0x10);
        assert_eq!(offset_of!(CallEngine, bp), 0x18);
        assert_eq!(offset_of!(CallEngine, frames_ptr), 0x20);
        assert_eq!(offset_of!(CallEngine, frames_cap), 0x28);
        assert_eq!(offset_of!(CallEngine, frames_len), 0x30);
        assert_eq!(offset_of!(CallEngine, ctx), 0x38);
        assert_eq!(offset_of!(CallEngine, status), 0x40);
        assert_eq!(offset_of!(CallEngine, exit_arg), 0x44);
        assert_eq!(offset_of!(CallEngine, exit_value), 0x48);
        assert_eq!(offset_of!(CallEngine, continuation), 0x50);
    }

    #[test]
    fn call_frame_layout() {
        assert_eq!(std::mem::size_of::<CallFrame>(), CALL_FRAME_SIZE);
        assert_eq!(offset_of!(CallFrame, return_addr), 0x00);
        assert_eq!(offset_of!(CallFrame, saved_bp), 0x08);
        assert_eq!(offset_of!(CallFrame, saved_ctx), 0x10);
    }
}
