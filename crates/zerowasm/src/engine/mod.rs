//! The engine abstraction: two interchangeable execution engines consume
//! the lowered operation stream — a portable interpreter and a native-code
//! compiler for `x86_64` and `aarch64`.
//!
//! The rest of the runtime only sees [`Engine`] (compile a module, build
//! per-instance state) and [`ModuleEngine`] (call a function); nothing else
//! depends on which engine is active.

pub(crate) mod interpreter;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub(crate) mod compiler;

use std::any::Any;
use std::sync::Arc;

use zerowasm_types::{Module, WasmValue};

use crate::global::GlobalInstance;
use crate::instance::ModuleInstance;
use crate::memory::MemoryInstance;
use crate::segment::{DataInstance, ElementInstance};
use crate::table::TableInstance;
use crate::Result;

/// Which execution engine a runtime uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// The portable interpreter; always available.
    #[default]
    Interpreter,
    /// The native compiler; `x86_64` and `aarch64` hosts only.
    Compiler,
}

impl EngineKind {
    /// The compiler where the host supports it, the interpreter otherwise.
    pub fn default_for_host() -> Self {
        if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
            EngineKind::Compiler
        } else {
            EngineKind::Interpreter
        }
    }
}

pub(crate) fn new_engine(kind: EngineKind) -> Result<Arc<dyn Engine>> {
    match kind {
        EngineKind::Interpreter => Ok(Arc::new(interpreter::InterpreterEngine::default())),
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        EngineKind::Compiler => Ok(Arc::new(compiler::CompilerEngine::new())),
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        EngineKind::Compiler => Err(crate::Error::UnsupportedArchitecture(std::env::consts::ARCH.to_string())),
    }
}

/// An execution engine. `compile_module` runs once per compiled module;
/// `new_module_engine` runs per instance.
pub(crate) trait Engine: Send + Sync + std::fmt::Debug {
    fn compile_module(&self, module: &Module) -> Result<Arc<dyn CompiledArtifact>>;

    fn new_module_engine(
        &self,
        instance: &Arc<ModuleInstance>,
        artifact: &Arc<dyn CompiledArtifact>,
    ) -> Result<Box<dyn ModuleEngine>>;
}

/// Engine-specific compilation output for one module. Released when the
/// last instance referencing it is dropped.
pub(crate) trait CompiledArtifact: Send + Sync + std::fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// Native entry address of the module's own function `index`, or 0 when
    /// the engine has no native code.
    fn code_addr(&self, index: u32) -> usize;
}

/// Per-instance engine state; the only call path into a function.
pub(crate) trait ModuleEngine: Send + Sync + std::fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// Calls the function at `func_index` (imports first) of `instance`.
    fn call(&self, instance: &Arc<ModuleInstance>, func_index: u32, args: &[WasmValue]) -> Result<Vec<WasmValue>>;
}

pub(crate) const HANDLE_KIND_WASM: u32 = 0;
pub(crate) const HANDLE_KIND_HOST: u32 = 1;

/// The per-function record both engines dispatch through.
///
/// Table elements store the address of one of these (or zero for null), so
/// `call_indirect` resolves the callee and checks its type in O(1). The
/// layout is fixed because compiled code addresses the fields directly.
#[repr(C)]
#[derive(Debug, Clone)]
pub(crate) struct FunctionHandle {
    /// Entry address of the compiled body; 0 under the interpreter and for
    /// host functions.
    pub(crate) code_addr: usize,
    /// Canonical context record of the owning instance.
    pub(crate) module_ctx: *const ModuleContextData,
    /// Canonicalized type id, compared on `call_indirect`.
    pub(crate) type_id: u32,
    pub(crate) kind: u32,
    /// Own-function index (wasm) or host-function index (host) in the
    /// owning instance.
    pub(crate) index: u32,
    pub(crate) param_slots: u32,
    pub(crate) result_slots: u32,
    /// Worst-case value-stack slots of the body, frame base included.
    pub(crate) stack_ceil: u32,
    pub(crate) owner: *const ModuleInstance,
}

unsafe impl Send for FunctionHandle {}
unsafe impl Sync for FunctionHandle {}

impl FunctionHandle {
    /// The owning instance. Sound while the referencing instance is alive:
    /// importers hold their sources via `imported_modules`.
    pub(crate) fn owner(&self) -> &ModuleInstance {
        unsafe { &*self.owner }
    }
}

/// The per-instance record a call engine works against: raw addresses of
/// the instance's memory, globals, tables, type ids, function handles, and
/// segment instances. Fields for state the module never touches stay null;
/// lowering's access flags prove those paths are never taken.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct ModuleContextData {
    pub(crate) memory: *const MemoryInstance,
    pub(crate) globals: *const *const GlobalInstance,
    pub(crate) tables: *const *const TableInstance,
    pub(crate) type_ids: *const u32,
    pub(crate) functions: *const FunctionHandle,
    pub(crate) data_instances: *const *const DataInstance,
    pub(crate) element_instances: *const *const ElementInstance,
    pub(crate) instance: *const ModuleInstance,
}

unsafe impl Send for ModuleContextData {}
unsafe impl Sync for ModuleContextData {}

/// Converts an embedder value into its value-stack slots. Function
/// references resolve against `instance`'s handle array; external
/// references keep their shifted integer form so zero stays null.
pub(crate) fn value_to_slots(
    instance: &ModuleInstance,
    value: &WasmValue,
) -> (zerowasm_types::RawValue, Option<zerowasm_types::RawValue>) {
    use zerowasm_types::RawValue;
    match value {
        WasmValue::RefFunc(index) => {
            let raw = instance
                .handle(*index)
                .map(|handle| handle as *const FunctionHandle as u64)
                .unwrap_or(0);
            (RawValue(raw), None)
        }
        other => RawValue::from_wasm_value(*other),
    }
}

/// Reattaches a type to stack slots on the way out. Function references
/// are decoded through their handle so the embedder sees the defining
/// module's function index.
pub(crate) fn slots_to_value(
    ty: zerowasm_types::ValType,
    lo: zerowasm_types::RawValue,
    hi: zerowasm_types::RawValue,
) -> WasmValue {
    use zerowasm_types::{RawValue, ValType};
    match ty {
        ValType::FuncRef => {
            if lo.0 == 0 {
                WasmValue::RefNull(ValType::FuncRef)
            } else {
                let handle = unsafe { &*(lo.0 as *const FunctionHandle) };
                WasmValue::RefFunc(handle.index)
            }
        }
        _ => RawValue::into_wasm_value(ty, lo, hi),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    // The emitters hard-code these; a layout change must fail loudly.
    #[test]
    fn function_handle_layout() {
        assert_eq!(offset_of!(FunctionHandle, code_addr), 0x00);
        assert_eq!(offset_of!(FunctionHandle, module_ctx), 0x08);
        assert_eq!(offset_of!(FunctionHandle, type_id), 0x10);
        assert_eq!(offset_of!(FunctionHandle, kind), 0x14);
        assert_eq!(offset_of!(FunctionHandle, index), 0x18);
        assert_eq!(offset_of!(FunctionHandle, param_slots), 0x1c);
        assert_eq!(offset_of!(FunctionHandle, result_slots), 0x20);
        assert_eq!(offset_of!(FunctionHandle, stack_ceil), 0x24);
        assert_eq!(offset_of!(FunctionHandle, owner), 0x28);
    }

    #[test]
    fn module_context_layout() {
        assert_eq!(offset_of!(ModuleContextData, memory), 0x00);
        assert_eq!(offset_of!(ModuleContextData, globals), 0x08);
        assert_eq!(offset_of!(ModuleContextData, tables), 0x10);
        assert_eq!(offset_of!(ModuleContextData, type_ids), 0x18);
        assert_eq!(offset_of!(ModuleContextData, functions), 0x20);
        assert_eq!(offset_of!(ModuleContextData, data_instances), 0x28);
        assert_eq!(offset_of!(ModuleContextData, element_instances), 0x30);
        assert_eq!(offset_of!(ModuleContextData, instance), 0x38);
    }
}
