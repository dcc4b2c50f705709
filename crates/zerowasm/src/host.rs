use std::sync::Arc;

use zerowasm_types::{FuncType, ValType, WasmValue};

use crate::instance::ModuleInstance;
use crate::memory::MemoryInstance;
use crate::wasi::sys::SysContext;
use crate::{Error, Result, Runtime};

/// What a host function sees of its caller: the calling instance's memory
/// and system context. Pointer-typed arguments are offsets into that
/// memory; the host never receives raw addresses.
pub struct HostContext<'a> {
    pub(crate) caller: &'a ModuleInstance,
}

impl<'a> HostContext<'a> {
    pub fn module_name(&self) -> &str {
        self.caller.name()
    }

    /// The calling module's memory, if it has one.
    pub fn memory(&self) -> Option<&MemoryInstance> {
        self.caller.memory()
    }

    pub(crate) fn sys(&self) -> &SysContext {
        self.caller.sys()
    }
}

pub type HostFn = dyn Fn(&HostContext<'_>, &[WasmValue]) -> Result<Vec<WasmValue>> + Send + Sync;

/// A host function: an erased callable with a typed signature.
pub struct HostFunc {
    pub(crate) name: String,
    pub(crate) ty: FuncType,
    pub(crate) func: Box<HostFn>,
}

impl std::fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunc").field("name", &self.name).field("ty", &self.ty).finish()
    }
}

impl HostFunc {
    pub fn new(
        name: impl Into<String>,
        params: &[ValType],
        results: &[ValType],
        func: impl Fn(&HostContext<'_>, &[WasmValue]) -> Result<Vec<WasmValue>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            ty: FuncType { params: params.into(), results: results.into() },
            func: Box::new(func),
        }
    }

    pub(crate) fn call(&self, ctx: &HostContext<'_>, args: &[WasmValue]) -> Result<Vec<WasmValue>> {
        let results = (self.func)(ctx, args)?;
        if results.len() != self.ty.results.len() {
            return Err(Error::Other(format!(
                "host function {} returned {} results, want {}",
                self.name,
                results.len(),
                self.ty.results.len()
            )));
        }
        Ok(results)
    }
}

/// Builds a module whose exports are host functions, registered in the
/// store under a name so other modules can import them.
#[derive(Debug)]
pub struct HostModuleBuilder {
    name: String,
    funcs: Vec<HostFunc>,
}

impl HostModuleBuilder {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), funcs: Vec::new() }
    }

    pub fn with_func(
        mut self,
        name: impl Into<String>,
        params: &[ValType],
        results: &[ValType],
        func: impl Fn(&HostContext<'_>, &[WasmValue]) -> Result<Vec<WasmValue>> + Send + Sync + 'static,
    ) -> Self {
        self.funcs.push(HostFunc::new(name, params, results, func));
        self
    }

    pub fn with_host_func(mut self, func: HostFunc) -> Self {
        self.funcs.push(func);
        self
    }

    /// Registers the host module in the runtime's store.
    pub fn instantiate(self, runtime: &Runtime) -> Result<Arc<ModuleInstance>> {
        runtime.store().instantiate_host(self.name, self.funcs)
    }
}
