use std::sync::Arc;

use zerowasm_types::{FuncType, WasmValue};

use crate::instance::ModuleInstance;
use crate::{Error, Result};

/// A callable exported function.
///
/// Holds the instance alive; calls run on the invoking thread with a
/// dedicated call engine, so handles may be called from multiple threads
/// in parallel.
#[derive(Debug, Clone)]
pub struct ExportedFunction {
    instance: Arc<ModuleInstance>,
    index: u32,
    ty: FuncType,
    name: String,
}

impl ExportedFunction {
    pub(crate) fn new(instance: Arc<ModuleInstance>, index: u32, ty: FuncType, name: String) -> Self {
        Self { instance, index, ty, name }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the function.
    ///
    /// See <https://webassembly.github.io/spec/core/exec/modules.html#invocation>
    pub fn call(&self, params: &[WasmValue]) -> Result<Vec<WasmValue>> {
        if let Some(err) = self.instance.closed_err() {
            return Err(err);
        }

        if self.ty.params.len() != params.len() {
            return Err(Error::Other(format!(
                "param count mismatch calling {}: expected {}, got {}",
                self.name,
                self.ty.params.len(),
                params.len()
            )));
        }
        for (i, (want, have)) in self.ty.params.iter().zip(params).enumerate() {
            if *want != have.ty() {
                return Err(Error::Other(format!(
                    "param type mismatch at index {i} calling {}: expected {want}, got {:?}",
                    self.name, have
                )));
            }
        }

        // engine-internal panics are bugs; they surface as errors rather
        // than unwinding across the API boundary
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.instance.engine().call(&self.instance, self.index, params)
        }));
        match result {
            Ok(result) => result,
            Err(cause) => {
                let msg = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "engine invariant violated".to_string());
                Err(Error::Other(format!("internal error calling {}: {msg}", self.name)))
            }
        }
    }
}
