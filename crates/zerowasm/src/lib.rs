#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

//! zerowasm is a self-contained WebAssembly runtime: it decodes, validates,
//! and executes Wasm modules in the host process, with modules confined to
//! a capability-restricted view of the host through WASI.
//!
//! ```no_run
//! use zerowasm::{ModuleConfig, Runtime, RuntimeConfig};
//!
//! # fn main() -> zerowasm::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::interpreter())?;
//! zerowasm::wasi::instantiate(&runtime)?;
//!
//! let compiled = runtime.compile(&std::fs::read("hello.wasm").unwrap())?;
//! let instance = runtime.instantiate(&compiled, ModuleConfig::new().with_name("hello"))?;
//! let run = instance.exported_function("run")?;
//! let results = run.call(&[])?;
//! # drop(results);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
pub(crate) mod engine;
mod func;
mod global;
mod host;
mod instance;
mod memory;
mod segment;
mod store;
mod table;
pub mod wasi;

use std::sync::Arc;

pub use config::{CompileOptions, ModuleConfig, RuntimeConfig};
pub use engine::EngineKind;
pub use error::{Error, LinkingError, ParseError, Result, Trap};
pub use func::ExportedFunction;
pub use global::GlobalInstance;
pub use host::{HostContext, HostFunc, HostModuleBuilder};
pub use instance::ModuleInstance;
pub use memory::MemoryInstance;
pub use store::{CompiledModule, Store};
pub use table::TableInstance;
pub use wasi::sys::{DirFs, Fs, FsFile, MemFs};
pub use zerowasm_types::{Features, FuncType, Module, ValType, WasmValue};

use zerowasm_parser::Parser;

/// The runtime: a store plus the engine and feature set it was configured
/// with. Cloning is cheap and shares the store.
#[derive(Debug, Clone)]
pub struct Runtime {
    store: Arc<Store>,
    features: Features,
}

impl Runtime {
    /// Builds a runtime. Fails when the configuration selects the native
    /// compiler on an unsupported host architecture.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let engine = engine::new_engine(config.engine)?;
        Ok(Self { store: Arc::new(Store::new(engine)), features: config.features })
    }

    /// Decodes, validates, lowers, and engine-compiles a binary module.
    pub fn compile(&self, wasm: &[u8]) -> Result<CompiledModule> {
        self.compile_with_options(wasm, &CompileOptions::default())
    }

    pub fn compile_with_options(&self, wasm: &[u8], options: &CompileOptions) -> Result<CompiledModule> {
        let module = Arc::new(Parser::new(self.features).parse_module_bytes(wasm, options)?);
        let artifact = self.store.engine().compile_module(&module)?;
        Ok(CompiledModule { module, artifact })
    }

    /// Compiles the textual form; errors carry `line:column` positions.
    #[cfg(feature = "text")]
    pub fn compile_text(&self, source: &str) -> Result<CompiledModule> {
        let module =
            Arc::new(Parser::new(self.features).parse_module_text(source, &CompileOptions::default())?);
        let artifact = self.store.engine().compile_module(&module)?;
        Ok(CompiledModule { module, artifact })
    }

    /// Instantiates a compiled module in the store.
    pub fn instantiate(&self, compiled: &CompiledModule, config: ModuleConfig) -> Result<Arc<ModuleInstance>> {
        self.store.instantiate(compiled, config)
    }

    /// Compiles and instantiates in one step.
    pub fn instantiate_bytes(&self, wasm: &[u8], config: ModuleConfig) -> Result<Arc<ModuleInstance>> {
        let compiled = self.compile(wasm)?;
        self.instantiate(&compiled, config)
    }

    /// Starts building a host module registered under `name`.
    pub fn host_module(&self, name: impl Into<String>) -> HostModuleBuilder {
        HostModuleBuilder::new(name)
    }

    /// The instance registered under `name`, if any.
    pub fn module(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.store.module(name)
    }

    /// See [`Store::close_module`].
    pub fn close_module(&self, name: &str) -> Result<()> {
        self.store.close_module(name)
    }

    /// See [`Store::close_with_exit_code`].
    pub fn close_with_exit_code(&self, exit_code: u32) {
        self.store.close_with_exit_code(exit_code)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn features(&self) -> Features {
        self.features
    }
}
