use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use zerowasm_types::{ExternalKind, FuncType, ImportKind, Module};

use crate::config::ModuleConfig;
use crate::engine::{CompiledArtifact, Engine, FunctionHandle};
use crate::host::HostFunc;
use crate::instance::{InstanceBuilder, ModuleInstance, ResolvedImports};
use crate::{Error, LinkingError, Result};

/// A module compiled by the active engine, ready to instantiate any number
/// of times.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub(crate) module: Arc<Module>,
    pub(crate) artifact: Arc<dyn CompiledArtifact>,
}

impl CompiledModule {
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }
}

/// Canonicalizes function types to dense ids so `call_indirect` checks are
/// a single integer comparison.
#[derive(Debug, Default)]
pub(crate) struct TypeRegistry {
    ids: HashMap<FuncType, u32>,
}

/// Hard cap on distinct function types per store.
const MAX_FUNCTION_TYPES: usize = 1 << 27;

impl TypeRegistry {
    pub(crate) fn type_id(&mut self, ty: &FuncType) -> Result<u32> {
        if let Some(id) = self.ids.get(ty) {
            return Ok(*id);
        }
        if self.ids.len() >= MAX_FUNCTION_TYPES {
            return Err(Error::Other("too many function types".to_string()));
        }
        let id = self.ids.len() as u32;
        self.ids.insert(ty.clone(), id);
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    modules: HashMap<String, Arc<ModuleInstance>>,
    registry: TypeRegistry,
}

/// Owns instantiated modules by unique name, brokers imports between them,
/// and coordinates close.
///
/// The module map and type registry sit behind one mutex; instantiation,
/// lookup, and close serialize on it. Calls on exported functions read only
/// state fixed at instantiation and take no locks.
#[derive(Debug)]
pub struct Store {
    engine: Arc<dyn Engine>,
    inner: Mutex<StoreInner>,
}

impl Store {
    pub(crate) fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine, inner: Mutex::new(StoreInner::default()) }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// The instance registered under `name`, if any.
    pub fn module(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.inner.lock().expect("store mutex poisoned").modules.get(name).cloned()
    }

    /// Instantiates a compiled module under the configured name, resolving
    /// its imports against the store, applying active segments, and running
    /// start functions.
    ///
    /// On any failure past import resolution the store is left without a
    /// module of that name.
    pub(crate) fn instantiate(
        &self,
        compiled: &CompiledModule,
        mut config: ModuleConfig,
    ) -> Result<Arc<ModuleInstance>> {
        let sys = Arc::new(config.build_sys()?);
        let name = config.name.clone();
        let module = compiled.module.clone();

        log::debug!("instantiating module {name:?}");
        let instance = {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            if inner.modules.contains_key(&name) {
                return Err(Error::AlreadyInstantiated(name));
            }

            let imports = resolve_imports(&inner.modules, &module)?;
            let type_ids = module
                .types
                .iter()
                .map(|ty| inner.registry.type_id(ty))
                .collect::<Result<Box<[u32]>>>()?;

            let instance = ModuleInstance::new(InstanceBuilder {
                name: name.clone(),
                module: module.clone(),
                type_ids,
                imports,
                hosts: Vec::new(),
                sys,
                artifact: compiled.artifact.clone(),
            });
            instance.apply_active_segments()?;

            let engine = self.engine.new_module_engine(&instance, &compiled.artifact)?;
            instance.install_engine(engine);

            for source in instance_sources(&instance) {
                source.inc_dependents();
            }
            inner.modules.insert(name.clone(), instance.clone());
            instance
        };

        if let Err(err) = self.run_start_functions(&instance, &module, &config) {
            match err {
                // an exit with code 0 means the module ran to completion
                Error::Exit { exit_code: 0, .. } => {}
                err => {
                    self.remove_module(&name);
                    return Err(err);
                }
            }
        }
        Ok(instance)
    }

    /// Registers a host module: its exports are the given host functions.
    pub(crate) fn instantiate_host(&self, name: String, funcs: Vec<HostFunc>) -> Result<Arc<ModuleInstance>> {
        let module = Arc::new(Module {
            types: funcs.iter().map(|f| f.ty.clone()).collect(),
            exports: funcs
                .iter()
                .enumerate()
                .map(|(i, f)| zerowasm_types::Export {
                    name: f.name.clone().into_boxed_str(),
                    kind: ExternalKind::Func,
                    index: i as u32,
                })
                .collect(),
            ..Module::default()
        });

        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if inner.modules.contains_key(&name) {
            return Err(Error::AlreadyInstantiated(name));
        }

        let type_ids = module
            .types
            .iter()
            .map(|ty| inner.registry.type_id(ty))
            .collect::<Result<Box<[u32]>>>()?;
        let artifact = self.engine.compile_module(&module)?;

        let instance = ModuleInstance::new(InstanceBuilder {
            name: name.clone(),
            module,
            type_ids,
            imports: ResolvedImports::default(),
            hosts: funcs,
            sys: Arc::new(ModuleConfig::new().build_sys()?),
            artifact: artifact.clone(),
        });
        let engine = self.engine.new_module_engine(&instance, &artifact)?;
        instance.install_engine(engine);

        inner.modules.insert(name, instance.clone());
        Ok(instance)
    }

    fn run_start_functions(
        &self,
        instance: &Arc<ModuleInstance>,
        module: &Module,
        config: &ModuleConfig,
    ) -> Result<()> {
        if let Some(start) = module.start {
            instance
                .engine()
                .call(instance, start, &[])
                .map_err(|err| start_error(start, err))?;
        }
        for name in &config.start_functions {
            let Some(export) = instance.find_export(name, ExternalKind::Func) else {
                continue;
            };
            let index = export.index;
            instance
                .engine()
                .call(instance, index, &[])
                .map_err(|err| start_error(index, err))?;
        }
        Ok(())
    }

    fn remove_module(&self, name: &str) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(instance) = inner.modules.remove(name) {
            instance.set_closed(0);
            for source in instance_sources(&instance) {
                source.dec_dependents();
            }
        }
    }

    /// Closes the named module. Fails while other modules import it;
    /// closing a module that is already gone succeeds.
    pub fn close_module(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        let Some(instance) = inner.modules.get(name) else {
            return Ok(());
        };
        if instance.dependent_count() > 0 {
            return Err(Error::ModuleInUse(name.to_string()));
        }
        log::debug!("closing module {name:?}");
        let instance = inner.modules.remove(name).expect("present above");
        instance.set_closed(0);
        for source in instance_sources(&instance) {
            source.dec_dependents();
        }
        Ok(())
    }

    /// Atomically closes every module with the given exit code. Subsequent
    /// calls on their exported functions fail with an exit error carrying
    /// the module name and code. Idempotent.
    pub fn close_with_exit_code(&self, exit_code: u32) {
        log::debug!("closing the store with exit code {exit_code}");
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        for instance in inner.modules.values() {
            instance.set_closed(exit_code);
        }
        inner.modules.clear();
    }

    /// The number of modules currently registered.
    pub fn module_count(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").modules.len()
    }
}

fn start_error(index: u32, err: Error) -> Error {
    match err {
        err @ Error::Exit { .. } => err,
        err => Error::StartFunctionFailed { index, source: Box::new(err) },
    }
}

fn instance_sources(instance: &Arc<ModuleInstance>) -> impl Iterator<Item = &Arc<ModuleInstance>> {
    instance.imported_modules().iter()
}

fn resolve_imports(
    modules: &HashMap<String, Arc<ModuleInstance>>,
    module: &Module,
) -> Result<ResolvedImports> {
    let mut resolved = ResolvedImports::default();

    for import in module.imports.iter() {
        let source = modules
            .get(&*import.module)
            .ok_or_else(|| LinkingError::ModuleNotInstantiated { module: import.module.to_string() })?;
        let kind = ExternalKind::from(&import.kind);
        let export = source.find_export(&import.name, kind).ok_or_else(|| {
            LinkingError::ExportNotFound { module: import.module.to_string(), name: import.name.to_string() }
        })?;

        match &import.kind {
            ImportKind::Function(type_idx) => {
                let expected = module.types[*type_idx as usize].clone();
                let actual = source.function_type(export.index).ok_or_else(|| {
                    LinkingError::ExportNotFound {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    }
                })?;
                if actual != expected {
                    return Err(LinkingError::SignatureMismatch {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                        expected,
                        actual,
                    }
                    .into());
                }
                let handle: FunctionHandle = source
                    .handle(export.index)
                    .ok_or_else(|| LinkingError::ExportNotFound {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    })?
                    .clone();
                resolved.functions.push(handle);
            }
            ImportKind::Global(expected) => {
                let global = source.globals().get(export.index as usize).cloned().ok_or_else(|| {
                    LinkingError::ExportNotFound {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    }
                })?;
                if global.ty() != *expected {
                    return Err(LinkingError::GlobalMismatch {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    }
                    .into());
                }
                resolved.globals.push(global);
            }
            ImportKind::Memory(expected) => {
                let memory = source
                    .memory_arc()
                    .ok_or_else(|| LinkingError::ExportNotFound {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    })?;
                let actual = memory.ty();
                if actual.min < expected.min || actual.max > expected.max {
                    return Err(LinkingError::MemoryLimitsMismatch {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    }
                    .into());
                }
                resolved.memory = Some(memory);
            }
            ImportKind::Table(expected) => {
                let table = source.tables().get(export.index as usize).cloned().ok_or_else(|| {
                    LinkingError::ExportNotFound {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    }
                })?;
                let actual = table.ty();
                let max_ok = match expected.max {
                    Some(max) => actual.max.is_some_and(|m| m <= max),
                    None => true,
                };
                if actual.element != expected.element || actual.min < expected.min || !max_ok {
                    return Err(LinkingError::TableLimitsMismatch {
                        module: import.module.to_string(),
                        name: import.name.to_string(),
                    }
                    .into());
                }
                resolved.tables.push(table);
            }
        }

        if !resolved.sources.iter().any(|s| Arc::ptr_eq(s, source)) {
            resolved.sources.push(source.clone());
        }
    }

    Ok(resolved)
}
