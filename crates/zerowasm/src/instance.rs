use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use zerowasm_types::{ConstExpr, DataKind, ElementKind, Export, ExternalKind, FuncType, Module, RawValue};

use crate::engine::{
    CompiledArtifact, FunctionHandle, ModuleContextData, ModuleEngine, HANDLE_KIND_HOST, HANDLE_KIND_WASM,
};
use crate::func::ExportedFunction;
use crate::global::GlobalInstance;
use crate::host::HostFunc;
use crate::memory::MemoryInstance;
use crate::segment::{DataInstance, ElementInstance};
use crate::table::TableInstance;
use crate::wasi::sys::SysContext;
use crate::{Error, Result};

/// What import resolution produced: the resolved instances, and the source
/// modules kept alive for as long as this instance exists.
#[derive(Default)]
pub(crate) struct ResolvedImports {
    pub(crate) functions: Vec<FunctionHandle>,
    pub(crate) globals: Vec<Arc<GlobalInstance>>,
    pub(crate) tables: Vec<Arc<TableInstance>>,
    pub(crate) memory: Option<Arc<MemoryInstance>>,
    pub(crate) sources: Vec<Arc<ModuleInstance>>,
}

pub(crate) struct InstanceBuilder {
    pub(crate) name: String,
    pub(crate) module: Arc<Module>,
    /// Canonical type id per entry of `module.types`.
    pub(crate) type_ids: Box<[u32]>,
    pub(crate) imports: ResolvedImports,
    pub(crate) hosts: Vec<HostFunc>,
    pub(crate) sys: Arc<SysContext>,
    pub(crate) artifact: Arc<dyn CompiledArtifact>,
}

/// The runtime realization of a module inside the store.
///
/// Owns its functions, globals, tables, memory, and segment instances;
/// anything imported is shared with the source instance, which stays alive
/// through `imported_modules`.
pub struct ModuleInstance {
    name: String,
    module: Arc<Module>,
    type_ids: Box<[u32]>,
    memory: Option<Arc<MemoryInstance>>,
    tables: Box<[Arc<TableInstance>]>,
    globals: Box<[Arc<GlobalInstance>]>,
    elements: Box<[ElementInstance]>,
    datas: Box<[DataInstance]>,
    hosts: Box<[HostFunc]>,
    handles: Box<[FunctionHandle]>,

    // raw arrays the context record points into; never read from Rust
    #[allow(dead_code)]
    global_ptrs: Box<[*const GlobalInstance]>,
    #[allow(dead_code)]
    table_ptrs: Box<[*const TableInstance]>,
    #[allow(dead_code)]
    data_ptrs: Box<[*const DataInstance]>,
    #[allow(dead_code)]
    elem_ptrs: Box<[*const ElementInstance]>,
    ctx: Box<ModuleContextData>,

    imported_modules: Vec<Arc<ModuleInstance>>,
    dependents: AtomicUsize,
    /// `(exit_code << 32) | 1` once closed; 0 while open.
    closed: AtomicU64,
    sys: Arc<SysContext>,
    #[allow(dead_code)] // owns the compiled code for the instance's lifetime
    artifact: Arc<dyn CompiledArtifact>,
    engine: OnceLock<Box<dyn ModuleEngine>>,
}

// Raw pointers inside only reference state owned by this instance or by
// instances it keeps alive through `imported_modules`.
unsafe impl Send for ModuleInstance {}
unsafe impl Sync for ModuleInstance {}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.name)
            .field("functions", &self.handles.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl ModuleInstance {
    pub(crate) fn new(builder: InstanceBuilder) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let InstanceBuilder { name, module, type_ids, imports, hosts, sys, artifact } = builder;
            let self_ptr = weak.as_ptr();

            // The context record is allocated first so function handles can
            // reference it; its fields are filled once the arrays exist.
            let mut ctx = Box::new(ModuleContextData {
                memory: std::ptr::null(),
                globals: std::ptr::null(),
                tables: std::ptr::null(),
                type_ids: std::ptr::null(),
                functions: std::ptr::null(),
                data_instances: std::ptr::null(),
                element_instances: std::ptr::null(),
                instance: self_ptr,
            });
            let ctx_ptr: *const ModuleContextData = &*ctx;

            let mut handles =
                Vec::with_capacity(imports.functions.len() + module.functions.len() + hosts.len());
            handles.extend(imports.functions);
            for (index, function) in module.functions.iter().enumerate() {
                let ty = &module.types[function.type_idx as usize];
                handles.push(FunctionHandle {
                    code_addr: artifact.code_addr(index as u32),
                    module_ctx: ctx_ptr,
                    type_id: type_ids[function.type_idx as usize],
                    kind: HANDLE_KIND_WASM,
                    index: index as u32,
                    param_slots: ty.param_slots(),
                    result_slots: ty.result_slots(),
                    stack_ceil: function.stack_ceil,
                    owner: self_ptr,
                });
            }
            for (index, host) in hosts.iter().enumerate() {
                handles.push(FunctionHandle {
                    code_addr: 0,
                    module_ctx: ctx_ptr,
                    type_id: type_ids[index],
                    kind: HANDLE_KIND_HOST,
                    index: index as u32,
                    param_slots: host.ty.param_slots(),
                    result_slots: host.ty.result_slots(),
                    stack_ceil: 0,
                    owner: self_ptr,
                });
            }
            let handles = handles.into_boxed_slice();

            // globals: imports first, then own globals evaluated in order so
            // initializers may read earlier (imported) globals
            let mut globals = imports.globals;
            for global in module.globals.iter() {
                let (lo, hi) = eval_const_expr(&global.init, &globals, &handles);
                globals.push(Arc::new(GlobalInstance::new(global.ty, lo, hi)));
            }
            let globals = globals.into_boxed_slice();

            let mut tables = imports.tables;
            tables.extend(module.tables.iter().map(|ty| Arc::new(TableInstance::new(*ty))));
            let tables = tables.into_boxed_slice();

            let memory = imports.memory.or_else(|| module.memories.first().map(|ty| Arc::new(MemoryInstance::new(*ty))));

            // passive segments keep their contents; active and declared ones
            // start dropped (they are applied before the instance is published)
            let elements = module
                .elements
                .iter()
                .map(|segment| match segment.kind {
                    ElementKind::Passive => {
                        let items =
                            segment.items.iter().map(|item| resolve_ref(item, &globals, &handles)).collect();
                        ElementInstance::new(items)
                    }
                    ElementKind::Active { .. } | ElementKind::Declared => ElementInstance::dropped(),
                })
                .collect::<Box<[_]>>();
            let datas = module
                .data
                .iter()
                .map(|segment| match segment.kind {
                    DataKind::Passive => DataInstance::new(segment.data.clone()),
                    DataKind::Active { .. } => DataInstance::dropped(),
                })
                .collect::<Box<[_]>>();

            let global_ptrs = globals.iter().map(|g| Arc::as_ptr(g)).collect::<Box<[_]>>();
            let table_ptrs = tables.iter().map(|t| Arc::as_ptr(t)).collect::<Box<[_]>>();
            let data_ptrs = datas.iter().map(|d| d as *const DataInstance).collect::<Box<[_]>>();
            let elem_ptrs = elements.iter().map(|e| e as *const ElementInstance).collect::<Box<[_]>>();

            ctx.memory = memory.as_ref().map(|m| Arc::as_ptr(m)).unwrap_or(std::ptr::null());
            ctx.globals = global_ptrs.as_ptr();
            ctx.tables = table_ptrs.as_ptr();
            ctx.type_ids = type_ids.as_ptr();
            ctx.functions = handles.as_ptr();
            ctx.data_instances = data_ptrs.as_ptr();
            ctx.element_instances = elem_ptrs.as_ptr();

            Self {
                name,
                module,
                type_ids,
                memory,
                tables,
                globals,
                elements,
                datas,
                hosts: hosts.into_boxed_slice(),
                handles,
                global_ptrs,
                table_ptrs,
                data_ptrs,
                elem_ptrs,
                ctx,
                imported_modules: imports.sources,
                dependents: AtomicUsize::new(0),
                closed: AtomicU64::new(0),
                sys,
                artifact,
                engine: OnceLock::new(),
            }
        })
    }

    /// Validates then applies active element and data segments. Validation
    /// runs first so a failure leaves imported tables and memories intact.
    pub(crate) fn apply_active_segments(&self) -> Result<()> {
        for (i, segment) in self.module.elements.iter().enumerate() {
            if let ElementKind::Active { table, offset } = &segment.kind {
                let offset = self.eval_i32(offset) as u32;
                let table = &self.tables[*table as usize];
                let end = offset as u64 + segment.items.len() as u64;
                if end > table.len() as u64 {
                    return Err(Error::Other(format!("element[{i}] is out of bounds")));
                }
            }
        }
        for (i, segment) in self.module.data.iter().enumerate() {
            if let DataKind::Active { offset, .. } = &segment.kind {
                let offset = self.eval_i32(offset) as u32;
                let memory = self.memory.as_ref().ok_or_else(|| Error::Other("no memory".to_string()))?;
                let end = offset as u64 + segment.data.len() as u64;
                if end > memory.len() as u64 {
                    return Err(Error::Other(format!("data[{i}] is out of bounds")));
                }
            }
        }

        for segment in self.module.elements.iter() {
            if let ElementKind::Active { table, offset } = &segment.kind {
                let offset = self.eval_i32(offset) as u32;
                let items = segment
                    .items
                    .iter()
                    .map(|item| resolve_ref(item, &self.globals, &self.handles))
                    .collect::<Vec<_>>();
                self.tables[*table as usize].init(offset, &items).map_err(Error::Trap)?;
            }
        }
        for segment in self.module.data.iter() {
            if let DataKind::Active { offset, .. } = &segment.kind {
                let offset = self.eval_i32(offset) as u32;
                let memory = self.memory.as_ref().expect("validated above");
                memory.write(offset as u64, &segment.data).map_err(Error::Trap)?;
            }
        }
        Ok(())
    }

    fn eval_i32(&self, expr: &ConstExpr) -> i32 {
        eval_const_expr(expr, &self.globals, &self.handles).0.as_i32()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn memory(&self) -> Option<&MemoryInstance> {
        self.memory.as_deref()
    }

    pub(crate) fn memory_arc(&self) -> Option<Arc<MemoryInstance>> {
        self.memory.clone()
    }

    pub(crate) fn imported_modules(&self) -> &[Arc<ModuleInstance>] {
        &self.imported_modules
    }

    pub(crate) fn sys(&self) -> &SysContext {
        &self.sys
    }

    pub(crate) fn handles(&self) -> &[FunctionHandle] {
        &self.handles
    }

    pub(crate) fn handle(&self, index: u32) -> Option<&FunctionHandle> {
        self.handles.get(index as usize)
    }

    pub(crate) fn hosts(&self) -> &[HostFunc] {
        &self.hosts
    }

    pub(crate) fn globals(&self) -> &[Arc<GlobalInstance>] {
        &self.globals
    }

    pub(crate) fn tables(&self) -> &[Arc<TableInstance>] {
        &self.tables
    }

    pub(crate) fn elements(&self) -> &[ElementInstance] {
        &self.elements
    }

    pub(crate) fn datas(&self) -> &[DataInstance] {
        &self.datas
    }

    pub(crate) fn type_ids(&self) -> &[u32] {
        &self.type_ids
    }

    pub(crate) fn context(&self) -> &ModuleContextData {
        &self.ctx
    }

    pub(crate) fn engine(&self) -> &dyn ModuleEngine {
        self.engine.get().expect("engine installed at instantiation").as_ref()
    }

    pub(crate) fn install_engine(&self, engine: Box<dyn ModuleEngine>) {
        if self.engine.set(engine).is_err() {
            unreachable!("engine installed twice");
        }
    }

    pub(crate) fn inc_dependents(&self) {
        self.dependents.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_dependents(&self) {
        self.dependents.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn dependent_count(&self) -> usize {
        self.dependents.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self, exit_code: u32) {
        let packed = ((exit_code as u64) << 32) | 1;
        let _ = self.closed.compare_exchange(0, packed, Ordering::AcqRel, Ordering::Acquire);
    }

    /// The exit error calls on this instance must fail with, if closed.
    pub(crate) fn closed_err(&self) -> Option<Error> {
        let packed = self.closed.load(Ordering::Acquire);
        if packed == 0 {
            None
        } else {
            Some(Error::Exit { module: self.name.clone(), exit_code: (packed >> 32) as u32 })
        }
    }

    pub(crate) fn find_export(&self, name: &str, kind: ExternalKind) -> Option<&Export> {
        self.module.exports.iter().find(|e| &*e.name == name && e.kind == kind)
    }

    /// The type of the function at `index` (imports first), wherever it is
    /// defined.
    pub(crate) fn function_type(&self, index: u32) -> Option<FuncType> {
        let handle = self.handles.get(index as usize)?;
        let owner = handle.owner();
        match handle.kind {
            HANDLE_KIND_HOST => owner.hosts.get(handle.index as usize).map(|h| h.ty.clone()),
            _ => {
                let function = owner.module.functions.get(handle.index as usize)?;
                owner.module.types.get(function.type_idx as usize).cloned()
            }
        }
    }

    /// Looks up an exported function.
    pub fn exported_function(self: &Arc<Self>, name: &str) -> Result<ExportedFunction> {
        let export = self.find_export(name, ExternalKind::Func).ok_or_else(|| Error::Other(format!(
            "\"{name}\" is not exported in module {}",
            self.name
        )))?;
        let index = export.index;
        let ty = self
            .function_type(index)
            .ok_or_else(|| Error::Other(format!("function {index} not found in module {}", self.name)))?;
        Ok(ExportedFunction::new(self.clone(), index, ty, name.to_string()))
    }

    /// Looks up an exported global.
    pub fn exported_global(&self, name: &str) -> Result<Arc<GlobalInstance>> {
        let export = self.find_export(name, ExternalKind::Global).ok_or_else(|| Error::Other(format!(
            "\"{name}\" is not exported in module {}",
            self.name
        )))?;
        self.globals
            .get(export.index as usize)
            .cloned()
            .ok_or_else(|| Error::Other(format!("global {} not found in module {}", export.index, self.name)))
    }
}

/// Evaluates a constant expression against the globals defined so far and
/// the instance's function handles.
pub(crate) fn eval_const_expr(
    expr: &ConstExpr,
    globals: &[Arc<GlobalInstance>],
    handles: &[FunctionHandle],
) -> (RawValue, RawValue) {
    match expr {
        ConstExpr::I32(v) => (RawValue::from(*v), RawValue::ZERO),
        ConstExpr::I64(v) => (RawValue::from(*v), RawValue::ZERO),
        ConstExpr::F32(v) => (RawValue::from(*v), RawValue::ZERO),
        ConstExpr::F64(v) => (RawValue::from(*v), RawValue::ZERO),
        ConstExpr::V128(v) => (RawValue(*v as u64), RawValue((*v >> 64) as u64)),
        ConstExpr::GlobalGet(index) => match globals.get(*index as usize) {
            Some(global) => global.get(),
            None => (RawValue::ZERO, RawValue::ZERO),
        },
        ConstExpr::RefNull(_) => (RawValue::ZERO, RawValue::ZERO),
        ConstExpr::RefFunc(index) => (RawValue(ref_value(*index, handles)), RawValue::ZERO),
    }
}

/// The table representation of a reference-valued constant.
pub(crate) fn resolve_ref(
    expr: &ConstExpr,
    globals: &[Arc<GlobalInstance>],
    handles: &[FunctionHandle],
) -> u64 {
    eval_const_expr(expr, globals, handles).0 .0
}

fn ref_value(index: u32, handles: &[FunctionHandle]) -> u64 {
    match handles.get(index as usize) {
        Some(handle) => handle as *const FunctionHandle as u64,
        None => 0,
    }
}
