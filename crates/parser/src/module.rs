use alloc::collections::BTreeSet;
use alloc::{format, string::ToString, vec::Vec};
use wasmparser::{FuncValidatorAllocations, Payload, Validator};
use zerowasm_types::*;

use crate::log::debug;
use crate::lower::{self, LowerContext};
use crate::{conversion, CompileOptions, ParseError, Result};

/// Accumulates section contents while [`wasmparser`] walks the binary,
/// lowering each code entry as it arrives.
#[derive(Default)]
pub(crate) struct ModuleReader {
    types: Vec<FuncType>,
    imports: Vec<Import>,
    func_type_indices: Vec<u32>,
    own_func_type_indices: Vec<u32>,
    functions: Vec<CompiledFunction>,
    tables: Vec<TableType>,
    memories: Vec<MemoryType>,
    globals: Vec<Global>,
    global_types: Vec<GlobalType>,
    exports: Vec<Export>,
    start: Option<u32>,
    elements: Vec<Element>,
    data: Vec<Data>,
    declared_funcrefs: BTreeSet<u32>,
    func_validator_allocations: Option<FuncValidatorAllocations>,
    pub(crate) end_reached: bool,
}

impl ModuleReader {
    pub(crate) fn new() -> ModuleReader {
        Self::default()
    }

    pub(crate) fn process_payload(
        &mut self,
        payload: Payload<'_>,
        validator: &mut Validator,
        options: &CompileOptions,
    ) -> Result<()> {
        use wasmparser::Payload::*;

        match payload {
            Version { num, encoding, range } => {
                validator.version(num, encoding, &range)?;
                if encoding != wasmparser::Encoding::Module {
                    return Err(ParseError::UnsupportedSection(format!("{encoding:?} encoding")));
                }
            }
            TypeSection(reader) => {
                if !self.types.is_empty() {
                    return Err(ParseError::DuplicateSection("type section".into()));
                }
                validator.type_section(&reader)?;
                self.types =
                    reader.into_iter().map(|t| conversion::convert_func_type(t?)).collect::<Result<Vec<_>>>()?;
            }
            ImportSection(reader) => {
                if !self.imports.is_empty() {
                    return Err(ParseError::DuplicateSection("import section".into()));
                }
                validator.import_section(&reader)?;
                for import in reader {
                    self.push_import(import?, options)?;
                }
            }
            FunctionSection(reader) => {
                if !self.own_func_type_indices.is_empty() {
                    return Err(ParseError::DuplicateSection("function section".into()));
                }
                validator.function_section(&reader)?;
                self.own_func_type_indices = reader.into_iter().collect::<wasmparser::Result<Vec<_>>>()?;
                self.func_type_indices.extend_from_slice(&self.own_func_type_indices);
            }
            TableSection(reader) => {
                if !self.tables.is_empty() {
                    return Err(ParseError::DuplicateSection("table section".into()));
                }
                validator.table_section(&reader)?;
                for table in reader {
                    self.tables.push(conversion::convert_table_type(&table?.ty)?);
                }
            }
            MemorySection(reader) => {
                if !self.memories.is_empty() {
                    return Err(ParseError::DuplicateSection("memory section".into()));
                }
                validator.memory_section(&reader)?;
                for memory in reader {
                    self.memories.push(conversion::convert_memory_type(&memory?, &options.sizer())?);
                }
            }
            GlobalSection(reader) => {
                if !self.globals.is_empty() {
                    return Err(ParseError::DuplicateSection("global section".into()));
                }
                validator.global_section(&reader)?;
                for global in reader {
                    let global = global?;
                    let ty = conversion::convert_global_type(&global.ty)?;
                    let init = conversion::convert_const_expr(&global.init_expr)?;
                    if let ConstExpr::RefFunc(index) = init {
                        self.declared_funcrefs.insert(index);
                    }
                    self.global_types.push(ty);
                    self.globals.push(Global { ty, init });
                }
            }
            ExportSection(reader) => {
                if !self.exports.is_empty() {
                    return Err(ParseError::DuplicateSection("export section".into()));
                }
                validator.export_section(&reader)?;
                for export in reader {
                    let export = conversion::convert_export(export?)?;
                    if export.kind == ExternalKind::Func {
                        self.declared_funcrefs.insert(export.index);
                    }
                    self.exports.push(export);
                }
            }
            StartSection { func, range } => {
                if self.start.is_some() {
                    return Err(ParseError::DuplicateSection("start section".into()));
                }
                validator.start_section(func, &range)?;
                self.declared_funcrefs.insert(func);
                self.start = Some(func);
            }
            ElementSection(reader) => {
                validator.element_section(&reader)?;
                for element in reader {
                    let element = conversion::convert_element(element?)?;
                    for item in element.items.iter() {
                        if let ConstExpr::RefFunc(index) = item {
                            self.declared_funcrefs.insert(*index);
                        }
                    }
                    self.elements.push(element);
                }
            }
            DataCountSection { count, range } => {
                validator.data_count_section(count, &range)?;
            }
            DataSection(reader) => {
                if !self.data.is_empty() {
                    return Err(ParseError::DuplicateSection("data section".into()));
                }
                validator.data_section(&reader)?;
                for data in reader {
                    self.data.push(conversion::convert_data(data?)?);
                }
            }
            CodeSectionStart { count, range, .. } => {
                if !self.functions.is_empty() {
                    return Err(ParseError::DuplicateSection("code section".into()));
                }
                debug!("code section: {} functions", count);
                self.functions.reserve(count as usize);
                validator.code_section_start(count, &range)?;
            }
            CodeSectionEntry(body) => {
                let func = validator.code_section_entry(&body)?;
                let allocations = self.func_validator_allocations.take().unwrap_or_default();
                let func_validator = func.into_validator(allocations);

                let ctx = LowerContext {
                    types: &self.types,
                    func_type_indices: &self.func_type_indices,
                    global_types: &self.global_types,
                    declared_funcrefs: &self.declared_funcrefs,
                };
                let type_idx = self
                    .func_type_indices
                    .get(self.imported_func_count() + self.functions.len())
                    .copied()
                    .ok_or_else(|| ParseError::Other("code entry without function declaration".to_string()))?;

                let (function, allocations) = lower::lower_function(body, func_validator, &ctx, type_idx)?;
                self.func_validator_allocations = Some(allocations);
                self.functions.push(function);
            }
            CustomSection(reader) => {
                debug!("skipping custom section: {}", reader.name());
            }
            End(offset) => {
                if self.end_reached {
                    return Err(ParseError::DuplicateSection("end marker".into()));
                }
                validator.end(offset)?;
                self.end_reached = true;
            }
            section => return Err(ParseError::UnsupportedSection(format!("{section:?}"))),
        };

        Ok(())
    }

    fn imported_func_count(&self) -> usize {
        self.imports.iter().filter(|i| matches!(i.kind, ImportKind::Function(_))).count()
    }

    fn push_import(&mut self, import: wasmparser::Import<'_>, options: &CompileOptions) -> Result<()> {
        let kind = match import.ty {
            wasmparser::TypeRef::Func(type_idx) => {
                self.func_type_indices.push(type_idx);
                ImportKind::Function(type_idx)
            }
            wasmparser::TypeRef::Table(ty) => ImportKind::Table(conversion::convert_table_type(&ty)?),
            wasmparser::TypeRef::Memory(ty) => ImportKind::Memory(conversion::convert_memory_type(&ty, &options.sizer())?),
            wasmparser::TypeRef::Global(ty) => {
                let ty = conversion::convert_global_type(&ty)?;
                self.global_types.push(ty);
                ImportKind::Global(ty)
            }
            other => return Err(ParseError::UnsupportedOperator(format!("import kind {other:?}"))),
        };

        let (module, name) = match &options.import_renamer {
            Some(renamer) => renamer(ExternalKind::from(&kind), import.module, import.name),
            None => (import.module.to_string(), import.name.to_string()),
        };

        self.imports.push(Import { module: module.into(), name: name.into(), kind });
        Ok(())
    }

    pub(crate) fn into_module(self) -> Result<Module> {
        if !self.end_reached {
            return Err(ParseError::EndNotReached);
        }

        Ok(Module {
            types: self.types.into_boxed_slice(),
            imports: self.imports.into_boxed_slice(),
            functions: self.functions.into_boxed_slice(),
            tables: self.tables.into_boxed_slice(),
            memories: self.memories.into_boxed_slice(),
            globals: self.globals.into_boxed_slice(),
            exports: self.exports.into_boxed_slice(),
            start: self.start,
            elements: self.elements.into_boxed_slice(),
            data: self.data.into_boxed_slice(),
            declared_funcrefs: self.declared_funcrefs.into_iter().collect(),
        })
    }
}
