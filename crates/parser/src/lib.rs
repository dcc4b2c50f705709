#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
//! Decodes, validates, and lowers WebAssembly modules for
//! [`zerowasm`](https://docs.rs/zerowasm).

extern crate alloc;

// log for logging (optional).
#[cfg(feature = "logging")]
#[allow(clippy::single_component_path_imports, unused_imports)]
pub(crate) use log;

// noop fallback if logging is disabled.
#[cfg(not(feature = "logging"))]
#[allow(unused_imports, unused_macros)]
pub(crate) mod log {
    macro_rules! debug    ( ($($tt:tt)*) => {{}} );
    macro_rules! error    ( ($($tt:tt)*) => {{}} );
    pub(crate) use debug;
    pub(crate) use error;
}

mod conversion;
mod error;
mod lower;
mod module;

use alloc::{boxed::Box, string::String};
use module::ModuleReader;
use wasmparser::{Validator, WasmFeatures};

pub use error::{ParseError, Result};
pub use zerowasm_types::{Features, Module};

use zerowasm_types::{ExternalKind, MAX_PAGES};

/// Renames an import after decode: `(kind, module, name) -> (module, name)`.
pub type ImportRenamer = dyn Fn(ExternalKind, &str, &str) -> (String, String) + Send + Sync;

/// Chooses a memory's `(min, cap, max)` pages from its declared limits.
pub type MemorySizer = dyn Fn(u32, Option<u32>) -> (u32, u32, u32) + Send + Sync;

/// The default memory sizer: capacity equals the declared minimum, the
/// maximum defaults to the 4 GiB limit.
pub fn default_memory_sizer(min: u32, max: Option<u32>) -> (u32, u32, u32) {
    (min, min, max.unwrap_or(MAX_PAGES))
}

/// Hooks applied while a module is decoded.
#[derive(Default)]
pub struct CompileOptions {
    pub import_renamer: Option<Box<ImportRenamer>>,
    pub memory_sizer: Option<Box<MemorySizer>>,
}

impl core::fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompileOptions")
            .field("import_renamer", &self.import_renamer.as_ref().map(|_| ".."))
            .field("memory_sizer", &self.memory_sizer.as_ref().map(|_| ".."))
            .finish()
    }
}

impl CompileOptions {
    pub(crate) fn sizer(&self) -> impl Fn(u32, Option<u32>) -> (u32, u32, u32) + '_ {
        move |min, max| match &self.memory_sizer {
            Some(sizer) => sizer(min, max),
            None => default_memory_sizer(min, max),
        }
    }
}

/// A WebAssembly parser configured with a feature set.
#[derive(Debug, Default)]
pub struct Parser {
    features: Features,
}

impl Parser {
    pub fn new(features: Features) -> Self {
        Self { features }
    }

    fn create_validator(&self) -> Validator {
        let mut features = WasmFeatures::FLOATS | WasmFeatures::GC_TYPES;
        features.set(WasmFeatures::MUTABLE_GLOBAL, self.features.mutable_global);
        features.set(WasmFeatures::BULK_MEMORY, self.features.bulk_memory_operations);
        features.set(WasmFeatures::REFERENCE_TYPES, self.features.reference_types);
        features.set(WasmFeatures::MULTI_VALUE, self.features.multi_value);
        features.set(WasmFeatures::SIGN_EXTENSION, self.features.sign_extension_ops);
        features.set(WasmFeatures::SATURATING_FLOAT_TO_INT, self.features.non_trapping_float_to_int_conversion);
        features.set(WasmFeatures::SIMD, self.features.simd);
        Validator::new_with_features(features)
    }

    /// Parses and validates a binary module, lowering every function body.
    pub fn parse_module_bytes(&self, wasm: impl AsRef<[u8]>, options: &CompileOptions) -> Result<Module> {
        let wasm = wasm.as_ref();
        let mut validator = self.create_validator();
        let mut reader = ModuleReader::new();

        for payload in wasmparser::Parser::new(0).parse_all(wasm) {
            reader.process_payload(payload?, &mut validator, options)?;
        }

        reader.into_module()
    }

    /// Parses the textual form by converting it to binary first. Errors
    /// from the text parser carry `line:column` positions.
    #[cfg(feature = "text")]
    pub fn parse_module_text(&self, source: &str, options: &CompileOptions) -> Result<Module> {
        use alloc::string::ToString;
        let wasm = wat::parse_str(source).map_err(|e| ParseError::TextError(e.to_string()))?;
        self.parse_module_bytes(wasm, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerowasm_types::*;

    fn parse(wat: &str) -> Result<Module> {
        let wasm = wat::parse_str(wat).expect("fixture must be valid wat");
        Parser::new(Features::wasm_core_2()).parse_module_bytes(wasm, &CompileOptions::default())
    }

    #[test]
    fn empty_module() {
        let module = parse("(module)").unwrap();
        assert!(module.functions.is_empty());
        assert!(module.exports.is_empty());
    }

    #[test]
    fn feature_gating_rejects_sign_extension() {
        let wasm = wat::parse_str(
            r#"(module (func (param i32) (result i32) local.get 0 i32.extend8_s))"#,
        )
        .unwrap();
        let err = Parser::new(Features::wasm_core_1())
            .parse_module_bytes(wasm, &CompileOptions::default())
            .unwrap_err();
        assert!(matches!(err, ParseError::ParseError { .. }), "{err:?}");
    }

    #[test]
    fn lowers_add_to_parametric_op() {
        let module = parse(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
        )
        .unwrap();
        let func = &module.functions[0];
        assert!(func.ops.contains(&Operation::Add(NumTy::I32)));
        // two params picked onto the stack: ceiling is 2 params + 2 operands
        assert_eq!(func.stack_ceil, 4);
    }

    #[test]
    fn lowers_branches_with_drop_ranges() {
        let module = parse(
            r#"(module (func (result i32)
                (block (result i32)
                    i32.const 1
                    i32.const 2
                    br 0)))"#,
        )
        .unwrap();
        let func = &module.functions[0];
        let br = func
            .ops
            .iter()
            .find_map(|op| match op {
                Operation::Br(target) => Some(*target),
                _ => None,
            })
            .expect("lowering must emit a br");
        // keep the branch result, discard the extra constant below it
        assert_eq!(br.drop, Some(DropRange { start: 1, end: 1 }));
    }

    #[test]
    fn loop_headers_are_labelled() {
        let module = parse(
            r#"(module (func
                (loop $l
                    br $l)))"#,
        )
        .unwrap();
        let func = &module.functions[0];
        let label = func
            .ops
            .iter()
            .find_map(|op| match op {
                Operation::Label(id) => Some(*id),
                _ => None,
            })
            .expect("loop must emit its header label");
        assert!(func.label_callers[label as usize] > 0, "br must count as a caller");
    }

    #[test]
    fn unreachable_code_is_elided() {
        let module = parse(
            r#"(module (func (result i32)
                i32.const 1
                return
                i32.const 2
                i32.const 3
                i32.add))"#,
        )
        .unwrap();
        let func = &module.functions[0];
        // nothing after the return makes it into the stream
        assert_eq!(func.ops.iter().filter(|op| matches!(op, Operation::Add(_))).count(), 0);
    }

    #[test]
    fn memory_flags_are_tracked() {
        let module = parse(
            r#"(module
                (memory 1)
                (func (param i32) (result i32) local.get 0 i32.load))"#,
        )
        .unwrap();
        assert!(module.functions[0].flags.uses_memory);
        assert!(!module.functions[0].flags.uses_table);
    }

    #[test]
    fn import_renamer_rewrites_names() {
        let wasm = wat::parse_str(r#"(module (import "old_mod" "old_name" (func)))"#).unwrap();
        let options = CompileOptions {
            import_renamer: Some(Box::new(|_, _, _| ("new_mod".into(), "new_name".into()))),
            memory_sizer: None,
        };
        let module = Parser::new(Features::wasm_core_1()).parse_module_bytes(wasm, &options).unwrap();
        assert_eq!(&*module.imports[0].module, "new_mod");
        assert_eq!(&*module.imports[0].name, "new_name");
    }

    #[test]
    fn memory_sizer_sets_capacity() {
        let wasm = wat::parse_str(r#"(module (memory 2))"#).unwrap();
        let options = CompileOptions {
            import_renamer: None,
            memory_sizer: Some(Box::new(|min, max| (min, min + 2, max.unwrap_or(100)))),
        };
        let module = Parser::new(Features::wasm_core_1()).parse_module_bytes(wasm, &options).unwrap();
        assert_eq!(module.memories[0], MemoryType { min: 2, cap: 4, max: 100 });
    }

    #[test]
    fn declared_funcrefs_gate_ref_func() {
        // a declared element segment makes the reference legal
        let module = parse(
            r#"(module
                (func $f)
                (elem declare func $f)
                (func (result funcref) (ref.func $f)))"#,
        )
        .unwrap();
        assert!(module.functions[1].ops.contains(&Operation::RefFunc(0)));
        assert_eq!(&*module.declared_funcrefs, &[0]);

        // no element segment, export, global, or start references $f
        let wasm = wat::parse_str(
            r#"(module
                (func $f)
                (func (result funcref) (ref.func $f)))"#,
        )
        .unwrap();
        let result = Parser::new(Features::wasm_core_2()).parse_module_bytes(wasm, &CompileOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn declared_funcrefs_cover_exports_and_elements() {
        let module = parse(
            r#"(module
                (table 2 funcref)
                (elem (i32.const 0) 0)
                (func $a)
                (func $b)
                (export "b" (func $b)))"#,
        )
        .unwrap();
        assert_eq!(&*module.declared_funcrefs, &[0, 1]);
    }
}
