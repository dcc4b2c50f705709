#![no_std]
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

//! Types shared by [`zerowasm`](https://docs.rs/zerowasm) and
//! [`zerowasm_parser`](https://docs.rs/zerowasm_parser): the decoded module
//! shape, value types, and the lowered instruction stream both execution
//! engines consume.

extern crate alloc;

mod features;
mod ops;
mod value;

use alloc::boxed::Box;
use core::fmt::{self, Display};

pub use features::Features;
pub use ops::*;
pub use value::{RawValue, WasmValue};

/// A WebAssembly page is 64 KiB.
pub const PAGE_SIZE: usize = 65536;

/// The maximum number of pages a memory may declare or grow to.
pub const MAX_PAGES: u32 = 65536;

/// A validated, lowered WebAssembly module.
///
/// Produced by the parser; immutable afterwards. Function bodies are stored
/// in their lowered form (see [`CompiledFunction`]), so the engines never
/// look at raw Wasm opcodes again.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// The function types declared in the type section.
    pub types: Box<[FuncType]>,

    /// All imports, in declaration order.
    pub imports: Box<[Import]>,

    /// Lowered bodies of the module's own functions (imports excluded).
    pub functions: Box<[CompiledFunction]>,

    /// The module's own tables (imports excluded).
    pub tables: Box<[TableType]>,

    /// The module's own memory, if any. At most one.
    pub memories: Box<[MemoryType]>,

    /// The module's own globals (imports excluded).
    pub globals: Box<[Global]>,

    /// All exports, in declaration order.
    pub exports: Box<[Export]>,

    /// The start function index, if declared.
    pub start: Option<u32>,

    /// Element segments.
    pub elements: Box<[Element]>,

    /// Data segments.
    pub data: Box<[Data]>,

    /// Function indexes that appear in a `ref.func` position somewhere in
    /// the module (element segments, exports, globals, start).
    pub declared_funcrefs: Box<[u32]>,
}

impl Module {
    /// The number of imported entries of the given kind.
    pub fn imported_count(&self, kind: ExternalKind) -> u32 {
        self.imports.iter().filter(|i| ExternalKind::from(&i.kind) == kind).count() as u32
    }

    /// The type of the function at `index`, counting imports first.
    pub fn func_type(&self, index: u32) -> Option<&FuncType> {
        let imported = self.imported_count(ExternalKind::Func);
        if index < imported {
            let type_idx = self
                .imports
                .iter()
                .filter_map(|i| match i.kind {
                    ImportKind::Function(t) => Some(t),
                    _ => None,
                })
                .nth(index as usize)?;
            self.types.get(type_idx as usize)
        } else {
            let func = self.functions.get((index - imported) as usize)?;
            self.types.get(func.type_idx as usize)
        }
    }
}

/// Type of a WebAssembly value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    /// A 32-bit integer.
    I32,
    /// A 64-bit integer.
    I64,
    /// A 32-bit float.
    F32,
    /// A 64-bit float.
    F64,
    /// A 128-bit vector.
    V128,
    /// A nullable reference to a function.
    FuncRef,
    /// A nullable reference to an external value.
    ExternRef,
}

impl ValType {
    /// The number of 64-bit value-stack slots a value of this type occupies.
    pub fn slot_count(&self) -> u32 {
        match self {
            ValType::V128 => 2,
            _ => 1,
        }
    }

    /// The zero value of this type.
    pub fn default_value(&self) -> WasmValue {
        match self {
            ValType::I32 => WasmValue::I32(0),
            ValType::I64 => WasmValue::I64(0),
            ValType::F32 => WasmValue::F32(0.0),
            ValType::F64 => WasmValue::F64(0.0),
            ValType::V128 => WasmValue::V128(0),
            ValType::FuncRef => WasmValue::RefNull(ValType::FuncRef),
            ValType::ExternRef => WasmValue::RefNull(ValType::ExternRef),
        }
    }
}

impl Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
        };
        f.write_str(s)
    }
}

/// The type of a WebAssembly function: ordered parameters and results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    pub params: Box<[ValType]>,
    pub results: Box<[ValType]>,
}

impl FuncType {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Total value-stack slots the parameters occupy.
    pub fn param_slots(&self) -> u32 {
        self.params.iter().map(ValType::slot_count).sum()
    }

    /// Total value-stack slots the results occupy.
    pub fn result_slots(&self) -> u32 {
        self.results.iter().map(ValType::slot_count).sum()
    }
}

impl Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            Display::fmt(p, f)?;
        }
        f.write_str(") -> (")?;
        for (i, r) in self.results.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            Display::fmt(r, f)?;
        }
        f.write_str(")")
    }
}

/// The kind of an import or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Func,
    Table,
    Memory,
    Global,
}

impl Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExternalKind::Func => "function",
            ExternalKind::Table => "table",
            ExternalKind::Memory => "memory",
            ExternalKind::Global => "global",
        };
        f.write_str(s)
    }
}

/// A module import: `(module, name, kind)`.
#[derive(Debug, Clone)]
pub struct Import {
    pub module: Box<str>,
    pub name: Box<str>,
    pub kind: ImportKind,
}

#[derive(Debug, Clone)]
pub enum ImportKind {
    /// A function import, referencing a type by index.
    Function(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

impl From<&ImportKind> for ExternalKind {
    fn from(kind: &ImportKind) -> Self {
        match kind {
            ImportKind::Function(_) => Self::Func,
            ImportKind::Table(_) => Self::Table,
            ImportKind::Memory(_) => Self::Memory,
            ImportKind::Global(_) => Self::Global,
        }
    }
}

/// A module export.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: Box<str>,
    pub kind: ExternalKind,
    /// Index into the kind's combined (imports first) index space.
    pub index: u32,
}

/// A table's type and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub element: ValType,
    pub min: u32,
    pub max: Option<u32>,
}

/// A memory's limits in pages, after the memory sizer has run.
///
/// `cap` pages are reserved up front so growth within the capacity never
/// moves the buffer; `max` bounds `memory.grow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub min: u32,
    pub cap: u32,
    pub max: u32,
}

impl MemoryType {
    pub fn new(min: u32, cap: u32, max: u32) -> Self {
        Self { min, cap, max }
    }
}

/// A global's type and mutability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub ty: ValType,
    pub mutable: bool,
}

/// A global declaration: type plus initializer.
#[derive(Debug, Clone)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

/// A constant expression, as allowed in global initializers and segment
/// offsets: a single typed constant, a `global.get` of an imported
/// immutable global, `ref.null`, or `ref.func`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    GlobalGet(u32),
    RefNull(ValType),
    RefFunc(u32),
}

/// An element segment.
#[derive(Debug, Clone)]
pub struct Element {
    pub kind: ElementKind,
    pub ty: ValType,
    pub items: Box<[ConstExpr]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ElementKind {
    /// Applied by `table.init` at runtime.
    Passive,
    /// Written into `table` at instantiation, then dropped.
    Active { table: u32, offset: ConstExpr },
    /// Only declares function references; dropped at instantiation.
    Declared,
}

/// A data segment.
#[derive(Debug, Clone)]
pub struct Data {
    pub kind: DataKind,
    pub data: Box<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataKind {
    /// Applied by `memory.init` at runtime.
    Passive,
    /// Copied into memory at instantiation, then dropped.
    Active { memory: u32, offset: ConstExpr },
}
