use core::fmt::{self, Display};

use zerowasm_types::FuncType;

pub use zerowasm_parser::ParseError;

/// A zerowasm error.
///
/// Every failure crosses the API boundary as a value of this type; no
/// exceptional control flow leaves the runtime.
#[derive(Debug)]
pub enum Error {
    /// Decoding, validation, or lowering rejected the module.
    Parse(ParseError),

    /// The engine could not compile the module.
    CompilationFailed(String),

    /// The requested configuration is not available on this host.
    UnsupportedArchitecture(String),

    /// A WebAssembly trap occurred.
    Trap(Trap),

    /// Import resolution failed.
    Linker(LinkingError),

    /// A module with this name is already in the store.
    AlreadyInstantiated(String),

    /// The module cannot be closed while other modules import it.
    ModuleInUse(String),

    /// A start function trapped or exited during instantiation.
    StartFunctionFailed { index: u32, source: Box<Error> },

    /// `proc_exit` was called or the module was closed with an exit code.
    /// Returned even for code 0 so callers can tell execution did not run
    /// to completion.
    Exit { module: String, exit_code: u32 },

    Other(String),
}

/// A linking error: an import could not be satisfied.
#[derive(Debug)]
pub enum LinkingError {
    /// The named module is not in the store.
    ModuleNotInstantiated { module: String },

    /// The module exists but exports nothing under this name.
    ExportNotFound { module: String, name: String },

    /// The export exists but is of a different kind.
    KindMismatch { module: String, name: String },

    /// Function signature mismatch; both signatures render in a stable form.
    SignatureMismatch { module: String, name: String, expected: FuncType, actual: FuncType },

    /// Global type or mutability mismatch.
    GlobalMismatch { module: String, name: String },

    /// The imported memory's limits are narrower than required.
    MemoryLimitsMismatch { module: String, name: String },

    /// The imported table's limits are narrower than required.
    TableLimitsMismatch { module: String, name: String },
}

/// A WebAssembly trap: a runtime-detected fault that aborts the current
/// call with a typed error.
///
/// See <https://webassembly.github.io/spec/core/intro/overview.html#trap>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// An `unreachable` instruction was executed.
    Unreachable,

    /// An out-of-bounds linear memory access.
    MemoryOutOfBounds,

    /// An out-of-bounds table access.
    TableOutOfBounds,

    /// Integer division by zero.
    DivisionByZero,

    /// Integer overflow on division or a trapping truncation.
    IntegerOverflow,

    /// A NaN reached a trapping float-to-int conversion.
    InvalidConversionToInt,

    /// `call_indirect` through a null table element.
    NullFuncRef,

    /// The `call_indirect` type check failed.
    IndirectCallTypeMismatch,

    /// The call-frame stack limit was reached.
    CallStackExhausted,
}

impl Trap {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::MemoryOutOfBounds => "out of bounds memory access",
            Self::TableOutOfBounds => "out of bounds table access",
            Self::DivisionByZero => "integer divide by zero",
            Self::IntegerOverflow => "integer overflow",
            Self::InvalidConversionToInt => "invalid conversion to integer",
            Self::NullFuncRef => "null function reference",
            Self::IndirectCallTypeMismatch => "indirect call type mismatch",
            Self::CallStackExhausted => "call stack exhausted",
        }
    }
}

impl Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Trap {}

impl std::error::Error for LinkingError {}

impl Display for LinkingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModuleNotInstantiated { module } => write!(f, "module[{module}] not instantiated"),
            Self::ExportNotFound { module, name } => write!(f, "\"{name}\" is not exported in module {module}"),
            Self::KindMismatch { module, name } => {
                write!(f, "import kind mismatch for \"{name}\" in module {module}")
            }
            Self::SignatureMismatch { module, name, expected, actual } => {
                write!(f, "signature mismatch for {module}.{name}: want {expected}, have {actual}")
            }
            Self::GlobalMismatch { module, name } => {
                write!(f, "global type mismatch for {module}.{name}")
            }
            Self::MemoryLimitsMismatch { module, name } => {
                write!(f, "memory limits mismatch for {module}.{name}")
            }
            Self::TableLimitsMismatch { module, name } => {
                write!(f, "table limits mismatch for {module}.{name}")
            }
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "error parsing module: {err}"),
            Self::CompilationFailed(msg) => write!(f, "compilation failed: {msg}"),
            Self::UnsupportedArchitecture(arch) => {
                write!(f, "the compiler engine does not support {arch}")
            }
            Self::Trap(trap) => write!(f, "trap: {trap}"),
            Self::Linker(err) => write!(f, "linking error: {err}"),
            Self::AlreadyInstantiated(name) => write!(f, "module {name} has already been instantiated"),
            Self::ModuleInUse(name) => write!(f, "module {name} is imported by other modules"),
            Self::StartFunctionFailed { index, source } => {
                write!(f, "start function[{index}] failed: {source}")
            }
            Self::Exit { module, exit_code } => {
                write!(f, "module {module} closed with exit code {exit_code}")
            }
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(value: ParseError) -> Self {
        Self::Parse(value)
    }
}

impl From<Trap> for Error {
    fn from(value: Trap) -> Self {
        Self::Trap(value)
    }
}

impl From<LinkingError> for Error {
    fn from(value: LinkingError) -> Self {
        Self::Linker(value)
    }
}

/// A specialized [`Result`] type for zerowasm operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;
