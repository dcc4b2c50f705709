use alloc::string::{String, ToString};
use core::fmt::{self, Display};

/// An error produced while decoding, validating, or lowering a module.
#[derive(Debug)]
pub enum ParseError {
    /// The binary was rejected by the decoder or validator. `offset` is the
    /// byte offset into the binary where the problem was detected.
    ParseError { message: String, offset: usize },

    /// The text form was rejected; the message carries `line:column`.
    #[cfg(feature = "text")]
    TextError(String),

    /// A section appeared twice.
    DuplicateSection(String),

    /// A section kind the decoder does not understand.
    UnsupportedSection(String),

    /// An operator outside the supported instruction set (e.g. a SIMD
    /// opcode other than the supported subset).
    UnsupportedOperator(String),

    /// A structurally valid construct exceeding an implementation limit.
    TooLarge(String),

    /// The end of the module was never reached.
    EndNotReached,

    Other(String),
}

impl From<wasmparser::BinaryReaderError> for ParseError {
    fn from(value: wasmparser::BinaryReaderError) -> Self {
        Self::ParseError { message: value.message().to_string(), offset: value.offset() }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseError { message, offset } => write!(f, "error at offset {offset}: {message}"),
            #[cfg(feature = "text")]
            Self::TextError(message) => write!(f, "error parsing text: {message}"),
            Self::DuplicateSection(section) => write!(f, "duplicate section: {section}"),
            Self::UnsupportedSection(section) => write!(f, "unsupported section: {section}"),
            Self::UnsupportedOperator(op) => write!(f, "unsupported operator: {op}"),
            Self::TooLarge(what) => write!(f, "implementation limit exceeded: {what}"),
            Self::EndNotReached => write!(f, "unexpected end of module"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ParseError {}

pub type Result<T, E = ParseError> = core::result::Result<T, E>;
