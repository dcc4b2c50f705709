/// WASI error numbers, as returned from every snapshot-preview1 call.
///
/// Only the subset this runtime produces is spelled out; everything else a
/// call could fail with maps to [`Errno::Io`] or [`Errno::NoSys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Errno {
    Success = 0,
    /// Bad file descriptor.
    BadF = 8,
    /// Bad address: a pointer/length pair fell outside linear memory.
    Fault = 21,
    /// Invalid argument.
    Inval = 28,
    /// I/O error.
    Io = 29,
    /// File name too long.
    NameTooLong = 37,
    /// No such file or directory.
    NoEnt = 44,
    /// Function not supported.
    NoSys = 52,
}

impl Errno {
    pub fn raw(self) -> u32 {
        self as u32
    }
}

impl From<std::io::ErrorKind> for Errno {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => Errno::NoEnt,
            std::io::ErrorKind::InvalidInput => Errno::Inval,
            _ => Errno::Io,
        }
    }
}
