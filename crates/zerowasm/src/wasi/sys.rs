use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Seek, Write};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// A read-only file system exposed to a module through preopens.
pub trait Fs: Send + Sync + fmt::Debug {
    /// Opens the file at `path` (no leading slash) for reading.
    fn open(&self, path: &str) -> io::Result<Box<dyn FsFile>>;
}

/// An open file. Reading and seeking is all WASI needs here; writes are out
/// of scope for the preopen layer.
pub trait FsFile: Read + Seek + Send {}
impl<T: Read + Seek + Send> FsFile for T {}

/// An in-memory [`Fs`], mainly for tests and embedded fixtures.
#[derive(Debug, Default)]
pub struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }
}

impl Fs for MemFs {
    fn open(&self, path: &str) -> io::Result<Box<dyn FsFile>> {
        match self.files.get(path) {
            Some(contents) => Ok(Box::new(io::Cursor::new(contents.clone()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, path.to_string())),
        }
    }
}

/// A host directory exposed read-only.
#[derive(Debug)]
pub struct DirFs {
    root: std::path::PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Fs for DirFs {
    fn open(&self, path: &str) -> io::Result<Box<dyn FsFile>> {
        let full = self.root.join(path);
        Ok(Box::new(std::fs::File::open(full)?))
    }
}

/// One slot in the file-descriptor table: the path it was opened under, the
/// file system it came from, and the open file (absent for preopened
/// directories).
pub(crate) struct FileEntry {
    pub(crate) path: String,
    pub(crate) fs: Option<Arc<dyn Fs>>,
    pub(crate) file: Option<Box<dyn FsFile>>,
    pub(crate) preopen: bool,
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("path", &self.path)
            .field("preopen", &self.preopen)
            .field("open", &self.file.is_some())
            .finish()
    }
}

/// FDs 0/1/2 are stdin/stdout/stderr; preopens start at 3.
pub(crate) const FD_PREOPEN_START: u32 = 3;

#[derive(Debug, Default)]
pub(crate) struct FdTable {
    entries: BTreeMap<u32, FileEntry>,
}

impl FdTable {
    /// Allocates the lowest free descriptor at or above the preopen range.
    pub(crate) fn insert_next(&mut self, entry: FileEntry) -> u32 {
        let mut fd = FD_PREOPEN_START;
        while self.entries.contains_key(&fd) {
            fd += 1;
        }
        self.entries.insert(fd, entry);
        fd
    }

    pub(crate) fn get_mut(&mut self, fd: u32) -> Option<&mut FileEntry> {
        self.entries.get_mut(&fd)
    }

    pub(crate) fn get(&self, fd: u32) -> Option<&FileEntry> {
        self.entries.get(&fd)
    }

    pub(crate) fn remove(&mut self, fd: u32) -> Option<FileEntry> {
        self.entries.remove(&fd)
    }
}

pub(crate) type Walltime = Box<dyn Fn() -> u64 + Send + Sync>;
pub(crate) type RandSource = Box<dyn Fn(&mut [u8]) + Send + Sync>;

/// The per-instance system context: everything the WASI host functions are
/// allowed to see.
pub struct SysContext {
    pub(crate) args: Vec<String>,
    /// `key=value` strings, in insertion order.
    pub(crate) environ: Vec<String>,
    pub(crate) stdin: Mutex<Box<dyn Read + Send>>,
    pub(crate) stdout: Mutex<Box<dyn Write + Send>>,
    pub(crate) stderr: Mutex<Box<dyn Write + Send>>,
    pub(crate) fds: Mutex<FdTable>,
    pub(crate) walltime: Walltime,
    pub(crate) random: RandSource,
}

impl fmt::Debug for SysContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysContext")
            .field("args", &self.args)
            .field("environ", &self.environ)
            .finish()
    }
}

impl SysContext {
    pub(crate) fn args_sizes(&self) -> (u32, u32) {
        let count = self.args.len() as u32;
        let buf = self.args.iter().map(|a| a.len() as u32 + 1).sum();
        (count, buf)
    }

    pub(crate) fn environ_sizes(&self) -> (u32, u32) {
        let count = self.environ.len() as u32;
        let buf = self.environ.iter().map(|e| e.len() as u32 + 1).sum();
        (count, buf)
    }
}

pub(crate) fn default_walltime() -> Walltime {
    Box::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    })
}

pub(crate) fn default_random() -> RandSource {
    Box::new(|buf| {
        if getrandom::getrandom(buf).is_err() {
            buf.fill(0);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_table_allocates_the_next_free_descriptor() {
        let mut fds = FdTable::default();
        let entry = |path: &str| FileEntry { path: path.into(), fs: None, file: None, preopen: true };
        assert_eq!(fds.insert_next(entry("/")), 3);
        assert_eq!(fds.insert_next(entry(".")), 4);
        fds.remove(3);
        // freed descriptors are reused
        assert_eq!(fds.insert_next(entry("x")), 3);
    }

    #[test]
    fn empty_args_have_zero_sizes() {
        let sys = SysContext {
            args: vec![],
            environ: vec![],
            stdin: Mutex::new(Box::new(io::empty())),
            stdout: Mutex::new(Box::new(io::sink())),
            stderr: Mutex::new(Box::new(io::sink())),
            fds: Mutex::new(FdTable::default()),
            walltime: Box::new(|| 0),
            random: Box::new(|_| {}),
        };
        assert_eq!(sys.args_sizes(), (0, 0));
        assert_eq!(sys.environ_sizes(), (0, 0));
    }

    #[test]
    fn args_sizes_count_nul_terminators() {
        let sys = SysContext {
            args: vec!["a".into(), "bc".into()],
            environ: vec!["k=v".into()],
            stdin: Mutex::new(Box::new(io::empty())),
            stdout: Mutex::new(Box::new(io::sink())),
            stderr: Mutex::new(Box::new(io::sink())),
            fds: Mutex::new(FdTable::default()),
            walltime: Box::new(|| 0),
            random: Box::new(|_| {}),
        };
        assert_eq!(sys.args_sizes(), (2, 5));
        assert_eq!(sys.environ_sizes(), (1, 4));
    }
}
