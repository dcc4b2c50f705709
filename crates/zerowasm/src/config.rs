use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use zerowasm_types::Features;

use crate::engine::EngineKind;
use crate::wasi::sys::{self, FdTable, FileEntry, Fs, RandSource, SysContext, Walltime};
use crate::{Error, Result};

pub use zerowasm_parser::{CompileOptions, ImportRenamer, MemorySizer};

/// Configuration of a [`Runtime`](crate::Runtime): the execution engine and
/// the accepted feature set.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub(crate) engine: EngineKind,
    pub(crate) features: Features,
}

impl RuntimeConfig {
    /// The interpreter with WebAssembly Core 1 features.
    pub fn interpreter() -> Self {
        Self { engine: EngineKind::Interpreter, features: Features::default() }
    }

    /// The native compiler with WebAssembly Core 1 features. Building the
    /// runtime fails on hosts other than `x86_64` and `aarch64`.
    pub fn compiler() -> Self {
        Self { engine: EngineKind::Compiler, features: Features::default() }
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_wasm_core_1(mut self) -> Self {
        self.features = Features::wasm_core_1();
        self
    }

    pub fn with_wasm_core_2(mut self) -> Self {
        self.features = Features::wasm_core_2();
        self
    }

    pub fn features(&self) -> Features {
        self.features
    }
}

/// Per-instantiation configuration: name, start functions, and the system
/// context (stdio, argv, environment, file systems, clock, randomness) the
/// WASI layer exposes.
pub struct ModuleConfig {
    pub(crate) name: String,
    pub(crate) start_functions: Vec<String>,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<Box<dyn Read + Send>>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    fs: Option<Arc<dyn Fs>>,
    workdir_fs: Option<Arc<dyn Fs>>,
    walltime: Option<Walltime>,
    random: Option<RandSource>,
}

impl std::fmt::Debug for ModuleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleConfig")
            .field("name", &self.name)
            .field("start_functions", &self.start_functions)
            .field("args", &self.args)
            .field("envs", &self.envs)
            .finish()
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            start_functions: vec!["_start".to_string()],
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            stdout: None,
            stderr: None,
            fs: None,
            workdir_fs: None,
            walltime: None,
            random: None,
        }
    }

    /// The name the instance is registered under in the store.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Exported functions invoked after instantiation, in order. Defaults
    /// to `["_start"]`; names the module does not export are skipped.
    pub fn with_start_functions(mut self, names: &[&str]) -> Self {
        self.start_functions = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Adds an environment variable. Keys must be non-empty and free of
    /// `'='`; violations surface when the module is instantiated.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_stdin(mut self, stdin: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    /// The root file system, preopened as `/`.
    pub fn with_fs(mut self, fs: impl Fs + 'static) -> Self {
        self.fs = Some(Arc::new(fs));
        self
    }

    /// The working-directory file system, preopened as `.`.
    pub fn with_workdir_fs(mut self, fs: impl Fs + 'static) -> Self {
        self.workdir_fs = Some(Arc::new(fs));
        self
    }

    /// Overrides the wall clock read by `clock_time_get` (epoch nanos).
    pub fn with_walltime(mut self, walltime: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.walltime = Some(Box::new(walltime));
        self
    }

    /// Overrides the source read by `random_get`.
    pub fn with_random(mut self, random: impl Fn(&mut [u8]) + Send + Sync + 'static) -> Self {
        self.random = Some(Box::new(random));
        self
    }

    pub(crate) fn build_sys(&mut self) -> Result<SysContext> {
        let mut environ = Vec::with_capacity(self.envs.len());
        for (key, value) in &self.envs {
            if key.is_empty() || key.contains('=') {
                return Err(Error::Other(format!("invalid environment variable key {key:?}")));
            }
            environ.push(format!("{key}={value}"));
        }

        let mut fds = FdTable::default();
        if let Some(fs) = &self.fs {
            fds.insert_next(FileEntry { path: "/".into(), fs: Some(fs.clone()), file: None, preopen: true });
        }
        if let Some(fs) = &self.workdir_fs {
            fds.insert_next(FileEntry { path: ".".into(), fs: Some(fs.clone()), file: None, preopen: true });
        }

        Ok(SysContext {
            args: std::mem::take(&mut self.args),
            environ,
            stdin: Mutex::new(self.stdin.take().unwrap_or_else(|| Box::new(std::io::empty()))),
            stdout: Mutex::new(self.stdout.take().unwrap_or_else(|| Box::new(std::io::sink()))),
            stderr: Mutex::new(self.stderr.take().unwrap_or_else(|| Box::new(std::io::sink()))),
            fds: Mutex::new(fds),
            walltime: self.walltime.take().unwrap_or_else(sys::default_walltime),
            random: self.random.take().unwrap_or_else(sys::default_random),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_are_validated() {
        assert!(ModuleConfig::new().with_env("", "v").build_sys().is_err());
        assert!(ModuleConfig::new().with_env("a=b", "v").build_sys().is_err());
        let sys = ModuleConfig::new().with_env("a", "b").build_sys().unwrap();
        assert_eq!(sys.environ, vec!["a=b".to_string()]);
    }

    #[test]
    fn default_start_functions() {
        assert_eq!(ModuleConfig::new().start_functions, vec!["_start".to_string()]);
    }
}
