use memmap2::{Mmap, MmapMut};

use crate::{Error, Result};

/// An executable code region. Bytes are written once into an anonymous
/// mapping, then the mapping is flipped to read+execute and never touched
/// again, so running it from many threads is safe.
#[derive(Debug)]
pub(crate) struct CodeMemory {
    map: Mmap,
}

impl CodeMemory {
    pub(crate) fn new(code: &[u8]) -> Result<Self> {
        let mut map = MmapMut::map_anon(code.len().max(1))
            .map_err(|e| Error::CompilationFailed(format!("allocating code memory: {e}")))?;
        map[..code.len()].copy_from_slice(code);
        let map = map
            .make_exec()
            .map_err(|e| Error::CompilationFailed(format!("marking code executable: {e}")))?;
        Ok(Self { map })
    }

    pub(crate) fn base(&self) -> usize {
        self.map.as_ptr() as usize
    }
}
