use std::cell::UnsafeCell;

use zerowasm_types::{MemoryType, PAGE_SIZE};

use crate::{Result, Trap};

/// The raw view compiled code reads: buffer address and current length in
/// bytes. Kept at offset 0 so the emitters can address the fields directly.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct MemoryRaw {
    pub(crate) base: *mut u8,
    pub(crate) len: u64,
}

/// A linear memory instance.
///
/// The buffer reserves `cap` pages of capacity up front, so growth within
/// the capacity only bumps the length and never moves the base address.
///
/// Call engines running in parallel against the same instance may read and
/// write the buffer concurrently; as in the Wasm MVP there is no
/// happens-before relationship between them, and embedders needing one
/// must serialize externally.
#[repr(C)]
#[derive(Debug)]
pub struct MemoryInstance {
    raw: UnsafeCell<MemoryRaw>,
    buf: UnsafeCell<Vec<u8>>,
    ty: MemoryType,
}

// One call engine mutates at a time per invocation; concurrent invocations
// share the buffer by design (see the concurrency notes above).
unsafe impl Send for MemoryInstance {}
unsafe impl Sync for MemoryInstance {}

impl MemoryInstance {
    pub(crate) fn new(ty: MemoryType) -> Self {
        let mut buf = Vec::with_capacity(ty.cap as usize * PAGE_SIZE);
        buf.resize(ty.min as usize * PAGE_SIZE, 0);
        let raw = UnsafeCell::new(MemoryRaw { base: buf.as_mut_ptr(), len: buf.len() as u64 });
        Self { raw, buf: UnsafeCell::new(buf), ty }
    }

    pub(crate) fn ty(&self) -> MemoryType {
        self.ty
    }

    /// Current length in bytes; always a multiple of the page size.
    pub fn len(&self) -> usize {
        unsafe { (*self.raw.get()).len as usize }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size in pages.
    pub fn page_count(&self) -> u32 {
        (self.len() / PAGE_SIZE) as u32
    }

    /// Grows by `delta` pages, returning the previous page count, or `None`
    /// if the growth would exceed the maximum.
    pub fn grow(&self, delta: u32) -> Option<u32> {
        let current = self.page_count();
        let new_pages = current.checked_add(delta)?;
        if new_pages > self.ty.max {
            return None;
        }
        let new_len = new_pages as usize * PAGE_SIZE;
        unsafe {
            let buf = &mut *self.buf.get();
            buf.resize(new_len, 0);
            *self.raw.get() = MemoryRaw { base: buf.as_mut_ptr(), len: new_len as u64 };
        }
        Some(current)
    }

    fn checked_range(&self, offset: u64, len: u64) -> Result<(usize, usize), Trap> {
        let end = offset.checked_add(len).ok_or(Trap::MemoryOutOfBounds)?;
        if end > self.len() as u64 {
            return Err(Trap::MemoryOutOfBounds);
        }
        Ok((offset as usize, end as usize))
    }

    /// Reads `len` bytes at `offset` into a fresh buffer.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, Trap> {
        let (start, end) = self.checked_range(offset, len)?;
        let buf = unsafe { &*self.buf.get() };
        Ok(buf[start..end].to_vec())
    }

    /// Copies `data` into memory at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), Trap> {
        let (start, end) = self.checked_range(offset, data.len() as u64)?;
        let buf = unsafe { &mut *self.buf.get() };
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn load_int(&self, offset: u64, size: u32) -> Result<u64, Trap> {
        let (start, end) = self.checked_range(offset, size as u64)?;
        let buf = unsafe { &*self.buf.get() };
        let mut bytes = [0u8; 8];
        bytes[..(end - start)].copy_from_slice(&buf[start..end]);
        Ok(u64::from_le_bytes(bytes))
    }

    pub(crate) fn store_int(&self, offset: u64, size: u32, value: u64) -> Result<(), Trap> {
        let (start, end) = self.checked_range(offset, size as u64)?;
        let buf = unsafe { &mut *self.buf.get() };
        buf[start..end].copy_from_slice(&value.to_le_bytes()[..size as usize]);
        Ok(())
    }

    /// `memory.copy`: overlapping ranges use `copy_within` semantics.
    pub(crate) fn copy_within(&self, dst: u64, src: u64, len: u64) -> Result<(), Trap> {
        let (src_start, src_end) = self.checked_range(src, len)?;
        let (dst_start, _) = self.checked_range(dst, len)?;
        let buf = unsafe { &mut *self.buf.get() };
        buf.copy_within(src_start..src_end, dst_start);
        Ok(())
    }

    pub(crate) fn fill(&self, dst: u64, len: u64, value: u8) -> Result<(), Trap> {
        let (start, end) = self.checked_range(dst, len)?;
        let buf = unsafe { &mut *self.buf.get() };
        buf[start..end].fill(value);
        Ok(())
    }

    /// Reads a NUL-free byte range as used by the WASI layer; identical to
    /// [`read`](Self::read) but kept separate for the `EFAULT` call sites.
    pub(crate) fn check_range(&self, offset: u64, len: u64) -> Result<(), Trap> {
        self.checked_range(offset, len).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerowasm_types::MemoryType;

    #[test]
    fn zero_sized_memory_traps_on_access() {
        let mem = MemoryInstance::new(MemoryType::new(0, 0, 2));
        assert_eq!(mem.len(), 0);
        assert_eq!(mem.read(0, 1).unwrap_err(), Trap::MemoryOutOfBounds);
        assert_eq!(mem.write(0, &[1]).unwrap_err(), Trap::MemoryOutOfBounds);
        // a zero-length access at the boundary is fine
        assert!(mem.read(0, 0).is_ok());
    }

    #[test]
    fn grow_within_capacity_keeps_the_base_address() {
        let mem = MemoryInstance::new(MemoryType::new(1, 4, 4));
        let base_before = unsafe { (*mem.raw.get()).base };
        assert_eq!(mem.grow(2), Some(1));
        assert_eq!(mem.page_count(), 3);
        assert_eq!(unsafe { (*mem.raw.get()).base }, base_before);
    }

    #[test]
    fn grow_past_max_fails() {
        let mem = MemoryInstance::new(MemoryType::new(1, 1, 2));
        assert_eq!(mem.grow(2), None);
        assert_eq!(mem.page_count(), 1);
        assert_eq!(mem.grow(1), Some(1));
    }

    #[test]
    fn bounds_check_covers_the_access_end() {
        let mem = MemoryInstance::new(MemoryType::new(1, 1, 1));
        let len = mem.len() as u64;
        assert!(mem.store_int(len - 4, 4, 0xdead_beef).is_ok());
        assert_eq!(mem.store_int(len - 3, 4, 0).unwrap_err(), Trap::MemoryOutOfBounds);
        assert_eq!(mem.load_int(len - 4, 4).unwrap(), 0xdead_beef);
        // offset + length overflow must not wrap
        assert_eq!(mem.load_int(u64::MAX, 8).unwrap_err(), Trap::MemoryOutOfBounds);
    }
}
