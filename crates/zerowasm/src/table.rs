use std::cell::UnsafeCell;

use zerowasm_types::TableType;

use crate::Trap;

/// The raw view compiled code reads: element base address and length.
/// Kept at offset 0 so the emitters can address the fields directly.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct TableRaw {
    pub(crate) elems: *mut u64,
    pub(crate) len: u64,
}

/// A table instance: an ordered sequence of opaque references.
///
/// Function references are stored as the address of the owning instance's
/// [`FunctionHandle`](crate::engine::FunctionHandle); external references
/// as their shifted integer form. Zero is the null reference.
#[repr(C)]
#[derive(Debug)]
pub struct TableInstance {
    raw: UnsafeCell<TableRaw>,
    storage: UnsafeCell<Vec<u64>>,
    ty: TableType,
}

unsafe impl Send for TableInstance {}
unsafe impl Sync for TableInstance {}

impl TableInstance {
    pub(crate) fn new(ty: TableType) -> Self {
        let mut storage = vec![0u64; ty.min as usize];
        let raw = UnsafeCell::new(TableRaw { elems: storage.as_mut_ptr(), len: storage.len() as u64 });
        Self { raw, storage: UnsafeCell::new(storage), ty }
    }

    pub(crate) fn ty(&self) -> TableType {
        self.ty
    }

    pub fn len(&self) -> u32 {
        unsafe { (*self.raw.get()).len as u32 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get(&self, index: u32) -> Result<u64, Trap> {
        let storage = unsafe { &*self.storage.get() };
        storage.get(index as usize).copied().ok_or(Trap::TableOutOfBounds)
    }

    pub(crate) fn set(&self, index: u32, value: u64) -> Result<(), Trap> {
        let storage = unsafe { &mut *self.storage.get() };
        let slot = storage.get_mut(index as usize).ok_or(Trap::TableOutOfBounds)?;
        *slot = value;
        Ok(())
    }

    /// Grows by `delta` entries filled with `init`, returning the previous
    /// length, or `None` when the maximum would be exceeded.
    pub(crate) fn grow(&self, delta: u32, init: u64) -> Option<u32> {
        let current = self.len();
        let new_len = current.checked_add(delta)?;
        if let Some(max) = self.ty.max {
            if new_len > max {
                return None;
            }
        }
        unsafe {
            let storage = &mut *self.storage.get();
            storage.resize(new_len as usize, init);
            *self.raw.get() = TableRaw { elems: storage.as_mut_ptr(), len: storage.len() as u64 };
        }
        Some(current)
    }

    /// Writes `items` at `offset`, as `table.init` and active element
    /// segments do.
    pub(crate) fn init(&self, offset: u32, items: &[u64]) -> Result<(), Trap> {
        let storage = unsafe { &mut *self.storage.get() };
        let end = (offset as usize).checked_add(items.len()).ok_or(Trap::TableOutOfBounds)?;
        if end > storage.len() {
            return Err(Trap::TableOutOfBounds);
        }
        storage[offset as usize..end].copy_from_slice(items);
        Ok(())
    }

    pub(crate) fn copy_within(&self, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let storage = unsafe { &mut *self.storage.get() };
        let src_end = (src as usize).checked_add(len as usize).ok_or(Trap::TableOutOfBounds)?;
        let dst_end = (dst as usize).checked_add(len as usize).ok_or(Trap::TableOutOfBounds)?;
        if src_end > storage.len() || dst_end > storage.len() {
            return Err(Trap::TableOutOfBounds);
        }
        storage.copy_within(src as usize..src_end, dst as usize);
        Ok(())
    }

    pub(crate) fn copy_from(&self, other: &TableInstance, dst: u32, src: u32, len: u32) -> Result<(), Trap> {
        let items = {
            let other_storage = unsafe { &*other.storage.get() };
            let src_end = (src as usize).checked_add(len as usize).ok_or(Trap::TableOutOfBounds)?;
            if src_end > other_storage.len() {
                return Err(Trap::TableOutOfBounds);
            }
            other_storage[src as usize..src_end].to_vec()
        };
        self.init(dst, &items)
    }

    pub(crate) fn fill(&self, offset: u32, len: u32, value: u64) -> Result<(), Trap> {
        let storage = unsafe { &mut *self.storage.get() };
        let end = (offset as usize).checked_add(len as usize).ok_or(Trap::TableOutOfBounds)?;
        if end > storage.len() {
            return Err(Trap::TableOutOfBounds);
        }
        storage[offset as usize..end].fill(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerowasm_types::ValType;

    fn table(min: u32, max: Option<u32>) -> TableInstance {
        TableInstance::new(TableType { element: ValType::FuncRef, min, max })
    }

    #[test]
    fn out_of_bounds_access_traps() {
        let t = table(2, None);
        assert!(t.get(1).is_ok());
        assert_eq!(t.get(2).unwrap_err(), Trap::TableOutOfBounds);
        assert_eq!(t.set(2, 1).unwrap_err(), Trap::TableOutOfBounds);
    }

    #[test]
    fn grow_respects_the_maximum() {
        let t = table(1, Some(3));
        assert_eq!(t.grow(2, 7), Some(1));
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(2).unwrap(), 7);
        assert_eq!(t.grow(1, 0), None);
    }

    #[test]
    fn init_checks_the_whole_range()  {
        let t = table(4, None);
        assert!(t.init(2, &[1, 2]).is_ok());
        assert_eq!(t.init(3, &[1, 2]).unwrap_err(), Trap::TableOutOfBounds);
        assert_eq!(t.get(3).unwrap(), 2);
    }
}
