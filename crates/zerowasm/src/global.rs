use std::cell::UnsafeCell;

use zerowasm_types::{GlobalType, RawValue, ValType, WasmValue};

/// A global instance: 128 bits of storage (low and high halves, so v128
/// fits) plus the type record. The storage sits at offset 0 so compiled
/// code can address it through the instance pointer.
#[repr(C)]
#[derive(Debug)]
pub struct GlobalInstance {
    value: UnsafeCell<[u64; 2]>,
    ty: GlobalType,
}

unsafe impl Send for GlobalInstance {}
unsafe impl Sync for GlobalInstance {}

impl GlobalInstance {
    pub(crate) fn new(ty: GlobalType, lo: RawValue, hi: RawValue) -> Self {
        Self { value: UnsafeCell::new([lo.0, hi.0]), ty }
    }

    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    pub(crate) fn get(&self) -> (RawValue, RawValue) {
        let value = unsafe { *self.value.get() };
        (RawValue(value[0]), RawValue(value[1]))
    }

    pub(crate) fn set(&self, lo: RawValue, hi: RawValue) {
        unsafe {
            *self.value.get() = [lo.0, hi.0];
        }
    }

    /// The typed value, for the embedder boundary.
    pub fn value(&self) -> WasmValue {
        let (lo, hi) = self.get();
        RawValue::into_wasm_value(self.ty.ty, lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v128_uses_both_halves() {
        let g = GlobalInstance::new(
            GlobalType { ty: ValType::V128, mutable: true },
            RawValue(0x1111_2222_3333_4444),
            RawValue(0x5555_6666_7777_8888),
        );
        assert_eq!(g.value(), WasmValue::V128(0x5555_6666_7777_8888_1111_2222_3333_4444));
    }
}
