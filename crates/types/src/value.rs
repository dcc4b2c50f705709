use core::fmt::{self, Debug};

use crate::ValType;

/// A typed WebAssembly value, as seen at the embedder boundary.
#[derive(Clone, Copy, PartialEq)]
pub enum WasmValue {
    /// A 32-bit integer.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A 32-bit float.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
    /// A 128-bit vector.
    V128(u128),
    /// A reference to a function, by index in its module.
    RefFunc(u32),
    /// An opaque external reference.
    RefExtern(u32),
    /// A null reference of the given type.
    RefNull(ValType),
}

impl WasmValue {
    /// The type of this value.
    pub fn ty(&self) -> ValType {
        match self {
            Self::I32(_) => ValType::I32,
            Self::I64(_) => ValType::I64,
            Self::F32(_) => ValType::F32,
            Self::F64(_) => ValType::F64,
            Self::V128(_) => ValType::V128,
            Self::RefFunc(_) => ValType::FuncRef,
            Self::RefExtern(_) => ValType::ExternRef,
            Self::RefNull(ty) => *ty,
        }
    }
}

impl Debug for WasmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "i32({v})"),
            Self::I64(v) => write!(f, "i64({v})"),
            Self::F32(v) => write!(f, "f32({v})"),
            Self::F64(v) => write!(f, "f64({v})"),
            Self::V128(v) => write!(f, "v128({v:#x})"),
            Self::RefFunc(v) => write!(f, "ref.func({v})"),
            Self::RefExtern(v) => write!(f, "ref.extern({v})"),
            Self::RefNull(ty) => write!(f, "ref.null({ty:?})"),
        }
    }
}

impl From<i32> for WasmValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for WasmValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f32> for WasmValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for WasmValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

/// An untyped 64-bit value-stack slot.
///
/// Integers are stored two's-complement, floats bit-cast, references as
/// their handle word. A v128 value occupies two adjacent slots, low half
/// first.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RawValue(pub u64);

impl Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raw({:#x})", self.0)
    }
}

impl RawValue {
    pub const ZERO: RawValue = RawValue(0);

    pub fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Splits a typed value into its slot representation: one slot for
    /// everything except v128, which yields `(low, Some(high))`.
    pub fn from_wasm_value(value: WasmValue) -> (RawValue, Option<RawValue>) {
        match value {
            WasmValue::I32(v) => (RawValue(v as u32 as u64), None),
            WasmValue::I64(v) => (RawValue(v as u64), None),
            WasmValue::F32(v) => (RawValue(v.to_bits() as u64), None),
            WasmValue::F64(v) => (RawValue(v.to_bits()), None),
            WasmValue::V128(v) => (RawValue(v as u64), Some(RawValue((v >> 64) as u64))),
            // references encode null as 0, so indexes are shifted by one
            WasmValue::RefFunc(v) => (RawValue(v as u64 + 1), None),
            WasmValue::RefExtern(v) => (RawValue(v as u64 + 1), None),
            WasmValue::RefNull(_) => (RawValue(0), None),
        }
    }

    /// Reattaches a type to a slot value. `high` is only read for v128.
    pub fn into_wasm_value(ty: ValType, low: RawValue, high: RawValue) -> WasmValue {
        match ty {
            ValType::I32 => WasmValue::I32(low.as_i32()),
            ValType::I64 => WasmValue::I64(low.as_i64()),
            ValType::F32 => WasmValue::F32(low.as_f32()),
            ValType::F64 => WasmValue::F64(low.as_f64()),
            ValType::V128 => WasmValue::V128((low.0 as u128) | ((high.0 as u128) << 64)),
            ValType::FuncRef => match low.0 {
                0 => WasmValue::RefNull(ValType::FuncRef),
                v => WasmValue::RefFunc((v - 1) as u32),
            },
            ValType::ExternRef => match low.0 {
                0 => WasmValue::RefNull(ValType::ExternRef),
                v => WasmValue::RefExtern((v - 1) as u32),
            },
        }
    }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self {
        RawValue(v as u32 as u64)
    }
}

impl From<u32> for RawValue {
    fn from(v: u32) -> Self {
        RawValue(v as u64)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue(v as u64)
    }
}

impl From<u64> for RawValue {
    fn from(v: u64) -> Self {
        RawValue(v)
    }
}

impl From<f32> for RawValue {
    fn from(v: f32) -> Self {
        RawValue(v.to_bits() as u64)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue(v.to_bits())
    }
}
