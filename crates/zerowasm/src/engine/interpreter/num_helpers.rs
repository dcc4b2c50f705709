//! Numeric helpers implementing the Wasm semantics the host language does
//! not give us directly: NaN-propagating min/max and trapping truncation.

use crate::Trap;

pub(crate) trait WasmFloat: Copy {
    fn wasm_min(self, other: Self) -> Self;
    fn wasm_max(self, other: Self) -> Self;
}

macro_rules! impl_wasm_float {
    ($ty:ty, $nan:expr) => {
        impl WasmFloat for $ty {
            fn wasm_min(self, other: Self) -> Self {
                if self.is_nan() || other.is_nan() {
                    $nan
                } else if self < other {
                    self
                } else if other < self {
                    other
                } else if self.is_sign_negative() {
                    // min(-0.0, +0.0) is -0.0
                    self
                } else {
                    other
                }
            }

            fn wasm_max(self, other: Self) -> Self {
                if self.is_nan() || other.is_nan() {
                    $nan
                } else if self > other {
                    self
                } else if other > self {
                    other
                } else if self.is_sign_positive() {
                    self
                } else {
                    other
                }
            }
        }
    };
}

impl_wasm_float!(f32, f32::NAN);
impl_wasm_float!(f64, f64::NAN);

/// Truncates toward zero, trapping on NaN and on values whose truncation
/// falls outside `[lo, hi]` (both inclusive truncation bounds as f64).
fn checked_trunc(value: f64, lo: f64, hi: f64) -> Result<f64, Trap> {
    if value.is_nan() {
        return Err(Trap::InvalidConversionToInt);
    }
    let truncated = value.trunc();
    if truncated < lo || truncated > hi {
        return Err(Trap::IntegerOverflow);
    }
    Ok(truncated)
}

pub(crate) fn trunc_to_i32(value: f64) -> Result<i32, Trap> {
    checked_trunc(value, -2147483648.0, 2147483647.0).map(|v| v as i32)
}

pub(crate) fn trunc_to_u32(value: f64) -> Result<u32, Trap> {
    checked_trunc(value, 0.0, 4294967295.0).map(|v| v as u32)
}

pub(crate) fn trunc_to_i64(value: f64) -> Result<i64, Trap> {
    if value.is_nan() {
        return Err(Trap::InvalidConversionToInt);
    }
    let truncated = value.trunc();
    // 2^63 is exactly representable; the upper bound is exclusive
    if truncated < -9223372036854775808.0 || truncated >= 9223372036854775808.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(truncated as i64)
}

pub(crate) fn trunc_to_u64(value: f64) -> Result<u64, Trap> {
    if value.is_nan() {
        return Err(Trap::InvalidConversionToInt);
    }
    let truncated = value.trunc();
    if truncated < 0.0 || truncated >= 18446744073709551616.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(truncated as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_propagate_nan_and_order_zeroes() {
        assert!(f32::NAN.wasm_min(1.0).is_nan());
        assert!(1.0f64.wasm_max(f64::NAN).is_nan());
        assert!((-0.0f32).wasm_min(0.0).is_sign_negative());
        assert!(0.0f64.wasm_max(-0.0).is_sign_positive());
        assert_eq!(1.0f64.wasm_min(2.0), 1.0);
    }

    #[test]
    fn trunc_traps_at_the_boundaries() {
        assert_eq!(trunc_to_i32(2147483647.9).unwrap(), i32::MAX);
        assert_eq!(trunc_to_i32(2147483648.0).unwrap_err(), Trap::IntegerOverflow);
        assert_eq!(trunc_to_i32(-2147483648.9).unwrap(), i32::MIN);
        assert_eq!(trunc_to_i32(f64::NAN).unwrap_err(), Trap::InvalidConversionToInt);
        assert_eq!(trunc_to_u32(-0.9).unwrap(), 0);
        assert_eq!(trunc_to_u32(-1.0).unwrap_err(), Trap::IntegerOverflow);
        assert_eq!(trunc_to_u64(18446744073709551615.0).unwrap_err(), Trap::IntegerOverflow);
        assert_eq!(trunc_to_i64(-9223372036854775808.0).unwrap(), i64::MIN);
    }
}
