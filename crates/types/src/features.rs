/// The set of WebAssembly proposals the runtime accepts.
///
/// Defaults to WebAssembly Core 1 (only mutable imported/exported globals).
/// `bulk_memory_operations` and `reference_types` imply each other because
/// bulk table instructions reference element segments and vice versa, so
/// enabling either enables both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub bulk_memory_operations: bool,
    pub multi_value: bool,
    pub mutable_global: bool,
    pub non_trapping_float_to_int_conversion: bool,
    pub reference_types: bool,
    pub sign_extension_ops: bool,
    pub simd: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self::wasm_core_1()
    }
}

impl Features {
    /// WebAssembly Core Specification 1.0: only `mutable_global`.
    pub fn wasm_core_1() -> Self {
        Self {
            bulk_memory_operations: false,
            multi_value: false,
            mutable_global: true,
            non_trapping_float_to_int_conversion: false,
            reference_types: false,
            sign_extension_ops: false,
            simd: false,
        }
    }

    /// WebAssembly Core Specification 2.0: every feature flag enabled.
    pub fn wasm_core_2() -> Self {
        Self {
            bulk_memory_operations: true,
            multi_value: true,
            mutable_global: true,
            non_trapping_float_to_int_conversion: true,
            reference_types: true,
            sign_extension_ops: true,
            simd: true,
        }
    }

    pub fn with_bulk_memory_operations(mut self, enabled: bool) -> Self {
        self.bulk_memory_operations = enabled;
        self.reference_types = enabled;
        self
    }

    pub fn with_multi_value(mut self, enabled: bool) -> Self {
        self.multi_value = enabled;
        self
    }

    pub fn with_mutable_global(mut self, enabled: bool) -> Self {
        self.mutable_global = enabled;
        self
    }

    pub fn with_non_trapping_float_to_int_conversion(mut self, enabled: bool) -> Self {
        self.non_trapping_float_to_int_conversion = enabled;
        self
    }

    pub fn with_reference_types(mut self, enabled: bool) -> Self {
        self.reference_types = enabled;
        self.bulk_memory_operations = enabled;
        self
    }

    pub fn with_sign_extension_ops(mut self, enabled: bool) -> Self {
        self.sign_extension_ops = enabled;
        self
    }

    pub fn with_simd(mut self, enabled: bool) -> Self {
        self.simd = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::Features;

    #[test]
    fn bulk_memory_and_reference_types_imply_each_other() {
        let f = Features::wasm_core_1().with_bulk_memory_operations(true);
        assert!(f.reference_types);
        let f = Features::wasm_core_1().with_reference_types(true);
        assert!(f.bulk_memory_operations);
    }

    #[test]
    fn presets() {
        let v1 = Features::wasm_core_1();
        assert!(v1.mutable_global);
        assert!(!v1.simd && !v1.multi_value);

        let v2 = Features::wasm_core_2();
        assert!(v2.bulk_memory_operations && v2.reference_types && v2.simd);
    }
}
