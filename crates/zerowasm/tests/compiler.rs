//! The same behaviours the interpreter tests cover, driven through the
//! native engine. Only built where the compiler exists.
#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use eyre::Result;
use zerowasm::{Error, ModuleConfig, Runtime, RuntimeConfig, Trap, WasmValue};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::compiler().with_wasm_core_2()).expect("compiler supported on this host")
}

fn instantiate(runtime: &Runtime, wat: &str, name: &str) -> Result<std::sync::Arc<zerowasm::ModuleInstance>> {
    let wasm = wat::parse_str(wat)?;
    let compiled = runtime.compile(&wasm)?;
    Ok(runtime.instantiate(&compiled, ModuleConfig::new().with_name(name).with_start_functions(&[]))?)
}

#[test]
fn arithmetic() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "mix") (param i32 i32) (result i32)
                (i32.mul (i32.add (local.get 0) (local.get 1)) (i32.const 3))))"#,
        "arith",
    )?;
    let mix = instance.exported_function("mix")?;
    assert_eq!(mix.call(&[WasmValue::I32(4), WasmValue::I32(6)])?, vec![WasmValue::I32(30)]);
    Ok(())
}

#[test]
fn calls_and_recursion() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func $fib (param i32) (result i32)
                (if (result i32) (i32.lt_s (local.get 0) (i32.const 2))
                    (then (local.get 0))
                    (else
                        (i32.add
                            (call $fib (i32.sub (local.get 0) (i32.const 1)))
                            (call $fib (i32.sub (local.get 0) (i32.const 2)))))))
            (func (export "fib") (param i32) (result i32)
                (call $fib (local.get 0))))"#,
        "fib",
    )?;
    let fib = instance.exported_function("fib")?;
    assert_eq!(fib.call(&[WasmValue::I32(15)])?, vec![WasmValue::I32(610)]);
    Ok(())
}

#[test]
fn loops_branches_and_locals() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "sum") (param i32) (result i64)
                (local i64)
                (block
                    (loop
                        (br_if 1 (i32.eqz (local.get 0)))
                        (local.set 1 (i64.add (local.get 1) (i64.extend_i32_u (local.get 0))))
                        (local.set 0 (i32.sub (local.get 0) (i32.const 1)))
                        (br 0)))
                local.get 1))"#,
        "loops",
    )?;
    assert_eq!(
        instance.exported_function("sum")?.call(&[WasmValue::I32(1000)])?,
        vec![WasmValue::I64(500_500)]
    );
    Ok(())
}

#[test]
fn memory_access_and_traps() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (memory 1)
            (func (export "roundtrip") (param i32 i64) (result i64)
                (i64.store (local.get 0) (local.get 1))
                (i64.load (local.get 0)))
            (func (export "oob") (result i32)
                (i32.load (i32.const 65536))))"#,
        "memory",
    )?;

    let roundtrip = instance.exported_function("roundtrip")?;
    assert_eq!(
        roundtrip.call(&[WasmValue::I32(8), WasmValue::I64(-1)])?,
        vec![WasmValue::I64(-1)]
    );

    let err = instance.exported_function("oob")?.call(&[]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::MemoryOutOfBounds)), "{err}");
    Ok(())
}

#[test]
fn division_and_truncation_traps() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "div") (param i64 i64) (result i64)
                (i64.div_s (local.get 0) (local.get 1)))
            (func (export "trunc") (param f64) (result i32)
                (i32.trunc_f64_s (local.get 0))))"#,
        "traps",
    )?;

    let div = instance.exported_function("div")?;
    assert_eq!(div.call(&[WasmValue::I64(-9), WasmValue::I64(2)])?, vec![WasmValue::I64(-4)]);
    let err = div.call(&[WasmValue::I64(1), WasmValue::I64(0)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::DivisionByZero)), "{err}");

    let trunc = instance.exported_function("trunc")?;
    assert_eq!(trunc.call(&[WasmValue::F64(-100.9)])?, vec![WasmValue::I32(-100)]);
    let err = trunc.call(&[WasmValue::F64(f64::NAN)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::InvalidConversionToInt)), "{err}");
    Ok(())
}

#[test]
fn float_semantics() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "min") (param f64 f64) (result f64)
                (f64.min (local.get 0) (local.get 1)))
            (func (export "nearest") (param f64) (result f64)
                (f64.nearest (local.get 0)))
            (func (export "cmp") (param f64 f64) (result i32)
                (f64.lt (local.get 0) (local.get 1))))"#,
        "floats",
    )?;

    let min = instance.exported_function("min")?;
    let WasmValue::F64(nan) = min.call(&[WasmValue::F64(1.0), WasmValue::F64(f64::NAN)])?[0] else {
        unreachable!()
    };
    assert!(nan.is_nan());
    let WasmValue::F64(zero) = min.call(&[WasmValue::F64(-0.0), WasmValue::F64(0.0)])?[0] else {
        unreachable!()
    };
    assert!(zero.is_sign_negative());

    let nearest = instance.exported_function("nearest")?;
    assert_eq!(nearest.call(&[WasmValue::F64(2.5)])?, vec![WasmValue::F64(2.0)]);

    // comparisons with NaN are false
    let cmp = instance.exported_function("cmp")?;
    assert_eq!(cmp.call(&[WasmValue::F64(f64::NAN), WasmValue::F64(1.0)])?, vec![WasmValue::I32(0)]);
    Ok(())
}

#[test]
fn indirect_calls_check_types() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (table 2 funcref)
            (type $returns_i32 (func (result i32)))
            (type $returns_i64 (func (result i64)))
            (func $f (type $returns_i32) (i32.const 7))
            (elem (i32.const 0) $f)
            (func (export "good") (result i32)
                (call_indirect (type $returns_i32) (i32.const 0)))
            (func (export "bad") (result i64)
                (call_indirect (type $returns_i64) (i32.const 0)))
            (func (export "null") (result i32)
                (call_indirect (type $returns_i32) (i32.const 1))))"#,
        "indirect",
    )?;

    assert_eq!(instance.exported_function("good")?.call(&[])?, vec![WasmValue::I32(7)]);
    let err = instance.exported_function("bad")?.call(&[]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::IndirectCallTypeMismatch)), "{err}");
    let err = instance.exported_function("null")?.call(&[]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::NullFuncRef)), "{err}");
    Ok(())
}

#[test]
fn host_calls_cross_the_engine_boundary() -> Result<()> {
    let runtime = runtime();
    runtime
        .host_module("env")
        .with_func("double", &[zerowasm::ValType::I64], &[zerowasm::ValType::I64], |_, args| {
            let WasmValue::I64(v) = args[0] else { unreachable!() };
            Ok(vec![WasmValue::I64(v * 2)])
        })
        .instantiate(&runtime)?;

    let instance = instantiate(
        &runtime,
        r#"(module
            (import "env" "double" (func $double (param i64) (result i64)))
            (func (export "quad") (param i64) (result i64)
                (call $double (call $double (local.get 0)))))"#,
        "hosty",
    )?;

    assert_eq!(
        instance.exported_function("quad")?.call(&[WasmValue::I64(11)])?,
        vec![WasmValue::I64(44)]
    );
    Ok(())
}

#[test]
fn deep_recursion_grows_the_stacks() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func $down (param i32) (result i32)
                (if (result i32) (i32.eqz (local.get 0))
                    (then (i32.const 0))
                    (else (i32.add (i32.const 1)
                        (call $down (i32.sub (local.get 0) (i32.const 1)))))))
            (func (export "depth") (param i32) (result i32)
                (call $down (local.get 0))))"#,
        "deep",
    )?;

    // deep enough to force both the value stack and the frame stack to grow
    let depth = instance.exported_function("depth")?;
    assert_eq!(depth.call(&[WasmValue::I32(1500)])?, vec![WasmValue::I32(1500)]);
    Ok(())
}

#[test]
fn bulk_memory_builtins() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (memory (export "memory") 1 2)
            (func (export "fill") (param i32 i32 i32)
                (memory.fill (local.get 0) (local.get 1) (local.get 2)))
            (func (export "grow") (param i32) (result i32)
                (memory.grow (local.get 0))))"#,
        "bulk",
    )?;

    instance
        .exported_function("fill")?
        .call(&[WasmValue::I32(4), WasmValue::I32(0x5a), WasmValue::I32(8)])?;
    let memory = instance.memory().expect("module declares a memory");
    assert_eq!(memory.read(4, 8)?, [0x5a; 8]);

    let grow = instance.exported_function("grow")?;
    assert_eq!(grow.call(&[WasmValue::I32(1)])?, vec![WasmValue::I32(1)]);
    assert_eq!(grow.call(&[WasmValue::I32(5)])?, vec![WasmValue::I32(-1)]);
    Ok(())
}
