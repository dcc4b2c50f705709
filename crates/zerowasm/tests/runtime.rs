use eyre::Result;
use zerowasm::{Error, ModuleConfig, Runtime, RuntimeConfig, Trap, WasmValue};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::interpreter().with_wasm_core_2()).expect("interpreter is always available")
}

fn instantiate(runtime: &Runtime, wat: &str, name: &str) -> Result<std::sync::Arc<zerowasm::ModuleInstance>> {
    let wasm = wat::parse_str(wat)?;
    let compiled = runtime.compile(&wasm)?;
    Ok(runtime.instantiate(&compiled, ModuleConfig::new().with_name(name).with_start_functions(&[]))?)
}

#[test]
fn global_set_then_get() -> Result<()> {
    // a mutable i32 global written then read back in one call
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (global $counter (mut i32) (i32.const 0))
            (global (mut i32) (i32.const 0))
            (func (export "run") (result i32)
                i32.const 12345
                global.set 1
                global.get 1))"#,
        "globals",
    )?;

    let run = instance.exported_function("run")?;
    let results = run.call(&[])?;
    assert_eq!(results, vec![WasmValue::I32(12345)]);
    Ok(())
}

#[test]
fn arithmetic_and_control_flow() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "fib") (param i32) (result i32)
                (if (result i32) (i32.lt_s (local.get 0) (i32.const 2))
                    (then (local.get 0))
                    (else
                        (i32.add
                            (call 0 (i32.sub (local.get 0) (i32.const 1)))
                            (call 0 (i32.sub (local.get 0) (i32.const 2))))))))"#,
        "fib",
    )?;

    let fib = instance.exported_function("fib")?;
    assert_eq!(fib.call(&[WasmValue::I32(10)])?, vec![WasmValue::I32(55)]);
    Ok(())
}

#[test]
fn loops_and_locals() -> Result<()> {
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

    let sum = instance.exported_function("sum")?;
    assert_eq!(sum.call(&[WasmValue::I32(100)])?, vec![WasmValue::I64(5050)]);
    Ok(())
}

#[test]
fn memory_load_store_and_grow() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (memory (export "memory") 1 4)
            (func (export "store") (param i32 i64)
                (i64.store (local.get 0) (local.get 1)))
            (func (export "load") (param i32) (result i64)
                (i64.load (local.get 0)))
            (func (export "grow") (param i32) (result i32)
                (memory.grow (local.get 0))))"#,
        "memory",
    )?;

    let store = instance.exported_function("store")?;
    let load = instance.exported_function("load")?;
    let grow = instance.exported_function("grow")?;

    store.call(&[WasmValue::I32(16), WasmValue::I64(0x1122_3344_5566_7788)])?;
    assert_eq!(load.call(&[WasmValue::I32(16)])?, vec![WasmValue::I64(0x1122_3344_5566_7788)]);

    assert_eq!(grow.call(&[WasmValue::I32(1)])?, vec![WasmValue::I32(1)]);
    assert_eq!(grow.call(&[WasmValue::I32(100)])?, vec![WasmValue::I32(-1)]);

    // the access end is bounds-checked, not just the base address
    let err = load.call(&[WasmValue::I32(2 * 65536 - 4)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::MemoryOutOfBounds)), "{err}");
    Ok(())
}

#[test]
fn division_traps() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "div") (param i32 i32) (result i32)
                (i32.div_s (local.get 0) (local.get 1))))"#,
        "div",
    )?;

    let div = instance.exported_function("div")?;
    assert_eq!(div.call(&[WasmValue::I32(-7), WasmValue::I32(2)])?, vec![WasmValue::I32(-3)]);

    let err = div.call(&[WasmValue::I32(1), WasmValue::I32(0)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::DivisionByZero)), "{err}");

    let err = div.call(&[WasmValue::I32(i32::MIN), WasmValue::I32(-1)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::IntegerOverflow)), "{err}");
    Ok(())
}

#[test]
fn trapping_and_saturating_truncation() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "trunc") (param f64) (result i32)
                (i32.trunc_f64_s (local.get 0)))
            (func (export "trunc_sat") (param f64) (result i32)
                (i32.trunc_sat_f64_s (local.get 0))))"#,
        "trunc",
    )?;

    let trunc = instance.exported_function("trunc")?;
    assert_eq!(trunc.call(&[WasmValue::F64(-3.9)])?, vec![WasmValue::I32(-3)]);
    let err = trunc.call(&[WasmValue::F64(f64::NAN)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::InvalidConversionToInt)), "{err}");
    let err = trunc.call(&[WasmValue::F64(4e9)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::IntegerOverflow)), "{err}");

    let trunc_sat = instance.exported_function("trunc_sat")?;
    assert_eq!(trunc_sat.call(&[WasmValue::F64(f64::NAN)])?, vec![WasmValue::I32(0)]);
    assert_eq!(trunc_sat.call(&[WasmValue::F64(4e9)])?, vec![WasmValue::I32(i32::MAX)]);
    assert_eq!(trunc_sat.call(&[WasmValue::F64(-4e9)])?, vec![WasmValue::I32(i32::MIN)]);
    Ok(())
}

#[test]
fn indirect_call_type_mismatch_traps() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (table 1 funcref)
            (type $returns_i32 (func (result i32)))
            (type $returns_i64 (func (result i64)))
            (func $f (type $returns_i32) (i32.const 1))
            (elem (i32.const 0) $f)
            (func (export "good") (result i32)
                (call_indirect (type $returns_i32) (i32.const 0)))
            (func (export "bad") (result i64)
                (call_indirect (type $returns_i64) (i32.const 0)))
            (func (export "null") (result i32)
                (call_indirect (type $returns_i32) (i32.const 5))))"#,
        "indirect",
    )?;

    assert_eq!(instance.exported_function("good")?.call(&[])?, vec![WasmValue::I32(1)]);

    let err = instance.exported_function("bad")?.call(&[]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::IndirectCallTypeMismatch)), "{err}");

    let err = instance.exported_function("null")?.call(&[]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::TableOutOfBounds)), "{err}");
    Ok(())
}

#[test]
fn multi_value_and_select() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "swap") (param i32 i32) (result i32 i32)
                local.get 1
                local.get 0)
            (func (export "pick") (param i32) (result i32)
                (select (i32.const 7) (i32.const 8) (local.get 0))))"#,
        "multi",
    )?;

    let swap = instance.exported_function("swap")?;
    assert_eq!(
        swap.call(&[WasmValue::I32(1), WasmValue::I32(2)])?,
        vec![WasmValue::I32(2), WasmValue::I32(1)]
    );

    let pick = instance.exported_function("pick")?;
    assert_eq!(pick.call(&[WasmValue::I32(1)])?, vec![WasmValue::I32(7)]);
    assert_eq!(pick.call(&[WasmValue::I32(0)])?, vec![WasmValue::I32(8)]);
    Ok(())
}

#[test]
fn bulk_memory_and_passive_segments() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (memory (export "memory") 1)
            (data $greeting "hello")
            (func (export "init") (param i32)
                (memory.init $greeting (local.get 0) (i32.const 0) (i32.const 5)))
            (func (export "drop_it")
                (data.drop $greeting)))"#,
        "bulk",
    )?;

    instance.exported_function("init")?.call(&[WasmValue::I32(10)])?;
    let memory = instance.memory().expect("module declares a memory");
    assert_eq!(memory.read(10, 5)?, b"hello");

    instance.exported_function("drop_it")?.call(&[])?;
    // reads from a dropped segment trap
    let err = instance.exported_function("init")?.call(&[WasmValue::I32(0)]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::MemoryOutOfBounds)), "{err}");
    Ok(())
}

#[test]
fn br_table_dispatch() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "classify") (param i32) (result i32)
                (block (block (block
                    (br_table 0 1 2 (local.get 0)))
                    (return (i32.const 100)))
                    (return (i32.const 200)))
                (i32.const 300)))"#,
        "brtable",
    )?;

    let classify = instance.exported_function("classify")?;
    assert_eq!(classify.call(&[WasmValue::I32(0)])?, vec![WasmValue::I32(100)]);
    assert_eq!(classify.call(&[WasmValue::I32(1)])?, vec![WasmValue::I32(200)]);
    assert_eq!(classify.call(&[WasmValue::I32(2)])?, vec![WasmValue::I32(300)]);
    // out of range takes the default
    assert_eq!(classify.call(&[WasmValue::I32(9)])?, vec![WasmValue::I32(300)]);
    Ok(())
}

#[test]
fn host_functions_reach_back_into_the_embedder() -> Result<()> {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    let runtime = runtime();
    let seen = Arc::new(AtomicI32::new(0));
    let seen_in_host = seen.clone();
    runtime
        .host_module("env")
        .with_func("record", &[zerowasm::ValType::I32], &[zerowasm::ValType::I32], move |_, args| {
            let WasmValue::I32(v) = args[0] else { unreachable!() };
            seen_in_host.store(v, Ordering::SeqCst);
            Ok(vec![WasmValue::I32(v + 1)])
        })
        .instantiate(&runtime)?;

    let instance = instantiate(
        &runtime,
        r#"(module
            (import "env" "record" (func $record (param i32) (result i32)))
            (func (export "run") (result i32)
                (call $record (i32.const 41))))"#,
        "host-test",
    )?;

    assert_eq!(instance.exported_function("run")?.call(&[])?, vec![WasmValue::I32(42)]);
    assert_eq!(seen.load(Ordering::SeqCst), 41);
    Ok(())
}

#[test]
fn unreachable_traps() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module (func (export "boom") unreachable))"#,
        "unreachable",
    )?;
    let err = instance.exported_function("boom")?.call(&[]).unwrap_err();
    assert!(matches!(err, Error::Trap(Trap::Unreachable)), "{err}");
    Ok(())
}

#[test]
fn text_format_parses_with_positions() -> Result<()> {
    let runtime = runtime();
    let compiled = runtime.compile_text("(module)")?;
    assert!(compiled.module().functions.is_empty());

    let err = runtime.compile_text("(module (func (oops)))").unwrap_err();
    // text errors carry line:column positions
    assert!(err.to_string().contains(':'), "{err}");
    Ok(())
}

#[test]
fn empty_module_text_matches_canonical_bytes() -> Result<()> {
    // the canonical empty module is just the magic and version
    let bytes = wat::parse_str("(module)")?;
    assert_eq!(bytes, b"\0asm\x01\x00\x00\x00");

    let runtime = runtime();
    let compiled = runtime.compile(&bytes)?;
    assert!(compiled.module().functions.is_empty());
    Ok(())
}

#[test]
fn sign_extension_ops() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (func (export "ext8") (param i32) (result i32)
                (i32.extend8_s (local.get 0)))
            (func (export "ext32u") (param i32) (result i64)
                (i64.extend_i32_u (local.get 0))))"#,
        "extend",
    )?;

    let ext8 = instance.exported_function("ext8")?;
    assert_eq!(ext8.call(&[WasmValue::I32(0x80)])?, vec![WasmValue::I32(-128)]);

    // unsigned extension zeroes the upper 32 bits
    let ext32u = instance.exported_function("ext32u")?;
    assert_eq!(ext32u.call(&[WasmValue::I32(-1)])?, vec![WasmValue::I64(0xffff_ffff)]);
    Ok(())
}
