use eyre::Result;
use zerowasm::{Error, LinkingError, ModuleConfig, Runtime, RuntimeConfig, ValType, WasmValue};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::interpreter().with_wasm_core_2()).expect("interpreter available")
}

fn config(name: &str) -> ModuleConfig {
    ModuleConfig::new().with_name(name).with_start_functions(&[])
}

#[test]
fn duplicate_names_are_rejected() -> Result<()> {
    let runtime = runtime();
    let wasm = wat::parse_str("(module)")?;
    let compiled = runtime.compile(&wasm)?;
    runtime.instantiate(&compiled, config("dup"))?;
    let err = runtime.instantiate(&compiled, config("dup")).unwrap_err();
    assert!(matches!(err, Error::AlreadyInstantiated(name) if name == "dup"));
    Ok(())
}

#[test]
fn imports_resolve_by_module_and_name() -> Result<()> {
    let runtime = runtime();
    let exporter = wat::parse_str(
        r#"(module
            (func (export "answer") (result i32) (i32.const 42))
            (memory (export "memory") 1)
            (global (export "base") i32 (i32.const 7)))"#,
    )?;
    runtime.instantiate(&runtime.compile(&exporter)?, config("exporter"))?;

    let importer = wat::parse_str(
        r#"(module
            (import "exporter" "answer" (func $answer (result i32)))
            (import "exporter" "memory" (memory 1))
            (import "exporter" "base" (global i32))
            (func (export "run") (result i32)
                (i32.add (call $answer) (global.get 0))))"#,
    )?;
    let instance = runtime.instantiate(&runtime.compile(&importer)?, config("importer"))?;
    assert_eq!(instance.exported_function("run")?.call(&[])?, vec![WasmValue::I32(49)]);
    Ok(())
}

#[test]
fn imported_memory_is_shared() -> Result<()> {
    let runtime = runtime();
    let exporter = wat::parse_str(r#"(module (memory (export "memory") 1))"#)?;
    let exporter = runtime.instantiate(&runtime.compile(&exporter)?, config("mem"))?;

    let importer = wat::parse_str(
        r#"(module
            (import "mem" "memory" (memory 1))
            (func (export "poke") (param i32 i32)
                (i32.store (local.get 0) (local.get 1))))"#,
    )?;
    let importer = runtime.instantiate(&runtime.compile(&importer)?, config("poker"))?;

    importer.exported_function("poke")?.call(&[WasmValue::I32(8), WasmValue::I32(99)])?;
    // the write is visible through the exporting module
    let memory = exporter.memory().expect("exporter declares the memory");
    assert_eq!(memory.read(8, 4)?, 99i32.to_le_bytes());
    Ok(())
}

#[test]
fn linking_errors_are_specific() -> Result<()> {
    let runtime = runtime();
    let exporter = wat::parse_str(r#"(module (func (export "f") (param i32)))"#)?;
    runtime.instantiate(&runtime.compile(&exporter)?, config("lib"))?;

    // missing module
    let wasm = wat::parse_str(r#"(module (import "nowhere" "f" (func)))"#)?;
    let err = runtime.instantiate(&runtime.compile(&wasm)?, config("a")).unwrap_err();
    assert!(matches!(err, Error::Linker(LinkingError::ModuleNotInstantiated { .. })), "{err}");

    // missing export
    let wasm = wat::parse_str(r#"(module (import "lib" "missing" (func)))"#)?;
    let err = runtime.instantiate(&runtime.compile(&wasm)?, config("b")).unwrap_err();
    assert!(matches!(err, Error::Linker(LinkingError::ExportNotFound { .. })), "{err}");

    // signature mismatch renders both signatures
    let wasm = wat::parse_str(r#"(module (import "lib" "f" (func (param i64))))"#)?;
    let err = runtime.instantiate(&runtime.compile(&wasm)?, config("c")).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("(i64)") && message.contains("(i32)"), "{message}");

    // failed instantiations leave nothing behind
    assert!(runtime.module("a").is_none());
    assert!(runtime.module("b").is_none());
    assert!(runtime.module("c").is_none());
    Ok(())
}

#[test]
fn close_is_ordered_and_idempotent() -> Result<()> {
    let runtime = runtime();
    let exporter = wat::parse_str(r#"(module (func (export "f")))"#)?;
    runtime.instantiate(&runtime.compile(&exporter)?, config("base"))?;

    let importer = wat::parse_str(r#"(module (import "base" "f" (func)))"#)?;
    runtime.instantiate(&runtime.compile(&importer)?, config("user"))?;

    // the source cannot close while an importer remains
    let err = runtime.close_module("base").unwrap_err();
    assert!(matches!(err, Error::ModuleInUse(name) if name == "base"));

    runtime.close_module("user")?;
    runtime.close_module("base")?;
    // closing a module that is already gone succeeds
    runtime.close_module("base")?;
    assert_eq!(runtime.store().module_count(), 0);
    Ok(())
}

#[test]
fn close_with_exit_code_fails_later_calls() -> Result<()> {
    let runtime = runtime();
    let wasm = wat::parse_str(r#"(module (func (export "f") (result i32) (i32.const 1)))"#)?;
    let instance = runtime.instantiate(&runtime.compile(&wasm)?, config("closing"))?;
    let f = instance.exported_function("f")?;
    assert_eq!(f.call(&[])?, vec![WasmValue::I32(1)]);

    runtime.close_with_exit_code(3);
    match f.call(&[]).unwrap_err() {
        Error::Exit { module, exit_code } => {
            assert_eq!(module, "closing");
            assert_eq!(exit_code, 3);
        }
        other => panic!("expected an exit error, got {other}"),
    }
    // close is idempotent
    runtime.close_with_exit_code(3);
    Ok(())
}

#[test]
fn start_function_failure_rolls_back() -> Result<()> {
    let runtime = runtime();
    let wasm = wat::parse_str(
        r#"(module (func (export "_start") unreachable))"#,
    )?;
    let err = runtime
        .instantiate(&runtime.compile(&wasm)?, ModuleConfig::new().with_name("failing"))
        .unwrap_err();
    assert!(matches!(err, Error::StartFunctionFailed { .. }), "{err}");
    // instantiation is atomic: the failed module is not observable
    assert!(runtime.module("failing").is_none());
    Ok(())
}

#[test]
fn concurrent_instantiate_and_close() -> Result<()> {
    let runtime = runtime();
    runtime
        .host_module("host")
        .with_func("nop", &[], &[ValType::I32], |_, _| Ok(vec![WasmValue::I32(0)]))
        .instantiate(&runtime)?;

    let importer = wat::parse_str(
        r#"(module
            (import "host" "nop" (func $nop (result i32)))
            (func (export "run") (result i32) (call $nop)))"#,
    )?;
    let compiled = runtime.compile(&importer)?;

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let runtime = runtime.clone();
            let compiled = compiled.clone();
            std::thread::spawn(move || -> Result<()> {
                for i in 0..1000 {
                    let name = format!("worker-{worker}-{i}");
                    let instance = runtime
                        .instantiate(&compiled, ModuleConfig::new().with_name(&name).with_start_functions(&[]))?;
                    let run = instance.exported_function("run")?;
                    assert_eq!(run.call(&[])?, vec![WasmValue::I32(0)]);
                    runtime.close_module(&name)?;
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked")?;
    }

    // only the host module remains
    assert_eq!(runtime.store().module_count(), 1);
    assert!(runtime.module("host").is_some());
    Ok(())
}

#[test]
fn parallel_calls_into_one_instance() -> Result<()> {
    let runtime = runtime();
    let wasm = wat::parse_str(
        r#"(module
            (memory (export "memory") 1)
            (func (export "bump") (param i32) (result i32)
                (i32.store (local.get 0) (i32.add (i32.load (local.get 0)) (i32.const 1)))
                (i32.load (local.get 0))))"#,
    )?;
    let instance = runtime.instantiate(&runtime.compile(&wasm)?, config("shared"))?;

    // each thread works on its own memory range, so there is no data race
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let instance = instance.clone();
            std::thread::spawn(move || -> Result<i32> {
                let bump = instance.exported_function("bump")?;
                let offset = worker * 64;
                let mut last = 0;
                for _ in 0..500 {
                    let WasmValue::I32(v) = bump.call(&[WasmValue::I32(offset)])?[0] else {
                        unreachable!()
                    };
                    last = v;
                }
                Ok(last)
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().expect("worker panicked")?, 500);
    }
    Ok(())
}
