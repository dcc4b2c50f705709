use eyre::Result;
use zerowasm::wasi::{self, Errno};
use zerowasm::{Error, MemFs, ModuleConfig, Runtime, RuntimeConfig, WasmValue};

fn runtime() -> Runtime {
    let runtime = Runtime::new(RuntimeConfig::interpreter().with_wasm_core_2()).expect("interpreter available");
    wasi::instantiate(&runtime).expect("wasi registers");
    runtime
}

fn instantiate(
    runtime: &Runtime,
    wat: &str,
    config: ModuleConfig,
) -> Result<std::sync::Arc<zerowasm::ModuleInstance>> {
    let wasm = wat::parse_str(wat)?;
    let compiled = runtime.compile(&wasm)?;
    Ok(runtime.instantiate(&compiled, config)?)
}

const ARGS_MODULE: &str = r#"(module
    (import "wasi_snapshot_preview1" "args_get"
        (func $args_get (param i32 i32) (result i32)))
    (import "wasi_snapshot_preview1" "args_sizes_get"
        (func $args_sizes_get (param i32 i32) (result i32)))
    (memory (export "memory") 1)
    (func (export "args_get") (param i32 i32) (result i32)
        (call $args_get (local.get 0) (local.get 1)))
    (func (export "args_sizes_get") (param i32 i32) (result i32)
        (call $args_sizes_get (local.get 0) (local.get 1))))"#;

#[test]
fn args_get_writes_the_exact_layout() -> Result<()> {
    let runtime = runtime();
    let config = ModuleConfig::new()
        .with_name("args")
        .with_start_functions(&[])
        .with_args(&["a", "bc"]);
    let instance = instantiate(&runtime, ARGS_MODULE, config)?;

    // argv at 7, argv_buf at 1
    let result = instance
        .exported_function("args_get")?
        .call(&[WasmValue::I32(7), WasmValue::I32(1)])?;
    assert_eq!(result, vec![WasmValue::I32(0)]);

    let memory = instance.memory().expect("module declares a memory");
    assert_eq!(memory.read(1, 5)?, b"a\0bc\0");
    assert_eq!(memory.read(7, 4)?, 1u32.to_le_bytes());
    assert_eq!(memory.read(11, 4)?, 3u32.to_le_bytes());
    Ok(())
}

#[test]
fn empty_args_produce_zero_sizes() -> Result<()> {
    let runtime = runtime();
    let config = ModuleConfig::new().with_name("noargs").with_start_functions(&[]);
    let instance = instantiate(&runtime, ARGS_MODULE, config)?;

    let result = instance
        .exported_function("args_sizes_get")?
        .call(&[WasmValue::I32(0), WasmValue::I32(4)])?;
    assert_eq!(result, vec![WasmValue::I32(0)]);

    let memory = instance.memory().expect("module declares a memory");
    assert_eq!(memory.read(0, 4)?, 0u32.to_le_bytes());
    assert_eq!(memory.read(4, 4)?, 0u32.to_le_bytes());
    Ok(())
}

#[test]
fn args_get_out_of_bounds_pointer_faults() -> Result<()> {
    let runtime = runtime();
    let config = ModuleConfig::new()
        .with_name("args-oob")
        .with_start_functions(&[])
        .with_args(&["a"]);
    let instance = instantiate(&runtime, ARGS_MODULE, config)?;

    let result = instance
        .exported_function("args_get")?
        .call(&[WasmValue::I32(65536 - 1), WasmValue::I32(0)])?;
    assert_eq!(result, vec![WasmValue::I32(Errno::Fault.raw() as i32)]);
    Ok(())
}

const FS_MODULE: &str = r#"(module
    (import "wasi_snapshot_preview1" "path_open"
        (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
    (import "wasi_snapshot_preview1" "fd_read"
        (func $fd_read (param i32 i32 i32 i32) (result i32)))
    (import "wasi_snapshot_preview1" "fd_seek"
        (func $fd_seek (param i32 i64 i32 i32) (result i32)))
    (import "wasi_snapshot_preview1" "fd_close"
        (func $fd_close (param i32) (result i32)))
    (memory (export "memory") 1)
    (func (export "path_open") (param i32 i32 i32 i32) (result i32)
        (call $path_open (local.get 0) (i32.const 0) (local.get 1) (local.get 2)
            (i32.const 0) (i64.const 0) (i64.const 0) (i32.const 0) (local.get 3)))
    (func (export "fd_read") (param i32 i32 i32 i32) (result i32)
        (call $fd_read (local.get 0) (local.get 1) (local.get 2) (local.get 3)))
    (func (export "fd_seek") (param i32 i64 i32 i32) (result i32)
        (call $fd_seek (local.get 0) (local.get 1) (local.get 2) (local.get 3)))
    (func (export "fd_close") (param i32) (result i32)
        (call $fd_close (local.get 0))))"#;

fn open_test_file(instance: &std::sync::Arc<zerowasm::ModuleInstance>) -> Result<u32> {
    let memory = instance.memory().expect("module declares a memory");
    memory.write(100, b"file.txt")?;
    // path_open(dirfd=3, path=100, len=8, &opened_fd=200)
    let result = instance.exported_function("path_open")?.call(&[
        WasmValue::I32(3),
        WasmValue::I32(100),
        WasmValue::I32(8),
        WasmValue::I32(200),
    ])?;
    assert_eq!(result, vec![WasmValue::I32(0)]);
    let fd = u32::from_le_bytes(memory.read(200, 4)?.try_into().unwrap());
    Ok(fd)
}

#[test]
fn fd_read_scatters_into_iovecs() -> Result<()> {
    let runtime = runtime();
    let config = ModuleConfig::new()
        .with_name("fs")
        .with_start_functions(&[])
        .with_fs(MemFs::new().with_file("file.txt", "stream"));
    let instance = instantiate(&runtime, FS_MODULE, config)?;
    let fd = open_test_file(&instance)?;
    assert_eq!(fd, 4, "preopen holds 3, the first file gets 4");

    let memory = instance.memory().expect("module declares a memory");
    // iovs at 1: [(18, 4), (23, 2)]
    memory.write(1, &18u32.to_le_bytes())?;
    memory.write(5, &4u32.to_le_bytes())?;
    memory.write(9, &23u32.to_le_bytes())?;
    memory.write(13, &2u32.to_le_bytes())?;

    let result = instance.exported_function("fd_read")?.call(&[
        WasmValue::I32(fd as i32),
        WasmValue::I32(1),
        WasmValue::I32(2),
        WasmValue::I32(26),
    ])?;
    assert_eq!(result, vec![WasmValue::I32(0)]);

    assert_eq!(memory.read(18, 4)?, b"stre");
    assert_eq!(memory.read(23, 2)?, b"am");
    assert_eq!(memory.read(26, 4)?, 6u32.to_le_bytes());
    Ok(())
}

#[test]
fn fd_seek_validates_whence_and_writes_u64() -> Result<()> {
    let runtime = runtime();
    let config = ModuleConfig::new()
        .with_name("seek")
        .with_start_functions(&[])
        .with_fs(MemFs::new().with_file("file.txt", "stream"));
    let instance = instantiate(&runtime, FS_MODULE, config)?;
    let fd = open_test_file(&instance)?;

    let seek = instance.exported_function("fd_seek")?;
    // whence beyond {start, current, end} is invalid
    let result = seek.call(&[WasmValue::I32(fd as i32), WasmValue::I64(0), WasmValue::I32(3), WasmValue::I32(50)])?;
    assert_eq!(result, vec![WasmValue::I32(Errno::Inval.raw() as i32)]);

    // seek from the end; the resulting offset is written as a u64
    let result =
        seek.call(&[WasmValue::I32(fd as i32), WasmValue::I64(-2), WasmValue::I32(2), WasmValue::I32(50)])?;
    assert_eq!(result, vec![WasmValue::I32(0)]);
    let memory = instance.memory().expect("module declares a memory");
    assert_eq!(memory.read(50, 8)?, 4u64.to_le_bytes());

    // a closed descriptor is gone
    let close = instance.exported_function("fd_close")?;
    assert_eq!(close.call(&[WasmValue::I32(fd as i32)])?, vec![WasmValue::I32(0)]);
    let result = seek.call(&[WasmValue::I32(fd as i32), WasmValue::I64(0), WasmValue::I32(0), WasmValue::I32(50)])?;
    assert_eq!(result, vec![WasmValue::I32(Errno::BadF.raw() as i32)]);
    Ok(())
}

#[test]
fn missing_file_is_noent() -> Result<()> {
    let runtime = runtime();
    let config = ModuleConfig::new()
        .with_name("noent")
        .with_start_functions(&[])
        .with_fs(MemFs::new());
    let instance = instantiate(&runtime, FS_MODULE, config)?;

    let memory = instance.memory().expect("module declares a memory");
    memory.write(100, b"file.txt")?;
    let result = instance.exported_function("path_open")?.call(&[
        WasmValue::I32(3),
        WasmValue::I32(100),
        WasmValue::I32(8),
        WasmValue::I32(200),
    ])?;
    assert_eq!(result, vec![WasmValue::I32(Errno::NoEnt.raw() as i32)]);
    Ok(())
}

#[test]
fn proc_exit_surfaces_the_exit_code_and_stops_execution() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
            (global $ran (mut i32) (i32.const 0))
            (func (export "exit2") (result i32)
                (call $proc_exit (i32.const 2))
                (global.set $ran (i32.const 1))
                (global.get $ran))
            (func (export "ran") (result i32) (global.get $ran)))"#,
        ModuleConfig::new().with_name("exiting").with_start_functions(&[]),
    )?;

    let err = instance.exported_function("exit2")?.call(&[]).unwrap_err();
    match err {
        Error::Exit { module, exit_code } => {
            assert_eq!(module, "exiting");
            assert_eq!(exit_code, 2);
        }
        other => panic!("expected an exit error, got {other}"),
    }

    // the instructions after proc_exit never ran, and the module is closed
    let err = instance.exported_function("ran")?.call(&[]).unwrap_err();
    assert!(matches!(err, Error::Exit { exit_code: 2, .. }), "{err}");
    Ok(())
}

#[test]
fn clock_random_and_stdio() -> Result<()> {
    use std::sync::{Arc, Mutex};

    let captured = Arc::new(Mutex::new(Vec::new()));
    struct Capture(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let runtime = runtime();
    let config = ModuleConfig::new()
        .with_name("sysext")
        .with_start_functions(&[])
        .with_walltime(|| 1_234_567_890)
        .with_random(|buf| buf.fill(0xaa))
        .with_stdout(Capture(captured.clone()));
    let instance = instantiate(
        &runtime,
        r#"(module
            (import "wasi_snapshot_preview1" "clock_time_get"
                (func $clock_time_get (param i32 i64 i32) (result i32)))
            (import "wasi_snapshot_preview1" "random_get"
                (func $random_get (param i32 i32) (result i32)))
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 64) "hi!")
            (func (export "clock") (param i32) (result i32)
                (call $clock_time_get (i32.const 0) (i64.const 0) (local.get 0)))
            (func (export "rand") (param i32 i32) (result i32)
                (call $random_get (local.get 0) (local.get 1)))
            (func (export "say") (result i32)
                ;; one iovec pointing at the data segment
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (i32.const 3))
                (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))"#,
        config,
    )?;

    let memory = instance.memory().expect("module declares a memory");

    assert_eq!(instance.exported_function("clock")?.call(&[WasmValue::I32(32)])?, vec![WasmValue::I32(0)]);
    assert_eq!(memory.read(32, 8)?, 1_234_567_890u64.to_le_bytes());

    assert_eq!(
        instance.exported_function("rand")?.call(&[WasmValue::I32(40), WasmValue::I32(4)])?,
        vec![WasmValue::I32(0)]
    );
    assert_eq!(memory.read(40, 4)?, [0xaa; 4]);

    assert_eq!(instance.exported_function("say")?.call(&[])?, vec![WasmValue::I32(0)]);
    assert_eq!(memory.read(8, 4)?, 3u32.to_le_bytes());
    assert_eq!(&*captured.lock().unwrap(), b"hi!");
    Ok(())
}

#[test]
fn unimplemented_calls_link_and_return_nosys() -> Result<()> {
    let runtime = runtime();
    let instance = instantiate(
        &runtime,
        r#"(module
            (import "wasi_snapshot_preview1" "sched_yield" (func $sched_yield (result i32)))
            (func (export "yield") (result i32) (call $sched_yield)))"#,
        ModuleConfig::new().with_name("stubs").with_start_functions(&[]),
    )?;

    let result = instance.exported_function("yield")?.call(&[])?;
    assert_eq!(result, vec![WasmValue::I32(Errno::NoSys.raw() as i32)]);
    Ok(())
}
