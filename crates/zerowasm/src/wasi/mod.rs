//! The WASI snapshot-preview1 host module.
//!
//! Host functions interact with the guest exclusively through 64-bit
//! integer arguments and the calling module's linear memory: pointers are
//! 32-bit offsets, every `offset+length` pair is bounds-checked, and each
//! call returns a WASI errno. Calls the runtime does not implement still
//! link, returning `ENOSYS`.

mod errno;
pub(crate) mod sys;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use zerowasm_types::{ValType, WasmValue};

use crate::host::{HostContext, HostFunc};
use crate::instance::ModuleInstance;
use crate::memory::MemoryInstance;
use crate::{Error, Result, Runtime};

pub use errno::Errno;
pub use sys::{DirFs, Fs, FsFile, MemFs};

/// The reserved import-module name.
pub const MODULE_NAME: &str = "wasi_snapshot_preview1";

const I32: ValType = ValType::I32;
const I64: ValType = ValType::I64;

/// Registers `wasi_snapshot_preview1` in the runtime's store so modules
/// can import it.
pub fn instantiate(runtime: &Runtime) -> Result<Arc<ModuleInstance>> {
    let mut builder = runtime.host_module(MODULE_NAME);

    builder = builder
        .with_func("args_get", &[I32, I32], &[I32], |ctx, args| {
            let argv = u32_arg(args, 0);
            let buf = u32_arg(args, 1);
            errno_result(write_string_list(ctx, &ctx.sys().args, argv, buf))
        })
        .with_func("args_sizes_get", &[I32, I32], &[I32], |ctx, args| {
            let (count, size) = ctx.sys().args_sizes();
            errno_result(write_sizes(ctx, count, size, u32_arg(args, 0), u32_arg(args, 1)))
        })
        .with_func("environ_get", &[I32, I32], &[I32], |ctx, args| {
            let environ = u32_arg(args, 0);
            let buf = u32_arg(args, 1);
            errno_result(write_string_list(ctx, &ctx.sys().environ, environ, buf))
        })
        .with_func("environ_sizes_get", &[I32, I32], &[I32], |ctx, args| {
            let (count, size) = ctx.sys().environ_sizes();
            errno_result(write_sizes(ctx, count, size, u32_arg(args, 0), u32_arg(args, 1)))
        })
        .with_func("clock_time_get", &[I32, I64, I32], &[I32], |ctx, args| {
            let result_ptr = u32_arg(args, 2);
            let now = (ctx.sys().walltime)();
            errno_result(try_mem(ctx).and_then(|mem| write_u64(mem, result_ptr, now)))
        })
        .with_func("random_get", &[I32, I32], &[I32], |ctx, args| {
            let buf = u32_arg(args, 0);
            let len = u32_arg(args, 1);
            let mut bytes = vec![0u8; len as usize];
            (ctx.sys().random)(&mut bytes);
            errno_result(try_mem(ctx).and_then(|mem| write_bytes(mem, buf, &bytes)))
        })
        .with_func("fd_close", &[I32], &[I32], |ctx, args| {
            let fd = u32_arg(args, 0);
            errno_result(fd_close(ctx, fd))
        })
        .with_func("fd_read", &[I32, I32, I32, I32], &[I32], |ctx, args| {
            errno_result(fd_read(ctx, u32_arg(args, 0), u32_arg(args, 1), u32_arg(args, 2), u32_arg(args, 3)))
        })
        .with_func("fd_seek", &[I32, I64, I32, I32], &[I32], |ctx, args| {
            let fd = u32_arg(args, 0);
            let offset = i64_arg(args, 1);
            let whence = u32_arg(args, 2);
            let result_ptr = u32_arg(args, 3);
            errno_result(fd_seek(ctx, fd, offset, whence, result_ptr))
        })
        .with_func("fd_write", &[I32, I32, I32, I32], &[I32], |ctx, args| {
            errno_result(fd_write(ctx, u32_arg(args, 0), u32_arg(args, 1), u32_arg(args, 2), u32_arg(args, 3)))
        })
        .with_func("fd_prestat_get", &[I32, I32], &[I32], |ctx, args| {
            errno_result(fd_prestat_get(ctx, u32_arg(args, 0), u32_arg(args, 1)))
        })
        .with_func("fd_prestat_dir_name", &[I32, I32, I32], &[I32], |ctx, args| {
            errno_result(fd_prestat_dir_name(ctx, u32_arg(args, 0), u32_arg(args, 1), u32_arg(args, 2)))
        })
        .with_func(
            "path_open",
            &[I32, I32, I32, I32, I32, I64, I64, I32, I32],
            &[I32],
            |ctx, args| {
                errno_result(path_open(ctx, u32_arg(args, 0), u32_arg(args, 2), u32_arg(args, 3), u32_arg(args, 8)))
            },
        )
        .with_func("proc_exit", &[I32], &[], |ctx, args| {
            let exit_code = u32_arg(args, 0);
            ctx.caller.set_closed(exit_code);
            Err(Error::Exit { module: ctx.module_name().to_string(), exit_code })
        });

    for &(name, params) in STUBS {
        builder = builder.with_host_func(stub(name, params));
    }

    builder.instantiate(runtime)
}

/// Calls without an implementation still need to link; each returns
/// `ENOSYS` with the right signature.
const STUBS: &[(&str, &[ValType])] = &[
    ("clock_res_get", &[I32, I32]),
    ("fd_advise", &[I32, I64, I64, I32]),
    ("fd_allocate", &[I32, I64, I64]),
    ("fd_datasync", &[I32]),
    ("fd_fdstat_get", &[I32, I32]),
    ("fd_fdstat_set_flags", &[I32, I32]),
    ("fd_fdstat_set_rights", &[I32, I64, I64]),
    ("fd_filestat_get", &[I32, I32]),
    ("fd_filestat_set_size", &[I32, I64]),
    ("fd_filestat_set_times", &[I32, I64, I64, I32]),
    ("fd_pread", &[I32, I32, I32, I64, I32]),
    ("fd_pwrite", &[I32, I32, I32, I64, I32]),
    ("fd_readdir", &[I32, I32, I32, I64, I32]),
    ("fd_renumber", &[I32, I32]),
    ("fd_sync", &[I32]),
    ("fd_tell", &[I32, I32]),
    ("path_create_directory", &[I32, I32, I32]),
    ("path_filestat_get", &[I32, I32, I32, I32, I32]),
    ("path_filestat_set_times", &[I32, I32, I32, I32, I64, I64, I32]),
    ("path_link", &[I32, I32, I32, I32, I32, I32, I32]),
    ("path_readlink", &[I32, I32, I32, I32, I32, I32]),
    ("path_remove_directory", &[I32, I32, I32]),
    ("path_rename", &[I32, I32, I32, I32, I32, I32]),
    ("path_symlink", &[I32, I32, I32, I32, I32]),
    ("path_unlink_file", &[I32, I32, I32]),
    ("poll_oneoff", &[I32, I32, I32, I32]),
    ("proc_raise", &[I32]),
    ("sched_yield", &[]),
    ("sock_recv", &[I32, I32, I32, I32, I32, I32]),
    ("sock_send", &[I32, I32, I32, I32, I32]),
    ("sock_shutdown", &[I32, I32]),
];

fn stub(name: &str, params: &[ValType]) -> HostFunc {
    HostFunc::new(name, params, &[I32], |_, _| Ok(vec![WasmValue::I32(Errno::NoSys.raw() as i32)]))
}

fn u32_arg(args: &[WasmValue], index: usize) -> u32 {
    match args[index] {
        WasmValue::I32(v) => v as u32,
        _ => 0,
    }
}

fn i64_arg(args: &[WasmValue], index: usize) -> i64 {
    match args[index] {
        WasmValue::I64(v) => v,
        _ => 0,
    }
}

fn errno_result(result: Result<(), Errno>) -> Result<Vec<WasmValue>> {
    let errno = match result {
        Ok(()) => Errno::Success,
        Err(errno) => errno,
    };
    Ok(vec![WasmValue::I32(errno.raw() as i32)])
}

fn try_mem<'a>(ctx: &'a HostContext<'_>) -> Result<&'a MemoryInstance, Errno> {
    ctx.memory().ok_or(Errno::Fault)
}

fn write_bytes(mem: &MemoryInstance, offset: u32, bytes: &[u8]) -> Result<(), Errno> {
    mem.write(offset as u64, bytes).map_err(|_| Errno::Fault)
}

fn read_bytes(mem: &MemoryInstance, offset: u32, len: u32) -> Result<Vec<u8>, Errno> {
    mem.read(offset as u64, len as u64).map_err(|_| Errno::Fault)
}

fn write_u32(mem: &MemoryInstance, offset: u32, value: u32) -> Result<(), Errno> {
    write_bytes(mem, offset, &value.to_le_bytes())
}

fn write_u64(mem: &MemoryInstance, offset: u32, value: u64) -> Result<(), Errno> {
    write_bytes(mem, offset, &value.to_le_bytes())
}

fn read_u32(mem: &MemoryInstance, offset: u32) -> Result<u32, Errno> {
    let bytes = read_bytes(mem, offset, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes read")))
}

/// `args_get` / `environ_get`: a vector of pointers into a packed buffer
/// of NUL-terminated strings.
fn write_string_list(
    ctx: &HostContext<'_>,
    strings: &[String],
    list_ptr: u32,
    buf_ptr: u32,
) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    let mut cursor = buf_ptr;
    for (i, entry) in strings.iter().enumerate() {
        write_u32(mem, list_ptr + 4 * i as u32, cursor)?;
        write_bytes(mem, cursor, entry.as_bytes())?;
        write_bytes(mem, cursor + entry.len() as u32, &[0])?;
        cursor += entry.len() as u32 + 1;
    }
    Ok(())
}

fn write_sizes(ctx: &HostContext<'_>, count: u32, size: u32, count_ptr: u32, size_ptr: u32) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    write_u32(mem, count_ptr, count)?;
    write_u32(mem, size_ptr, size)
}

fn fd_close(ctx: &HostContext<'_>, fd: u32) -> Result<(), Errno> {
    if fd < sys::FD_PREOPEN_START {
        return Ok(());
    }
    let mut fds = ctx.sys().fds.lock().expect("fd table mutex poisoned");
    fds.remove(fd).map(|_| ()).ok_or(Errno::BadF)
}

/// Reads each iovec in turn, stopping at end of input; `fd_read`'s result
/// is the total number of bytes scattered into memory.
fn fd_read(ctx: &HostContext<'_>, fd: u32, iovs: u32, iovs_len: u32, nread_ptr: u32) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    let sys = ctx.sys();

    let mut stdin;
    let mut fds;
    let source: &mut dyn Read = match fd {
        0 => {
            stdin = sys.stdin.lock().expect("stdin mutex poisoned");
            &mut **stdin
        }
        1 | 2 => return Err(Errno::BadF),
        _ => {
            fds = sys.fds.lock().expect("fd table mutex poisoned");
            let entry = fds.get_mut(fd).ok_or(Errno::BadF)?;
            entry.file.as_mut().ok_or(Errno::BadF)?
        }
    };

    let mut total = 0u32;
    'iovs: for i in 0..iovs_len {
        let iov = iovs + 8 * i;
        let buf_ptr = read_u32(mem, iov)?;
        let buf_len = read_u32(mem, iov + 4)?;
        mem.check_range(buf_ptr as u64, buf_len as u64).map_err(|_| Errno::Fault)?;

        let mut buf = vec![0u8; buf_len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = source.read(&mut buf[filled..]).map_err(|e| Errno::from(e.kind()))?;
            if n == 0 {
                write_bytes(mem, buf_ptr, &buf[..filled])?;
                total += filled as u32;
                break 'iovs;
            }
            filled += n;
        }
        write_bytes(mem, buf_ptr, &buf)?;
        total += filled as u32;
    }

    write_u32(mem, nread_ptr, total)
}

fn fd_write(ctx: &HostContext<'_>, fd: u32, iovs: u32, iovs_len: u32, nwritten_ptr: u32) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    let sys = ctx.sys();

    let mut stream = match fd {
        1 => sys.stdout.lock().expect("stdout mutex poisoned"),
        2 => sys.stderr.lock().expect("stderr mutex poisoned"),
        _ => return Err(Errno::BadF),
    };

    let mut total = 0u32;
    for i in 0..iovs_len {
        let iov = iovs + 8 * i;
        let buf_ptr = read_u32(mem, iov)?;
        let buf_len = read_u32(mem, iov + 4)?;
        let bytes = read_bytes(mem, buf_ptr, buf_len)?;
        stream.write_all(&bytes).map_err(|e| Errno::from(e.kind()))?;
        total += buf_len;
    }

    write_u32(mem, nwritten_ptr, total)
}

fn fd_seek(ctx: &HostContext<'_>, fd: u32, offset: i64, whence: u32, result_ptr: u32) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    let pos = match whence {
        0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return Err(Errno::Inval),
    };
    if fd < sys::FD_PREOPEN_START {
        return Err(Errno::BadF);
    }

    let mut fds = ctx.sys().fds.lock().expect("fd table mutex poisoned");
    let entry = fds.get_mut(fd).ok_or(Errno::BadF)?;
    let file = entry.file.as_mut().ok_or(Errno::BadF)?;
    let new_offset = file.seek(pos).map_err(|e| Errno::from(e.kind()))?;
    drop(fds);

    // the WASI contract represents the resulting offset as a u64
    write_u64(mem, result_ptr, new_offset)
}

fn fd_prestat_get(ctx: &HostContext<'_>, fd: u32, prestat_ptr: u32) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    let fds = ctx.sys().fds.lock().expect("fd table mutex poisoned");
    let entry = fds.get(fd).ok_or(Errno::BadF)?;
    if !entry.preopen {
        return Err(Errno::BadF);
    }
    let name_len = entry.path.len() as u32;
    drop(fds);

    // pr_type == 0 (directory), then the name length
    write_u32(mem, prestat_ptr, 0)?;
    write_u32(mem, prestat_ptr + 4, name_len)
}

fn fd_prestat_dir_name(ctx: &HostContext<'_>, fd: u32, path_ptr: u32, path_len: u32) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    let fds = ctx.sys().fds.lock().expect("fd table mutex poisoned");
    let entry = fds.get(fd).ok_or(Errno::BadF)?;
    if !entry.preopen {
        return Err(Errno::BadF);
    }
    if (path_len as usize) < entry.path.len() {
        return Err(Errno::NameTooLong);
    }
    let name = entry.path.clone();
    drop(fds);

    write_bytes(mem, path_ptr, name.as_bytes())
}

/// Opens a file for reading relative to a preopened directory, allocating
/// the next free descriptor.
fn path_open(ctx: &HostContext<'_>, dir_fd: u32, path_ptr: u32, path_len: u32, opened_fd_ptr: u32) -> Result<(), Errno> {
    let mem = try_mem(ctx)?;
    let path_bytes = read_bytes(mem, path_ptr, path_len)?;
    let path = String::from_utf8(path_bytes).map_err(|_| Errno::Inval)?;

    let mut fds = ctx.sys().fds.lock().expect("fd table mutex poisoned");
    let dir = fds.get(dir_fd).ok_or(Errno::BadF)?;
    let fs = dir.fs.clone().ok_or(Errno::BadF)?;

    let file = fs.open(&path).map_err(|e| Errno::from(e.kind()))?;
    let fd = fds.insert_next(sys::FileEntry { path, fs: Some(fs), file: Some(file), preopen: false });
    drop(fds);

    write_u32(mem, opened_fd_ptr, fd)
}
