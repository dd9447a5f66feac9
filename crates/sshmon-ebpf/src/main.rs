#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_task,
        bpf_get_current_uid_gid, bpf_probe_read_kernel, bpf_probe_read_user,
        bpf_probe_read_user_str_bytes,
    },
    macros::{map, tracepoint},
    maps::PerfEventArray,
    programs::TracePointContext,
};
use sshmon_common::{
    TraceRecord, ARG_FRAGMENT_LEN, COMM_LEN, END_OF_ARGS, MAX_ARG_FRAGMENTS, TRUNCATED_ARGS,
};

// ============================================================
// Kernel struct field byte offsets (Linux 6.12, from BTF)
// ============================================================
//
// Generated from: pahole -C task_struct /sys/kernel/btf/vmlinux
// These are NOT portable across kernel versions. Without CO-RE
// support in aya-ebpf, we must regenerate if the kernel changes.
//
// Build with --features arch-x86_64 or --features arch-aarch64.

#[cfg(not(any(feature = "arch-x86_64", feature = "arch-aarch64")))]
compile_error!("must enable exactly one of: arch-x86_64, arch-aarch64");

#[cfg(feature = "arch-x86_64")]
mod offsets {
    pub const TASK_TGID: usize = 1844;
    pub const TASK_REAL_PARENT: usize = 1856;
    pub const TASK_SESSIONID: usize = 2804; // CONFIG_AUDIT sessionid
}

#[cfg(feature = "arch-aarch64")]
mod offsets {
    pub const TASK_TGID: usize = 1748;
    pub const TASK_REAL_PARENT: usize = 1760;
    pub const TASK_SESSIONID: usize = 2676; // CONFIG_AUDIT sessionid
}

use offsets::*;

// sys_enter_execve tracepoint argument offsets, from
// /sys/kernel/tracing/events/syscalls/sys_enter_execve/format
const TP_FILENAME: usize = 16;
const TP_ARGV: usize = 24;

/// Read a kernel field at a fixed byte offset.
#[inline(always)]
unsafe fn read_field<T: Copy>(base: *const u8, offset: usize) -> Result<T, i64> {
    bpf_probe_read_kernel(base.add(offset) as *const T)
}

#[map]
static EVENTS: PerfEventArray<TraceRecord> = PerfEventArray::new(0);

/// One record per argv entry: the program path first, then each argument,
/// then a terminator. END_OF_ARGS when the argument list was exhausted,
/// TRUNCATED_ARGS when we hit MAX_ARG_FRAGMENTS with arguments left over.
#[tracepoint(category = "syscalls", name = "sys_enter_execve")]
pub fn sshmon_execve(ctx: TracePointContext) -> u32 {
    match unsafe { try_execve(&ctx) } {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

unsafe fn try_execve(ctx: &TracePointContext) -> Result<(), i64> {
    let task = bpf_get_current_task() as *const u8;
    let parent: *const u8 = read_field(task, TASK_REAL_PARENT)?;
    let ppid: u32 = read_field(parent, TASK_TGID)?;

    let mut record = TraceRecord {
        pid: bpf_get_current_pid_tgid() >> 32,
        ppid: ppid as u64,
        uid: bpf_get_current_uid_gid() as u32,
        session_id: read_field(task, TASK_SESSIONID).unwrap_or(u32::MAX),
        comm: bpf_get_current_comm().unwrap_or([0; COMM_LEN]),
        argv: [0; ARG_FRAGMENT_LEN],
    };

    let filename: *const u8 = ctx.read_at(TP_FILENAME)?;
    emit_user_str(ctx, &mut record, filename);

    // Once the first record is out, every exit path must emit a
    // terminator or the pending buffer for this pid never flushes.
    let argv: *const *const u8 = match ctx.read_at(TP_ARGV) {
        Ok(argv) => argv,
        Err(_) => {
            emit_sentinel(ctx, &mut record, END_OF_ARGS);
            return Ok(());
        }
    };
    for i in 1..MAX_ARG_FRAGMENTS {
        // An unreadable argv slot ends the walk the same as a null entry.
        let arg: *const u8 = bpf_probe_read_user(argv.add(i)).unwrap_or(core::ptr::null());
        if arg.is_null() {
            emit_sentinel(ctx, &mut record, END_OF_ARGS);
            return Ok(());
        }
        emit_user_str(ctx, &mut record, arg);
    }

    emit_sentinel(ctx, &mut record, TRUNCATED_ARGS);
    Ok(())
}

/// Copy a user string into the fragment buffer and emit the record.
/// A failed read still emits (with an empty fragment), matching the
/// one-record-per-argument protocol.
#[inline(always)]
unsafe fn emit_user_str(ctx: &TracePointContext, record: &mut TraceRecord, src: *const u8) {
    record.argv = [0; ARG_FRAGMENT_LEN];
    let _ = bpf_probe_read_user_str_bytes(src, &mut record.argv);
    EVENTS.output(ctx, record, 0);
}

#[inline(always)]
unsafe fn emit_sentinel(ctx: &TracePointContext, record: &mut TraceRecord, sentinel: &str) {
    record.argv = [0; ARG_FRAGMENT_LEN];
    let bytes = sentinel.as_bytes();
    record.argv[..bytes.len()].copy_from_slice(bytes);
    EVENTS.output(ctx, record, 0);
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
