#![cfg_attr(not(feature = "userspace"), no_std)]

/// Length of the fixed argv fragment carried by each trace record.
pub const ARG_FRAGMENT_LEN: usize = 128;

/// Length of the fixed comm field (kernel TASK_COMM_LEN).
pub const COMM_LEN: usize = 16;

/// How many fragments the kernel program collects per exec before it
/// gives up and reports the argument list as truncated.
pub const MAX_ARG_FRAGMENTS: usize = 10;

/// Terminator fragment: every observed argument was captured.
pub const END_OF_ARGS: &str = "....";

/// Terminator fragment: the process passed more arguments than
/// MAX_ARG_FRAGMENTS and the tail was dropped.
pub const TRUNCATED_ARGS: &str = "...";

/// One exec trace fragment, written by the eBPF program and read by
/// userspace. The kernel emits one record per argument (the first carries
/// the program path, the last a terminator sentinel), all sharing the pid.
/// Layout is read back byte-for-byte, host endian; field order and widths
/// must not change.
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "userspace", derive(Debug))]
pub struct TraceRecord {
    /// Process ID (tgid in kernel terms)
    pub pid: u64,
    /// Parent process ID
    pub ppid: u64,
    /// Effective user ID
    pub uid: u32,
    /// Audit session ID at exec time
    pub session_id: u32,
    /// Process name, null-terminated
    pub comm: [u8; COMM_LEN],
    /// One argument (or sentinel), null-terminated
    pub argv: [u8; ARG_FRAGMENT_LEN],
}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TraceRecord {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_is_stable() {
        // 8 + 8 + 4 + 4 + 16 + 128, no padding
        assert_eq!(core::mem::size_of::<TraceRecord>(), 168);
        assert_eq!(core::mem::align_of::<TraceRecord>(), 8);
    }
}
