//! Argv reassembly for kernel exec records
//!
//! The kernel emits one record per argument; fragments for a pid are
//! buffered here until a terminator arrives, then flushed as a single
//! [`CommandEvent`]. Exactly one task may own an assembler: the pending
//! buffer is unsynchronized by construction.

use std::collections::HashMap;

use nix::unistd::{Uid, User};
use sshmon_common::{TraceRecord, END_OF_ARGS, TRUNCATED_ARGS};
use tracing::debug;

use crate::events::CommandEvent;

pub(crate) struct ArgvAssembler {
    hostname: String,
    pending: HashMap<u64, Vec<String>>,
}

impl ArgvAssembler {
    pub(crate) fn new(hostname: String) -> Self {
        Self {
            hostname,
            pending: HashMap::new(),
        }
    }

    /// Feed one record. Returns the finished event when the record carries
    /// a terminator sentinel; the sentinel text itself is never part of the
    /// command, truncated or not.
    pub(crate) fn push(&mut self, record: &TraceRecord) -> Option<CommandEvent> {
        let fragment = cstr_to_string(&record.argv);
        match fragment.as_str() {
            END_OF_ARGS | TRUNCATED_ARGS => {
                let args = self.pending.remove(&record.pid).unwrap_or_else(|| {
                    debug!("Terminator for PID {} with no pending fragments", record.pid);
                    Vec::new()
                });
                debug!(
                    "Exec captured: {} (PID: {})",
                    cstr_to_string(&record.comm),
                    record.pid
                );
                let username = username_for_uid(record.uid);
                Some(CommandEvent::new(
                    &self.hostname,
                    username,
                    record,
                    args.join(" "),
                ))
            }
            _ => {
                self.pending.entry(record.pid).or_default().push(fragment);
                None
            }
        }
    }

    #[cfg(test)]
    fn pending_pids(&self) -> usize {
        self.pending.len()
    }
}

/// Convert null-terminated C string bytes to a Rust String.
pub(crate) fn cstr_to_string(bytes: &[u8]) -> String {
    let nul_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..nul_pos]).to_string()
}

/// Resolve a username from the system user database; "unknown" when the
/// uid has no entry or the lookup fails.
fn username_for_uid(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No real system assigns uids this high; forces the "unknown" path.
    const NO_SUCH_UID: u32 = 0xffff_fffe;

    fn record(pid: u64, fragment: &str) -> TraceRecord {
        let mut argv = [0u8; 128];
        argv[..fragment.len()].copy_from_slice(fragment.as_bytes());
        let mut comm = [0u8; 16];
        comm[..4].copy_from_slice(b"bash");
        TraceRecord {
            pid,
            ppid: 1,
            uid: NO_SUCH_UID,
            session_id: 5,
            comm,
            argv,
        }
    }

    #[test]
    fn test_exact_terminator_flushes_space_joined() {
        let mut assembler = ArgvAssembler::new("host1".to_string());
        assert!(assembler.push(&record(100, "/bin/ls")).is_none());
        assert!(assembler.push(&record(100, "-la")).is_none());
        assert!(assembler.push(&record(100, "/tmp")).is_none());

        let event = assembler.push(&record(100, END_OF_ARGS)).expect("flush");
        assert_eq!(event.command, "/bin/ls -la /tmp");
        assert_eq!(event.pid, 100);
        assert_eq!(event.session_id, 5);
        assert_eq!(assembler.pending_pids(), 0);
    }

    #[test]
    fn test_truncated_terminator_excludes_sentinel() {
        let mut assembler = ArgvAssembler::new("host1".to_string());
        assembler.push(&record(200, "/usr/bin/find"));
        assembler.push(&record(200, "/"));

        let event = assembler.push(&record(200, TRUNCATED_ARGS)).expect("flush");
        assert_eq!(event.command, "/usr/bin/find /");
        assert_eq!(assembler.pending_pids(), 0);
    }

    #[test]
    fn test_terminator_without_fragments_emits_empty_command() {
        let mut assembler = ArgvAssembler::new("host1".to_string());
        let event = assembler.push(&record(300, END_OF_ARGS)).expect("flush");
        assert_eq!(event.command, "");
    }

    #[test]
    fn test_fragments_stay_pending_until_terminated() {
        let mut assembler = ArgvAssembler::new("host1".to_string());
        assert!(assembler.push(&record(400, "/bin/true")).is_none());
        assert_eq!(assembler.pending_pids(), 1);
    }

    #[test]
    fn test_interleaved_pids_do_not_mix() {
        let mut assembler = ArgvAssembler::new("host1".to_string());
        assembler.push(&record(1, "/bin/echo"));
        assembler.push(&record(2, "/bin/cat"));
        assembler.push(&record(1, "one"));
        assembler.push(&record(2, "/etc/hosts"));

        let second = assembler.push(&record(2, END_OF_ARGS)).expect("flush 2");
        assert_eq!(second.command, "/bin/cat /etc/hosts");

        let first = assembler.push(&record(1, END_OF_ARGS)).expect("flush 1");
        assert_eq!(first.command, "/bin/echo one");
    }

    #[test]
    fn test_unresolvable_uid_becomes_unknown() {
        let mut assembler = ArgvAssembler::new("host1".to_string());
        assembler.push(&record(500, "/bin/id"));
        let event = assembler.push(&record(500, END_OF_ARGS)).expect("flush");
        assert_eq!(event.username, "unknown");
    }

    #[test]
    fn test_resolves_known_uid() {
        assert_eq!(username_for_uid(0), "root");
    }

    #[test]
    fn test_cstr_to_string() {
        assert_eq!(cstr_to_string(b"hello\0world"), "hello");
        assert_eq!(cstr_to_string(b"no terminator"), "no terminator");
        assert_eq!(cstr_to_string(b"\0"), "");
    }
}
