//! Event envelopes delivered to the collector
//!
//! Three flat JSON objects, one per delivery. The field names are the
//! collector's contract and must not change.

use chrono::Utc;
use serde::Serialize;
use sshmon_common::TraceRecord;

/// Wall-clock nanoseconds at emit time.
fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Hostname stamped into every event; "unknown" when unresolvable.
pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A process execution captured by the kernel tracer.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEvent {
    /// Wall-clock nanoseconds at emit
    pub timestamp: i64,
    /// Always "session.command"
    pub event: &'static str,
    /// Host the command ran on
    pub hostname: String,
    /// Username resolved from the uid, "unknown" if unresolvable
    pub username: String,
    /// Effective user ID at exec time
    pub uid: u32,
    /// Audit session ID at exec time
    pub session_id: u32,
    /// Full command line, space-joined
    pub command: String,
    /// Process ID
    pub pid: u64,
    /// Parent process ID
    pub ppid: u64,
}

impl CommandEvent {
    /// Create a command event from a reassembled kernel record
    pub fn new(hostname: &str, username: String, record: &TraceRecord, command: String) -> Self {
        Self {
            timestamp: now_nanos(),
            event: "session.command",
            hostname: hostname.to_string(),
            username,
            uid: record.uid,
            session_id: record.session_id,
            command,
            pid: record.pid,
            ppid: record.ppid,
        }
    }
}

/// An accepted SSH login.
#[derive(Debug, Clone, Serialize)]
pub struct SSHStartEvent {
    /// Wall-clock nanoseconds at emit
    pub timestamp: i64,
    /// Always "session.start"
    pub event: &'static str,
    /// Host the login landed on
    pub hostname: String,
    /// Username from the log line
    pub username: String,
    /// Numeric uid for the username, -1 if unresolvable
    pub uid: i64,
    /// Source IPv4 address
    pub addr_remote: String,
    /// sshd process ID from the log line
    pub pid: i64,
    /// Audit session ID, -1 if unresolvable
    pub session_id: i64,
    /// Public key fingerprint, verbatim from the log line
    pub ssh_fingerprint: String,
}

impl SSHStartEvent {
    /// Create a session start event
    pub fn new(
        hostname: &str,
        username: &str,
        uid: i64,
        addr_remote: &str,
        pid: i64,
        session_id: i64,
        ssh_fingerprint: &str,
    ) -> Self {
        Self {
            timestamp: now_nanos(),
            event: "session.start",
            hostname: hostname.to_string(),
            username: username.to_string(),
            uid,
            addr_remote: addr_remote.to_string(),
            pid,
            session_id,
            ssh_fingerprint: ssh_fingerprint.to_string(),
        }
    }
}

/// A closed SSH session.
#[derive(Debug, Clone, Serialize)]
pub struct SSHEndEvent {
    /// Wall-clock nanoseconds at emit
    pub timestamp: i64,
    /// Always "session.end"
    pub event: &'static str,
    /// Host the session ended on
    pub hostname: String,
    /// Username from the log line
    pub username: String,
    /// Numeric uid for the username, -1 if unresolvable
    pub uid: i64,
    /// sshd process ID from the log line
    pub pid: i64,
    /// Session ID recorded at login, -1 when the login was never seen
    pub session_id: i64,
}

impl SSHEndEvent {
    /// Create a session end event
    pub fn new(hostname: &str, username: &str, uid: i64, pid: i64, session_id: i64) -> Self {
        Self {
            timestamp: now_nanos(),
            event: "session.end",
            hostname: hostname.to_string(),
            username: username.to_string(),
            uid,
            pid,
            session_id,
        }
    }
}
