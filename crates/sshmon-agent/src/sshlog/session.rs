//! Live SSH session state
//!
//! The tail loop is the only writer, so the pid map needs no locking.
//! Session ids come from `/proc/<pid>/sessionid`, which the kernel may
//! not have populated yet when the login line lands in the log; the
//! resolver retries briefly before giving up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::User;
use tokio::time::sleep;
use tracing::debug;

/// Value the kernel reports while audit has not assigned a session yet.
const SESSION_UNSET: u32 = 4_294_967_295;
/// Total reads of the pseudo-file before giving up on an unset session.
const RESOLVE_ATTEMPTS: u32 = 5;
/// Pause between reads while the session stays unset.
const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(10);

pub(crate) struct SessionTracker {
    proc_root: PathBuf,
    sessions: HashMap<String, i64>,
}

impl SessionTracker {
    pub(crate) fn new() -> Self {
        Self::with_proc_root(PathBuf::from("/proc"))
    }

    pub(crate) fn with_proc_root(proc_root: PathBuf) -> Self {
        Self {
            proc_root,
            sessions: HashMap::new(),
        }
    }

    /// Resolve the audit session id for a pid.
    ///
    /// An unreadable or unparsable pseudo-file means the pid is gone or
    /// audit is absent, and resolves to -1 immediately. The unset
    /// sentinel is a race with the kernel instead, so that case re-reads
    /// a few times before settling on -1.
    pub(crate) async fn resolve(&self, pid: &str) -> i64 {
        let path = self.proc_root.join(pid).join("sessionid");
        for attempt in 1..=RESOLVE_ATTEMPTS {
            let value = match std::fs::read_to_string(&path) {
                Ok(text) => match text.trim().parse::<u32>() {
                    Ok(value) => value,
                    Err(_) => return -1,
                },
                Err(_) => return -1,
            };
            if value != SESSION_UNSET {
                return i64::from(value);
            }
            debug!("Session ID for PID {} not assigned yet (attempt {})", pid, attempt);
            if attempt < RESOLVE_ATTEMPTS {
                sleep(RESOLVE_RETRY_DELAY).await;
            }
        }
        -1
    }

    /// Record a login. Pids get reused; the newest login wins.
    pub(crate) fn insert(&mut self, pid: String, session_id: i64) {
        self.sessions.insert(pid, session_id);
    }

    /// Remove a session on logout and return its id. A pid that was
    /// never seen logging in resolves to -1 and leaves the map alone.
    pub(crate) fn remove(&mut self, pid: &str) -> i64 {
        self.sessions.remove(pid).unwrap_or(-1)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, pid: &str) -> bool {
        self.sessions.contains_key(pid)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Numeric uid for a username from the system user database, or -1 when
/// the user is unknown or the lookup fails.
pub(crate) fn uid_for_username(username: &str) -> i64 {
    match User::from_name(username) {
        Ok(Some(user)) => i64::from(user.uid.as_raw()),
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn tracker_with(pid: &str, contents: &str) -> (TempDir, SessionTracker) {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(pid)).unwrap();
        fs::write(dir.path().join(pid).join("sessionid"), contents).unwrap();
        let tracker = SessionTracker::with_proc_root(dir.path().to_path_buf());
        (dir, tracker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_value_resolves_on_first_read() {
        let (_dir, tracker) = tracker_with("8751", "42\n");
        let started = Instant::now();
        assert_eq!(tracker.resolve("8751").await, 42);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_missing_pid_resolves_unknown_immediately() {
        let dir = TempDir::new().unwrap();
        let tracker = SessionTracker::with_proc_root(dir.path().to_path_buf());
        assert_eq!(tracker.resolve("1").await, -1);
    }

    #[tokio::test]
    async fn test_unparsable_value_resolves_unknown_immediately() {
        let (_dir, tracker) = tracker_with("77", "not a number\n");
        assert_eq!(tracker.resolve("77").await, -1);
    }

    #[tokio::test]
    async fn test_negative_value_is_unparsable() {
        let (_dir, tracker) = tracker_with("78", "-5\n");
        assert_eq!(tracker.resolve("78").await, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_sentinel_retries_five_times_then_gives_up() {
        let (_dir, tracker) = tracker_with("90", "4294967295\n");
        let started = Instant::now();
        assert_eq!(tracker.resolve("90").await, -1);
        // five reads separated by four 10 ms pauses
        assert_eq!(started.elapsed(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_sentinel_resolves_once_assigned() {
        let (dir, tracker) = tracker_with("91", "4294967295\n");
        let path = dir.path().join("91").join("sessionid");
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(15)).await;
            fs::write(&path, "7\n").unwrap();
        });
        assert_eq!(tracker.resolve("91").await, 7);
        writer.await.unwrap();
    }

    #[test]
    fn test_login_then_logout_sequencing() {
        let mut tracker = SessionTracker::with_proc_root(PathBuf::from("/nonexistent"));
        tracker.insert("8751".to_string(), 42);
        assert!(tracker.contains("8751"));
        assert_eq!(tracker.remove("8751"), 42);
        assert!(!tracker.contains("8751"));
    }

    #[test]
    fn test_logout_without_login_leaves_map_untouched() {
        let mut tracker = SessionTracker::with_proc_root(PathBuf::from("/nonexistent"));
        tracker.insert("1".to_string(), 10);
        assert_eq!(tracker.remove("999"), -1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.contains("1"));
    }

    #[test]
    fn test_newest_login_wins_on_pid_reuse() {
        let mut tracker = SessionTracker::with_proc_root(PathBuf::from("/nonexistent"));
        tracker.insert("50".to_string(), 7);
        tracker.insert("50".to_string(), 9);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.remove("50"), 9);
    }

    #[test]
    fn test_unknown_username_resolves_negative() {
        assert_eq!(uid_for_username("nosuchusersshmon"), -1);
    }

    #[test]
    fn test_root_resolves_to_uid_zero() {
        assert_eq!(uid_for_username("root"), 0);
    }
}
