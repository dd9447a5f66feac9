//! SSH auth log watcher
//!
//! Tails the sshd auth log from its current end, matches login and
//! logout lines, correlates them with kernel audit session ids, and
//! emits session start/end events. The pid map lives entirely inside
//! the tail task; no other task ever touches it.

mod parser;
mod session;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{SSHEndEvent, SSHStartEvent};
use crate::queue::EventSender;
use parser::{AuthLine, LineParser};
use session::{uid_for_username, SessionTracker};

/// Grace period for the tail loop to acknowledge a stop request.
pub const STOP_GRACE: Duration = Duration::from_secs(5);
/// How often the tail loop checks the log for growth.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to start tailing {}: {source}", .path.display())]
    Start {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to the running watcher. Stopping is a two-phase handshake:
/// request cancellation, then wait (bounded) for the loop to confirm.
pub struct LogWatcher {
    cancel: CancellationToken,
    stopped: oneshot::Receiver<()>,
}

impl LogWatcher {
    /// Open the log and start tailing from its current end. Lines
    /// already in the file are never replayed.
    pub async fn start(
        path: &Path,
        hostname: String,
        queue: EventSender,
    ) -> Result<Self, WatchError> {
        let mut file = File::open(path).await.map_err(|e| WatchError::Start {
            path: path.to_path_buf(),
            source: e,
        })?;
        let offset = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| WatchError::Start {
                path: path.to_path_buf(),
                source: e,
            })?;
        drop(file);

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(tail_loop(
            path.to_path_buf(),
            offset,
            hostname,
            queue,
            cancel.clone(),
            done_tx,
        ));

        info!("Started SSH log watcher on {}", path.display());
        Ok(Self {
            cancel,
            stopped: done_rx,
        })
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if timeout(STOP_GRACE, self.stopped).await.is_err() {
            warn!(
                "SSH log watcher failed to stop gracefully within {:?}",
                STOP_GRACE
            );
        }
    }
}

async fn tail_loop(
    path: PathBuf,
    mut offset: u64,
    hostname: String,
    queue: EventSender,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
) {
    let parser = LineParser::new();
    let mut tracker = SessionTracker::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }

        offset = match drain_new_lines(&path, offset, &parser, &mut tracker, &hostname, &queue)
            .await
        {
            Ok(next) => next,
            Err(e) => {
                // Rotation can make the file vanish briefly; keep the
                // offset and let the shrink check sort it out on reopen.
                debug!("Auth log unavailable: {}", e);
                offset
            }
        };
    }

    debug!("SSH log watcher loop exited");
    let _ = done.send(());
}

/// Read any newly appended complete lines and handle them, returning the
/// next read offset. The offset only ever advances past a final newline,
/// so a line the writer has not finished stays put for the next poll. A
/// shrunken file means truncation or rotation and reading restarts from
/// the top.
async fn drain_new_lines(
    path: &Path,
    mut offset: u64,
    parser: &LineParser,
    tracker: &mut SessionTracker,
    hostname: &str,
    queue: &EventSender,
) -> std::io::Result<u64> {
    let len = tokio::fs::metadata(path).await?.len();
    if len < offset {
        info!("Auth log {} truncated, restarting from the top", path.display());
        offset = 0;
    }
    if len == offset {
        return Ok(offset);
    }

    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut chunk = Vec::with_capacity((len - offset) as usize);
    file.take(len - offset).read_to_end(&mut chunk).await?;

    let Some(last_newline) = chunk.iter().rposition(|&b| b == b'\n') else {
        return Ok(offset);
    };
    let text = String::from_utf8_lossy(&chunk[..last_newline]);
    for line in text.lines() {
        handle_line(line, parser, tracker, hostname, queue).await;
    }
    Ok(offset + last_newline as u64 + 1)
}

/// Handle one complete log line. For logins the map is updated before
/// the event is enqueued, so any command captured afterwards sees the
/// session.
async fn handle_line(
    line: &str,
    parser: &LineParser,
    tracker: &mut SessionTracker,
    hostname: &str,
    queue: &EventSender,
) {
    match parser.parse(line) {
        Some(AuthLine::Login(login)) => {
            let session_id = tracker.resolve(&login.pid).await;
            tracker.insert(login.pid.clone(), session_id);
            debug!(
                "SSH login accepted for {} from {}:{} (PID: {}, session: {})",
                login.username, login.addr, login.port, login.pid, session_id
            );
            let event = SSHStartEvent::new(
                hostname,
                &login.username,
                uid_for_username(&login.username),
                &login.addr,
                parse_pid(&login.pid),
                session_id,
                &login.fingerprint,
            );
            enqueue(&event, queue).await;
        }
        Some(AuthLine::Logout(logout)) => {
            let session_id = tracker.remove(&logout.pid);
            debug!(
                "SSH session closed for {} (PID: {}, session: {})",
                logout.username, logout.pid, session_id
            );
            let event = SSHEndEvent::new(
                hostname,
                &logout.username,
                uid_for_username(&logout.username),
                parse_pid(&logout.pid),
                session_id,
            );
            enqueue(&event, queue).await;
        }
        None => {}
    }
}

fn parse_pid(pid: &str) -> i64 {
    pid.parse().unwrap_or(-1)
}

async fn enqueue<T: serde::Serialize>(event: &T, queue: &EventSender) {
    match serde_json::to_string(event) {
        Ok(payload) => queue.send(payload).await,
        Err(e) => warn!("Failed to serialize session event: {}", e),
    }
}
