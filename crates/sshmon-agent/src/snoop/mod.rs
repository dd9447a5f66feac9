//! Kernel capture & reassembly engine
//!
//! Attaches an eBPF tracepoint to the process-creation syscall, drains
//! the per-CPU perf buffers, and reassembles the per-argument record
//! stream into complete command events. Reassembly runs on exactly one
//! task; the per-CPU readers only decode and forward.

mod assembler;
mod probe;

use std::path::Path;
use std::time::Duration;

use sshmon_common::TraceRecord;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::EventSender;
use assembler::ArgvAssembler;
use probe::ExecProbe;

/// Grace period for the tracer to wind down on stop.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

/// Capacity of the record channel between the per-CPU readers and the
/// reassembly consumer.
const RECORD_CHANNEL: usize = 1024;

/// Errors starting the capture engine. All of them are fatal to the
/// process: without the probe attached there is nothing to capture.
#[derive(Error, Debug)]
pub enum SnoopError {
    #[error("Failed to load BPF program: {0}")]
    Load(String),
    #[error("Failed to attach BPF program: {0}")]
    Attach(String),
    #[error("Perf buffer error: {0}")]
    PerfBuffer(String),
}

/// The capture engine: an attached probe plus the single reassembly
/// consumer draining its records.
pub struct ExecSnoop {
    cancel: CancellationToken,
    probe: Option<ExecProbe>,
    consumer: Option<JoinHandle<()>>,
}

impl ExecSnoop {
    /// Load and attach the tracer, then start the reassembly consumer.
    pub fn start(object: &Path, hostname: String, queue: EventSender) -> Result<Self, SnoopError> {
        let cancel = CancellationToken::new();
        let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL);

        let probe = ExecProbe::start(object, record_tx, cancel.clone())?;
        let consumer = tokio::spawn(consume(record_rx, hostname, queue, cancel.clone()));

        info!("Started exec tracer on syscalls:sys_enter_execve");
        Ok(Self {
            cancel,
            probe: Some(probe),
            consumer: Some(consumer),
        })
    }

    /// Stop the record stream and detach the probe, waiting at most
    /// [`STOP_GRACE`]; shutdown proceeds regardless.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let probe = self.probe.take();
        let consumer = self.consumer.take();
        let wind_down = async {
            if let Some(probe) = probe {
                probe.stop().await;
            }
            if let Some(consumer) = consumer {
                let _ = consumer.await;
            }
        };
        if timeout(STOP_GRACE, wind_down).await.is_err() {
            warn!("Exec tracer failed to stop gracefully within {:?}", STOP_GRACE);
        }
    }
}

/// Single sequential consumer: the only task that touches the pending
/// argv buffer. Serialize failures drop the event and keep the loop
/// alive; a full queue is handled (and bounded) by the sender.
async fn consume(
    mut records: mpsc::Receiver<TraceRecord>,
    hostname: String,
    queue: EventSender,
    cancel: CancellationToken,
) {
    let mut assembler = ArgvAssembler::new(hostname);
    loop {
        let record = tokio::select! {
            next = records.recv() => match next {
                Some(record) => record,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        if let Some(event) = assembler.push(&record) {
            match serde_json::to_string(&event) {
                Ok(payload) => queue.send(payload).await,
                Err(e) => warn!("Failed to serialize command event: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::delivery_queue;
    use sshmon_common::END_OF_ARGS;

    fn record(pid: u64, fragment: &str) -> TraceRecord {
        let mut argv = [0u8; 128];
        argv[..fragment.len()].copy_from_slice(fragment.as_bytes());
        TraceRecord {
            pid,
            ppid: 1,
            uid: 0xffff_fffe,
            session_id: 3,
            comm: [0; 16],
            argv,
        }
    }

    #[tokio::test]
    async fn test_consumer_reassembles_and_enqueues() {
        let (event_tx, event_rx) = delivery_queue(16);
        let (record_tx, record_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(
            record_rx,
            "host1".to_string(),
            event_tx,
            cancel.clone(),
        ));

        record_tx.send(record(7, "/usr/bin/uptime")).await.unwrap();
        record_tx.send(record(7, END_OF_ARGS)).await.unwrap();

        let payload = event_rx.recv().await.expect("event");
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["event"], "session.command");
        assert_eq!(value["command"], "/usr/bin/uptime");
        assert_eq!(value["pid"], 7);
        assert_eq!(value["session_id"], 3);

        cancel.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_exits_when_readers_hang_up() {
        let (event_tx, _event_rx) = delivery_queue(16);
        let (record_tx, record_rx) = mpsc::channel::<TraceRecord>(16);
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(record_rx, "host1".to_string(), event_tx, cancel));

        drop(record_tx);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_consumer_exits_on_cancel() {
        let (event_tx, _event_rx) = delivery_queue(16);
        let (_record_tx, record_rx) = mpsc::channel::<TraceRecord>(16);
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(consume(
            record_rx,
            "host1".to_string(),
            event_tx,
            cancel.clone(),
        ));

        cancel.cancel();
        consumer.await.unwrap();
    }
}
