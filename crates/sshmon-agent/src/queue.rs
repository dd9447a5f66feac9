//! Bounded delivery queue shared by the producers and the delivery pool
//!
//! Producers enqueue serialized events with a bounded wait; a full queue
//! drops the event after [`ENQUEUE_TIMEOUT`] rather than stalling the
//! kernel-record or log-tail drain loops. Drops are counted so a slow
//! collector is visible at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Mutex;
use tracing::warn;

/// How long a producer may wait on a full queue before dropping the event.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the queue. One sender handle per producer (clone it), one shared
/// receiver for the worker pool.
pub fn delivery_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = EventSender {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let receiver = EventReceiver {
        rx: Arc::new(Mutex::new(rx)),
    };
    (sender, receiver)
}

/// Producer side of the delivery queue.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Enqueue a payload, waiting at most [`ENQUEUE_TIMEOUT`] for room.
    /// On timeout the payload is dropped, logged, and counted.
    pub async fn send(&self, payload: String) {
        match self.tx.send_timeout(payload, ENQUEUE_TIMEOUT).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Failed to emit event for {:?}, giving up",
                    ENQUEUE_TIMEOUT
                );
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Delivery queue closed, dropping event");
            }
        }
    }

    /// Events dropped to backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side, shared by the pool workers. At most two workers contend
/// for the inner lock, and only around a single `recv`.
#[derive(Clone)]
pub struct EventReceiver {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl EventReceiver {
    /// Next payload; `None` once every sender is gone and the queue drained.
    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_delivers_in_order() {
        let (tx, rx) = delivery_queue(8);
        tx.send("a".to_string()).await;
        tx.send("b".to_string()).await;
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
        assert_eq!(tx.dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_after_timeout() {
        let (tx, rx) = delivery_queue(1);
        tx.send("first".to_string()).await;

        let started = Instant::now();
        tx.send("second".to_string()).await;
        assert_eq!(started.elapsed(), ENQUEUE_TIMEOUT);
        assert_eq!(tx.dropped(), 1);

        // The original entry is intact; the dropped one never arrives.
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_count_accumulates() {
        let (tx, _rx) = delivery_queue(1);
        tx.send("fills the queue".to_string()).await;
        tx.send("dropped".to_string()).await;
        tx.send("also dropped".to_string()).await;
        assert_eq!(tx.dropped(), 2);
    }
}
