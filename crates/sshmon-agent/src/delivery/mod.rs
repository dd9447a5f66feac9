//! Bounded delivery pool
//!
//! A small set of workers drains the delivery queue and posts events to
//! the collector, one HTTP POST per event. Worker count is one per core,
//! capped at two; a slow collector backs up into the bounded queue.

mod client;

pub use client::{DeliveryError, HttpPoster, Poster};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::EventReceiver;

/// Upper bound on concurrent posts regardless of core count.
const MAX_WORKERS: usize = 2;
/// Fixed pause that lets in-flight posts finish during shutdown.
const STOP_GRACE: Duration = Duration::from_millis(500);

pub struct DeliveryPool {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl DeliveryPool {
    /// Spawn the workers: one per core, capped at [`MAX_WORKERS`].
    pub fn start(poster: Arc<dyn Poster>, events: EventReceiver) -> Self {
        let cancel = CancellationToken::new();
        let workers: Vec<_> = (0..pool_size())
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&poster),
                    events.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        info!("Started delivery pool with {} worker(s)", workers.len());
        Self { cancel, workers }
    }

    /// Signal the workers, then give in-flight posts a fixed grace
    /// period. Workers are never aborted; one stuck in a slow post is
    /// abandoned at process exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        tokio::time::sleep(STOP_GRACE).await;
        let busy = self.workers.iter().filter(|w| !w.is_finished()).count();
        if busy > 0 {
            warn!("{} delivery worker(s) still busy after {:?}", busy, STOP_GRACE);
        }
    }

    #[cfg(test)]
    fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

fn pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKERS)
}

async fn worker_loop(
    id: usize,
    poster: Arc<dyn Poster>,
    events: EventReceiver,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            payload = events.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        match poster.post(&payload).await {
            Ok(()) => debug!("Worker {} delivered event ({} bytes)", id, payload.len()),
            Err(e) => warn!("Worker {} dropping undeliverable event: {}", id, e),
        }
    }
    debug!("Delivery worker {} exited", id);
}
