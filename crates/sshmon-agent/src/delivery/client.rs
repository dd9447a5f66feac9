//! HTTP transport for serialized events
//!
//! One POST per event, JSON body. Transient failures retry with
//! doubling backoff; an event that still fails after the last attempt
//! is dropped by the caller, never requeued.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Attempts per event, counting the first.
const MAX_ATTEMPTS: u32 = 3;
/// Backoff before the second attempt; doubles each retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Per-request timeout, separate from the retry schedule.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Endpoint returned {0}")]
    Status(reqwest::StatusCode),
}

/// Transport seam for the worker pool; lets the pool run against a test
/// double instead of a live collector.
#[async_trait]
pub trait Poster: Send + Sync {
    async fn post(&self, payload: &str) -> Result<(), DeliveryError>;
}

pub struct HttpPoster {
    client: reqwest::Client,
    url: String,
}

impl HttpPoster {
    pub fn new(url: String) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(DeliveryError::Client)?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Poster for HttpPoster {
    async fn post(&self, payload: &str) -> Result<(), DeliveryError> {
        with_retry(|| async {
            let response = self
                .client
                .post(&self.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.to_owned())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(DeliveryError::Status(response.status()));
            }
            Ok(())
        })
        .await
    }
}

/// Run `op` up to [`MAX_ATTEMPTS`] times with doubling backoff between
/// attempts. The final error is the caller's to report.
async fn with_retry<F, Fut>(op: F) -> Result<(), DeliveryError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), DeliveryError>>,
{
    let mut delay = INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < MAX_ATTEMPTS => {
                debug!("Delivery attempt {} failed, retrying in {:?}: {}", attempt, delay, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
