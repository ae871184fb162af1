//! Retrying facade over the object-store backend.
//!
//! Every other component reaches storage through this gateway. Transient
//! backend faults are retried with exponential backoff; permanent faults
//! abort on the first attempt. At this boundary the original cause
//! collapses to two caller-visible outcomes: `NotFound` for permanent
//! failures and `StorageFault` once retries are exhausted.

use crate::errors::{MediaError, MediaResult};
use crate::models::MediaObject;
use crate::storage::{BackendError, ByteStream, ObjectStore};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff schedule for transient storage faults.
///
/// `max_attempts` counts every try including the first; the delay before
/// retry `n` is `initial_backoff * multiplier^(n-1)`, so the defaults give
/// three attempts separated by 50ms and 100ms.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    fn delay_before_retry(&self, retry: u32) -> Duration {
        self.initial_backoff * self.multiplier.saturating_pow(retry.saturating_sub(1))
    }
}

/// The only component allowed to call the backing object store.
pub struct StorageGateway {
    backend: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl StorageGateway {
    pub fn new(backend: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Open the payload behind `key` as a stream. Retry covers opening the
    /// stream; mid-stream failures surface to the consumer as I/O errors.
    pub async fn get_stream(&self, key: &str) -> MediaResult<ByteStream> {
        self.with_retry("get", key, || self.backend.get(key)).await
    }

    /// Fetch the payload behind `key` fully into memory.
    ///
    /// Drains [`Self::get_stream`]; acceptable for this system's target
    /// file sizes but unsafe for arbitrarily large originals, which is why
    /// the engine checks the origin's size before calling this.
    pub async fn get_bytes(&self, key: &str) -> MediaResult<Bytes> {
        let mut stream = self.get_stream(key).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| {
                warn!(key, error = %err, "object read failed mid-stream");
                MediaError::NotFound(key.to_string())
            })?;
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }

    pub async fn stat(&self, key: &str) -> MediaResult<MediaObject> {
        self.with_retry("stat", key, || self.backend.stat(key)).await
    }

    pub async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: HashMap<String, String>,
    ) -> MediaResult<()> {
        self.with_retry("put", key, || {
            self.backend.put(key, bytes.clone(), metadata.clone())
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> MediaResult<()> {
        self.with_retry("delete", key, || self.backend.delete(key))
            .await
    }

    /// Run `call`, retrying transient failures per the policy.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        mut call: F,
    ) -> MediaResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, key, attempts = attempt, "storage operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_before_retry(attempt);
                    warn!(
                        operation,
                        key,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient storage fault, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        operation,
                        key,
                        attempts = attempt,
                        error = %err,
                        "storage retries exhausted"
                    );
                    return Err(MediaError::StorageFault {
                        operation,
                        key: key.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    debug!(operation, key, error = %err, "permanent storage fault");
                    return Err(MediaError::NotFound(key.to_string()));
                }
            }
        }
    }
}
