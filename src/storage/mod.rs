//! Object-store backend boundary.
//!
//! Everything above this module reaches storage through the
//! [`StorageGateway`](crate::services::storage_gateway::StorageGateway);
//! implementations of [`ObjectStore`] never apply retry policy themselves.
//! A backend is scoped to a single bucket and must distinguish "object not
//! found" from faults, and classify faults as transient or permanent so the
//! gateway can decide whether to retry.

pub mod local;
pub mod memory;

use crate::models::MediaObject;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use thiserror::Error;

pub use local::LocalStore;
pub use memory::MemoryStore;

/// Chunked object payload. Errors surfacing mid-stream are I/O errors; the
/// retry policy only covers acquiring the stream, not consuming it.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Failure classes a backend may surface.
///
/// The retry policy treats `Timeout`, `Throttled`, `Network`, `Unavailable`
/// and `Internal` as transient; everything else aborts on the first attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The key has no object behind it.
    NotFound,
    /// The backend did not answer in time.
    Timeout,
    /// The backend asked us to slow down.
    Throttled,
    /// The connection to the backend failed.
    Network,
    /// The backend is temporarily unable to serve requests.
    Unavailable,
    /// The backend reported an internal fault.
    Internal,
    /// Anything else: malformed key, corrupt metadata, unsupported request.
    Other,
}

impl BackendErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Throttled | Self::Network | Self::Unavailable | Self::Internal
        )
    }
}

/// A classified backend failure.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(key: &str) -> Self {
        Self::new(BackendErrorKind::NotFound, format!("object `{key}` not found"))
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Bucket-scoped key-value blob store.
///
/// The contract mirrors what S3-style stores offer: stream a payload out,
/// stat metadata without touching bytes, overwrite on put (last writer
/// wins), and hard-delete. No listing, no versioning, no implicit expiry.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open the payload behind `key` as a byte stream.
    async fn get(&self, key: &str) -> BackendResult<ByteStream>;

    /// Fetch metadata for `key` without reading the payload.
    async fn stat(&self, key: &str) -> BackendResult<MediaObject>;

    /// Write `bytes` under `key`, overwriting any previous object.
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: HashMap<String, String>,
    ) -> BackendResult<()>;

    /// Remove the object behind `key`.
    async fn delete(&self, key: &str) -> BackendResult<()>;
}
