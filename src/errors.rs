//! Crate-wide error type.
//!
//! Validation failures (`WrongMediaType`, `UnsupportedOperation`,
//! `LimitExceeded`, `InvalidImage`) are caller errors and terminate a
//! request immediately. Storage faults are retried inside the gateway;
//! only `NotFound` and `StorageFault` (retries exhausted) escape it.

use crate::storage::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    /// The key does not refer to an image where an image was required.
    #[error("`{0}` is not an image")]
    WrongMediaType(String),

    /// The key refers to an image whose format cannot be resized.
    #[error("resizing is not supported for `{0}`")]
    UnsupportedOperation(String),

    /// Requested width or original size is over a configured ceiling.
    #[error("{0}")]
    LimitExceeded(String),

    /// The key is absent in storage, or a storage operation failed
    /// permanently.
    #[error("`{0}` not found")]
    NotFound(String),

    /// A storage operation kept failing transiently until retries ran out.
    #[error("storage operation `{operation}` on `{key}` failed after {attempts} attempts")]
    StorageFault {
        operation: &'static str,
        key: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// The payload could not be decoded as an image.
    #[error("invalid image data: {0}")]
    InvalidImage(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// True for errors a transport should map to a bad-request class.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::WrongMediaType(_)
                | Self::UnsupportedOperation(_)
                | Self::LimitExceeded(_)
                | Self::InvalidImage(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
