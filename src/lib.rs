//! media-store: serves media files backed by an object store, with
//! on-demand generation and caching of resized image variants.
//!
//! The crate exposes a plain function-call boundary: construct a
//! [`ResizeService`] over a [`StorageGateway`] and any [`ObjectStore`]
//! backend, and let your transport of choice adapt to it.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
pub mod storage;

pub use config::ResizeConfig;
pub use errors::{MediaError, MediaResult};
pub use models::{MediaObject, OutputFormat};
pub use services::{
    BatchResizeItem, BatchResizeOutcome, ImageResponse, ImageStreamResponse, MediaPolicy,
    ResizeHooks, ResizeService, RetryPolicy, StorageGateway,
};
pub use storage::{ByteStream, LocalStore, MemoryStore, ObjectStore};
