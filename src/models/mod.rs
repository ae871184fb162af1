//! Domain models for the media store.
//!
//! These entities describe stored media objects and the closed set of
//! variant encodings. They serialize naturally as JSON via `serde`.

pub mod format;
pub mod media_object;

pub use format::{NEGOTIATION_ORDER, OutputFormat};
pub use media_object::MediaObject;
