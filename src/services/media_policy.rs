//! Naming and classification policy: pure functions over file names and
//! configuration. No I/O happens here.

use crate::config::ResizeConfig;
use crate::errors::{MediaError, MediaResult};
use crate::models::OutputFormat;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Extensions the engine treats as images at all.
const IMAGE_EXTENSIONS: [&str; 11] = [
    "jpg", "jpeg", "png", "gif", "webp", "avif", "bmp", "tif", "tiff", "svg", "ico",
];

/// Strict subset of [`IMAGE_EXTENSIONS`] that the resize pipeline accepts.
/// Vector (`svg`) and icon (`ico`) formats are images but not resizable.
const RESIZABLE_EXTENSIONS: [&str; 9] = [
    "jpg", "jpeg", "png", "gif", "webp", "avif", "bmp", "tif", "tiff",
];

/// Naming, classification and limit checks for the resize engine.
#[derive(Clone, Debug)]
pub struct MediaPolicy {
    config: Arc<ResizeConfig>,
}

impl MediaPolicy {
    pub fn new(config: Arc<ResizeConfig>) -> Self {
        Self { config }
    }

    /// Lowercased extension of the file name component of `key`, if any.
    pub fn extension(key: &str) -> Option<String> {
        let file = key.rsplit('/').next().unwrap_or(key);
        match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                Some(ext.to_ascii_lowercase())
            }
            _ => None,
        }
    }

    pub fn is_image(key: &str) -> bool {
        Self::extension(key)
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    pub fn is_resizable(key: &str) -> bool {
        Self::extension(key)
            .map(|ext| RESIZABLE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// MIME type for a file extension. Case-insensitive; unknown
    /// extensions fall back to `application/octet-stream`.
    pub fn mime_type(extension: &str) -> String {
        mime_guess::from_ext(extension)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    /// Deterministic variant key for `(original, width, output extension)`.
    ///
    /// The directory component is preserved, the base name is suffixed with
    /// `-{width}` and the extension replaced. Two calls with identical
    /// inputs always yield the same key; this is the cache-addressing
    /// invariant.
    pub fn variant_key(original: &str, width: u32, output_extension: &str) -> String {
        let (dir, file) = match original.rsplit_once('/') {
            Some((dir, file)) => (Some(dir), file),
            None => (None, original),
        };
        let stem = match file.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => file,
        };
        match dir {
            Some(dir) => format!("{dir}/{stem}-{width}.{output_extension}"),
            None => format!("{stem}-{width}.{output_extension}"),
        }
    }

    /// Reject files the resize pipeline cannot process, distinguishing
    /// non-images from images in non-resizable formats.
    pub fn validate_resizable(&self, key: &str) -> MediaResult<()> {
        if Self::is_resizable(key) {
            return Ok(());
        }
        if Self::is_image(key) {
            Err(MediaError::UnsupportedOperation(key.to_string()))
        } else {
            Err(MediaError::WrongMediaType(key.to_string()))
        }
    }

    /// Reject widths above the configured ceiling.
    pub fn validate_width(&self, width: u32) -> MediaResult<()> {
        if width > self.config.max_resize_width {
            return Err(MediaError::LimitExceeded(format!(
                "requested width {width} exceeds the maximum of {}",
                self.config.max_resize_width
            )));
        }
        Ok(())
    }

    /// ETag derived from object metadata, for responses that never touch
    /// the payload bytes. Quoted lowercase hex, stable for fixed inputs.
    pub fn metadata_etag(key: &str, last_modified: DateTime<Utc>, size: u64) -> String {
        let digest = md5::compute(format!(
            "{key}:{}:{size}",
            last_modified.timestamp_millis()
        ));
        format!("\"{digest:x}\"")
    }

    /// ETag derived from content bytes, for freshly generated variants.
    pub fn content_etag(bytes: &[u8]) -> String {
        format!("\"{:x}\"", md5::compute(bytes))
    }

    /// ETag for streaming-resize responses, derived from the request
    /// parameters plus the origin's stat rather than from content. The
    /// asymmetry with [`Self::content_etag`] is intentional and relied on
    /// by callers.
    pub fn request_etag(
        key: &str,
        width: u32,
        format: OutputFormat,
        last_modified: DateTime<Utc>,
        size: u64,
    ) -> String {
        let digest = md5::compute(format!(
            "{key}:{width}:{format}:{}:{size}",
            last_modified.timestamp_millis()
        ));
        format!("\"{digest:x}\"")
    }

    pub fn prevent_upscale(&self) -> bool {
        self.config.auto_prevent_upscale
    }

    pub fn max_width(&self) -> u32 {
        self.config.max_resize_width
    }
}
