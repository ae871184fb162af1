//! Represents a media object stored in the backing object store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata for a single stored object, addressed by its key.
///
/// Keys are path-like, "/"-separated strings with no leading slash. The
/// struct carries metadata only, never the content bytes. An object is
/// immutable once written except by explicit overwrite; its lifecycle is
/// owned entirely by the backing store.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MediaObject {
    /// Object key within the configured bucket.
    pub key: String,

    /// Size of the payload in bytes.
    pub size: u64,

    /// Timestamp of the last write to this key.
    pub last_modified: DateTime<Utc>,

    /// Opaque identifier assigned by the backing store.
    pub storage_id: String,

    /// Free-form string metadata attached at write time.
    pub metadata: HashMap<String, String>,
}
