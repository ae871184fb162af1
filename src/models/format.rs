//! Output encodings the resize pipeline can produce.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of variant encodings.
///
/// `Original` keeps the source encoding untouched; the other three transcode
/// at a fixed quality. When more than one format is acceptable to a client,
/// negotiation prefers avif > webp > jpeg > original.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Original,
    Jpeg,
    Webp,
    Avif,
}

/// Negotiation priority, highest first. `Original` is the implicit fallback.
pub const NEGOTIATION_ORDER: [OutputFormat; 3] =
    [OutputFormat::Avif, OutputFormat::Webp, OutputFormat::Jpeg];

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
            Self::Avif => "avif",
        }
    }

    /// Parse a caller-supplied format name. Case-insensitive; `jpg` is
    /// accepted as an alias for `jpeg`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "original" => Some(Self::Original),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            _ => None,
        }
    }

    /// File extension a variant in this format is stored under.
    /// `Original` keeps the source extension.
    pub fn extension(self, original_ext: &str) -> String {
        match self {
            Self::Original => original_ext.to_ascii_lowercase(),
            Self::Jpeg => "jpg".into(),
            Self::Webp => "webp".into(),
            Self::Avif => "avif".into(),
        }
    }

    /// The `Accept` media type that selects this format during negotiation.
    pub fn accept_token(self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::Jpeg => Some("image/jpeg"),
            Self::Webp => Some("image/webp"),
            Self::Avif => Some("image/avif"),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
