//! Represents an object (file) stored in the bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata snapshot of a single object, as reported by the backend.
///
/// The key is a slash-delimited path such as `photos/2025/img.jpg`. Keys are
/// not validated locally; the backend decides what it accepts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Timestamp when the object was last written.
    pub last_modified: DateTime<Utc>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Content type (MIME type). Only metadata fetches report it; listings don't.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}
