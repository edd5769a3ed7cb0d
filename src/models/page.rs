//! One page of a prefix listing and the cursor for the next one.

use super::object::ObjectMetadata;
use serde::{Deserialize, Serialize};

/// Opaque cursor handed out by the backend when a listing is truncated.
///
/// The value is stored and forwarded as-is. Nothing in this crate looks
/// inside it, so any backend's encoding works.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single page of listing results, in ascending key order.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Page {
    pub entries: Vec<ObjectMetadata>,

    /// `None` on the last page.
    pub continuation_token: Option<ContinuationToken>,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.continuation_token.is_none()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }
}
