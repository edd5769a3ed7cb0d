//! Object store abstraction.
//!
//! Everything interesting about listing (key order, prefix filtering, token
//! semantics) lives in the backend. This module only names the operations
//! the service needs and the errors they can surface.
//!
//! Two implementations exist:
//! - [`s3::S3Store`] talks to AWS S3 or any S3-compatible endpoint.
//! - [`memory::MemoryStore`] keeps objects in process; it backs the test
//!   suite and `--backend memory`.

pub mod memory;
pub mod s3;

use crate::models::{
    object::ObjectMetadata,
    page::{ContinuationToken, Page},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;

/// Streamed object payload, in either direction.
pub type ByteStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Where a listing call starts from.
///
/// A token already encodes the prefix and position it was issued for, so the
/// two starting points are mutually exclusive.
#[derive(Clone, Copy, Debug)]
pub enum ListCursor<'a> {
    /// Start at the first key matching the prefix (`""` matches everything).
    Prefix(&'a str),
    /// Resume where a previous page stopped.
    Token(&'a ContinuationToken),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("continuation token rejected: {0}")]
    InvalidToken(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("object store unavailable: {0}")]
    BackendUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// The client's upload stream failed before the backend saw all of it.
    pub fn upload_body(err: io::Error) -> Self {
        StoreError::InvalidArgument(format!("reading upload body: {}", err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Single-bucket object store client.
///
/// Each call is one independent request against the backend. Implementations
/// hold no request state and must be safe to share across handlers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the bucket this store is bound to.
    fn bucket(&self) -> &str;

    /// Write `body` under `key`, replacing any existing object.
    async fn put<'a>(
        &self,
        key: &str,
        content_type: Option<String>,
        body: ByteStream<'a>,
    ) -> StoreResult<()>;

    /// Open an object for streaming. Fails with `NotFound` if absent.
    async fn get(&self, key: &str) -> StoreResult<(ObjectMetadata, ByteStream<'static>)>;

    /// Fetch metadata only. Fails with `NotFound` if absent.
    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata>;

    /// Remove `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Fetch one page of at most `max_keys` entries in ascending key order.
    async fn list_page(&self, cursor: ListCursor<'_>, max_keys: usize) -> StoreResult<Page>;

    /// Create the bucket. Succeeds if it already exists and we own it.
    async fn create_bucket(&self) -> StoreResult<()>;

    /// Remove the (already emptied) bucket.
    async fn delete_bucket(&self) -> StoreResult<()>;

    /// Check that the bucket exists and is reachable with our credentials.
    async fn bucket_exists(&self) -> StoreResult<bool>;
}

#[cfg(test)]
pub(crate) fn test_body(content: &str) -> ByteStream<'static> {
    use futures::StreamExt;

    let bytes = Bytes::copy_from_slice(content.as_bytes());
    futures::stream::iter([Ok(bytes)]).boxed()
}
