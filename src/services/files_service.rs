//! src/services/files_service.rs
//!
//! FilesService — the files API on top of a single-bucket object store.
//!
//! The interesting part is the listing contract: one request maps to exactly
//! one backend page, page sizes are bounds-checked before the backend sees
//! them, and continuation tokens are forwarded without being looked at.
//! Everything else is a thin passthrough to [`ObjectStore`].

use crate::{
    models::{
        object::ObjectMetadata,
        page::{ContinuationToken, Page},
    },
    store::{ByteStream, ListCursor, ObjectStore, StoreError, StoreResult},
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Page size used when the client does not ask for one.
pub const DEFAULT_MAX_KEYS: i64 = 100;

/// Largest page S3's ListObjectsV2 will return.
pub const MAX_KEYS_LIMIT: i64 = 1000;

/// A logical "list files" request.
#[derive(Clone, Debug)]
pub struct ListFilesParams {
    /// Literal key prefix; ignored when a continuation token is present.
    pub prefix: String,
    pub max_keys: i64,
    pub continuation_token: Option<ContinuationToken>,
}

impl Default for ListFilesParams {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            max_keys: DEFAULT_MAX_KEYS,
            continuation_token: None,
        }
    }
}

/// FilesService provides the operations behind the HTTP surface:
/// - Upload, download, inspect and delete single objects
/// - List objects one page at a time
/// - Create and tear down the bucket itself
///
/// It holds no state besides the store handle, so cloning it per request is
/// cheap and every call is independent of every other.
#[derive(Clone)]
pub struct FilesService {
    store: Arc<dyn ObjectStore>,
}

impl FilesService {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn bucket(&self) -> &str {
        self.store.bucket()
    }

    /// List one page of files.
    ///
    /// A continuation token, when present, is the only thing that decides
    /// where the page starts; the prefix it was issued for is already baked
    /// into it.
    pub async fn list_files(&self, params: ListFilesParams) -> StoreResult<Page> {
        match params.continuation_token {
            Some(token) => self.list_next_page(&token, params.max_keys).await,
            None => self.list_first_page(&params.prefix, params.max_keys).await,
        }
    }

    /// First page of keys starting with `prefix` (`""` for all keys).
    #[instrument(skip(self))]
    pub async fn list_first_page(&self, prefix: &str, max_keys: i64) -> StoreResult<Page> {
        let max_keys = validate_max_keys(max_keys)?;
        let page = self
            .store
            .list_page(ListCursor::Prefix(prefix), max_keys)
            .await?;
        debug!(
            entries = page.entries.len(),
            has_more = !page.is_last(),
            "listed first page"
        );
        Ok(page)
    }

    /// Page following the one that produced `token`.
    ///
    /// A token the backend no longer accepts surfaces as `InvalidToken`.
    #[instrument(skip(self, token))]
    pub async fn list_next_page(
        &self,
        token: &ContinuationToken,
        max_keys: i64,
    ) -> StoreResult<Page> {
        let max_keys = validate_max_keys(max_keys)?;
        let page = self
            .store
            .list_page(ListCursor::Token(token), max_keys)
            .await?;
        debug!(
            entries = page.entries.len(),
            has_more = !page.is_last(),
            "listed next page"
        );
        Ok(page)
    }

    /// Every key under `prefix`, following tokens until the listing ends.
    pub async fn list_all_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut page = self.list_first_page(prefix, MAX_KEYS_LIMIT).await?;
        let mut keys: Vec<String> = page.keys().map(str::to_string).collect();
        while let Some(token) = page.continuation_token.take() {
            page = self.list_next_page(&token, MAX_KEYS_LIMIT).await?;
            keys.extend(page.keys().map(str::to_string));
        }
        Ok(keys)
    }

    /// Store `body` under `key`, replacing whatever was there.
    pub async fn upload(
        &self,
        key: &str,
        content_type: Option<String>,
        body: ByteStream<'_>,
    ) -> StoreResult<()> {
        self.store.put(key, content_type, body).await?;
        info!("uploaded {}", key);
        Ok(())
    }

    pub async fn fetch_metadata(&self, key: &str) -> StoreResult<ObjectMetadata> {
        self.store.head(key).await
    }

    /// Metadata plus a stream over the object's bytes.
    pub async fn fetch_body(
        &self,
        key: &str,
    ) -> StoreResult<(ObjectMetadata, ByteStream<'static>)> {
        self.store.get(key).await
    }

    /// Delete `key`. Missing keys are not an error.
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.store.delete(key).await?;
        info!("deleted {}", key);
        Ok(())
    }

    #[cfg(test)]
    pub async fn object_exists(&self, key: &str) -> StoreResult<bool> {
        match self.store.head(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create the bucket; an existing bucket we own counts as success.
    pub async fn ensure_bucket(&self) -> StoreResult<()> {
        self.store.create_bucket().await
    }

    /// Delete every object in the bucket, then the bucket.
    pub async fn delete_bucket(&self) -> StoreResult<()> {
        let keys = self.list_all_keys("").await?;
        info!("deleting {} objects from bucket {}", keys.len(), self.bucket());
        for key in &keys {
            self.store.delete(key).await?;
        }
        self.store.delete_bucket().await
    }

    pub async fn bucket_ready(&self) -> StoreResult<bool> {
        self.store.bucket_exists().await
    }
}

fn validate_max_keys(max_keys: i64) -> StoreResult<usize> {
    if max_keys <= 0 {
        return Err(StoreError::InvalidArgument(format!(
            "max_keys must be positive, got {}",
            max_keys
        )));
    }
    if max_keys > MAX_KEYS_LIMIT {
        return Err(StoreError::InvalidArgument(format!(
            "max_keys must be at most {}, got {}",
            MAX_KEYS_LIMIT, max_keys
        )));
    }
    Ok(max_keys as usize)
}
