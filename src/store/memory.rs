//! In-process object store with S3 listing semantics.
//!
//! Keys live in a `BTreeMap`, so iteration order is the same byte-wise
//! lexicographic order S3 guarantees. Continuation tokens carry their own
//! resume position (prefix plus last key returned), base64-encoded and tagged
//! with the issuing store's id, so nothing is kept per token. A token another
//! store issued, or one that does not decode, is rejected the way S3 rejects a
//! foreign one.

use super::{ByteStream, ListCursor, ObjectStore, StoreError, StoreResult};
use crate::models::{
    object::ObjectMetadata,
    page::{ContinuationToken, Page},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, ops::Bound};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Clone, Debug)]
struct StoredObject {
    body: Bytes,
    content_type: Option<String>,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn metadata(&self, key: &str, with_content_type: bool) -> ObjectMetadata {
        ObjectMetadata {
            key: key.to_string(),
            last_modified: self.last_modified,
            size_bytes: self.body.len() as i64,
            content_type: if with_content_type {
                self.content_type.clone()
            } else {
                None
            },
        }
    }
}

/// Position a continuation token resumes from.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct TokenCursor {
    store: Uuid,
    prefix: String,
    last_key: String,
}

impl TokenCursor {
    fn encode(&self) -> StoreResult<ContinuationToken> {
        let json =
            serde_json::to_vec(self).map_err(|err| StoreError::BackendUnavailable(Box::new(err)))?;
        Ok(ContinuationToken::new(general_purpose::URL_SAFE_NO_PAD.encode(json)))
    }

    fn decode(token: &ContinuationToken) -> Option<Self> {
        let json = general_purpose::URL_SAFE_NO_PAD
            .decode(token.as_str())
            .ok()?;
        serde_json::from_slice(&json).ok()
    }
}

pub struct MemoryStore {
    bucket: String,
    /// Tags the tokens this store issues.
    id: Uuid,
    /// `None` until the bucket is created.
    objects: RwLock<Option<BTreeMap<String, StoredObject>>>,
}

impl MemoryStore {
    /// Create a store whose bucket already exists.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            id: Uuid::new_v4(),
            objects: RwLock::new(Some(BTreeMap::new())),
        }
    }

    /// Create a store whose bucket has not been created yet.
    #[cfg(test)]
    pub fn without_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            id: Uuid::new_v4(),
            objects: RwLock::new(None),
        }
    }

    fn missing_bucket(&self) -> StoreError {
        StoreError::BucketNotFound(self.bucket.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, body), fields(backend = "memory"))]
    async fn put<'a>(
        &self,
        key: &str,
        content_type: Option<String>,
        body: ByteStream<'a>,
    ) -> StoreResult<()> {
        let chunks: Vec<Bytes> = body.try_collect().await.map_err(StoreError::upload_body)?;
        let mut buf = BytesMut::new();
        for chunk in chunks {
            buf.extend_from_slice(&chunk);
        }

        let mut objects = self.objects.write().await;
        let objects = objects.as_mut().ok_or_else(|| self.missing_bucket())?;
        objects.insert(
            key.to_string(),
            StoredObject {
                body: buf.freeze(),
                content_type,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get(&self, key: &str) -> StoreResult<(ObjectMetadata, ByteStream<'static>)> {
        let objects = self.objects.read().await;
        let objects = objects.as_ref().ok_or_else(|| self.missing_bucket())?;
        let object = objects.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;

        let body = object.body.clone();
        Ok((
            object.metadata(key, true),
            stream::iter([Ok(body)]).boxed(),
        ))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata> {
        let objects = self.objects.read().await;
        let objects = objects.as_ref().ok_or_else(|| self.missing_bucket())?;
        objects
            .get(key)
            .map(|object| object.metadata(key, true))
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut objects = self.objects.write().await;
        let objects = objects.as_mut().ok_or_else(|| self.missing_bucket())?;
        if objects.remove(key).is_none() {
            debug!("object {} already missing", key);
        }
        Ok(())
    }

    #[instrument(skip(self, cursor), fields(backend = "memory"))]
    async fn list_page(&self, cursor: ListCursor<'_>, max_keys: usize) -> StoreResult<Page> {
        if max_keys == 0 {
            return Err(StoreError::InvalidArgument(
                "max_keys must be positive".into(),
            ));
        }

        let (prefix, last_key) = match cursor {
            ListCursor::Prefix(prefix) => (prefix.to_string(), None),
            ListCursor::Token(token) => {
                let resumed = TokenCursor::decode(token)
                    .filter(|cursor| cursor.store == self.id)
                    .ok_or_else(|| {
                        StoreError::InvalidToken("token was not issued by this bucket".into())
                    })?;
                (resumed.prefix, Some(resumed.last_key))
            }
        };

        let (entries, has_more) = {
            let objects = self.objects.read().await;
            let objects = objects.as_ref().ok_or_else(|| self.missing_bucket())?;

            let lower = match last_key.as_deref() {
                Some(last) => Bound::Excluded(last),
                None => Bound::Included(prefix.as_str()),
            };
            let mut matching = objects
                .range::<str, _>((lower, Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(prefix.as_str()));

            let entries: Vec<ObjectMetadata> = matching
                .by_ref()
                .take(max_keys)
                .map(|(key, object)| object.metadata(key, false))
                .collect();
            (entries, matching.next().is_some())
        };

        let continuation_token = match entries.last() {
            Some(last) if has_more => Some(
                TokenCursor {
                    store: self.id,
                    prefix,
                    last_key: last.key.clone(),
                }
                .encode()?,
            ),
            _ => None,
        };

        Ok(Page {
            entries,
            continuation_token,
        })
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn create_bucket(&self) -> StoreResult<()> {
        let mut objects = self.objects.write().await;
        if objects.is_some() {
            debug!("bucket {} already exists", self.bucket);
        } else {
            *objects = Some(BTreeMap::new());
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete_bucket(&self) -> StoreResult<()> {
        let mut objects = self.objects.write().await;
        match objects.as_ref() {
            None => Err(self.missing_bucket()),
            Some(existing) if !existing.is_empty() => Err(StoreError::InvalidArgument(format!(
                "bucket `{}` is not empty",
                self.bucket
            ))),
            Some(_) => {
                *objects = None;
                Ok(())
            }
        }
    }

    async fn bucket_exists(&self) -> StoreResult<bool> {
        Ok(self.objects.read().await.is_some())
    }
}
