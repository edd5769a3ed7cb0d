//! S3-compatible object store using the AWS SDK.
//!
//! Listing, ordering, prefix filtering and continuation tokens are all S3's;
//! this type forwards parameters and reshapes responses.

use super::{ByteStream, ListCursor, ObjectStore, StoreError, StoreResult};
use crate::{
    config::S3Config,
    models::{
        object::ObjectMetadata,
        page::{ContinuationToken, Page},
    },
};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    Client,
    error::{ProvideErrorMetadata, SdkError},
    primitives::{ByteStream as SdkByteStream, DateTime as SdkDateTime},
    types::{
        BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
        CreateBucketConfiguration,
    },
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

/// Minimum part size for S3 multipart uploads (5 MiB).
/// Bodies smaller than this go out as a single PutObject.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 rejects multipart uploads with more parts than this.
const MAX_PARTS: usize = 10_000;

/// Part size doubles after every this many parts, so the 10,000-part limit
/// covers objects up to about 4.9 TiB while parts stay under S3's 5 GiB cap.
const PARTS_PER_SIZE_STEP: usize = 1_000;

/// The only region where CreateBucket must omit a location constraint.
const DEFAULT_S3_REGION: &str = "us-east-1";

pub struct S3Store {
    client: Client,
    bucket: String,
    region: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Build a client from the resolved configuration.
    ///
    /// Credentials come from the AWS default chain, scoped to `profile` when
    /// one is configured. They are resolved lazily on the first request, so
    /// this never touches the network.
    pub async fn connect(cfg: &S3Config) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));
        if let Some(profile) = &cfg.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(endpoint) = &cfg.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(cfg.force_path_style)
            .build();

        Self::with_client(Client::from_conf(s3_config), &cfg.bucket, &cfg.region)
    }

    /// Wrap an already configured client.
    pub fn with_client(client: Client, bucket: &str, region: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            region: region.to_string(),
        }
    }

    /// Convert an SDK error, mapping missing keys and buckets.
    fn map_error<E>(&self, err: SdkError<E>, key: Option<&str>) -> StoreError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        if let SdkError::ServiceError(ref service_err) = err {
            if service_err.err().code() == Some("NoSuchBucket") {
                return StoreError::BucketNotFound(self.bucket.clone());
            }
            // HEAD responses carry no error code, only the status.
            if service_err.raw().status().as_u16() == 404 {
                return match key {
                    Some(key) => StoreError::NotFound {
                        key: key.to_string(),
                    },
                    None => StoreError::BucketNotFound(self.bucket.clone()),
                };
            }
        }
        StoreError::BackendUnavailable(Box::new(err))
    }

    async fn put_single(
        &self,
        key: &str,
        content_type: Option<String>,
        body: BytesMut,
    ) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type)
            .body(SdkByteStream::from(body.freeze()))
            .send()
            .await
            .map_err(|err| self.map_error(err, None))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        content_type: Option<String>,
        head: BytesMut,
        rest: ByteStream<'_>,
    ) -> StoreResult<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type)
            .send()
            .await
            .map_err(|err| self.map_error(err, None))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::BackendUnavailable("S3 did not return an upload id".into()))?
            .to_string();

        let parts = match self.upload_parts(key, &upload_id, head, rest).await {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        upload_id = %upload_id,
                        error = %abort_err,
                        "failed to abort multipart upload, orphaned parts may remain"
                    );
                }
                return Err(err);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| self.map_error(err, None))?;
        Ok(())
    }

    /// Cut the body into parts sized by [`part_size`]; the last one may be short.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        mut buffer: BytesMut,
        mut rest: ByteStream<'_>,
    ) -> StoreResult<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        loop {
            while buffer.len() >= part_size(parts.len()) {
                let part = buffer.split_to(part_size(parts.len()));
                let completed = self.upload_part(key, upload_id, parts.len(), part).await?;
                parts.push(completed);
            }
            match rest.try_next().await.map_err(StoreError::upload_body)? {
                Some(chunk) => buffer.extend_from_slice(&chunk),
                None => break,
            }
        }
        if !buffer.is_empty() {
            let completed = self.upload_part(key, upload_id, parts.len(), buffer).await?;
            parts.push(completed);
        }
        Ok(parts)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        uploaded: usize,
        data: BytesMut,
    ) -> StoreResult<CompletedPart> {
        if uploaded >= MAX_PARTS {
            return Err(StoreError::InvalidArgument(format!(
                "upload of `{}` exceeds the {} part limit",
                key, MAX_PARTS
            )));
        }
        let part_number = uploaded as i32 + 1;
        debug!(key = %key, part_number, size = data.len(), "uploading part");
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(SdkByteStream::from(data.freeze()))
            .send()
            .await
            .map_err(|err| self.map_error(err, None))?;

        Ok(CompletedPart::builder()
            .e_tag(output.e_tag().unwrap_or_default())
            .part_number(part_number)
            .build())
    }
}

/// Size of the zero-based part `index`: 5 MiB, doubling every
/// `PARTS_PER_SIZE_STEP` parts.
fn part_size(index: usize) -> usize {
    MIN_PART_SIZE << (index / PARTS_PER_SIZE_STEP).min(9)
}

/// S3 timestamps are always present on real responses; fall back to the
/// epoch rather than failing the whole call if one is missing.
fn to_utc(timestamp: Option<&SdkDateTime>) -> DateTime<Utc> {
    timestamp
        .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, body), fields(backend = "s3"))]
    async fn put<'a>(
        &self,
        key: &str,
        content_type: Option<String>,
        mut body: ByteStream<'a>,
    ) -> StoreResult<()> {
        let mut head = BytesMut::new();
        while head.len() < MIN_PART_SIZE {
            match body.try_next().await.map_err(StoreError::upload_body)? {
                Some(chunk) => head.extend_from_slice(&chunk),
                None => return self.put_single(key, content_type, head).await,
            }
        }
        self.put_multipart(key, content_type, head, body).await
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StoreResult<(ObjectMetadata, ByteStream<'static>)> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| self.map_error(err, Some(key)))?;

        let meta = ObjectMetadata {
            key: key.to_string(),
            last_modified: to_utc(output.last_modified()),
            size_bytes: output.content_length().unwrap_or(0),
            content_type: output.content_type().map(str::to_string),
        };
        let body = ReaderStream::new(output.body.into_async_read()).boxed();
        Ok((meta, body))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StoreResult<ObjectMetadata> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| self.map_error(err, Some(key)))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            last_modified: to_utc(output.last_modified()),
            size_bytes: output.content_length().unwrap_or(0),
            content_type: output.content_type().map(str::to_string),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        // DeleteObject already succeeds for missing keys.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| self.map_error(err, None))?;
        Ok(())
    }

    #[instrument(skip(self, cursor), fields(backend = "s3"))]
    async fn list_page(&self, cursor: ListCursor<'_>, max_keys: usize) -> StoreResult<Page> {
        let max_keys = i32::try_from(max_keys)
            .map_err(|_| StoreError::InvalidArgument(format!("max_keys {} too large", max_keys)))?;

        let request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(max_keys);
        let request = match cursor {
            ListCursor::Prefix("") => request,
            ListCursor::Prefix(prefix) => request.prefix(prefix),
            ListCursor::Token(token) => request.continuation_token(token.as_str()),
        };

        let output = match request.send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(service_err))
                if matches!(cursor, ListCursor::Token(_))
                    && service_err.raw().status().as_u16() == 400 =>
            {
                let reason = service_err
                    .err()
                    .message()
                    .unwrap_or("continuation token is invalid")
                    .to_string();
                return Err(StoreError::InvalidToken(reason));
            }
            Err(err) => return Err(self.map_error(err, None)),
        };

        let entries = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectMetadata {
                    key: object.key()?.to_string(),
                    last_modified: to_utc(object.last_modified()),
                    size_bytes: object.size().unwrap_or(0),
                    content_type: None,
                })
            })
            .collect();

        let continuation_token = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(ContinuationToken::new)
        } else {
            None
        };

        Ok(Page {
            entries,
            continuation_token,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn create_bucket(&self) -> StoreResult<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_S3_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("bucket {} created in {}", self.bucket, self.region);
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                info!("bucket {} already exists and is ours", self.bucket);
                Ok(())
            }
            Err(err) => Err(self.map_error(err, None)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete_bucket(&self) -> StoreResult<()> {
        self.client
            .delete_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| self.map_error(err, None))?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn bucket_exists(&self) -> StoreResult<bool> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => match self.map_error(err, None) {
                StoreError::BucketNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::{
        config::{BehaviorVersion, Credentials, Region},
        primitives::SdkBody,
    };
    use aws_smithy_http_client::test_util::infallible_client_fn;
    use axum::{
        extract::Query,
        http::{Request, Response},
    };
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    /// What the store sent over the wire.
    #[derive(Clone, Debug)]
    struct SentRequest {
        method: String,
        uri: axum::http::Uri,
        body: String,
    }

    impl SentRequest {
        fn query(&self) -> HashMap<String, String> {
            Query::<HashMap<String, String>>::try_from_uri(&self.uri)
                .unwrap()
                .0
        }
    }

    type Sent = Arc<Mutex<Vec<SentRequest>>>;

    /// S3Store talking to a canned responder instead of the network.
    fn store_replying<F>(region: &str, respond: F) -> (S3Store, Sent)
    where
        F: Fn(&SentRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let http_client = infallible_client_fn(move |request: Request<SdkBody>| {
            let seen = SentRequest {
                method: request.method().to_string(),
                uri: request.uri().clone(),
                body: request
                    .body()
                    .bytes()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default(),
            };
            let (status, body) = respond(&seen);
            log.lock().unwrap().push(seen);
            Response::builder().status(status).body(body).unwrap()
        });

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new("test-key", "test-secret", None, None, "test"))
            .endpoint_url("http://localhost:9000")
            .force_path_style(true)
            .http_client(http_client)
            .build();

        (
            S3Store::with_client(Client::from_conf(config), "test-bucket", region),
            sent,
        )
    }

    fn listing(keys: &[&str], truncated: bool, next_token: Option<&str>) -> String {
        let mut xml = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Name>test-bucket</Name>"#,
        );
        xml.push_str(&format!("<IsTruncated>{}</IsTruncated>", truncated));
        if let Some(token) = next_token {
            xml.push_str(&format!("<NextContinuationToken>{}</NextContinuationToken>", token));
        }
        for key in keys {
            xml.push_str(&format!(
                "<Contents><Key>{}</Key><LastModified>2024-05-01T12:00:00.000Z</LastModified><Size>3</Size></Contents>",
                key
            ));
        }
        xml.push_str("</ListBucketResult>");
        xml
    }

    fn error_body(code: &str, message: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Error><Code>{}</Code><Message>{}</Message></Error>"#,
            code, message
        )
    }

    #[tokio::test]
    async fn token_is_sent_verbatim_and_next_token_returned() {
        let (store, sent) = store_replying("eu-central-1", |_| {
            (200, listing(&["b.txt", "c.txt"], true, Some("next/+token==")))
        });
        let token = ContinuationToken::new("1ueGcx/LPRx+1Tr==");

        let page = store.list_page(ListCursor::Token(&token), 2).await.unwrap();

        assert_eq!(page.keys().collect::<Vec<_>>(), ["b.txt", "c.txt"]);
        assert_eq!(page.entries[0].size_bytes, 3);
        assert_eq!(
            page.continuation_token,
            Some(ContinuationToken::new("next/+token=="))
        );

        let sent = sent.lock().unwrap();
        let query = sent[0].query();
        assert_eq!(sent[0].method, "GET");
        assert_eq!(query["continuation-token"], "1ueGcx/LPRx+1Tr==");
        assert_eq!(query["max-keys"], "2");
        assert!(!query.contains_key("prefix"));
    }

    #[tokio::test]
    async fn prefix_is_sent_only_when_non_empty() {
        let (store, sent) = store_replying("eu-central-1", |_| (200, listing(&[], false, None)));

        store.list_page(ListCursor::Prefix("docs/"), 10).await.unwrap();
        store.list_page(ListCursor::Prefix(""), 10).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].query()["prefix"], "docs/");
        assert!(!sent[1].query().contains_key("prefix"));
        assert!(!sent[1].query().contains_key("continuation-token"));
    }

    #[tokio::test]
    async fn listing_ends_unless_truncated_with_a_token() {
        let (store, _) = store_replying("eu-central-1", |_| {
            (200, listing(&["a.txt"], true, None))
        });
        let page = store.list_page(ListCursor::Prefix(""), 1).await.unwrap();
        assert!(page.is_last());

        let (store, _) = store_replying("eu-central-1", |_| {
            (200, listing(&["a.txt"], false, Some("stale")))
        });
        let page = store.list_page(ListCursor::Prefix(""), 1).await.unwrap();
        assert!(page.is_last());
    }

    #[tokio::test]
    async fn rejected_token_is_invalid_token() {
        let (store, _) = store_replying("eu-central-1", |_| {
            (
                400,
                error_body("InvalidArgument", "The continuation token provided is incorrect"),
            )
        });

        let err = store
            .list_page(ListCursor::Token(&ContinuationToken::new("forged")), 5)
            .await
            .unwrap_err();
        match err {
            StoreError::InvalidToken(reason) => {
                assert_eq!(reason, "The continuation token provided is incorrect")
            }
            other => panic!("expected InvalidToken, got {:?}", other),
        }

        // The same rejection without a token is a backend problem, not the client's.
        let err = store
            .list_page(ListCursor::Prefix("docs/"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_keys_and_buckets_are_told_apart() {
        let (store, _) = store_replying("eu-central-1", |request| {
            match request.uri.path() {
                "/test-bucket/absent.txt" if request.method == "HEAD" => (404, String::new()),
                "/test-bucket/absent.txt" => (404, error_body("NoSuchKey", "no such key")),
                _ => (404, error_body("NoSuchBucket", "no such bucket")),
            }
        });

        assert!(matches!(
            store.head("absent.txt").await,
            Err(StoreError::NotFound { key }) if key == "absent.txt"
        ));
        assert!(matches!(
            store.get("absent.txt").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("other.txt").await,
            Err(StoreError::BucketNotFound(bucket)) if bucket == "test-bucket"
        ));
        assert!(matches!(
            store.list_page(ListCursor::Prefix(""), 1).await,
            Err(StoreError::BucketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn bucket_exists_follows_head_bucket() {
        let (store, _) = store_replying("eu-central-1", |_| (404, String::new()));
        assert!(!store.bucket_exists().await.unwrap());

        let (store, _) = store_replying("eu-central-1", |_| (200, String::new()));
        assert!(store.bucket_exists().await.unwrap());

        let (store, _) = store_replying("eu-central-1", |_| (403, String::new()));
        assert!(matches!(
            store.bucket_exists().await,
            Err(StoreError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn create_bucket_tolerates_owned_bucket() {
        let (store, sent) = store_replying("eu-central-1", |_| {
            (
                409,
                error_body("BucketAlreadyOwnedByYou", "you already own it"),
            )
        });
        store.create_bucket().await.unwrap();
        assert_eq!(sent.lock().unwrap()[0].method, "PUT");

        let (store, _) = store_replying("eu-central-1", |_| {
            (409, error_body("BucketAlreadyExists", "someone else owns it"))
        });
        assert!(matches!(
            store.create_bucket().await,
            Err(StoreError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn location_constraint_depends_on_region() {
        let (store, sent) = store_replying("eu-central-1", |_| (200, String::new()));
        store.create_bucket().await.unwrap();
        assert!(
            sent.lock().unwrap()[0]
                .body
                .contains("<LocationConstraint>eu-central-1</LocationConstraint>")
        );

        let (store, sent) = store_replying("us-east-1", |_| (200, String::new()));
        store.create_bucket().await.unwrap();
        assert!(!sent.lock().unwrap()[0].body.contains("LocationConstraint"));
    }

    #[test]
    fn part_size_grows_to_cover_large_objects() {
        assert_eq!(part_size(0), MIN_PART_SIZE);
        assert_eq!(part_size(PARTS_PER_SIZE_STEP - 1), MIN_PART_SIZE);
        assert_eq!(part_size(PARTS_PER_SIZE_STEP), 2 * MIN_PART_SIZE);

        let largest = part_size(MAX_PARTS - 1);
        assert!(largest <= 5 * 1024 * 1024 * 1024);

        let capacity: u64 = (0..MAX_PARTS).map(|i| part_size(i) as u64).sum();
        assert!(capacity > 4 * 1024 * 1024 * 1024 * 1024);
    }

    #[tokio::test]
    async fn part_beyond_the_limit_is_refused_before_sending() {
        let (store, sent) = store_replying("eu-central-1", |_| (200, String::new()));

        let err = store
            .upload_part("big.bin", "upload-1", MAX_PARTS, BytesMut::from(&b"tail"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn timestamps_convert_to_utc() {
        let ts = SdkDateTime::from_secs_and_nanos(1_700_000_000, 500);
        let converted = to_utc(Some(&ts));

        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 500);
        assert_eq!(to_utc(None), DateTime::UNIX_EPOCH);
    }
}
