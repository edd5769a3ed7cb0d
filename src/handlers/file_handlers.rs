//! HTTP handlers for file operations.
//! Streams file bodies in both directions to avoid buffering in memory and
//! delegates storage concerns to `FilesService`.

use crate::{
    errors::AppError,
    models::{object::ObjectMetadata, page::ContinuationToken},
    services::files_service::{DEFAULT_MAX_KEYS, FilesService, ListFilesParams},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::debug;

/// Multipart field carrying the uploaded file.
const FILE_FIELD: &str = "file";

/// Query params accepted by `GET /files`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub max_keys: Option<i64>,
    pub prefix: Option<String>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub objects: Vec<ObjectMetadata>,
    pub continuation_token: Option<ContinuationToken>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
}

/// PUT `/files/{*path}` — upload the multipart `file` field under `path`.
pub async fn upload_file(
    State(service): State<FilesService>,
    Path(path): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            debug!("skipping multipart field {:?}", field.name());
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| path.clone());
        let content_type = field.content_type().map(str::to_string);
        let stream = field
            .map(|chunk| chunk.map_err(|err| io::Error::other(err)))
            .boxed();

        service.upload(&path, content_type, stream).await?;
        return Ok((StatusCode::CREATED, Json(UploadResponse { filename })));
    }

    Err(AppError::bad_request(format!(
        "multipart field `{}` is required",
        FILE_FIELD
    )))
}

/// GET `/files` — one page of files, supports ?prefix=&max_keys=&continuation_token=
pub async fn list_files(
    State(service): State<FilesService>,
    query: Result<Query<ListFilesQuery>, QueryRejection>,
) -> Result<Json<ListFilesResponse>, AppError> {
    let Query(q) = query.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;

    // An empty token is what clients send back after a `null` one.
    let params = ListFilesParams {
        prefix: q.prefix.unwrap_or_default(),
        max_keys: q.max_keys.unwrap_or(DEFAULT_MAX_KEYS),
        continuation_token: q
            .continuation_token
            .filter(|token| !token.is_empty())
            .map(ContinuationToken::new),
    };

    let page = service.list_files(params).await?;
    Ok(Json(ListFilesResponse {
        objects: page.entries,
        continuation_token: page.continuation_token,
    }))
}

/// HEAD `/files/{*path}` — same headers as GET but no body.
pub async fn head_file(
    State(service): State<FilesService>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let meta = service.fetch_metadata(&path).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// GET `/files/{*path}` — download a file as a streaming response.
pub async fn get_file(
    State(service): State<FilesService>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let (meta, stream) = service.fetch_body(&path).await?;
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// DELETE `/files/{*path}` — 204 whether or not the file existed.
pub async fn delete_file(
    State(service): State<FilesService>,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    service.delete(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn set_file_headers(headers: &mut HeaderMap, meta: &ObjectMetadata) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0)),
    );

    if let Ok(value) = HeaderValue::from_str(
        &meta
            .last_modified
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    ) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{routes::routes::routes, store::memory::MemoryStore};
    use axum::http::Method;
    use axum_test::{
        TestServer,
        multipart::{MultipartForm, Part},
    };
    use std::sync::Arc;

    fn server() -> TestServer {
        let service = FilesService::new(Arc::new(MemoryStore::new("test-bucket")));
        TestServer::new(routes().with_state(service)).unwrap()
    }

    fn text_file(name: &str, content: &str) -> MultipartForm {
        MultipartForm::new().add_part(
            FILE_FIELD,
            Part::bytes(content.as_bytes().to_vec())
                .file_name(name)
                .mime_type("text/plain"),
        )
    }

    async fn upload(server: &TestServer, path: &str, content: &str) {
        server
            .put(&format!("/files/{}", path))
            .multipart(text_file(path, content))
            .await
            .assert_status(StatusCode::CREATED);
    }

    #[tokio::test]
    async fn upload_returns_created_with_filename() {
        let server = server();
        let response = server
            .put("/files/docs/report.txt")
            .multipart(text_file("report.txt", "quarterly numbers"))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: UploadResponse = response.json();
        assert_eq!(body.filename, "report.txt");
    }

    #[tokio::test]
    async fn upload_without_file_field_is_rejected() {
        let server = server();
        let response = server
            .put("/files/empty.txt")
            .multipart(MultipartForm::new().add_text("note", "no file here"))
            .expect_failure()
            .await;

        response.assert_status_bad_request();
    }

    #[tokio::test]
    async fn download_streams_content_with_headers() {
        let server = server();
        upload(&server, "folder/hello.txt", "hello world").await;

        let response = server.get("/files/folder/hello.txt").await;
        response.assert_status_ok();
        assert_eq!(response.as_bytes().as_ref(), b"hello world");
        assert_eq!(response.header(header::CONTENT_TYPE), "text/plain");
        assert_eq!(response.header(header::CONTENT_LENGTH), "11");
        assert!(response.maybe_header(header::LAST_MODIFIED).is_some());
    }

    #[tokio::test]
    async fn head_reports_metadata_without_body() {
        let server = server();
        upload(&server, "a.bin", "12345").await;

        let response = server.method(Method::HEAD, "/files/a.bin").await;
        response.assert_status_ok();
        assert_eq!(response.header(header::CONTENT_LENGTH), "5");
        assert!(response.as_bytes().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let server = server();

        server
            .get("/files/nope.txt")
            .expect_failure()
            .await
            .assert_status_not_found();
        server
            .method(Method::HEAD, "/files/nope.txt")
            .expect_failure()
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let server = server();
        upload(&server, "gone.txt", "bye").await;

        server.delete("/files/gone.txt").await.assert_status_no_content();
        server.delete("/files/gone.txt").await.assert_status_no_content();
        server
            .get("/files/gone.txt")
            .expect_failure()
            .await
            .assert_status_not_found();

        let listed: ListFilesResponse = server.get("/files").await.json();
        assert!(listed.objects.is_empty());
    }

    #[tokio::test]
    async fn list_paginates_with_tokens() {
        let server = server();
        for i in 1..=5 {
            upload(&server, &format!("test_file_{}.txt", i), "").await;
        }

        let all: ListFilesResponse = server
            .get("/files")
            .add_query_param("max_keys", 10)
            .await
            .json();
        assert_eq!(all.objects.len(), 5);
        assert!(all.continuation_token.is_none());

        let first: ListFilesResponse = server
            .get("/files")
            .add_query_param("max_keys", 2)
            .await
            .json();
        assert_eq!(first.objects.len(), 2);
        let token = first.continuation_token.expect("more pages");

        let rest: ListFilesResponse = server
            .get("/files")
            .add_query_param("max_keys", 5)
            .add_query_param("continuation_token", token.as_str())
            .await
            .json();
        assert_eq!(
            rest.objects.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            ["test_file_3.txt", "test_file_4.txt", "test_file_5.txt"]
        );
        assert!(rest.continuation_token.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let server = server();
        upload(&server, "folder1/a.txt", "a").await;
        upload(&server, "folder1/b.txt", "b").await;
        upload(&server, "folder2/c.txt", "c").await;

        let listed: ListFilesResponse = server
            .get("/files")
            .add_query_param("prefix", "folder1/")
            .await
            .json();
        assert_eq!(
            listed.objects.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            ["folder1/a.txt", "folder1/b.txt"]
        );
    }

    #[tokio::test]
    async fn list_rejects_bad_arguments() {
        let server = server();

        for max_keys in ["0", "-3", "1001", "many"] {
            server
                .get("/files")
                .add_query_param("max_keys", max_keys)
                .expect_failure()
                .await
                .assert_status_bad_request();
        }

        server
            .get("/files")
            .add_query_param("continuation_token", "forged")
            .expect_failure()
            .await
            .assert_status_bad_request();
    }
}
