//! Defines routes for the files API.
//!
//! ## Structure
//! - **Collection endpoint**
//!   - `GET    /files` — list files (supports prefix, max_keys, continuation_token)
//!
//! - **File-level endpoints**
//!   - `PUT    /files/{*path}` — upload file (multipart field `file`)
//!   - `GET    /files/{*path}` — download file
//!   - `HEAD   /files/{*path}` — retrieve metadata only
//!   - `DELETE /files/{*path}` — delete file (idempotent)
//!
//! The wildcard `*path` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        file_handlers::{delete_file, get_file, head_file, list_files, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::files_service::FilesService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, put},
};

/// Build and return the router for all routes.
///
/// The router carries shared state (`FilesService`) to all handlers.
/// Uploads are streamed to the backend, so the default request body limit
/// is lifted.
pub fn routes() -> Router<FilesService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // File-level routes
        .route(
            "/files/{*path}",
            put(upload_file)
                .get(get_file)
                .head(head_file)
                .delete(delete_file),
        )
        // Collection routes
        .route("/files", get(list_files))
        .layer(DefaultBodyLimit::disable())
}
