//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the bucket is reachable

use crate::services::files_service::FilesService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that asks the backend whether the configured bucket
/// exists and our credentials can see it.
///
/// HTTP 200 when the check passes, HTTP 503 otherwise.
pub async fn readyz(State(service): State<FilesService>) -> impl IntoResponse {
    let bucket_check = match service.bucket_ready().await {
        Ok(true) => CheckStatus {
            ok: true,
            error: None,
        },
        Ok(false) => CheckStatus {
            ok: false,
            error: Some(format!("bucket `{}` does not exist", service.bucket())),
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(format!("error: {}", e)),
        },
    };

    let overall_ok = bucket_check.ok;
    let mut checks = HashMap::new();
    checks.insert("bucket".to_string(), bucket_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize, Deserialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<String, CheckStatus>,
}

#[derive(Serialize, Deserialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
