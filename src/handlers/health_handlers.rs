//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the snapshot backend and disk I/O

use crate::services::share_service::ShareService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe; never performs I/O.
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
/// 200 when the snapshot backend answers and the upload root accepts a
/// write/read/delete round trip, 503 otherwise. The body lists each check.
pub async fn readyz(State(service): State<ShareService>) -> impl IntoResponse {
    let backend = service.checkpointer.backend();
    let snapshots = match backend.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("{}: {}", backend.describe(), e)),
    };
    let disk = probe_disk(service.store.base_path()).await;

    let overall_ok = snapshots.ok && disk.ok;
    let checks = HashMap::from([("snapshots", snapshots), ("disk", disk)]);

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: (if overall_ok { "ok" } else { "error" }).to_string(),
            checks,
        }),
    )
}

async fn probe_disk(root: &Path) -> CheckStatus {
    let probe = root.join(format!(".readyz-{}", Uuid::new_v4()));
    let outcome = match fs::write(&probe, b"readyz").await {
        Err(e) => return CheckStatus::failed(format!("could not write probe file: {}", e)),
        Ok(()) => match fs::read(&probe).await {
            Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
            Ok(_) => CheckStatus::failed("probe file content mismatch".into()),
            Err(e) => CheckStatus::failed(format!("could not read probe file: {}", e)),
        },
    };
    if let Err(e) = fs::remove_file(&probe).await {
        tracing::warn!("could not remove probe file {}: {}", probe.display(), e);
    }
    outcome
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
