//! HTTP handlers for pickup codes: `GET /info/{code}` and
//! `GET /download/{code}`. Downloads stream the artifact from disk.

use crate::{
    errors::AppError,
    services::{
        registry::{ArtifactView, is_wellformed_code},
        share_service::ShareService,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub filename: String,
    pub size: u64,
    /// Upload completion, unix seconds.
    pub time: i64,
    pub code: String,
    pub remain_download: u32,
    /// Unix seconds.
    pub expired_time: i64,
}

impl From<ArtifactView> for InfoResponse {
    fn from(view: ArtifactView) -> Self {
        Self {
            filename: view.filename,
            size: view.byte_size,
            time: view.created_at.timestamp(),
            code: view.code,
            remain_download: view.remaining_downloads,
            expired_time: view.expires_at.timestamp(),
        }
    }
}

/// `GET /info/{code}`
pub async fn get_info(
    State(service): State<ShareService>,
    Path(code): Path<String>,
) -> Result<Json<InfoResponse>, AppError> {
    if !is_wellformed_code(&code) {
        return Err(AppError::not_found("code not found"));
    }
    let view = service.info(&code).await?;
    Ok(Json(view.into()))
}

/// `GET /download/{code}`: counts one download and streams the file as an
/// attachment under its original name.
pub async fn download(
    State(service): State<ShareService>,
    Path(code): Path<String>,
) -> Result<Response, AppError> {
    if !is_wellformed_code(&code) {
        return Err(AppError::not_found("code not found"));
    }
    let download = service.download(&code).await?;
    tracing::debug!(
        code = %code,
        remaining = download.entry.remaining_downloads(),
        "streaming artifact"
    );

    let body = Body::from_stream(ReaderStream::new(download.file));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(
        response.headers_mut(),
        &download.artifact.filename,
        download.artifact.byte_size,
        &download.artifact.etag,
    );
    Ok(response)
}

fn set_download_headers(headers: &mut HeaderMap, filename: &str, length: u64, etag: &str) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&length.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    if let Ok(value) = HeaderValue::from_str(&content_disposition(filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        headers.insert(header::ETAG, value);
    }
}

/// `attachment` disposition with an ASCII fallback name and the exact name
/// percent-encoded in `filename*`.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}
