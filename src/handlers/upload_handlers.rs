//! HTTP handlers for the chunked upload flow:
//! `POST /upload/start`, `POST /upload/chunk`, `POST /upload/finish`.
//!
//! Parameters arrive as query strings and are parsed by hand so that bad
//! values surface as our own `Malformed` error rather than a framework
//! rejection.

use crate::{
    errors::{AppError, ShareError, ShareResult},
    models::retrieval::RetentionPolicy,
    services::share_service::ShareService,
};
use axum::{
    Json,
    extract::{Query, State},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Clients are not metered; the credit fields always report this value.
pub const UNLIMITED_CREDIT: u64 = 999_999;

const DEFAULT_MAX_DOWNLOADS: u32 = 2;
const DEFAULT_MAX_RETENTION_HOURS: u32 = 2;

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    pub filename: Option<String>,
    pub file_size: Option<String>,
    pub max_downloads: Option<String>,
    pub max_retention: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub file_id: Option<String>,
    pub chunk_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FinishQuery {
    pub file_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub file_id: String,
    pub token: String,
    pub remain_credit: u64,
    pub required_credit: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub message: String,
    pub remain_credit: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinishResponse {
    pub message: String,
    pub code: String,
}

fn required(name: &str, value: Option<String>) -> ShareResult<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ShareError::Malformed(format!("{} is required", name)))
}

fn parse<T: FromStr>(name: &str, value: &str) -> ShareResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ShareError::Malformed(format!("{} is invalid", name)))
}

fn parse_or<T: FromStr>(name: &str, value: Option<String>, default: T) -> ShareResult<T> {
    match value {
        Some(v) => parse(name, &v),
        None => Ok(default),
    }
}

/// `POST /upload/start?filename=&file_size=&max_downloads=&max_retention=`
pub async fn start_upload(
    State(service): State<ShareService>,
    Query(q): Query<StartQuery>,
) -> Result<Json<StartResponse>, AppError> {
    let filename = required("filename", q.filename)?;
    let file_size: u64 = parse("file_size", &required("file_size", q.file_size)?)?;
    let policy = RetentionPolicy {
        max_downloads: parse_or("max_downloads", q.max_downloads, DEFAULT_MAX_DOWNLOADS)?,
        max_retention_hours: parse_or(
            "max_retention",
            q.max_retention,
            DEFAULT_MAX_RETENTION_HOURS,
        )?,
    };

    let upload = service.start_upload(filename, file_size, policy).await?;

    Ok(Json(StartResponse {
        file_id: upload.upload_id,
        token: upload.upload_secret,
        remain_credit: UNLIMITED_CREDIT,
        required_credit: upload.expected_chunk_count,
    }))
}

/// `POST /upload/chunk?file_id=&chunk_id=&token=` with the raw chunk as body.
pub async fn upload_chunk(
    State(service): State<ShareService>,
    Query(q): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<ChunkResponse>, AppError> {
    let file_id = required("file_id", q.file_id)?;
    // Negative indexes are out of range, not malformed.
    let chunk_index: i64 = parse("chunk_id", &required("chunk_id", q.chunk_id)?)?;
    let token = q.token.unwrap_or_default();

    let outcome = service
        .write_chunk(&file_id, chunk_index, &token, &body)
        .await?;

    Ok(Json(ChunkResponse {
        message: outcome.message().to_string(),
        remain_credit: UNLIMITED_CREDIT,
    }))
}

/// `POST /upload/finish?file_id=&token=`
pub async fn finish_upload(
    State(service): State<ShareService>,
    Query(q): Query<FinishQuery>,
) -> Result<Json<FinishResponse>, AppError> {
    let file_id = required("file_id", q.file_id)?;
    let token = required("token", q.token)?;

    let code = service.finish_upload(&file_id, &token).await?;

    Ok(Json(FinishResponse {
        message: "merge success".into(),
        code,
    }))
}
