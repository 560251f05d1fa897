//! Defines routes for the upload and pickup-code API.
//!
//! ## Structure
//! - **Upload endpoints** (query-string parameters)
//!   - `POST /upload/start`  - register an upload, returns `file_id` + `token`
//!   - `POST /upload/chunk`  - raw chunk bytes as the request body
//!   - `POST /upload/finish` - merge chunks, returns a 6-digit `code`
//!
//! - **Retrieval endpoints**
//!   - `GET /info/{code}`     - metadata and remaining downloads
//!   - `GET /download/{code}` - counted, streamed download
//!
//! - **Probes**: `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        retrieval_handlers::{download, get_info},
        upload_handlers::{finish_upload, start_upload, upload_chunk},
    },
    services::share_service::ShareService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `chunk_size` bounds the accepted chunk body.
pub fn routes(chunk_size: usize) -> Router<ShareService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload/start", post(start_upload))
        .route(
            "/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(chunk_size)),
        )
        .route("/upload/finish", post(finish_upload))
        .route("/info/{code}", get(get_info))
        .route("/download/{code}", get(download))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handlers::{
            retrieval_handlers::InfoResponse,
            upload_handlers::{FinishResponse, StartResponse},
        },
        services::{
            chunk_store::ChunkStore,
            persistence::JsonSnapshotBackend,
            share_service::UploadLimits,
        },
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use serde::de::DeserializeOwned;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const MIB: usize = 1024 * 1024;
    const CHUNK: usize = 4 * MIB;

    async fn app(dir: &TempDir) -> (Router, ShareService) {
        let service = ShareService::new(
            ChunkStore::new(dir.path().join("uploads")),
            Arc::new(JsonSnapshotBackend::new(dir.path().join("state"))),
            UploadLimits {
                chunk_size: CHUNK as u64,
                max_file_size: 2 * 1024 * MIB as u64,
            },
        );
        service.restore().await.unwrap();
        (routes(CHUNK).with_state(service.clone()), service)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Vec<u8>) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn json<T: DeserializeOwned>(response: Response) -> T {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_ten_mib_upload_single_download() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;
        let original: Vec<u8> = (0..10 * MIB).map(|i| (i * 31 % 256) as u8).collect();

        let response = send(
            &app,
            "POST",
            &format!(
                "/upload/start?filename=video.mp4&file_size={}&max_downloads=1&max_retention=1",
                original.len()
            ),
            Vec::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let start: StartResponse = json(response).await;
        assert_eq!(start.required_credit, 3);

        for (index, chunk) in original.chunks(CHUNK).enumerate() {
            let response = send(
                &app,
                "POST",
                &format!(
                    "/upload/chunk?file_id={}&chunk_id={}&token={}",
                    start.file_id, index, start.token
                ),
                chunk.to_vec(),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK, "chunk {}", index);
        }

        let response = send(
            &app,
            "POST",
            &format!("/upload/finish?file_id={}&token={}", start.file_id, start.token),
            Vec::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let finish: FinishResponse = json(response).await;
        assert_eq!(finish.code.len(), 6);
        assert!(finish.code.bytes().all(|b| b.is_ascii_digit()));

        let response = send(&app, "GET", &format!("/info/{}", finish.code), Vec::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let info: InfoResponse = json(response).await;
        assert_eq!(info.remain_download, 1);
        assert_eq!(info.filename, "video.mp4");
        assert_eq!(info.size, original.len() as u64);

        let response = send(&app, "GET", &format!("/download/{}", finish.code), Vec::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"video.mp4\"; filename*=UTF-8''video.mp4"
        );
        assert_eq!(body_bytes(response).await, original);

        let response = send(&app, "GET", &format!("/download/{}", finish.code), Vec::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&app, "GET", &format!("/info/{}", finish.code), Vec::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_oversize_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (app, service) = app(&dir).await;

        let too_big = 2u64 * 1024 * 1024 * 1024 + 1;
        let response = send(
            &app,
            "POST",
            &format!("/upload/start?filename=huge.bin&file_size={}", too_big),
            Vec::new(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(service.tracker.upload_ids().await.is_empty());
        assert!(service.store.list_areas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unauthorized_requests() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;

        let response = send(&app, "POST", "/upload/start?filename=a&file_size=ten", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&app, "POST", "/upload/start?file_size=10", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app, "POST", "/upload/start?filename=a&file_size=10", Vec::new()).await;
        let start: StartResponse = json(response).await;

        let response = send(
            &app,
            "POST",
            &format!("/upload/chunk?file_id={}&chunk_id=x&token={}", start.file_id, start.token),
            b"0123456789".to_vec(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            "POST",
            &format!("/upload/chunk?file_id={}&chunk_id=0&token=nope", start.file_id),
            b"0123456789".to_vec(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(
            &app,
            "POST",
            &format!("/upload/chunk?file_id={}&chunk_id=1&token={}", start.file_id, start.token),
            b"0123456789".to_vec(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app,
            "POST",
            &format!("/upload/chunk?file_id={}&chunk_id=-1&token={}", start.file_id, start.token),
            b"0123456789".to_vec(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app,
            "POST",
            &format!(
                "/upload/start?filename=a&file_size=10&max_retention={}",
                u32::MAX
            ),
            Vec::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(
            &app,
            "POST",
            &format!("/upload/finish?file_id={}&token={}", start.file_id, start.token),
            Vec::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = send(&app, "GET", "/info/12ab56", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = send(&app, "GET", "/download/000000", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_chunk_reports_already_uploaded() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;
        let response = send(&app, "POST", "/upload/start?filename=a&file_size=3", Vec::new()).await;
        let start: StartResponse = json(response).await;
        let uri = format!(
            "/upload/chunk?file_id={}&chunk_id=0&token={}",
            start.file_id, start.token
        );

        let first: serde_json::Value = json(send(&app, "POST", &uri, b"abc".to_vec()).await).await;
        let second: serde_json::Value = json(send(&app, "POST", &uri, b"xyz".to_vec()).await).await;

        assert_eq!(first["message"], "chunk uploaded");
        assert_eq!(second["message"], "chunk already uploaded");
        assert_eq!(second["remain_credit"], 999_999);
    }

    #[tokio::test]
    async fn test_probes() {
        let dir = TempDir::new().unwrap();
        let (app, _) = app(&dir).await;
        assert_eq!(send(&app, "GET", "/healthz", Vec::new()).await.status(), StatusCode::OK);
        let response = send(&app, "GET", "/readyz", Vec::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = json(response).await;
        assert_eq!(body["checks"]["disk"]["ok"], true);
        assert_eq!(body["checks"]["snapshots"]["ok"], true);
    }
}
