use crate::config::{ApiConfig, RegionMode};
use crate::plate_store::PlateStore;
use crate::processor::{DetectionProcessor, WebhookPayload};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use plate_capture::SegmentRecorder;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

const WEBHOOK_ACK: &str = "Webhook received and acknowledged.";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<DetectionProcessor>,
    pub store: Arc<dyn PlateStore>,
    /// Directory clips and thumbnails are served from
    pub clip_dir: PathBuf,
    /// Present when video capture is enabled
    pub recorder: Option<Arc<SegmentRecorder>>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Last-update marker response
#[derive(Debug, Serialize)]
pub struct LastUpdateResponse {
    pub last_update: Option<DateTime<Utc>>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/webhook", post(receive_webhook))
        .route("/video/:filename", get(serve_media))
        .route("/api/v1/last-update", get(last_update))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let region_mode = match state.processor.region_mode() {
        RegionMode::Strict => "strict",
        RegionMode::Permissive => "permissive",
    };
    let recorder = state.recorder.as_ref().map(|r| {
        serde_json::json!({
            "state": r.state(),
            "stats": r.stats(),
        })
    });

    Json(serde_json::json!({
        "status": "healthy",
        "service": "plate-worker",
        "video_capture_enabled": state.processor.video_capture_enabled(),
        "region_mode": region_mode,
        "pending_tasks": state.processor.pending_tasks(),
        "recorder": recorder,
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": format!("{:#}", e)
            })),
        ),
    }
}

/// Detection webhook. Always acknowledged; processing continues in the
/// background and outcomes are only logged.
async fn receive_webhook(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let received_at = Utc::now();

    match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => {
            debug!("Webhook accepted");
            state.processor.submit(payload, received_at);
        }
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "Malformed webhook body");
            metrics::counter!("lpr.webhooks.malformed").increment(1);
        }
    }

    (StatusCode::OK, WEBHOOK_ACK)
}

/// Content type for a servable file name, or None if the extension is not
/// served.
fn media_content_type(filename: &str) -> Option<&'static str> {
    let (_, extension) = filename.rsplit_once('.')?;
    match extension.to_ascii_lowercase().as_str() {
        "mp4" => Some("video/mp4"),
        "jpg" => Some("image/jpeg"),
        _ => None,
    }
}

/// A bare file name: no separators, no parent references, no leading dot.
fn is_safe_file_name(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.starts_with('.')
        && !filename.contains(['/', '\\', '\0'])
        && !filename.contains("..")
}

/// Stream a clip or thumbnail from the clip directory.
#[instrument(skip(state))]
async fn serve_media(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_file_name(&filename) {
        warn!("Rejected media path");
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Invalid file name",
            "INVALID_FILENAME",
        ));
    }

    let content_type = media_content_type(&filename)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "File not found", "NOT_FOUND"))?;

    let path = state.clip_dir.join(&filename);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(api_error(StatusCode::NOT_FOUND, "File not found", "NOT_FOUND"));
        }
        Err(e) => {
            error!(error = %e, path = %path.display(), "Failed to open media file");
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read file",
                "IO_ERROR",
            ));
        }
    };

    let metadata = file.metadata().await.map_err(|e| {
        error!(error = %e, path = %path.display(), "Failed to stat media file");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read file",
            "IO_ERROR",
        )
    })?;
    if !metadata.is_file() {
        return Err(api_error(StatusCode::NOT_FOUND, "File not found", "NOT_FOUND"));
    }

    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (header::CONTENT_LENGTH, metadata.len().to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", filename),
        ),
    ];

    Ok((
        StatusCode::OK,
        headers,
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Time of the last plate data change, for dashboard polling.
async fn last_update(
    State(state): State<AppState>,
) -> Result<Json<LastUpdateResponse>, ApiError> {
    let last_update = state.store.last_update().await.map_err(|e| {
        error!(error = ?e, "Failed to read last-update marker");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to read last update",
            "QUERY_ERROR",
        )
    })?;

    Ok(Json(LastUpdateResponse { last_update }))
}

/// Start the webhook and playback API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting plate API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::VehicleAttributes;
    use crate::processor::RegionPolicy;
    use crate::registry::{RegistryError, VehicleRegistry};
    use crate::testing::MemoryPlateStore;
    use async_trait::async_trait;
    use axum::http::Request;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<MemoryPlateStore>,
        processor: Arc<DetectionProcessor>,
        _clips: tempfile::TempDir,
    }

    /// Registry that knows every plate but answers slowly.
    struct SlowRegistry(Duration);

    #[async_trait]
    impl VehicleRegistry for SlowRegistry {
        async fn lookup(&self, _plate: &str) -> Result<VehicleAttributes, RegistryError> {
            tokio::time::sleep(self.0).await;
            Ok(VehicleAttributes {
                make: Some("FORD".to_string()),
                ..Default::default()
            })
        }
    }

    fn test_app() -> TestApp {
        test_app_with(
            None,
            RegionPolicy {
                mode: RegionMode::Permissive,
                enrich: false,
            },
        )
    }

    fn test_app_with(registry: Option<Arc<dyn VehicleRegistry>>, policy: RegionPolicy) -> TestApp {
        let clips = tempfile::tempdir().unwrap();
        std::fs::write(clips.path().join("AB12CDE_clip.mp4"), b"mp4 data").unwrap();
        std::fs::write(clips.path().join("AB12CDE_clip.mp4.jpg"), b"jpeg").unwrap();
        std::fs::write(clips.path().join("notes.txt"), b"text").unwrap();

        let store = Arc::new(MemoryPlateStore::default());
        let processor = Arc::new(DetectionProcessor::new(store.clone(), registry, policy));
        let state = AppState {
            processor: processor.clone(),
            store: store.clone(),
            clip_dir: clips.path().to_path_buf(),
            recorder: None,
        };

        TestApp {
            router: create_router(state, &ApiConfig::default()),
            store,
            processor,
            _clips: clips,
        }
    }

    async fn get(router: &Router, uri: &str) -> Response {
        router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post_webhook(router: &Router, body: &str) -> Response {
        router
            .clone()
            .oneshot(
                Request::post("/webhook")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[test]
    fn test_media_content_type() {
        assert_eq!(media_content_type("a.mp4"), Some("video/mp4"));
        assert_eq!(media_content_type("a.mp4.jpg"), Some("image/jpeg"));
        assert_eq!(media_content_type("a.txt"), None);
        assert_eq!(media_content_type("mp4"), None);
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("AB12CDE_2024-01-15T10-00-00.000Z.mp4"));
        assert!(!is_safe_file_name(""));
        assert!(!is_safe_file_name(".hidden.mp4"));
        assert!(!is_safe_file_name("../secret.mp4"));
        assert!(!is_safe_file_name("a/b.mp4"));
        assert!(!is_safe_file_name("a\\b.mp4"));
    }

    #[tokio::test]
    async fn test_webhook_persists_detection() {
        let app = test_app();
        let response = post_webhook(
            &app.router,
            r#"{"alarm": {"triggers": [{"value": "ab12 cde"}]}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, WEBHOOK_ACK.as_bytes());

        app.processor.shutdown().await;
        assert!(app.store.get_plate("AB12CDE").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_before_lookup_finishes() {
        let app = test_app_with(
            Some(Arc::new(SlowRegistry(Duration::from_secs(5)))),
            RegionPolicy {
                mode: RegionMode::Strict,
                enrich: false,
            },
        );

        let response = tokio::time::timeout(
            Duration::from_secs(1),
            post_webhook(&app.router, r#"{"plate_number": "AB12CDE"}"#),
        )
        .await
        .expect("webhook acknowledged without waiting for the registry");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.processor.pending_tasks(), 1);
        assert_eq!(app.store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_detection_survives_client_disconnect() {
        let app = test_app_with(
            Some(Arc::new(SlowRegistry(Duration::from_millis(500)))),
            RegionPolicy {
                mode: RegionMode::Strict,
                enrich: false,
            },
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app.router.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let body = r#"{"plate_number":"AB12CDE"}"#;
        let request = format!(
            "POST /webhook HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            addr,
            body.len(),
            body
        );
        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        socket.write_all(request.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(socket);

        let stored = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Some(record) = app.store.get_plate("AB12CDE").await.unwrap() {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("detection persisted after the client went away");
        assert_eq!(stored.car_make.as_deref(), Some("FORD"));

        app.processor.shutdown().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_malformed_body() {
        let app = test_app();
        let response = post_webhook(&app.router, "{not json").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = post_webhook(&app.router, r#"{"alarm": {}}"#).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_webhook_acknowledges_persistence_failure() {
        let app = test_app();
        app.store.set_failing(true);
        let response = post_webhook(&app.router, r#"{"plate_number": "AB12CDE"}"#).await;
        assert_eq!(response.status(), StatusCode::OK);

        app.processor.shutdown().await;
        assert_eq!(app.store.record_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_clip() {
        let app = test_app();
        let response = get(&app.router, "/video/AB12CDE_clip.mp4").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "8");
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("inline"));
        assert_eq!(body_bytes(response).await, "mp4 data".as_bytes());
    }

    #[tokio::test]
    async fn test_serve_thumbnail() {
        let app = test_app();
        let response = get(&app.router, "/video/AB12CDE_clip.mp4.jpg").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    }

    #[tokio::test]
    async fn test_serve_media_errors() {
        let app = test_app();
        assert_eq!(
            get(&app.router, "/video/missing.mp4").await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get(&app.router, "/video/notes.txt").await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get(&app.router, "/video/..%2Fsecret.mp4").await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get(&app.router, "/video/.hidden.mp4").await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_last_update_follows_writes() {
        let app = test_app();
        let response = get(&app.router, "/api/v1/last-update").await;
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body["last_update"].is_null());

        post_webhook(&app.router, r#"{"plate_number": "AB12CDE"}"#).await;
        app.processor.shutdown().await;

        let response = get(&app.router, "/api/v1/last-update").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body["last_update"].is_string());
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = test_app();
        let response = get(&app.router, "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["video_capture_enabled"], false);
        assert_eq!(body["region_mode"], "permissive");
        assert_eq!(body["pending_tasks"], 0);
        assert!(body["recorder"].is_null());

        assert_eq!(get(&app.router, "/ready").await.status(), StatusCode::OK);

        app.store.set_failing(true);
        assert_eq!(
            get(&app.router, "/ready").await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
