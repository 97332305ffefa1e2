use std::sync::Arc;
use std::time::Instant;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::ColorizeError;
use crate::model::{ChromaPredictor, ColorizationModel, ModelSummary};
use crate::pipeline;

/// Multipart field carrying the uploaded image.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    predictor: Arc<dyn ChromaPredictor>,
    summary: Option<ModelSummary>,
    config: AppConfig,
}

impl AppState {
    pub fn new(
        predictor: Arc<dyn ChromaPredictor>,
        summary: Option<ModelSummary>,
        config: AppConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                predictor,
                summary,
                config,
            }),
        }
    }

    /// State backed by a loaded model; `/api/model` reports its summary.
    pub fn with_model(model: ColorizationModel, config: AppConfig) -> Self {
        let summary = model.summary().clone();
        Self::new(Arc::new(model), Some(summary), config)
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.inner.config.server.max_upload_bytes;

    Router::new()
        .route("/", get(health))
        .route("/colorize", post(colorize))
        .route("/api/health", get(health))
        .route("/api/model", get(model_summary))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn model_summary(State(state): State<AppState>) -> Result<Json<ModelSummary>, AppError> {
    state
        .inner
        .summary
        .clone()
        .map(Json)
        .ok_or_else(|| AppError::NotFound("no model summary available".to_string()))
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn colorize(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("colorize", %request_id);

    let mut multipart =
        multipart.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let upload = read_upload_field(&mut multipart).await?;
    let upload_bytes = upload.len();

    let predictor = Arc::clone(&state.inner.predictor);
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let outcome = pipeline::colorize(predictor.as_ref(), &upload);
        match &outcome {
            Ok(image) => info!(
                upload_bytes,
                width = image.width,
                height = image.height,
                png_bytes = image.png.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Colorized upload"
            ),
            Err(err) if err.is_client_error() => {
                warn!(upload_bytes, error = %err, "Rejected upload")
            }
            Err(err) => error!(upload_bytes, error = %format!("{err:#}"), "Colorization failed"),
        }
        outcome
    })
    .await
    .map_err(|e| AppError::Internal(format!("task join error: {e}")))??;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        result.png,
    )
        .into_response())
}

async fn read_upload_field(multipart: &mut Multipart) -> Result<Vec<u8>, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let data = field.bytes().await.map_err(multipart_error)?;
        return Ok(data.to_vec());
    }

    Err(AppError::BadRequest(format!(
        "missing multipart field '{UPLOAD_FIELD}'"
    )))
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(err.body_text())
    } else {
        AppError::BadRequest(format!("multipart error: {}", err.body_text()))
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<ColorizeError> for AppError {
    fn from(err: ColorizeError) -> Self {
        if err.is_client_error() {
            AppError::BadRequest(format!("{err:#}"))
        } else {
            AppError::Internal(format!("{err:#}"))
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use image::{Rgb, RgbImage};
    use ndarray::{Array3, ArrayView2};
    use tower::ServiceExt;

    const BOUNDARY: &str = "recolor-test-boundary";

    struct FlatChroma;

    impl ChromaPredictor for FlatChroma {
        fn predict(&self, _: ArrayView2<'_, f32>) -> Result<Array3<f32>, ColorizeError> {
            Ok(Array3::from_elem((2, 56, 56), 8.0))
        }
    }

    struct BrokenChroma;

    impl ChromaPredictor for BrokenChroma {
        fn predict(&self, _: ArrayView2<'_, f32>) -> Result<Array3<f32>, ColorizeError> {
            Ok(Array3::zeros((313, 56, 56)))
        }
    }

    fn test_router_with(predictor: Arc<dyn ChromaPredictor>, config: AppConfig) -> Router {
        app_router(AppState::new(predictor, None, config))
    }

    fn test_router() -> Router {
        test_router_with(Arc::new(FlatChroma), AppConfig::default())
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
        pipeline::encode_png(&img).expect("encode test png")
    }

    fn multipart_body(field: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"photo.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn colorize_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/colorize")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("build request")
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&body).expect("json body")
    }

    #[tokio::test]
    async fn test_root_and_health_endpoints() {
        for uri in ["/", "/api/health"] {
            let resp = test_router()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
            assert_eq!(body_json(resp).await["status"], "ok");
        }
    }

    #[tokio::test]
    async fn test_colorize_returns_png_with_same_dimensions() {
        let resp = test_router()
            .oneshot(colorize_request(multipart_body("file", &png_bytes(400, 300))))
            .await
            .expect("response");

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("image/png")
        );
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("read body");
        let decoded = image::load_from_memory(&body).expect("decode png");
        assert_eq!((decoded.width(), decoded.height()), (400, 300));
    }

    #[tokio::test]
    async fn test_colorize_rejects_garbage_upload() {
        let resp = test_router()
            .oneshot(colorize_request(multipart_body("file", b"definitely not an image")))
            .await
            .expect("response");

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().is_some_and(|e| e.contains("decode")));
    }

    #[tokio::test]
    async fn test_colorize_requires_file_field() {
        let resp = test_router()
            .oneshot(colorize_request(multipart_body("image", &png_bytes(8, 8))))
            .await
            .expect("response");

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "missing multipart field 'file'");
    }

    #[tokio::test]
    async fn test_colorize_rejects_non_multipart_body() {
        let req = Request::builder()
            .method("POST")
            .uri("/colorize")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .expect("request");
        let resp = test_router().oneshot(req).await.expect("response");

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_colorize_enforces_body_limit() {
        let mut config = AppConfig::default();
        config.server.max_upload_bytes = 1024;
        let app = test_router_with(Arc::new(FlatChroma), config);

        let resp = app
            .oneshot(colorize_request(multipart_body("file", &vec![7u8; 8 * 1024])))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_colorize_reports_shape_defects_as_server_errors() {
        let app = test_router_with(Arc::new(BrokenChroma), AppConfig::default());
        let resp = app
            .oneshot(colorize_request(multipart_body("file", &png_bytes(16, 16))))
            .await
            .expect("response");

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().is_some_and(|e| e.contains("prediction")));
    }

    #[tokio::test]
    async fn test_model_summary_absent_for_mock_state() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/api/model").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_json_404() {
        let resp = test_router()
            .oneshot(Request::builder().uri("/api/nope/deeper").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "api endpoint not found: /api/nope/deeper");
    }

    #[tokio::test]
    async fn test_cors_preflight_is_permissive() {
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/colorize")
            .header(header::ORIGIN, "http://localhost:3000")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .expect("request");
        let resp = test_router().oneshot(req).await.expect("response");

        assert!(resp.status().is_success());
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }

    #[test]
    fn test_colorize_error_mapping() {
        let decode = ColorizeError::Decode(image::ImageError::IoError(std::io::Error::other("eof")));
        assert!(matches!(AppError::from(decode), AppError::BadRequest(_)));

        let shape = ColorizeError::shape("prediction", "[2, H, W]", &[3, 1, 1]);
        assert!(matches!(AppError::from(shape), AppError::Internal(_)));
    }

    #[test]
    fn test_inference_failure_keeps_runtime_cause() {
        let err = ColorizeError::Inference(anyhow::anyhow!("CUDA out of memory"));
        match AppError::from(err) {
            AppError::Internal(message) => {
                assert_eq!(message, "inference failed: CUDA out of memory");
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
