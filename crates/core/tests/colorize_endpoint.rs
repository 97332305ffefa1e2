use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use ndarray::{Array3, ArrayView2};
use recolor_core::config::AppConfig;
use recolor_core::error::ColorizeError;
use recolor_core::model::{ChromaPredictor, NETWORK_INPUT_SIZE};
use recolor_core::pipeline;
use recolor_core::server::{app_router, AppState};

const BOUNDARY: &str = "----recolor-e2e";

/// Tints warmer for brighter inputs and counts calls.
#[derive(Default)]
struct LuminanceTint {
    calls: AtomicUsize,
}

impl ChromaPredictor for LuminanceTint {
    fn predict(&self, luminance: ArrayView2<'_, f32>) -> Result<Array3<f32>, ColorizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(luminance.dim(), (NETWORK_INPUT_SIZE, NETWORK_INPUT_SIZE));
        let mean = luminance.mean().unwrap_or(0.0);
        let mut ab = Array3::zeros((2, 56, 56));
        ab.index_axis_mut(ndarray::Axis(0), 0).fill(mean / 2.0 + 25.0);
        ab.index_axis_mut(ndarray::Axis(0), 1).fill(20.0);
        Ok(ab)
    }
}

async fn spawn_server(predictor: Arc<dyn ChromaPredictor>) -> String {
    let app = app_router(AppState::new(predictor, None, AppConfig::default()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn upload_body(payload: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"scan.png\"\r\nContent-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn post_image(base: &str, png: &[u8]) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{base}/colorize"))
        .header(
            reqwest::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(upload_body(png))
        .send()
        .await
        .expect("send request")
}

fn grayscale_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let v = ((x + y) % 200 + 30) as u8;
        Rgb([v, v, v])
    });
    pipeline::encode_png(&img).expect("encode png")
}

#[tokio::test]
async fn oversized_upload_is_colorized_at_guarded_size() {
    let predictor = Arc::new(LuminanceTint::default());
    let base = spawn_server(predictor.clone()).await;

    let resp = post_image(&base, &grayscale_png(1000, 500)).await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("image/png")
    );

    let bytes = resp.bytes().await.expect("body");
    let out = image::load_from_memory(&bytes).expect("decode png").to_rgb8();
    assert_eq!(out.dimensions(), (800, 400));
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);

    let p = out.get_pixel(400, 200);
    assert!(p[0] > p[2], "expected a warm tint, got {p:?}");
}

#[tokio::test]
async fn concurrent_requests_are_deterministic() {
    let predictor = Arc::new(LuminanceTint::default());
    let base = spawn_server(predictor.clone()).await;
    let png = grayscale_png(320, 240);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let base = base.clone();
        let png = png.clone();
        handles.push(tokio::spawn(async move {
            let resp = post_image(&base, &png).await;
            assert_eq!(resp.status(), reqwest::StatusCode::OK);
            resp.bytes().await.expect("body").to_vec()
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        bodies.push(handle.await.expect("join"));
    }
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn undecodable_upload_gets_json_400() {
    let base = spawn_server(Arc::new(LuminanceTint::default())).await;

    let resp = post_image(&base, b"GIF89a but not really").await;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body = resp.bytes().await.expect("body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert!(json["error"].is_string());
}
