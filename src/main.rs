use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::Method,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

mod error;
use error::AppError;
mod model;
use model::{Classifier, ClassifierError};
mod pipeline;
use pipeline::{DiagnosisResult, Pipeline, PipelineConfig};
mod sample;
use sample::{decode_upload, is_allowed_content_type};
mod utils;
use utils::{ensure_files_exist, ServerConfig};

struct AppState {
    pipeline: Pipeline,
}

#[derive(Serialize)]
struct PredictResponse {
    filename: Option<String>,
    content_type: Option<String>,
    #[serde(flatten)]
    diagnosis: DiagnosisResult,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    tracing::info!("Checking model...");
    ensure_files_exist(&config).await?;

    let classifier = load_classifier(&config)?;
    let state = Arc::new(AppState {
        pipeline: Pipeline::new(PipelineConfig::default(), classifier),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app(state, config.body_limit_bytes).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "tensorflow")]
fn load_classifier(config: &ServerConfig) -> Result<Box<dyn Classifier>, ClassifierError> {
    let classifier = model::TfClassifier::new(
        &config.model_path,
        &config.labels_path,
        &config.input_op,
        &config.output_op,
    )?;
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "tensorflow"))]
fn load_classifier(_config: &ServerConfig) -> Result<Box<dyn Classifier>, ClassifierError> {
    Err(ClassifierError::Runtime(
        "built without the `tensorflow` feature, no classifier available".to_string(),
    ))
}

fn app(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/predict", post(predict_handler))
        .route("/predict/", post(predict_handler))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, AppError> {
    let mut upload = None;

    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let filename = field.file_name().map(String::from);
            let content_type = field.content_type().map(String::from);
            if !is_allowed_content_type(content_type.as_deref()) {
                return Err(AppError::UnsupportedType);
            }
            let bytes = field.bytes().await?;
            upload = Some((filename, content_type, bytes));
            break;
        }
    }

    let (filename, content_type, bytes) = upload.ok_or(AppError::MissingFile)?;

    // decoding and inference are CPU-bound
    let diagnosis = tokio::task::spawn_blocking(move || -> Result<DiagnosisResult, AppError> {
        let sample = decode_upload(&bytes)?;
        Ok(state.pipeline.diagnose(&sample)?)
    })
    .await??;

    tracing::info!(
        filename = filename.as_deref().unwrap_or(""),
        category = ?diagnosis.category,
        top_label = %diagnosis.top_label,
        "prediction served"
    );

    Ok(Json(PredictResponse {
        filename,
        content_type,
        diagnosis,
    }))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{FailingClassifier, StubClassifier};
    use crate::sample::tests::encode_png;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use image::{Rgb, RgbImage};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const BOUNDARY: &str = "leafdiagnosisboundary";

    fn router_with(classifier: Box<dyn Classifier>) -> Router {
        let state = Arc::new(AppState {
            pipeline: Pipeline::new(PipelineConfig::default(), classifier),
        });
        app(state, 5 * 1024 * 1024)
    }

    fn stub_router(predictions: &[(&str, f32)]) -> (Router, Arc<AtomicUsize>) {
        let stub = StubClassifier::new(predictions);
        let calls = stub.calls.clone();
        (router_with(Box::new(stub)), calls)
    }

    fn multipart_request(uri: &str, field: &str, content_type: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        write!(
            body,
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"leaf.png\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .unwrap();
        body.extend_from_slice(bytes);
        write!(body, "\r\n--{BOUNDARY}--\r\n").unwrap();

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn leafy_png() -> Vec<u8> {
        encode_png(RgbImage::from_fn(224, 224, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([40, 160, 50])
            } else {
                Rgb([20, 30, 25])
            }
        }))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _) = stub_router(&[]);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "OK");
    }

    #[tokio::test]
    async fn confident_leaf_is_diagnosed() {
        let (app, calls) = stub_router(&[("Tomato___healthy", 0.91), ("Tomato___Late_blight", 0.05)]);
        let request = multipart_request("/predict", "file", "image/png", &leafy_png());
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["filename"], "leaf.png");
        assert_eq!(body["content_type"], "image/png");
        assert_eq!(body["top_label"], "Tomato___healthy");
        assert_eq!(body["top_confidence"], 0.91);
        assert_eq!(body["category"], "Healthy");
        assert_eq!(body["crop"], "Tomato");
        assert_eq!(body["status"], "Healthy");
        assert!(body["disease"].is_null());
        assert_eq!(body["predictions"].as_array().unwrap().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trailing_slash_route_is_served() {
        let (app, _) = stub_router(&[("Grape___Powdery_mildew", 0.8), ("Grape___healthy", 0.1)]);
        let request = multipart_request("/predict/", "file", "image/jpeg", &leafy_png());
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["category"], "Powdery");
        assert_eq!(body["disease"], "Powdery mildew");
    }

    #[tokio::test]
    async fn flat_image_is_gated_before_the_classifier() {
        let (app, calls) = stub_router(&[("Tomato___healthy", 0.99)]);
        let png = encode_png(RgbImage::from_pixel(300, 200, Rgb([128, 128, 128])));
        let response = app
            .oneshot(multipart_request("/predict", "file", "image/png", &png))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["category"], "Unknown");
        assert_eq!(body["top_label"], "unknown");
        assert!(body["top_confidence"].is_null());
        assert!(body["note"].as_str().unwrap().contains("Low detail"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abstention_is_a_normal_response() {
        let (app, _) = stub_router(&[("A___x", 0.50), ("B___y", 0.48)]);
        let response = app
            .oneshot(multipart_request("/predict", "file", "image/png", &leafy_png()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["category"], "Unknown");
        assert!(body["crop"].is_null());
        assert_eq!(body["predictions"][0]["label"], "A___x");
    }

    #[tokio::test]
    async fn disallowed_content_type_is_rejected() {
        let (app, calls) = stub_router(&[("Tomato___healthy", 0.99)]);
        let response = app
            .oneshot(multipart_request("/predict", "file", "image/gif", &leafy_png()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "Only JPG, JPEG and PNG images are allowed"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undecodable_upload_is_rejected() {
        let (app, _) = stub_router(&[("Tomato___healthy", 0.99)]);
        let response = app
            .oneshot(multipart_request("/predict", "file", "image/png", b"not an image"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Invalid image file");
    }

    #[tokio::test]
    async fn missing_file_field_is_rejected() {
        let (app, _) = stub_router(&[("Tomato___healthy", 0.99)]);
        let response = app
            .oneshot(multipart_request("/predict", "photo", "image/png", &leafy_png()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file uploaded");
    }

    #[tokio::test]
    async fn classifier_failure_is_a_server_error() {
        let app = router_with(Box::new(FailingClassifier));
        let response = app
            .oneshot(multipart_request("/predict", "file", "image/png", &leafy_png()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("graph exploded"));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let state = Arc::new(AppState {
            pipeline: Pipeline::new(
                PipelineConfig::default(),
                Box::new(StubClassifier::new(&[("Tomato___healthy", 0.99)])),
            ),
        });
        let response = app(state, 64)
            .oneshot(multipart_request("/predict", "file", "image/png", &leafy_png()))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }
}
