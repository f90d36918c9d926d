use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::model::ClassifierError;
use crate::sample::SampleError;

/// Request-level failures of the predict endpoint.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("No file uploaded")]
    MissingFile,
    #[error("Only JPG, JPEG and PNG images are allowed")]
    UnsupportedType,
    #[error(transparent)]
    InvalidImage(#[from] SampleError),
    #[error("Malformed upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Prediction failed: {0}")]
    Inference(#[from] ClassifierError),
    #[error("Prediction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::MissingFile | AppError::UnsupportedType | AppError::InvalidImage(_) => {
                StatusCode::BAD_REQUEST
            }
            // oversized bodies surface here as 413
            AppError::Multipart(err) => err.status(),
            AppError::Inference(_) | AppError::Task(_) => {
                tracing::error!(error = %self, "predict request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
