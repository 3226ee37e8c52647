// src/error.rs
//! Error taxonomy for the pipeline service.
//!
//! Four caller-facing categories: validation (400), conflict (409),
//! provider/storage/timeout (500). Infrastructure errors convert via `#[from]`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Bad input or an invalid generated artifact. Never retried
    /// automatically; the caller must re-invoke the step.
    #[error("{0}")]
    Validation(String),

    /// A generative provider rejected or failed a request. Carries the
    /// provider-supplied detail (status code, body, task message).
    #[error("provider error: {0}")]
    Provider(String),

    /// Another step is already running for this project.
    #[error("step {step} is already running for project {project}")]
    Conflict { project: String, step: u32 },

    /// An expected upstream artifact is missing from the project directory.
    #[error("{0}")]
    Storage(String),

    /// The video task poll loop ran out of attempts.
    #[error("video generation task did not finish after {attempts} poll attempts")]
    Timeout { attempts: u32 },

    /// A step task ended without producing a result (panic or runtime
    /// shutdown mid-step).
    #[error("internal error: {0}")]
    Internal(String),

    /// The external concatenation tool failed.
    #[error("ffmpeg error: {0}")]
    Ffmpeg(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
