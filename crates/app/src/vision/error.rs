//! Error taxonomy for the processing engine and its HTTP mapping.

use std::time::Duration;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use video_ingest::CaptureError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Video file or camera could not be opened.
    #[error("video source unavailable: {0}")]
    SourceUnavailable(#[source] CaptureError),

    /// The detector failed on a frame.
    #[error("detector inference failed: {0:#}")]
    Inference(anyhow::Error),

    /// Annotated output could not be written.
    #[error("annotated output unavailable: {0}")]
    Writer(#[source] CaptureError),

    /// A running session did not reach idle in time.
    #[error("previous session did not stop within {0:?}")]
    StopTimeout(Duration),

    /// The camera feed was requested without starting the camera.
    #[error("camera is not active; call /start_camera first")]
    CameraInactive,

    /// Uploaded image could not be decoded or encoded.
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError for SessionError {
    fn status_code(&self) -> StatusCode {
        match self {
            SessionError::SourceUnavailable(_) | SessionError::Inference(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SessionError::StopTimeout(_) | SessionError::CameraInactive => StatusCode::CONFLICT,
            SessionError::Image(_) | SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Writer(_) | SessionError::Io(_) | SessionError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}
