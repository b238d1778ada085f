use actix_multipart::MultipartError;
use actix_web::error::BlockingError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::error::ClassifierError;

/// Failures of the upload endpoints. Rendered as `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    /// The form has no `file` field.
    MissingFile,
    PayloadTooLarge { limit: usize },
    /// Kept as text so the error can cross to the blocking pool.
    Multipart(String),
    /// Spooling the upload to disk failed.
    Upload(std::io::Error),
    Classifier(ClassifierError),
    /// The blocking worker running inference went away.
    Blocking,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFile => write!(f, "Form field 'file' is required"),
            Self::PayloadTooLarge { limit } => {
                write!(f, "Uploaded file exceeds the {limit} byte limit")
            }
            Self::Multipart(e) => write!(f, "Malformed multipart request: {e}"),
            Self::Upload(e) => write!(f, "Could not store upload: {e}"),
            Self::Classifier(e) => write!(f, "{e}"),
            Self::Blocking => write!(f, "Inference worker failed"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upload(e) => Some(e),
            Self::Classifier(e) => Some(e),
            _ => None,
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::Classifier(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Upload(_) | Self::Classifier(_) | Self::Blocking => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::Multipart(err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self::Upload(err)
    }
}

impl From<ClassifierError> for ApiError {
    fn from(err: ClassifierError) -> Self {
        Self::Classifier(err)
    }
}

impl From<BlockingError> for ApiError {
    fn from(_: BlockingError) -> Self {
        Self::Blocking
    }
}
