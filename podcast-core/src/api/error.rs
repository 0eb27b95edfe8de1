use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::catalog::CatalogError;
use crate::feed::FeedError;
use crate::processing::ProcessingError;
use crate::upload::UploadError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Upload(err) => classify_upload(err),
            ApiError::Catalog(err) => classify_catalog(err),
            ApiError::Feed(FeedError::ShowNotFound(_)) => (StatusCode::NOT_FOUND, "show_not_found"),
            ApiError::Feed(FeedError::Catalog(err)) => classify_catalog(err),
            ApiError::Feed(FeedError::InvalidBaseUrl(_)) => (StatusCode::BAD_REQUEST, "invalid_base_url"),
            ApiError::Processing(err) => match err {
                ProcessingError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
                ProcessingError::QueueClosed => (StatusCode::SERVICE_UNAVAILABLE, "queue_closed"),
                ProcessingError::Catalog(err) => classify_catalog(err),
                ProcessingError::MissingAudio { .. } => (StatusCode::CONFLICT, "missing_audio"),
                ProcessingError::Probe(_) | ProcessingError::Transcode(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "processing_failed")
                }
            },
        }
    }
}

fn classify_upload(err: &UploadError) -> (StatusCode, &'static str) {
    match err {
        UploadError::NotFound { .. } => (StatusCode::NOT_FOUND, "upload_not_found"),
        UploadError::Incomplete { .. } => (StatusCode::BAD_REQUEST, "incomplete_upload"),
        UploadError::MissingChunk { .. } => (StatusCode::BAD_REQUEST, "missing_chunk"),
        UploadError::InvalidChunkIndex { .. }
        | UploadError::InvalidUploadId(_)
        | UploadError::TotalMismatch { .. } => (StatusCode::BAD_REQUEST, "invalid_chunk"),
        UploadError::Corrupted { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "corrupted_upload"),
        UploadError::Io { .. } | UploadError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
        }
    }
}

fn classify_catalog(err: &CatalogError) -> (StatusCode, &'static str) {
    match err {
        CatalogError::ShowNotFound(_) => (StatusCode::NOT_FOUND, "show_not_found"),
        CatalogError::EpisodeNotFound { .. } => (StatusCode::NOT_FOUND, "episode_not_found"),
        CatalogError::EpisodeBusy { .. } => (StatusCode::CONFLICT, "episode_busy"),
        CatalogError::InvalidId(_) => (StatusCode::BAD_REQUEST, "invalid_id"),
        CatalogError::Malformed { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "corrupted_record"),
        CatalogError::Io { .. } | CatalogError::Serialization(_) | CatalogError::Join(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.classify();
        if status.is_server_error() {
            error!(error = %self, kind, "request failed");
        }
        let body = Json(json!({
            "error": kind,
            "details": self.to_string(),
        }));
        (status, body).into_response()
    }
}
