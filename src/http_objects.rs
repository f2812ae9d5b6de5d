use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metadata_store::FileMetadata;
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::{IntoParams, ToSchema};

use crate::{files::FileError, uploads::UploadError};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct UploadServerAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl UploadServerAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn internal_error_str(e: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn conflict(message: &str) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for UploadServerAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<FileError> for UploadServerAPIError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound(key) => Self::not_found(&format!("file not found: {}", key)),
            // a broken request body is the client's fault
            FileError::Upload(UploadError::Source(e)) => {
                Self::bad_request(&format!("failed reading upload: {}", e))
            }
            FileError::Upload(e @ UploadError::SessionInUse(_)) => Self::conflict(&e.to_string()),
            e => Self::internal_error(e.into()),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for UploadServerAPIError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        Self::new(e.status(), &e.body_text())
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UploadParams {
    /// Correlates the upload with `GET /progress/{session_id}`. Generated
    /// when absent.
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub message: String,
    pub s3_key: String,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateResponse {
    pub message: String,
    pub updated_key: String,
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FileMetadataResponse {
    pub s3_key: String,
    pub filename: String,
    pub email: String,
    pub uploaded_at: u64,
}

impl From<FileMetadata> for FileMetadataResponse {
    fn from(record: FileMetadata) -> Self {
        Self {
            s3_key: record.s3_key,
            filename: record.filename,
            email: record.email,
            uploaded_at: record.uploaded_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadForm {
    #[schema(format = "binary")]
    /// File to upload
    pub file: String,
    /// Address notified once the upload is stored
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateForm {
    #[schema(format = "binary")]
    /// Replacement contents
    pub file: String,
}
