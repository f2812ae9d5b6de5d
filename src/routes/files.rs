use axum::{
    body::Body,
    extract::{Path, State},
    http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    response::Response,
    Json,
};
use tracing::warn;

use super::RouteState;
use crate::http_objects::{DeleteResponse, FileMetadataResponse, UploadServerAPIError};

fn content_disposition(filename: &str) -> String {
    let escaped: String = filename
        .chars()
        .map(|c| {
            if c == '"' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    format!("attachment; filename=\"{}\"", escaped)
}

/// Download a file
#[utoipa::path(
    get,
    path = "/file/{key}",
    params(("key" = String, Path, description = "Storage key of the file")),
    tag = "files",
    responses(
        (status = 200, description = "file contents"),
        (status = 404, description = "file not found"),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error")
    ),
)]
pub async fn download_file(
    Path(key): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response<Body>, UploadServerAPIError> {
    let download = state.files.fetch(&key).await?;
    let filename = match state.files.metadata(&key).await {
        Ok(record) => record.filename,
        Err(e) => {
            warn!(key = %key, "serving file without metadata: {}", e);
            key.clone()
        }
    };

    Response::builder()
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, download.size_bytes.to_string())
        .header(CONTENT_DISPOSITION, content_disposition(&filename))
        .body(Body::from_stream(download.stream))
        .map_err(|e| UploadServerAPIError::internal_error_str(&e.to_string()))
}

/// Get the recorded metadata of a file
#[utoipa::path(
    get,
    path = "/file/{key}/metadata",
    params(("key" = String, Path, description = "Storage key of the file")),
    tag = "files",
    responses(
        (status = 200, description = "file metadata", body = FileMetadataResponse),
        (status = 404, description = "file not found"),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error")
    ),
)]
pub async fn file_metadata(
    Path(key): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<FileMetadataResponse>, UploadServerAPIError> {
    let record = state.files.metadata(&key).await?;
    Ok(Json(record.into()))
}

/// Delete a file
#[utoipa::path(
    delete,
    path = "/delete/{key}",
    params(("key" = String, Path, description = "Storage key of the file")),
    tag = "files",
    responses(
        (status = 200, description = "file deleted", body = DeleteResponse),
        (status = 404, description = "file not found"),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error")
    ),
)]
pub async fn delete_file(
    Path(key): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<DeleteResponse>, UploadServerAPIError> {
    state.files.delete(&key).await?;
    Ok(Json(DeleteResponse {
        message: format!("File {} deleted successfully", key),
    }))
}
