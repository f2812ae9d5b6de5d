use axum::{
    extract::{Multipart, Path, Query, State},
    http::HeaderMap,
    Json,
};
use nanoid::nanoid;
use tracing::info;

use super::RouteState;
use crate::{
    http_objects::{UpdateResponse, UploadParams, UploadResponse, UploadServerAPIError},
    uploads::UploadOutcome,
};

/// Client supplied size of the file being uploaded.
pub const UPLOAD_SIZE_HEADER: &str = "x-upload-size";

/// Expected file size for progress reporting, 0 when unknown.
///
/// The request body length is not used: it counts the multipart framing
/// and the other form fields.
pub fn declared_size(headers: &HeaderMap) -> u64 {
    headers
        .get(UPLOAD_SIZE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

#[derive(Default)]
struct ReceivedForm {
    email: Option<String>,
    stored: Option<(UploadOutcome, String)>,
}

async fn read_upload_form(
    state: &RouteState,
    form: &mut Multipart,
    session_id: &str,
    total_size: u64,
    received: &mut ReceivedForm,
) -> Result<(), UploadServerAPIError> {
    while let Some(field) = form.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "email" => received.email = Some(field.text().await?),
            "file" => {
                if received.stored.is_some() {
                    return Err(UploadServerAPIError::bad_request(
                        "only one file can be uploaded per request",
                    ));
                }
                let filename = field.file_name().unwrap_or_default().to_string();
                let outcome = state
                    .files
                    .store(field, &filename, total_size, Some(session_id))
                    .await?;
                received.stored = Some((outcome, filename));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Upload a file
#[utoipa::path(
    post,
    path = "/upload",
    params(UploadParams),
    request_body(content_type = "multipart/form-data", content = inline(crate::http_objects::UploadForm)),
    tag = "files",
    responses(
        (status = 200, description = "upload successful", body = UploadResponse),
        (status = 400, description = "bad request"),
        (status = 409, description = "upload session already in use"),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error")
    ),
)]
#[axum::debug_handler]
pub async fn upload_file(
    State(state): State<RouteState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    mut form: Multipart,
) -> Result<Json<UploadResponse>, UploadServerAPIError> {
    let session_id = params.session_id.unwrap_or_else(|| nanoid!());
    let total_size = declared_size(&headers);
    info!(session_id = %session_id, total_size, "receiving upload");

    let mut received = ReceivedForm::default();
    if let Err(e) =
        read_upload_form(&state, &mut form, &session_id, total_size, &mut received).await
    {
        if let Some((outcome, _)) = received.stored {
            state.files.discard(&outcome.key).await;
        }
        return Err(e);
    }

    let Some((outcome, filename)) = received.stored else {
        return Err(UploadServerAPIError::bad_request("file is required"));
    };
    let Some(email) = received.email.filter(|email| !email.trim().is_empty()) else {
        state.files.discard(&outcome.key).await;
        return Err(UploadServerAPIError::bad_request("email is required"));
    };

    let record = state.files.register(&outcome, &filename, &email).await?;
    Ok(Json(UploadResponse {
        message: "File uploaded successfully".to_string(),
        s3_key: record.s3_key,
        session_id,
    }))
}

/// Replace the contents of an existing file
#[utoipa::path(
    put,
    path = "/update/{key}",
    params(
        ("key" = String, Path, description = "Storage key of the file"),
        UploadParams,
    ),
    request_body(content_type = "multipart/form-data", content = inline(crate::http_objects::UpdateForm)),
    tag = "files",
    responses(
        (status = 200, description = "file updated", body = UpdateResponse),
        (status = 400, description = "bad request"),
        (status = 404, description = "file not found"),
        (status = 409, description = "upload session already in use"),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error")
    ),
)]
#[axum::debug_handler]
pub async fn update_file(
    Path(key): Path<String>,
    State(state): State<RouteState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    mut form: Multipart,
) -> Result<Json<UpdateResponse>, UploadServerAPIError> {
    let session_id = params.session_id.unwrap_or_else(|| nanoid!());
    let total_size = declared_size(&headers);

    while let Some(field) = form.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let outcome = state
            .files
            .overwrite(
                &key,
                field,
                filename.as_deref(),
                total_size,
                Some(&session_id),
            )
            .await?;
        return Ok(Json(UpdateResponse {
            message: "File updated successfully".to_string(),
            updated_key: outcome.key,
            session_id,
        }));
    }
    Err(UploadServerAPIError::bad_request("file is required"))
}
