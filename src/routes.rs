use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    config::ServerConfig,
    files::FileService,
    http_objects::{
        DeleteResponse,
        FileMetadataResponse,
        UpdateForm,
        UpdateResponse,
        UploadForm,
        UploadResponse,
        UploadServerAPIError,
    },
    middleware::InstanceRequestSpan,
    uploads::{channel::ProgressChannelRegistry, progress::ProgressEvent},
};

mod files;
mod progress;
mod upload;

pub use upload::UPLOAD_SIZE_HEADER;

#[derive(OpenApi)]
#[openapi(
        paths(
            upload::upload_file,
            upload::update_file,
            progress::progress_stream,
            files::download_file,
            files::file_metadata,
            files::delete_file,
        ),
        components(
            schemas(
                UploadServerAPIError,
                UploadForm,
                UploadResponse,
                UpdateForm,
                UpdateResponse,
                DeleteResponse,
                FileMetadataResponse,
                ProgressEvent,
            )
        ),
        tags(
            (name = "upload-server", description = "File upload API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub files: Arc<FileService>,
    pub progress: Arc<ProgressChannelRegistry>,
}

pub fn create_routes(route_state: RouteState, config: &ServerConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route(
            "/upload",
            post(upload::upload_file).with_state(route_state.clone()),
        )
        .route(
            "/update/{key}",
            put(upload::update_file).with_state(route_state.clone()),
        )
        .route(
            "/progress/{session_id}",
            get(progress::progress_stream).with_state(route_state.clone()),
        )
        .route(
            "/file/{key}",
            get(files::download_file).with_state(route_state.clone()),
        )
        .route(
            "/file/{key}/metadata",
            get(files::file_metadata).with_state(route_state.clone()),
        )
        .route(
            "/delete/{key}",
            delete(files::delete_file).with_state(route_state.clone()),
        )
        .layer(DefaultBodyLimit::max(config.upload.max_upload_size_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(InstanceRequestSpan::new(
            &config.env,
            &config.instance_id,
        )))
}

async fn index() -> &'static str {
    "Upload server is running"
}
