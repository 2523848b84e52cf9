use crate::config::BODY_LIMIT_SLACK;
use crate::error::UploadError;
use crate::session::{
    AttachmentResponse, CompleteRequest, InitRequest, InitResponse, StatusResponse, UploadService,
};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::extract::Multipart;
use bytes::Bytes;
use std::collections::HashMap;

#[derive(Clone)]
pub struct UploadState {
    pub service: UploadService,
}

/// API Routes
pub fn routes(service: UploadService) -> Router {
    let limits = service.limits();
    let chunk_limit = limits.chunk_size() as usize + BODY_LIMIT_SLACK;
    let single_limit = limits.max_upload_bytes() as usize + BODY_LIMIT_SLACK;

    Router::new()
        .route("/", get(root))
        .route("/metrics", get(metrics))
        .route("/attachments/upload-init", post(upload_init))
        .route("/attachments/upload-status", get(upload_status))
        .route(
            "/attachments/upload-chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/attachments/upload-complete", post(upload_complete))
        .route("/attachments/upload/:upload_id", delete(upload_abort))
        .route(
            "/attachments/upload",
            post(upload_single).layer(DefaultBodyLimit::max(single_limit)),
        )
        .route("/attachments/temp/:temp_identifier/:filename", get(serve_temp_file))
        .with_state(UploadState { service })
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "chunkport",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Resumable chunked attachment uploads"
    }))
}

async fn metrics(State(state): State<UploadState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.service.metrics().render(),
    )
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, UploadError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| UploadError::validation("invalid_request", rejection.body_text()))
}

fn multipart_error(e: axum_extra::extract::multipart::MultipartError) -> UploadError {
    UploadError::validation("invalid_multipart", e.body_text())
}

async fn upload_init(
    State(state): State<UploadState>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> Result<Json<InitResponse>, UploadError> {
    let req = json_body(payload)?;
    tracing::debug!("POST /attachments/upload-init filename={:?} size={}", req.filename, req.size);
    Ok(Json(state.service.init(req).await?))
}

async fn upload_status(
    State(state): State<UploadState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<StatusResponse>, UploadError> {
    let upload_id = params
        .get("upload_id")
        .ok_or_else(|| UploadError::validation("missing_field", "upload_id is required"))?;
    Ok(Json(state.service.status(upload_id).await?))
}

async fn upload_chunk(
    State(state): State<UploadState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, UploadError> {
    let mut upload_id: Option<String> = None;
    let mut chunk_index: Option<String> = None;
    let mut chunk: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "upload_id" => upload_id = Some(field.text().await.map_err(multipart_error)?),
            "chunk_index" => chunk_index = Some(field.text().await.map_err(multipart_error)?),
            "chunk" => chunk = Some(field.bytes().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    // No upload id reads as an unknown upload
    let upload_id = upload_id.ok_or(UploadError::NotFound)?;
    let chunk_index: i64 = chunk_index
        .as_deref()
        .map(str::trim)
        .ok_or_else(|| UploadError::validation("missing_field", "chunk_index is required"))?
        .parse()
        .map_err(|_| UploadError::validation("invalid_chunk_index", "chunk_index must be an integer"))?;
    let chunk = chunk.ok_or_else(|| UploadError::validation("missing_field", "chunk is required"))?;

    state.service.put_chunk(upload_id.trim(), chunk_index, chunk).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn upload_complete(
    State(state): State<UploadState>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<AttachmentResponse>, UploadError> {
    let req = json_body(payload)?;
    Ok(Json(state.service.complete(req).await?))
}

async fn upload_abort(
    State(state): State<UploadState>,
    Path(upload_id): Path<String>,
) -> Result<Json<serde_json::Value>, UploadError> {
    state.service.abort(&upload_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn upload_single(
    State(state): State<UploadState>,
    mut multipart: Multipart,
) -> Result<Json<AttachmentResponse>, UploadError> {
    let mut temp_identifier = String::new();
    let mut filename = String::new();
    let mut mime_type: Option<String> = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                filename = field.file_name().unwrap_or("upload.bin").to_string();
                mime_type = field.content_type().map(|m| m.to_string());
                data = Some(field.bytes().await.map_err(multipart_error)?);
            }
            "temp_identifier" => temp_identifier = field.text().await.map_err(multipart_error)?,
            _ => {}
        }
    }

    let data = data.ok_or_else(|| UploadError::validation("missing_field", "file is required"))?;
    tracing::debug!("POST /attachments/upload filename={:?} bytes={}", filename, data.len());

    let response = state
        .service
        .upload_single(temp_identifier.trim(), &filename, &data, mime_type)
        .await?;
    Ok(Json(response))
}

async fn serve_temp_file(
    State(state): State<UploadState>,
    Path((temp_identifier, filename)): Path<(String, String)>,
) -> Result<Response, UploadError> {
    let area = state.service.temp_area();
    let data = area.read(&temp_identifier, &filename).await?.ok_or(UploadError::NotFound)?;

    // Declared mime types stay in the sidecar; serving goes by extension
    let content_type = mime_guess::from_path(&filename).first_or_octet_stream();

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
        ],
        data,
    )
        .into_response())
}
