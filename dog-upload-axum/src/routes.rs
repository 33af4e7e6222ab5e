use axum::{
    extract::{rejection::JsonRejection, Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use dog_upload::{
    ChunkStream, FinalizeOutcome, NewSession, SessionEngine, SessionId, SessionStatus, UploadError,
    UploadSession, DEFAULT_CONTENT_TYPE,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{UploadHttpError, UploadState};

type ApiResult<T> = Result<T, UploadHttpError>;

/// The `/api/upload` routes and `/health`
pub fn upload_router(state: UploadState) -> Router<()> {
    Router::new()
        .route("/api/upload", post(direct_upload))
        .route("/api/upload/start", post(start_upload))
        .route("/api/upload/chunk", post(upload_chunk))
        .route("/api/upload/complete", post(complete_upload))
        .route("/api/upload/{id}", get(upload_status).delete(abandon_upload))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

fn map_json_rejection(rejection: JsonRejection) -> UploadHttpError {
    UploadError::invalid(format!("Failed to parse the request body as JSON: {}", rejection.body_text())).into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadRequest {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub studio_name: String,
    #[serde(default)]
    pub num_sheets: Option<u32>,
    /// Client-side chunk count; derived from `fileSize` and the chunk size when absent
    #[serde(default)]
    pub total_chunks: Option<u32>,
}

async fn start_upload(
    State(state): State<UploadState>,
    body: Result<Json<StartUploadRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = body.map_err(map_json_rejection)?;

    let chunk_size = state.config().chunk_size;
    let total_chunks = match req.total_chunks {
        Some(count) => count,
        None => state.config().chunks_for(req.file_size)?,
    };
    let request = NewSession::new(req.file_name.clone(), req.file_size)
        .with_file_type(req.file_type.unwrap_or_default())
        .with_expected_chunks(total_chunks);

    // Rejected requests must not create a remote folder
    state.engine.check_limits(&request)?;
    let destination = state.resolver.resolve(&req.studio_name, req.num_sheets).await?;

    let id = state
        .engine
        .start_session(request.with_destination(destination))
        .await?;

    Ok(Json(json!({
        "success": true,
        "uploadId": id,
        "chunkSize": chunk_size,
        "totalChunks": total_chunks,
        "message": format!("Upload session started for {}", req.file_name),
    })))
}

#[derive(Default)]
struct ChunkForm {
    upload_id: Option<String>,
    chunk_index: Option<String>,
    total_chunks: Option<String>,
    chunk: Option<Bytes>,
}

async fn read_chunk_form(mut multipart: Multipart) -> ApiResult<ChunkForm> {
    let mut form = ChunkForm::default();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "uploadId" => form.upload_id = Some(field.text().await?),
            "chunkIndex" => form.chunk_index = Some(field.text().await?),
            "totalChunks" => form.total_chunks = Some(field.text().await?),
            "chunk" => form.chunk = Some(field.bytes().await?),
            _ => {}
        }
    }
    Ok(form)
}

async fn upload_chunk(State(state): State<UploadState>, multipart: Multipart) -> ApiResult<Json<Value>> {
    let form = read_chunk_form(multipart).await?;
    let (Some(upload_id), Some(raw_index), Some(chunk)) = (form.upload_id, form.chunk_index, form.chunk) else {
        return Err(UploadError::invalid("Missing required fields").into());
    };

    let id = SessionId::from_string(upload_id);
    // Anything that is not a non-negative integer is out of range
    let index = raw_index.trim().parse::<i64>().unwrap_or(-1);

    let admission = state.engine.admit_chunk(&id, index, chunk).await?;

    if let Some(claimed) = form.total_chunks.and_then(|v| v.trim().parse::<u32>().ok()) {
        if claimed != admission.expected_count {
            warn!(
                session_id = %id,
                claimed,
                expected = admission.expected_count,
                "Client chunk count disagrees with session, using session value"
            );
        }
    }

    if admission.is_complete && state.config().auto_finalize {
        spawn_finalize(state.engine.clone(), id.clone());
    }

    Ok(Json(json!({
        "success": true,
        "accepted": admission.accepted,
        "isComplete": admission.is_complete,
        "progress": admission.progress_percent,
        "receivedChunks": admission.received_count,
        "totalChunks": admission.expected_count,
        "message": format!("Chunk {}/{} uploaded", index + 1, admission.expected_count),
    })))
}

fn spawn_finalize(engine: SessionEngine, id: SessionId) {
    tokio::spawn(async move {
        match engine.complete_upload(&id).await {
            Ok(FinalizeOutcome::Delivered { object_id }) => {
                info!(session_id = %id, object_id = %object_id, "Upload finalized in background")
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %id, error = %e, "Background finalize failed"),
        }
    });
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    #[serde(default)]
    pub upload_id: String,
}

async fn complete_upload(
    State(state): State<UploadState>,
    body: Result<Json<CompleteUploadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(map_json_rejection)?;
    if req.upload_id.trim().is_empty() {
        return Err(UploadError::invalid("Missing upload ID").into());
    }

    let id = SessionId::from_string(req.upload_id);
    let outcome = state.engine.complete_upload(&id).await?;

    let (status, label, message) = match &outcome {
        FinalizeOutcome::Delivered { .. } => (StatusCode::OK, "uploaded", "Upload completed"),
        FinalizeOutcome::AlreadyCompleted { .. } => (StatusCode::OK, "already_completed", "Upload already completed"),
        FinalizeOutcome::InProgress => (StatusCode::ACCEPTED, "in_progress", "Upload is being finalized"),
    };

    Ok((
        status,
        Json(json!({
            "success": true,
            "status": label,
            "objectId": outcome.object_id(),
            "message": message,
        })),
    ))
}

fn session_summary(session: &UploadSession) -> Value {
    let (object_id, reason) = match &session.status {
        SessionStatus::Completed { object_id, .. } => (Some(object_id.as_str()), None),
        SessionStatus::Failed { reason, .. } => (None, Some(reason.as_str())),
        _ => (None, None),
    };

    json!({
        "success": true,
        "uploadId": session.id,
        "fileName": session.file_name,
        "fileType": session.file_type,
        "fileSize": session.file_size,
        "destination": session.destination,
        "status": session.status.label(),
        "receivedChunks": session.received_count(),
        "totalChunks": session.expected_chunk_count,
        "receivedBytes": session.received_bytes(),
        "progress": session.progress_percent(),
        "isComplete": session.is_complete(),
        "objectId": object_id,
        "error": reason,
        "createdAt": session.created_at,
        "updatedAt": session.updated_at,
        "expiresAt": session.expires_at,
    })
}

async fn upload_status(State(state): State<UploadState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let session = state.engine.session(&SessionId::from_string(id)).await?;
    Ok(Json(session_summary(&session)))
}

async fn abandon_upload(State(state): State<UploadState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let id = SessionId::from_string(id);
    state.engine.abandon(&id).await?;
    Ok(Json(json!({
        "success": true,
        "uploadId": id,
        "message": "Upload abandoned",
    })))
}

struct DirectFile {
    name: String,
    mime_type: String,
    data: Bytes,
}

/// Single-request upload of small files straight into a studio folder
async fn direct_upload(State(state): State<UploadState>, mut multipart: Multipart) -> ApiResult<Json<Value>> {
    let mut studio_name = None;
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "studioName" => studio_name = Some(field.text().await?),
            "files" => {
                let name = field.file_name().unwrap_or_default().to_string();
                let mime_type = field
                    .content_type()
                    .filter(|t| !t.is_empty())
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                let data = field.bytes().await?;
                if name.trim().is_empty() {
                    return Err(UploadError::invalid("Every file needs a file name").into());
                }
                files.push(DirectFile { name, mime_type, data });
            }
            _ => {}
        }
    }

    let Some(studio_name) = studio_name.filter(|s| !s.trim().is_empty()) else {
        return Err(UploadError::invalid("Studio name is required").into());
    };
    if files.is_empty() {
        return Err(UploadError::invalid("No files provided").into());
    }

    let destination = state.resolver.resolve(&studio_name, None).await?;

    let mut objects = Vec::with_capacity(files.len());
    for file in files {
        let size = file.data.len();
        let body: ChunkStream = Box::pin(futures::stream::once(async move { Ok::<_, UploadError>(file.data) }));
        let object_id = state
            .remote
            .create_object(&destination, &file.name, &file.mime_type, body)
            .await?;
        info!(file_name = %file.name, object_id = %object_id, size, "File uploaded directly");
        objects.push(json!({
            "fileName": file.name,
            "objectId": object_id,
            "size": size,
        }));
    }

    Ok(Json(json!({
        "success": true,
        "destination": destination,
        "objects": objects,
        "message": format!("Uploaded {} file(s)", objects.len()),
    })))
}
