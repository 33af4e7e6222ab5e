use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dog_upload::{ErrorKind, UploadError};
use serde_json::json;

/// HTTP rendering of [`UploadError`] in the Feathers error shape.
///
/// `error` duplicates `message` for browser clients that read `errorData.error`.
#[derive(Debug)]
pub struct UploadHttpError(pub UploadError);

impl From<UploadError> for UploadHttpError {
    fn from(e: UploadError) -> Self {
        Self(e)
    }
}

impl From<MultipartError> for UploadHttpError {
    fn from(e: MultipartError) -> Self {
        match e.status() {
            StatusCode::PAYLOAD_TOO_LARGE => Self(UploadError::too_large(e.body_text())),
            _ => Self(UploadError::invalid(format!("Malformed multipart body: {}", e.body_text()))),
        }
    }
}

impl UploadHttpError {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }

    /// Message safe to hand to a client; storage faults never leak paths or internals
    fn client_message(&self) -> String {
        match self.kind() {
            ErrorKind::Storage => "Internal storage error".to_string(),
            _ => self.0.to_string(),
        }
    }
}

impl IntoResponse for UploadHttpError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        if kind.is_client_error() {
            tracing::debug!(kind = %kind, error = %self.0, "Upload request rejected");
        } else {
            tracing::error!(kind = %kind, error = %self.0, "Upload request failed");
        }

        let status = StatusCode::from_u16(kind.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = self.client_message();
        let body = json!({
            "success": false,
            "error": message,
            "name": kind.name(),
            "message": message,
            "code": kind.status_code(),
            "className": kind.class_name(),
            "data": { "kind": kind.as_str() },
        });
        (status, Json(body)).into_response()
    }
}
