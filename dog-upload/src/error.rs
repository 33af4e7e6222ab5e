use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while running an upload session
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Request too large: {message}")]
    PayloadTooLarge { message: String },

    #[error("Upload session not found: {session_id}")]
    UnknownSession { session_id: String },

    #[error("Upload session already exists: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("Upload session {session_id} is {status}, not open")]
    SessionNotOpen {
        session_id: String,
        status: &'static str,
    },

    #[error("Upload session {session_id} is not ready: {received} of {expected} chunks received")]
    SessionNotReady {
        session_id: String,
        received: u32,
        expected: u32,
    },

    #[error("Invalid chunk index {index} (must be 0..{expected})")]
    InvalidChunkIndex { index: i64, expected: u32 },

    #[error("Failed to write chunk {index} of {session_id}: {source}")]
    WriteError {
        session_id: String,
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunk {index} of {session_id} is missing from storage")]
    MissingChunk { session_id: String, index: u32 },

    #[error("Remote object store failure: {reason}")]
    RemoteStoreFailure { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Stable error kinds callers can branch on.
///
/// Carries an HTTP-equivalent status in the Feathers style used across DogRS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    PayloadTooLarge,
    UnknownSession,
    DuplicateSession,
    SessionNotOpen,
    SessionNotReady,
    InvalidChunkIndex,
    WriteError,
    MissingChunk,
    RemoteStoreFailure,
    Storage,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::UnknownSession => 404,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::DuplicateSession
            | ErrorKind::SessionNotOpen
            | ErrorKind::SessionNotReady => 409,
            ErrorKind::InvalidChunkIndex => 422,
            ErrorKind::WriteError | ErrorKind::MissingChunk | ErrorKind::Storage => 500,
            ErrorKind::RemoteStoreFailure => 502,
        }
    }

    /// Feathers error `name` for the status code
    pub fn name(&self) -> &'static str {
        match self.status_code() {
            400 => "BadRequest",
            404 => "NotFound",
            413 => "PayloadTooLarge",
            409 => "Conflict",
            422 => "Unprocessable",
            502 => "BadGateway",
            _ => "GeneralError",
        }
    }

    /// Feathers error `className` for the status code
    pub fn class_name(&self) -> &'static str {
        match self.status_code() {
            400 => "bad-request",
            404 => "not-found",
            413 => "payload-too-large",
            409 => "conflict",
            422 => "unprocessable",
            502 => "bad-gateway",
            _ => "general-error",
        }
    }

    /// Client input or sequencing problems, as opposed to server-side faults
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::PayloadTooLarge => "PayloadTooLarge",
            ErrorKind::UnknownSession => "UnknownSession",
            ErrorKind::DuplicateSession => "DuplicateSession",
            ErrorKind::SessionNotOpen => "SessionNotOpen",
            ErrorKind::SessionNotReady => "SessionNotReady",
            ErrorKind::InvalidChunkIndex => "InvalidChunkIndex",
            ErrorKind::WriteError => "WriteError",
            ErrorKind::MissingChunk => "MissingChunk",
            ErrorKind::RemoteStoreFailure => "RemoteStoreFailure",
            ErrorKind::Storage => "Storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            UploadError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            UploadError::UnknownSession { .. } => ErrorKind::UnknownSession,
            UploadError::DuplicateSession { .. } => ErrorKind::DuplicateSession,
            UploadError::SessionNotOpen { .. } => ErrorKind::SessionNotOpen,
            UploadError::SessionNotReady { .. } => ErrorKind::SessionNotReady,
            UploadError::InvalidChunkIndex { .. } => ErrorKind::InvalidChunkIndex,
            UploadError::WriteError { .. } => ErrorKind::WriteError,
            UploadError::MissingChunk { .. } => ErrorKind::MissingChunk,
            UploadError::RemoteStoreFailure { .. } => ErrorKind::RemoteStoreFailure,
            UploadError::Io { .. } | UploadError::Serialization { .. } => ErrorKind::Storage,
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn too_large<S: Into<String>>(message: S) -> Self {
        Self::PayloadTooLarge {
            message: message.into(),
        }
    }

    /// Create an unknown session error
    pub fn unknown_session<S: Into<String>>(session_id: S) -> Self {
        Self::UnknownSession {
            session_id: session_id.into(),
        }
    }

    pub fn not_open<S: Into<String>>(session_id: S, status: &'static str) -> Self {
        Self::SessionNotOpen {
            session_id: session_id.into(),
            status,
        }
    }

    pub fn missing_chunk<S: Into<String>>(session_id: S, index: u32) -> Self {
        Self::MissingChunk {
            session_id: session_id.into(),
            index,
        }
    }

    /// Create a remote store failure from any error type
    pub fn remote<E: std::fmt::Display>(error: E) -> Self {
        Self::RemoteStoreFailure {
            reason: error.to_string(),
        }
    }

    pub fn write_failed<S: Into<String>>(session_id: S, index: u32, source: std::io::Error) -> Self {
        Self::WriteError {
            session_id: session_id.into(),
            index,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_feathers_codes() {
        assert_eq!(UploadError::invalid("x").kind().status_code(), 400);
        assert_eq!(UploadError::unknown_session("s").kind().name(), "NotFound");
        assert_eq!(
            UploadError::InvalidChunkIndex { index: -1, expected: 3 }.kind().class_name(),
            "unprocessable"
        );
        assert_eq!(UploadError::remote("down").kind().status_code(), 502);
        assert_eq!(UploadError::too_large("body").kind().class_name(), "payload-too-large");
        let io = UploadError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::Storage);
        assert!(!io.kind().is_client_error());
    }
}
