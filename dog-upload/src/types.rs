use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use uuid::Uuid;

use crate::UploadResult;

/// Lazy, single-pass stream of chunk buffers handed to the remote store
pub type ChunkStream = Pin<Box<dyn Stream<Item = UploadResult<Bytes>> + Send>>;

/// Content type used when the client does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Unique identifier for an upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string (e.g. the `uploadId` a client sends back)
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids end up in file names, so only `[A-Za-z0-9_-]` is accepted
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle naming where the assembled object lands (a folder, a key prefix, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(pub String);

impl Destination {
    pub fn new<S: Into<String>>(handle: S) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the remote object store assigned to a delivered object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference into a blob sink
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkLocator(pub String);

impl ChunkLocator {
    pub fn new<S: Into<String>>(locator: S) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Status of an upload session.
///
/// Transitions are monotonic: `Open -> Finalizing -> Completed | Failed`.
/// Nothing leaves `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Finalizing { claimed_at: i64 },
    Completed { completed_at: i64, object_id: ObjectId },
    Failed { failed_at: i64, reason: String },
}

impl SessionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed { .. } | SessionStatus::Failed { .. })
    }

    /// Short label used in errors, logs and API responses
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Finalizing { .. } => "finalizing",
            SessionStatus::Completed { .. } => "completed",
            SessionStatus::Failed { .. } => "failed",
        }
    }
}

/// One arrived chunk, owned by its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: u32,
    pub locator: ChunkLocator,
    pub size_bytes: u64,
    pub received_at: i64,
}

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: SessionId,

    // Declared by the client, never verified against the uploaded bytes
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,

    pub destination: Destination,
    pub expected_chunk_count: u32,
    pub chunks: BTreeMap<u32, ChunkRecord>,
    pub status: SessionStatus,

    pub created_at: i64,
    pub updated_at: i64,
    /// End of the session lease; an `Open` session past this point is swept
    pub expires_at: i64,
}

impl UploadSession {
    /// Number of distinct chunk indices received
    pub fn received_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// True when every index `0..expected_chunk_count` is present
    pub fn is_complete(&self) -> bool {
        self.received_count() == self.expected_chunk_count
            && (0..self.expected_chunk_count).all(|i| self.chunks.contains_key(&i))
    }

    pub fn progress_percent(&self) -> u8 {
        progress_percent(self.received_count(), self.expected_chunk_count)
    }

    pub fn received_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.size_bytes).sum()
    }

    /// Recorded chunks in assembly order
    pub fn ordered_chunks(&self) -> Vec<ChunkRecord> {
        self.chunks.values().cloned().collect()
    }
}

/// `round(received / expected * 100)`
pub fn progress_percent(received: u32, expected: u32) -> u8 {
    if expected == 0 {
        return 0;
    }
    ((received as f64 / expected as f64) * 100.0).round().min(100.0) as u8
}

/// Request to open a new upload session
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub destination: Destination,
    pub expected_chunk_count: u32,
}

impl NewSession {
    pub fn new<S: Into<String>>(file_name: S, file_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            ..Self::default()
        }
    }

    pub fn with_file_type<S: Into<String>>(mut self, file_type: S) -> Self {
        self.file_type = file_type.into();
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_expected_chunks(mut self, count: u32) -> Self {
        self.expected_chunk_count = count;
        self
    }
}

/// Result of admitting a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkAdmission {
    pub accepted: bool,
    pub received_count: u32,
    pub expected_count: u32,
    pub is_complete: bool,
    pub progress_percent: u8,
}

/// Result of a finalize attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This caller won the claim and delivered the object
    Delivered { object_id: ObjectId },
    /// An earlier finalize already delivered the object
    AlreadyCompleted { object_id: ObjectId },
    /// Another caller holds the claim and is streaming right now
    InProgress,
}

impl FinalizeOutcome {
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            FinalizeOutcome::Delivered { object_id }
            | FinalizeOutcome::AlreadyCompleted { object_id } => Some(object_id),
            FinalizeOutcome::InProgress => None,
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
