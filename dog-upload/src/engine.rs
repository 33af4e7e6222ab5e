use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::types::now_secs;
use crate::{
    mutate, BlobSink, ChunkAdmission, ChunkLocator, ChunkRecord, FinalizeOutcome, Finalizer, NewSession,
    RemoteObjectStore, SessionId, SessionStatus, SessionStore, UploadConfig, UploadError,
    UploadResult, UploadSession, DEFAULT_CONTENT_TYPE,
};

/// The chunked upload state machine.
///
/// Creates sessions, admits chunks in any order, reports completion and hands
/// complete sessions to the [`Finalizer`]. Cheap to clone: all state lives in
/// the session store and blob sink.
#[derive(Clone)]
pub struct SessionEngine {
    sessions: Arc<dyn SessionStore>,
    sink: Arc<dyn BlobSink>,
    finalizer: Finalizer,
    config: UploadConfig,
}

impl SessionEngine {
    pub fn new<SS, B, R>(sessions: SS, sink: B, remote: R, config: UploadConfig) -> Self
    where
        SS: SessionStore + 'static,
        B: BlobSink + 'static,
        R: RemoteObjectStore + 'static,
    {
        Self::from_parts(Arc::new(sessions), Arc::new(sink), Arc::new(remote), config)
    }

    /// Build from already shared collaborators
    pub fn from_parts(
        sessions: Arc<dyn SessionStore>,
        sink: Arc<dyn BlobSink>,
        remote: Arc<dyn RemoteObjectStore>,
        config: UploadConfig,
    ) -> Self {
        let finalizer = Finalizer::new(Arc::clone(&sessions), Arc::clone(&sink), remote);
        Self {
            sessions,
            sink,
            finalizer,
            config,
        }
    }

    /// Open a new session with an empty chunk set
    pub async fn start_session(&self, request: NewSession) -> UploadResult<SessionId> {
        self.validate(&request)?;

        let now = now_secs();
        let file_type = if request.file_type.trim().is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            request.file_type
        };

        let session = UploadSession {
            id: SessionId::new(),
            file_name: request.file_name,
            file_type,
            file_size: request.file_size,
            destination: request.destination,
            expected_chunk_count: request.expected_chunk_count,
            chunks: BTreeMap::new(),
            status: SessionStatus::Open,
            created_at: now,
            updated_at: now,
            expires_at: now + self.config.session_ttl_secs(),
        };
        let id = session.id.clone();

        info!(
            session_id = %id,
            file_name = %session.file_name,
            file_size = session.file_size,
            chunks = session.expected_chunk_count,
            "Upload session started"
        );

        self.sessions.create(session).await?;
        Ok(id)
    }

    /// Accept one chunk.
    ///
    /// Re-sending an index replaces the recorded chunk and does not count twice.
    /// Completion is reported, never acted on: finalizing is a separate call.
    pub async fn admit_chunk(&self, id: &SessionId, index: i64, bytes: Bytes) -> UploadResult<ChunkAdmission> {
        let session = self.sessions.get(id).await?;
        if !session.status.is_open() {
            return Err(UploadError::not_open(id.as_str(), session.status.label()));
        }
        if index < 0 || index >= session.expected_chunk_count as i64 {
            return Err(UploadError::InvalidChunkIndex {
                index,
                expected: session.expected_chunk_count,
            });
        }
        let index = index as u32;
        let size_bytes = bytes.len() as u64;

        // A failed write leaves the session record untouched
        let locator = self.sink.put(id, index, bytes).await?;

        let ttl = self.config.session_ttl_secs();
        let recorded = locator.clone();
        let superseded = Arc::new(Mutex::new(None::<ChunkLocator>));
        let slot = Arc::clone(&superseded);
        let updated = self
            .sessions
            .update(
                id,
                mutate(move |s| {
                    // A finalize claim or expiry may have landed while the bytes were being written
                    if !s.status.is_open() {
                        return Err(UploadError::not_open(s.id.as_str(), s.status.label()));
                    }
                    let now = now_secs();
                    let previous = s.chunks.insert(
                        index,
                        ChunkRecord {
                            index,
                            locator: recorded,
                            size_bytes,
                            received_at: now,
                        },
                    );
                    *slot.lock() = previous.map(|c| c.locator);
                    s.updated_at = now;
                    s.expires_at = now + ttl;
                    Ok(())
                }),
            )
            .await;

        let updated = match updated {
            Ok(session) => session,
            Err(e) => {
                self.discard_blob(id, &locator).await;
                return Err(e);
            }
        };
        let previous = superseded.lock().take();
        if let Some(previous) = previous {
            self.discard_blob(id, &previous).await;
        }

        let admission = ChunkAdmission {
            accepted: true,
            received_count: updated.received_count(),
            expected_count: updated.expected_chunk_count,
            is_complete: updated.is_complete(),
            progress_percent: updated.progress_percent(),
        };

        debug!(
            session_id = %id,
            index,
            received = admission.received_count,
            expected = admission.expected_count,
            "Chunk admitted"
        );

        Ok(admission)
    }

    /// Finalize a fully received session. Idempotent.
    pub async fn complete_upload(&self, id: &SessionId) -> UploadResult<FinalizeOutcome> {
        self.finalizer.finalize(id).await
    }

    /// Current session record
    pub async fn session(&self, id: &SessionId) -> UploadResult<UploadSession> {
        self.sessions.get(id).await
    }

    /// Drop a session and its chunks. A session being finalized cannot be abandoned.
    ///
    /// An open session is failed first, so no chunk or finalize claim can land
    /// while its blobs go away. If the purge fails the failed record stays
    /// behind for the reaper.
    pub async fn abandon(&self, id: &SessionId) -> UploadResult<()> {
        self.sessions
            .update(
                id,
                mutate(|s| match s.status {
                    SessionStatus::Finalizing { .. } => Err(UploadError::not_open(s.id.as_str(), s.status.label())),
                    SessionStatus::Open => {
                        let now = now_secs();
                        s.status = SessionStatus::Failed {
                            failed_at: now,
                            reason: "abandoned".to_string(),
                        };
                        s.updated_at = now;
                        Ok(())
                    }
                    SessionStatus::Completed { .. } | SessionStatus::Failed { .. } => Ok(()),
                }),
            )
            .await?;

        self.sink.purge(id).await?;
        self.sessions.delete(id).await?;

        info!(session_id = %id, "Upload session abandoned");
        Ok(())
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    pub(crate) fn sessions(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.sessions)
    }

    pub(crate) fn sink(&self) -> Arc<dyn BlobSink> {
        Arc::clone(&self.sink)
    }

    /// Every check `start_session` makes except the destination, so a transport
    /// can reject a request before resolving (and creating) its destination
    pub fn check_limits(&self, request: &NewSession) -> UploadResult<()> {
        if request.file_name.trim().is_empty() {
            return Err(UploadError::invalid("File name is required"));
        }
        if request.file_size == 0 {
            return Err(UploadError::invalid("File size is required"));
        }
        if request.expected_chunk_count < 1 {
            return Err(UploadError::invalid("Expected chunk count must be at least 1"));
        }
        if request.expected_chunk_count > self.config.max_chunks {
            return Err(UploadError::invalid(format!(
                "Expected chunk count {} exceeds maximum {}",
                request.expected_chunk_count, self.config.max_chunks
            )));
        }
        if request.file_size > self.config.max_file_bytes {
            return Err(UploadError::invalid(format!(
                "File size {} exceeds maximum {}",
                request.file_size, self.config.max_file_bytes
            )));
        }
        Ok(())
    }

    fn validate(&self, request: &NewSession) -> UploadResult<()> {
        self.check_limits(request)?;
        if request.destination.is_empty() {
            return Err(UploadError::invalid("Destination is required"));
        }
        Ok(())
    }

    async fn discard_blob(&self, id: &SessionId, locator: &ChunkLocator) {
        if let Err(e) = self.sink.discard(id, locator).await {
            warn!(session_id = %id, locator = locator.as_str(), error = %e, "Failed to discard chunk blob");
        }
    }
}
