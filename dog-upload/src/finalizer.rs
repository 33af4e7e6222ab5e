use std::sync::Arc;
use tracing::{error, info, warn};

use crate::types::now_secs;
use crate::{
    mutate, BlobSink, FinalizeOutcome, ObjectId, RemoteObjectStore, SessionId, SessionStatus,
    SessionStore, UploadError, UploadResult, UploadSession,
};

/// Assembles a fully received session and delivers it to the remote store.
///
/// The finalizer is the only writer of the `Finalizing`, `Completed` and
/// `Failed` states. Delivery is at-most-once per session: callers race for a
/// claim (`Open -> Finalizing`) inside the store's atomic update, and only the
/// winner streams to the remote store.
#[derive(Clone)]
pub struct Finalizer {
    sessions: Arc<dyn SessionStore>,
    sink: Arc<dyn BlobSink>,
    remote: Arc<dyn RemoteObjectStore>,
}

impl Finalizer {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        sink: Arc<dyn BlobSink>,
        remote: Arc<dyn RemoteObjectStore>,
    ) -> Self {
        Self {
            sessions,
            sink,
            remote,
        }
    }

    pub async fn finalize(&self, id: &SessionId) -> UploadResult<FinalizeOutcome> {
        let session = self.sessions.get(id).await?;
        if !session.status.is_open() {
            return Self::settled_outcome(&session);
        }
        if !session.is_complete() {
            return Err(Self::not_ready(&session));
        }

        let claimed = self
            .sessions
            .update(
                id,
                mutate(|s| {
                    if !s.status.is_open() {
                        return Err(UploadError::not_open(s.id.as_str(), s.status.label()));
                    }
                    if !s.is_complete() {
                        return Err(Self::not_ready(s));
                    }
                    s.status = SessionStatus::Finalizing {
                        claimed_at: now_secs(),
                    };
                    s.updated_at = now_secs();
                    Ok(())
                }),
            )
            .await;

        let session = match claimed {
            Ok(session) => session,
            // Lost the race: someone else claimed (or already finished) this session
            Err(UploadError::SessionNotOpen { .. }) => {
                let current = self.sessions.get(id).await?;
                return Self::settled_outcome(&current);
            }
            Err(e) => return Err(e),
        };

        info!(
            session_id = %id,
            file_name = %session.file_name,
            chunks = session.expected_chunk_count,
            "Finalizing upload"
        );

        match self.deliver(&session).await {
            Ok(object_id) => {
                // Without a Completed record the chunks are the only trace of this upload
                if self.mark_completed(id, &object_id).await {
                    if let Err(e) = self.sink.purge(id).await {
                        warn!(session_id = %id, error = %e, "Failed to purge chunks after completion");
                    }
                }
                info!(session_id = %id, object_id = %object_id, "Upload delivered");
                Ok(FinalizeOutcome::Delivered { object_id })
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "Finalization failed, chunks retained");
                self.mark_failed(id, e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Stream the session's chunks, in index order, into the remote store
    async fn deliver(&self, session: &UploadSession) -> UploadResult<ObjectId> {
        let body = self
            .sink
            .read_in_order(&session.id, session.ordered_chunks())
            .await?;

        self.remote
            .create_object(&session.destination, &session.file_name, &session.file_type, body)
            .await
    }

    /// Record delivery; false when the record could not be updated
    async fn mark_completed(&self, id: &SessionId, object_id: &ObjectId) -> bool {
        let recorded = object_id.clone();
        let result = self
            .sessions
            .update(
                id,
                mutate(move |s| {
                    if !matches!(s.status, SessionStatus::Finalizing { .. }) {
                        return Err(UploadError::not_open(s.id.as_str(), s.status.label()));
                    }
                    let now = now_secs();
                    s.status = SessionStatus::Completed {
                        completed_at: now,
                        object_id: recorded,
                    };
                    s.updated_at = now;
                    Ok(())
                }),
            )
            .await;

        // The object exists remotely either way; that is what the uploader cares about
        match result {
            Ok(_) => true,
            Err(e) => {
                error!(
                    session_id = %id,
                    object_id = %object_id,
                    error = %e,
                    "Delivered upload could not be marked completed, chunks retained"
                );
                false
            }
        }
    }

    async fn mark_failed(&self, id: &SessionId, reason: String) {
        let result = self
            .sessions
            .update(
                id,
                mutate(move |s| {
                    if s.status.is_terminal() {
                        return Err(UploadError::not_open(s.id.as_str(), s.status.label()));
                    }
                    let now = now_secs();
                    s.status = SessionStatus::Failed {
                        failed_at: now,
                        reason,
                    };
                    s.updated_at = now;
                    Ok(())
                }),
            )
            .await;

        if let Err(e) = result {
            error!(session_id = %id, error = %e, "Failed upload could not be marked failed");
        }
    }

    /// Outcome for a session some other call already claimed
    fn settled_outcome(session: &UploadSession) -> UploadResult<FinalizeOutcome> {
        match &session.status {
            SessionStatus::Completed { object_id, .. } => Ok(FinalizeOutcome::AlreadyCompleted {
                object_id: object_id.clone(),
            }),
            SessionStatus::Finalizing { .. } => Ok(FinalizeOutcome::InProgress),
            SessionStatus::Failed { reason, .. } => Err(UploadError::RemoteStoreFailure {
                reason: reason.clone(),
            }),
            SessionStatus::Open => Err(Self::not_ready(session)),
        }
    }

    fn not_ready(session: &UploadSession) -> UploadError {
        UploadError::SessionNotReady {
            session_id: session.id.to_string(),
            received: session.received_count(),
            expected: session.expected_chunk_count,
        }
    }
}
