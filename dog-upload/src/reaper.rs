use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::types::now_secs;
use crate::{
    mutate, BlobSink, SessionEngine, SessionId, SessionStatus, SessionStore, UploadConfig,
    UploadError, UploadResult, UploadSession,
};

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open sessions whose lease ran out
    pub expired: usize,
    /// Completed or failed sessions dropped after the retention window
    pub evicted: usize,
    /// Finalize claims whose owner never came back
    pub abandoned_finalizations: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.expired + self.evicted + self.abandoned_finalizations
    }
}

/// Session expiry reaper.
///
/// Sessions nobody finishes would otherwise keep their chunks forever.
/// Each sweep:
/// - fails and deletes `Open` sessions past `expires_at`
/// - fails `Finalizing` sessions claimed longer than the session TTL ago
/// - deletes terminal sessions (and any chunks left behind) once
///   `terminal_retention` has passed since their last update
pub struct SessionReaper {
    sessions: Arc<dyn SessionStore>,
    sink: Arc<dyn BlobSink>,
    session_ttl_secs: i64,
    retention_secs: i64,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(sessions: Arc<dyn SessionStore>, sink: Arc<dyn BlobSink>, config: &UploadConfig) -> Self {
        Self {
            sessions,
            sink,
            session_ttl_secs: config.session_ttl_secs(),
            retention_secs: config.terminal_retention_secs(),
            interval: config.sweep_interval,
        }
    }

    /// Reaper over the same stores an engine uses
    pub fn for_engine(engine: &SessionEngine) -> Self {
        Self::new(engine.sessions(), engine.sink(), engine.config())
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run sweeps forever at the configured interval
    pub async fn start(self) -> UploadResult<()> {
        let mut ticker = interval(self.interval);

        info!("Starting session reaper with interval: {:?}", self.interval);

        loop {
            ticker.tick().await;

            match self.sweep_once().await {
                Ok(report) if report.total() > 0 => {
                    info!(
                        expired = report.expired,
                        evicted = report.evicted,
                        abandoned = report.abandoned_finalizations,
                        "Session sweep finished"
                    );
                }
                Ok(_) => debug!("No stale sessions found"),
                Err(e) => warn!("Error during session sweep: {}", e),
            }
        }
    }

    /// Run one sweep against the current clock
    pub async fn sweep_once(&self) -> UploadResult<SweepReport> {
        self.sweep_at(now_secs()).await
    }

    /// Run one sweep as if the clock read `now` (unix seconds)
    pub async fn sweep_at(&self, now: i64) -> UploadResult<SweepReport> {
        let mut report = SweepReport::default();

        for session in self.sessions.list().await? {
            let id = session.id.clone();
            let result = match &session.status {
                SessionStatus::Open if session.expires_at <= now => {
                    self.expire(&session).await.map(|swept| {
                        if swept {
                            report.expired += 1;
                        }
                    })
                }
                SessionStatus::Finalizing { claimed_at } if claimed_at + self.session_ttl_secs <= now => {
                    self.abandon_claim(&id, *claimed_at).await.map(|swept| {
                        if swept {
                            report.abandoned_finalizations += 1;
                        }
                    })
                }
                status if status.is_terminal() && session.updated_at + self.retention_secs <= now => {
                    self.evict(&id).await.map(|_| report.evicted += 1)
                }
                _ => Ok(()),
            };

            // One bad record must not stop the sweep
            if let Err(e) = result {
                warn!(session_id = %id, error = %e, "Failed to sweep session");
            }
        }

        Ok(report)
    }

    async fn expire(&self, session: &UploadSession) -> UploadResult<bool> {
        let expires_at = session.expires_at;
        let failed = self
            .sessions
            .update(
                &session.id,
                mutate(move |s| {
                    // A chunk may have renewed the lease since the listing
                    if !s.status.is_open() || s.expires_at != expires_at {
                        return Err(UploadError::not_open(s.id.as_str(), s.status.label()));
                    }
                    let now = now_secs();
                    s.status = SessionStatus::Failed {
                        failed_at: now,
                        reason: "session expired".to_string(),
                    };
                    s.updated_at = now;
                    Ok(())
                }),
            )
            .await;

        match failed {
            Ok(_) => {}
            Err(UploadError::SessionNotOpen { .. }) | Err(UploadError::UnknownSession { .. }) => {
                return Ok(false)
            }
            Err(e) => return Err(e),
        }

        debug!(session_id = %session.id, "Expiring upload session");
        self.evict(&session.id).await?;
        Ok(true)
    }

    async fn abandon_claim(&self, id: &SessionId, claimed_at: i64) -> UploadResult<bool> {
        let failed = self
            .sessions
            .update(
                id,
                mutate(move |s| {
                    if s.status != (SessionStatus::Finalizing { claimed_at }) {
                        return Err(UploadError::not_open(s.id.as_str(), s.status.label()));
                    }
                    let now = now_secs();
                    s.status = SessionStatus::Failed {
                        failed_at: now,
                        reason: "finalization abandoned".to_string(),
                    };
                    s.updated_at = now;
                    Ok(())
                }),
            )
            .await;

        match failed {
            Ok(_) => {
                warn!(session_id = %id, "Finalization abandoned, session marked failed");
                Ok(true)
            }
            Err(UploadError::SessionNotOpen { .. }) | Err(UploadError::UnknownSession { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn evict(&self, id: &SessionId) -> UploadResult<()> {
        self.sink.purge(id).await?;
        self.sessions.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBlobSink, MemoryObjectStore, MemoryUploadSessionStore, NewSession, Destination};
    use bytes::Bytes;

    struct Fixture {
        engine: SessionEngine,
        sessions: MemoryUploadSessionStore,
        sink: MemoryBlobSink,
        reaper: SessionReaper,
        config: UploadConfig,
    }

    fn fixture() -> Fixture {
        let config = UploadConfig::default()
            .with_session_ttl(Duration::from_secs(60))
            .with_terminal_retention(Duration::from_secs(10));
        let sessions = MemoryUploadSessionStore::new();
        let sink = MemoryBlobSink::new();
        let engine = SessionEngine::new(
            sessions.clone(),
            sink.clone(),
            MemoryObjectStore::new(),
            config.clone(),
        );
        let reaper = SessionReaper::for_engine(&engine);
        Fixture {
            engine,
            sessions,
            sink,
            reaper,
            config,
        }
    }

    fn request(chunks: u32) -> NewSession {
        NewSession::new("photo.zip", 30)
            .with_destination(Destination::new("Studio - 2024-01-01"))
            .with_expected_chunks(chunks)
    }

    #[tokio::test]
    async fn fresh_sessions_survive_a_sweep() {
        let f = fixture();
        let id = f.engine.start_session(request(2)).await.unwrap();

        let report = f.reaper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(f.engine.session(&id).await.is_ok());
    }

    #[tokio::test]
    async fn expired_open_session_is_removed_with_its_chunks() {
        let f = fixture();
        let id = f.engine.start_session(request(2)).await.unwrap();
        f.engine.admit_chunk(&id, 0, Bytes::from_static(b"a")).await.unwrap();

        let later = now_secs() + f.config.session_ttl_secs() + 1;
        let report = f.reaper.sweep_at(later).await.unwrap();

        assert_eq!(report.expired, 1);
        assert!(f.sessions.is_empty());
        assert_eq!(f.sink.stored_chunks(&id), 0);
        assert!(matches!(
            f.engine.session(&id).await,
            Err(UploadError::UnknownSession { .. })
        ));
    }

    #[tokio::test]
    async fn completed_session_is_evicted_after_retention() {
        let f = fixture();
        let id = f.engine.start_session(request(1)).await.unwrap();
        f.engine.admit_chunk(&id, 0, Bytes::from_static(b"a")).await.unwrap();
        f.engine.complete_upload(&id).await.unwrap();

        // Inside the retention window the record is still queryable
        let report = f.reaper.sweep_at(now_secs() + 1).await.unwrap();
        assert_eq!(report.evicted, 0);
        assert!(f.engine.session(&id).await.is_ok());

        let later = now_secs() + f.config.terminal_retention_secs() + 1;
        let report = f.reaper.sweep_at(later).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn stale_finalize_claim_becomes_failed() {
        let f = fixture();
        let id = f.engine.start_session(request(1)).await.unwrap();
        f.engine.admit_chunk(&id, 0, Bytes::from_static(b"a")).await.unwrap();

        // Simulate a finalizer that claimed the session and then died
        f.sessions
            .update(
                &id,
                mutate(|s| {
                    s.status = SessionStatus::Finalizing { claimed_at: now_secs() };
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let later = now_secs() + f.config.session_ttl_secs() + 1;
        let report = f.reaper.sweep_at(later).await.unwrap();
        assert_eq!(report.abandoned_finalizations, 1);

        let session = f.engine.session(&id).await.unwrap();
        assert!(matches!(session.status, SessionStatus::Failed { ref reason, .. } if reason == "finalization abandoned"));
        // Chunks stay until the failed session itself is evicted
        assert_eq!(f.sink.stored_chunks(&id), 1);
    }
}
