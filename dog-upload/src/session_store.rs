use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::{
    SessionId, SessionMutator, SessionStore, UploadError, UploadResult, UploadSession,
};

/// In-memory session store.
///
/// Each update runs while holding the write lock of the record's shard, which
/// makes the read-modify-write atomic per session id.
#[derive(Clone, Default)]
pub struct MemoryUploadSessionStore {
    sessions: Arc<DashMap<SessionId, UploadSession>>,
}

impl MemoryUploadSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryUploadSessionStore {
    async fn create(&self, session: UploadSession) -> UploadResult<()> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(UploadError::DuplicateSession {
                session_id: session.id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| UploadError::unknown_session(id.as_str()))
    }

    async fn update(&self, id: &SessionId, mutator: SessionMutator) -> UploadResult<UploadSession> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| UploadError::unknown_session(id.as_str()))?;

        let mut draft = entry.clone();
        mutator(&mut draft)?;
        *entry = draft.clone();
        Ok(draft)
    }

    async fn delete(&self, id: &SessionId) -> UploadResult<()> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn list(&self) -> UploadResult<Vec<UploadSession>> {
        Ok(self.sessions.iter().map(|s| s.value().clone()).collect())
    }
}

/// File-backed session store: one JSON record per session.
///
/// Mutations of a session serialize on a per-id async lock; records are
/// written to a temp file and renamed into place, so readers never observe a
/// partially written record.
pub struct FsUploadSessionStore {
    dir: PathBuf,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl FsUploadSessionStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub async fn open<P: AsRef<Path>>(dir: P) -> UploadResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &SessionId) -> UploadResult<PathBuf> {
        if !id.is_path_safe() {
            // Such an id can never have been issued, so it cannot exist
            return Err(UploadError::unknown_session(id.as_str()));
        }
        Ok(self.dir.join(format!("{}.json", id.as_str())))
    }

    fn lock_for(&self, id: &SessionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_record(path: &Path, id: &SessionId) -> UploadResult<UploadSession> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(UploadError::unknown_session(id.as_str()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(path: &Path, session: &UploadSession) -> UploadResult<()> {
        let data = serde_json::to_vec(session)?;
        let tmp = path.with_extension(format!("json.tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FsUploadSessionStore {
    async fn create(&self, session: UploadSession) -> UploadResult<()> {
        let path = self.record_path(&session.id).map_err(|_| {
            UploadError::invalid(format!("Session id {} is not storable", session.id))
        })?;
        let lock = self.lock_for(&session.id);
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(&path).await? {
            return Err(UploadError::DuplicateSession {
                session_id: session.id.to_string(),
            });
        }
        Self::write_record(&path, &session).await
    }

    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession> {
        let path = self.record_path(id)?;
        Self::read_record(&path, id).await
    }

    async fn update(&self, id: &SessionId, mutator: SessionMutator) -> UploadResult<UploadSession> {
        let path = self.record_path(id)?;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut session = Self::read_record(&path, id).await?;
        mutator(&mut session)?;
        Self::write_record(&path, &session).await?;
        Ok(session)
    }

    async fn delete(&self, id: &SessionId) -> UploadResult<()> {
        let Ok(path) = self.record_path(id) else {
            return Ok(());
        };
        let lock = self.lock_for(id);
        let guard = lock.lock().await;

        let result = match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        drop(guard);
        self.locks.remove(id);
        result
    }

    async fn list(&self) -> UploadResult<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<UploadSession>(&data) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session record"),
                },
                // Deleted between read_dir and read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mutate, ChunkLocator, ChunkRecord, Destination, SessionStatus};
    use std::collections::BTreeMap;

    fn session(id: &str, expected: u32) -> UploadSession {
        UploadSession {
            id: SessionId::from_string(id.to_string()),
            file_name: "photo.zip".to_string(),
            file_type: "application/zip".to_string(),
            file_size: 30,
            destination: Destination::new("studio"),
            expected_chunk_count: expected,
            chunks: BTreeMap::new(),
            status: SessionStatus::Open,
            created_at: 0,
            updated_at: 0,
            expires_at: i64::MAX,
        }
    }

    fn chunk(index: u32) -> ChunkRecord {
        ChunkRecord {
            index,
            locator: ChunkLocator::new(format!("chunk-{index}")),
            size_bytes: 10,
            received_at: 0,
        }
    }

    async fn concurrent_updates_keep_every_chunk<S: SessionStore + 'static>(store: Arc<S>) {
        store.create(session("upl_race", 64)).await.unwrap();
        let id = SessionId::from_string("upl_race".to_string());

        let mut handles = Vec::new();
        for index in 0..64u32 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&id, mutate(move |s| {
                        s.chunks.insert(index, chunk(index));
                        Ok(())
                    }))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.received_count(), 64);
        assert!(stored.is_complete());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn memory_store_serializes_updates() {
        concurrent_updates_keep_every_chunk(Arc::new(MemoryUploadSessionStore::new())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fs_store_serializes_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsUploadSessionStore::open(dir.path()).await.unwrap();
        concurrent_updates_keep_every_chunk(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = MemoryUploadSessionStore::new();
        store.create(session("upl_a", 1)).await.unwrap();
        let err = store.create(session("upl_a", 1)).await.unwrap_err();
        assert!(matches!(err, UploadError::DuplicateSession { .. }));

        let dir = tempfile::tempdir().unwrap();
        let fs = FsUploadSessionStore::open(dir.path()).await.unwrap();
        fs.create(session("upl_a", 1)).await.unwrap();
        let err = fs.create(session("upl_a", 1)).await.unwrap_err();
        assert!(matches!(err, UploadError::DuplicateSession { .. }));
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_record_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsUploadSessionStore::open(dir.path()).await.unwrap();
        store.create(session("upl_b", 2)).await.unwrap();
        let id = SessionId::from_string("upl_b".to_string());

        let err = store
            .update(&id, mutate(|s| {
                s.chunks.insert(0, chunk(0));
                Err(UploadError::invalid("nope"))
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest { .. }));
        assert_eq!(store.get(&id).await.unwrap().received_count(), 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_missing_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsUploadSessionStore::open(dir.path()).await.unwrap();
        store.create(session("upl_c", 1)).await.unwrap();
        let id = SessionId::from_string("upl_c".to_string());

        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();

        let err = store.get(&id).await.unwrap_err();
        assert!(matches!(err, UploadError::UnknownSession { .. }));
        let err = store
            .update(&id, mutate(|_| Ok(())))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::UnknownSession { .. }));
    }

    #[tokio::test]
    async fn path_traversal_ids_are_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsUploadSessionStore::open(dir.path()).await.unwrap();
        let id = SessionId::from_string("../../etc/passwd".to_string());
        assert!(matches!(
            store.get(&id).await.unwrap_err(),
            UploadError::UnknownSession { .. }
        ));
    }

    #[tokio::test]
    async fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsUploadSessionStore::open(dir.path()).await.unwrap();
            store.create(session("upl_d", 3)).await.unwrap();
        }
        let reopened = FsUploadSessionStore::open(dir.path()).await.unwrap();
        let all = reopened.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].expected_chunk_count, 3);
    }
}
