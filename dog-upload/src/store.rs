use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::{ChunkLocator, ChunkRecord, ChunkStream, SessionId, UploadError, UploadResult};

/// Durable chunk storage keyed by (session id, chunk index).
///
/// Every `put` lands under a fresh locator and never touches an existing blob,
/// so a blob a reader is streaming stays byte-for-byte stable until it is
/// discarded or purged. Which blob counts for an index is decided by the
/// session record, not by the sink.
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Store one write attempt of a chunk under a new locator
    async fn put(&self, session_id: &SessionId, index: u32, bytes: Bytes) -> UploadResult<ChunkLocator>;

    /// Stream the recorded chunks in the given order.
    ///
    /// Fails with `MissingChunk` if any record points at no stored blob.
    /// The stream is lazy and single-pass: one chunk is loaded at a time.
    async fn read_in_order(&self, session_id: &SessionId, chunks: Vec<ChunkRecord>) -> UploadResult<ChunkStream>;

    /// Delete a single blob (a superseded retry or a rejected write); absent is not an error
    async fn discard(&self, session_id: &SessionId, locator: &ChunkLocator) -> UploadResult<()>;

    /// Delete every chunk of a session; purging an absent session is not an error
    async fn purge(&self, session_id: &SessionId) -> UploadResult<()>;
}

/// Fresh, never reused name for one write attempt of a chunk
pub fn chunk_key(session_id: &SessionId, index: u32) -> String {
    format!("{}/{}.{}", session_id.as_str(), chunk_prefix(index), Uuid::new_v4().simple())
}

fn chunk_prefix(index: u32) -> String {
    format!("chunk-{:06}", index)
}

type ChunkMap = HashMap<SessionId, HashMap<ChunkLocator, Bytes>>;

/// In-memory blob sink for tests and development
#[derive(Clone, Default)]
pub struct MemoryBlobSink {
    chunks: Arc<RwLock<ChunkMap>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBlobSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs stored for a session
    pub fn stored_chunks(&self, session_id: &SessionId) -> usize {
        self.chunks.read().get(session_id).map_or(0, HashMap::len)
    }

    /// Make every subsequent `put` fail with `WriteError` (test helper)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drop every blob of one chunk index behind the session's back (test helper)
    pub fn remove_chunk(&self, session_id: &SessionId, index: u32) {
        let prefix = format!("{}/{}.", session_id.as_str(), chunk_prefix(index));
        if let Some(blobs) = self.chunks.write().get_mut(session_id) {
            blobs.retain(|locator, _| !locator.as_str().starts_with(&prefix));
        }
    }
}

#[async_trait]
impl BlobSink for MemoryBlobSink {
    async fn put(&self, session_id: &SessionId, index: u32, bytes: Bytes) -> UploadResult<ChunkLocator> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(UploadError::write_failed(
                session_id.as_str(),
                index,
                std::io::Error::new(std::io::ErrorKind::Other, "writes disabled"),
            ));
        }
        let locator = ChunkLocator::new(chunk_key(session_id, index));
        self.chunks
            .write()
            .entry(session_id.clone())
            .or_default()
            .insert(locator.clone(), bytes);
        Ok(locator)
    }

    async fn read_in_order(&self, session_id: &SessionId, chunks: Vec<ChunkRecord>) -> UploadResult<ChunkStream> {
        {
            let stored = self.chunks.read();
            let blobs = stored.get(session_id);
            if let Some(missing) = chunks
                .iter()
                .find(|c| !blobs.is_some_and(|b| b.contains_key(&c.locator)))
            {
                return Err(UploadError::missing_chunk(session_id.as_str(), missing.index));
            }
        }

        let stored = Arc::clone(&self.chunks);
        let session_id = session_id.clone();
        let stream = async_stream::stream! {
            for record in chunks {
                let chunk = stored
                    .read()
                    .get(&session_id)
                    .and_then(|blobs| blobs.get(&record.locator))
                    .cloned();
                match chunk {
                    Some(bytes) => yield Ok(bytes),
                    None => {
                        yield Err(UploadError::missing_chunk(session_id.as_str(), record.index));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn discard(&self, session_id: &SessionId, locator: &ChunkLocator) -> UploadResult<()> {
        let mut stored = self.chunks.write();
        let emptied = match stored.get_mut(session_id) {
            Some(blobs) => {
                blobs.remove(locator);
                blobs.is_empty()
            }
            None => false,
        };
        if emptied {
            stored.remove(session_id);
        }
        Ok(())
    }

    async fn purge(&self, session_id: &SessionId) -> UploadResult<()> {
        self.chunks.write().remove(session_id);
        Ok(())
    }
}

/// Filesystem blob sink: `<root>/<session>/chunk-<index>.<attempt>`.
///
/// Each attempt is written to a temp file and renamed into place, so a blob
/// is never observed half-written by a concurrent reader.
#[derive(Debug, Clone)]
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    /// Open (and create if needed) a sink rooted at `root`
    pub async fn open<P: AsRef<Path>>(root: P) -> UploadResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn session_dir(&self, session_id: &SessionId) -> UploadResult<PathBuf> {
        if !session_id.is_path_safe() {
            return Err(UploadError::unknown_session(session_id.as_str()));
        }
        Ok(self.root.join(session_id.as_str()))
    }

    /// Path of a blob; the locator must name a file directly inside the session directory
    fn blob_path(&self, session_id: &SessionId, locator: &ChunkLocator) -> UploadResult<PathBuf> {
        let dir = self.session_dir(session_id)?;
        let name = locator
            .as_str()
            .strip_prefix(session_id.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\']))
            .ok_or_else(|| {
                UploadError::invalid(format!(
                    "Chunk locator {} does not belong to session {}",
                    locator.as_str(),
                    session_id
                ))
            })?;
        Ok(dir.join(name))
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    async fn put(&self, session_id: &SessionId, index: u32, bytes: Bytes) -> UploadResult<ChunkLocator> {
        let dir = self.session_dir(session_id)?;
        let locator = ChunkLocator::new(chunk_key(session_id, index));
        let path = self.blob_path(session_id, &locator)?;
        let write_failed = |e| UploadError::write_failed(session_id.as_str(), index, e);

        tokio::fs::create_dir_all(&dir).await.map_err(write_failed)?;
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await.map_err(write_failed)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_failed(e));
        }

        Ok(locator)
    }

    async fn read_in_order(&self, session_id: &SessionId, chunks: Vec<ChunkRecord>) -> UploadResult<ChunkStream> {
        let mut paths = Vec::with_capacity(chunks.len());
        for record in chunks {
            let path = self.blob_path(session_id, &record.locator)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => paths.push((record.index, path)),
                Ok(_) => return Err(UploadError::missing_chunk(session_id.as_str(), record.index)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(UploadError::missing_chunk(session_id.as_str(), record.index));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let session_id = session_id.clone();
        let stream = async_stream::stream! {
            for (index, path) in paths {
                match tokio::fs::read(&path).await {
                    Ok(data) => yield Ok(Bytes::from(data)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        yield Err(UploadError::missing_chunk(session_id.as_str(), index));
                        return;
                    }
                    Err(e) => {
                        yield Err(UploadError::from(e));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn discard(&self, session_id: &SessionId, locator: &ChunkLocator) -> UploadResult<()> {
        let path = self.blob_path(session_id, locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // Fails while other blobs remain, which is fine
        let _ = tokio::fs::remove_dir(self.session_dir(session_id)?).await;
        Ok(())
    }

    async fn purge(&self, session_id: &SessionId) -> UploadResult<()> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
