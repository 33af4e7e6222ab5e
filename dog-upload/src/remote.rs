use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::{ChunkStream, Destination, ObjectId, UploadError, UploadResult};

/// Destination service receiving assembled files
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Stream `body` into a new object named `name` under `destination`
    async fn create_object(
        &self,
        destination: &Destination,
        name: &str,
        mime_type: &str,
        body: ChunkStream,
    ) -> UploadResult<ObjectId>;

    /// Find the folder called `name` under `parent`, creating it if absent
    async fn resolve_or_create_folder(
        &self,
        name: &str,
        parent: Option<&Destination>,
    ) -> UploadResult<Destination>;
}

/// Maps what an uploader typed in (studio name, sheet count) to a destination
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(&self, studio_name: &str, sheet_count: Option<u32>) -> UploadResult<Destination>;
}

/// Resolves one folder per studio and day: `"{studio} - {n} sheets - {YYYY-MM-DD}"`.
///
/// An existing folder with the same name is reused, so every file a studio
/// sends on a given day lands together.
pub struct FolderDestinationResolver {
    remote: Arc<dyn RemoteObjectStore>,
    root: Option<Destination>,
}

impl FolderDestinationResolver {
    pub fn new(remote: Arc<dyn RemoteObjectStore>) -> Self {
        Self { remote, root: None }
    }

    /// Create folders under `root` instead of the store's top level
    pub fn with_root(mut self, root: Destination) -> Self {
        self.root = Some(root);
        self
    }

    pub fn folder_name(studio_name: &str, sheet_count: Option<u32>, date: chrono::NaiveDate) -> String {
        let studio = studio_name.trim().replace('/', "-");
        match sheet_count {
            Some(n) => format!("{} - {} sheets - {}", studio, n, date.format("%Y-%m-%d")),
            None => format!("{} - {}", studio, date.format("%Y-%m-%d")),
        }
    }
}

#[async_trait]
impl DestinationResolver for FolderDestinationResolver {
    async fn resolve(&self, studio_name: &str, sheet_count: Option<u32>) -> UploadResult<Destination> {
        if studio_name.trim().is_empty() {
            return Err(UploadError::invalid("Studio name is required"));
        }
        let name = Self::folder_name(studio_name, sheet_count, chrono::Utc::now().date_naive());
        self.remote
            .resolve_or_create_folder(&name, self.root.as_ref())
            .await
    }
}

/// An object held by [`MemoryObjectStore`]
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub destination: Destination,
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

#[derive(Default)]
struct MemoryObjects {
    objects: RwLock<HashMap<ObjectId, StoredObject>>,
    folders: RwLock<HashMap<String, Destination>>,
    writes: AtomicUsize,
    failing: AtomicBool,
    write_delay: RwLock<Option<Duration>>,
}

/// In-memory remote store for tests and development
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<MemoryObjects>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `create_object` calls that reached the store
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn object(&self, id: &ObjectId) -> Option<StoredObject> {
        self.inner.objects.read().get(id).cloned()
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.inner.objects.read().values().cloned().collect()
    }

    /// Folders created so far
    pub fn folders(&self) -> Vec<Destination> {
        self.inner.folders.read().values().cloned().collect()
    }

    /// Make every subsequent `create_object` fail (test helper)
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold each write open for `delay` before consuming the body (test helper)
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.inner.write_delay.write() = delay;
    }
}

#[async_trait]
impl RemoteObjectStore for MemoryObjectStore {
    async fn create_object(
        &self,
        destination: &Destination,
        name: &str,
        mime_type: &str,
        mut body: ChunkStream,
    ) -> UploadResult<ObjectId> {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.write_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(UploadError::remote("remote store unavailable"));
        }

        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }

        let id = ObjectId::new(format!("obj_{}", Uuid::new_v4().simple()));
        self.inner.objects.write().insert(
            id.clone(),
            StoredObject {
                destination: destination.clone(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                data: data.freeze(),
            },
        );
        Ok(id)
    }

    async fn resolve_or_create_folder(
        &self,
        name: &str,
        parent: Option<&Destination>,
    ) -> UploadResult<Destination> {
        let path = match parent {
            Some(parent) => format!("{}/{}", parent.as_str().trim_end_matches('/'), name),
            None => name.to_string(),
        };
        let mut folders = self.inner.folders.write();
        let folder = folders
            .entry(path.clone())
            .or_insert_with(|| Destination::new(path));
        Ok(folder.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_names_follow_the_studio_convention() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            FolderDestinationResolver::folder_name("Bright Studio", Some(4), date),
            "Bright Studio - 4 sheets - 2024-03-09"
        );
        assert_eq!(
            FolderDestinationResolver::folder_name(" A/B ", None, date),
            "A-B - 2024-03-09"
        );
    }

    #[tokio::test]
    async fn resolver_reuses_existing_folder() {
        let remote = MemoryObjectStore::new();
        let resolver = FolderDestinationResolver::new(Arc::new(remote.clone()))
            .with_root(Destination::new("uploads"));

        let first = resolver.resolve("Bright Studio", Some(2)).await.unwrap();
        let second = resolver.resolve("Bright Studio", Some(2)).await.unwrap();
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("uploads/Bright Studio - 2 sheets - "));

        let err = resolver.resolve("  ", Some(2)).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest { .. }));
    }
}
