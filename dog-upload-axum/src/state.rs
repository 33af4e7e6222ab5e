use std::sync::Arc;

use dog_upload::{DestinationResolver, RemoteObjectStore, SessionEngine, UploadConfig};

/// Shared handler state
#[derive(Clone)]
pub struct UploadState {
    pub engine: SessionEngine,
    pub resolver: Arc<dyn DestinationResolver>,
    /// Used directly by the single-request upload route
    pub remote: Arc<dyn RemoteObjectStore>,
}

impl UploadState {
    pub fn new(
        engine: SessionEngine,
        resolver: Arc<dyn DestinationResolver>,
        remote: Arc<dyn RemoteObjectStore>,
    ) -> Self {
        Self {
            engine,
            resolver,
            remote,
        }
    }

    pub fn config(&self) -> &UploadConfig {
        self.engine.config()
    }
}
