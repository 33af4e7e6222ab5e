use std::sync::Arc;

use anyhow::{Context, Result};
use dog_upload::{
    FolderDestinationResolver, FsBlobSink, FsUploadSessionStore, RemoteObjectStore, S3ObjectStore,
    SessionEngine, SessionReaper,
};
use dog_upload_axum::{ServerConfig, UploadApp, UploadState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();

    let sessions = FsUploadSessionStore::open(config.sessions_dir())
        .await
        .context("failed to open session store")?;
    let sink = FsBlobSink::open(config.chunks_dir())
        .await
        .context("failed to open chunk storage")?;
    let remote: Arc<dyn RemoteObjectStore> = Arc::new(
        S3ObjectStore::from_env()
            .await
            .context("failed to configure remote object store")?,
    );

    let engine = SessionEngine::from_parts(
        Arc::new(sessions),
        Arc::new(sink),
        Arc::clone(&remote),
        config.upload.clone(),
    );

    let reaper = SessionReaper::for_engine(&engine);
    tokio::spawn(async move {
        if let Err(e) = reaper.start().await {
            tracing::error!("Session reaper stopped: {}", e);
        }
    });

    let resolver = Arc::new(FolderDestinationResolver::new(Arc::clone(&remote)));
    let state = UploadState::new(engine, resolver, remote);
    let app = UploadApp::with_body_limit(state, config.max_body_bytes);

    let addr = config.addr();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        chunk_size = config.upload.chunk_size,
        auto_finalize = config.upload.auto_finalize,
        "dog-upload-server listening on http://{}",
        addr
    );

    app.listen(addr).await?;

    Ok(())
}
