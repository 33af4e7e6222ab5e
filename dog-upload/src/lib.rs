//! # dog-upload: resumable chunked uploads
//!
//! `dog-upload` receives a large file as independently uploaded, retryable
//! chunks, tracks which chunks arrived, and once every chunk is present
//! streams them in order to a remote object store exactly once.
//!
//! ## Key Features
//!
//! - **Any order, any retries**: chunks may arrive out of order and be re-sent; a
//!   re-sent chunk replaces the previous one and never counts twice
//! - **At-most-once delivery**: concurrent completion requests race for a claim,
//!   only the winner writes the remote object
//! - **Bounded memory**: assembly streams one chunk at a time into the remote store
//! - **Durable state**: session records and chunk blobs survive process restarts
//!   with the filesystem stores
//! - **Self-cleaning**: the [`SessionReaper`] expires abandoned sessions and
//!   evicts finished ones
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload::prelude::*;
//! use bytes::Bytes;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let remote = MemoryObjectStore::new();
//! let engine = SessionEngine::new(
//!     MemoryUploadSessionStore::new(),
//!     MemoryBlobSink::new(),
//!     remote.clone(),
//!     UploadConfig::default(),
//! );
//!
//! let id = engine
//!     .start_session(
//!         NewSession::new("photo.zip", 6)
//!             .with_file_type("application/zip")
//!             .with_destination(Destination::new("Bright Studio - 2024-03-09"))
//!             .with_expected_chunks(3),
//!     )
//!     .await?;
//!
//! engine.admit_chunk(&id, 2, Bytes::from_static(b"cc")).await?;
//! engine.admit_chunk(&id, 0, Bytes::from_static(b"aa")).await?;
//! let admission = engine.admit_chunk(&id, 1, Bytes::from_static(b"bb")).await?;
//! assert!(admission.is_complete);
//!
//! let outcome = engine.complete_upload(&id).await?;
//! let object = remote.object(outcome.object_id().unwrap()).unwrap();
//! assert_eq!(&object.data[..], b"aabbcc");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Transport (HTTP)│  ← dog-upload-axum
//! ├──────────────────┤
//! │  SessionEngine   │  ← state machine, validation
//! ├────────┬─────────┤
//! │Session │  Blob   │  ← SessionStore / BlobSink
//! │ store  │  sink   │
//! ├────────┴─────────┤
//! │    Finalizer     │  ← claim, stream, deliver
//! ├──────────────────┤
//! │RemoteObjectStore │  ← S3 or memory
//! └──────────────────┘
//! ```

mod config;
mod engine;
mod error;
mod finalizer;
mod reaper;
pub mod remote;
mod s3_store;
mod session_store;
pub mod store;
mod types;
mod upload;

// Re-export main types for clean API
pub use config::UploadConfig;
pub use engine::SessionEngine;
pub use error::{ErrorKind, UploadError, UploadResult};
pub use finalizer::Finalizer;
pub use reaper::{SessionReaper, SweepReport};
pub use remote::{
    DestinationResolver, FolderDestinationResolver, MemoryObjectStore, RemoteObjectStore, StoredObject,
};
pub use s3_store::{S3Config, S3ObjectStore};
pub use session_store::{FsUploadSessionStore, MemoryUploadSessionStore};
pub use store::{chunk_key, BlobSink, FsBlobSink, MemoryBlobSink};
pub use types::{
    progress_percent, ChunkAdmission, ChunkLocator, ChunkRecord, ChunkStream, Destination,
    FinalizeOutcome, NewSession, ObjectId, SessionId, SessionStatus, UploadSession,
    DEFAULT_CONTENT_TYPE,
};
pub use upload::{mutate, SessionMutator, SessionStore};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobSink, ChunkAdmission, Destination, FinalizeOutcome, MemoryBlobSink, MemoryObjectStore,
        MemoryUploadSessionStore, NewSession, RemoteObjectStore, SessionEngine, SessionId,
        SessionStatus, SessionStore, UploadConfig, UploadError, UploadResult, UploadSession,
    };
}
