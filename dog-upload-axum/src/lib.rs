//! dog-upload-axum: HTTP transport for dog-upload.
//!
//! Exposes the chunked upload session engine over the `/api/upload` routes a
//! browser uploader talks to, plus the process bootstrap used by the
//! `dog-upload-server` binary.

pub mod app;
pub mod config;
mod error;
pub mod routes;
pub mod state;

pub use app::UploadApp;
pub use config::ServerConfig;
pub use error::UploadHttpError;
pub use state::UploadState;

pub use axum;
