use std::path::PathBuf;
use std::time::Duration;

use dog_upload::UploadConfig;

struct ServerDefaults;

impl ServerDefaults {
    const HOST: &'static str = "127.0.0.1";
    const PORT: u16 = 3000;
    const DATA_DIR: &'static str = "data/uploads";
    const CHUNK_SIZE_MB: u64 = 10;
    const MAX_FILE_SIZE_MB: u64 = 50 * 1024;
    const MAX_CHUNKS: u32 = 10_000;
    const SESSION_TTL_SECS: u64 = 24 * 60 * 60;
    const RETENTION_SECS: u64 = 60 * 60;
    const SWEEP_INTERVAL_SECS: u64 = 300;
    const AUTO_FINALIZE: bool = false;
    // One chunk plus multipart framing
    const MAX_BODY_MB: usize = 16;
}

/// Process settings read from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root for session records (`sessions/`) and staged chunks (`chunks/`)
    pub data_dir: PathBuf,
    pub max_body_bytes: usize,
    pub upload: UploadConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: ServerDefaults::HOST.to_string(),
            port: ServerDefaults::PORT,
            data_dir: PathBuf::from(ServerDefaults::DATA_DIR),
            max_body_bytes: ServerDefaults::MAX_BODY_MB * 1024 * 1024,
            upload: UploadConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mb = 1024 * 1024;

        let mut upload = UploadConfig::new()
            .with_chunk_size(env_var_or("UPLOAD_CHUNK_SIZE_MB", ServerDefaults::CHUNK_SIZE_MB) * mb)
            .with_max_file_bytes(env_var_or("UPLOAD_MAX_FILE_SIZE_MB", ServerDefaults::MAX_FILE_SIZE_MB) * mb)
            .with_max_chunks(env_var_or("UPLOAD_MAX_CHUNKS", ServerDefaults::MAX_CHUNKS))
            .with_session_ttl(Duration::from_secs(env_var_or(
                "UPLOAD_SESSION_TTL_SECS",
                ServerDefaults::SESSION_TTL_SECS,
            )))
            .with_terminal_retention(Duration::from_secs(env_var_or(
                "UPLOAD_RETENTION_SECS",
                ServerDefaults::RETENTION_SECS,
            )))
            .with_sweep_interval(Duration::from_secs(env_var_or(
                "UPLOAD_SWEEP_INTERVAL_SECS",
                ServerDefaults::SWEEP_INTERVAL_SECS,
            )));
        if env_var_or("UPLOAD_AUTO_FINALIZE", ServerDefaults::AUTO_FINALIZE) {
            upload = upload.auto_finalize();
        }

        Self {
            host: env_var_or("HTTP_HOST", ServerDefaults::HOST.to_string()),
            port: env_var_or("HTTP_PORT", ServerDefaults::PORT),
            data_dir: PathBuf::from(env_var_or("UPLOAD_DATA_DIR", ServerDefaults::DATA_DIR.to_string())),
            max_body_bytes: env_var_or("UPLOAD_MAX_BODY_MB", ServerDefaults::MAX_BODY_MB) * mb as usize,
            upload,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }
}

fn env_var_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Debug,
{
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}
