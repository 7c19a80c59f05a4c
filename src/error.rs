use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Unsupported schema version {found} in {path} (expected {expected})")]
    SchemaVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("Geolocation error: {0}")]
    Geo(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Status query failed for {instance}: {reason}")]
    Status { instance: String, reason: String },
}

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;
