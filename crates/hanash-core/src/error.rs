//! Error types for the Hanash core

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the engine's public API.
///
/// A running coordinator never returns one of these to its supervisor;
/// terminal outcomes are represented by the item's status value.
#[derive(Debug, Error)]
pub enum HanashError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("download not found: {0}")]
    NotFound(usize),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("server returned {status} for {url}")]
    BadStatus { status: u16, url: String },

    #[error("destination folder is missing or not writable: {0}")]
    FolderNotWritable(PathBuf),

    #[error("target file already exists: {0}")]
    TargetExists(PathBuf),

    #[error("\"{name}\" is already downloading into {folder}")]
    AlreadyActive { name: String, folder: PathBuf },

    #[error("downloads are still active, stop or cancel them first")]
    Busy,

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for HanashError {
    fn from(e: serde_json::Error) -> Self {
        HanashError::Serialization(e.to_string())
    }
}
