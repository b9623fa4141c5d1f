//! Persistent storage
//!
//! This module handles persistence of the application settings.

pub mod settings;

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing local data
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine the data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Platform data directory for the application
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "LegalGPT", "legalgpt")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
