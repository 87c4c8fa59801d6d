//! Persistent storage
//!
//! This module handles the settings file and the local model directory.

pub mod download;
pub mod models;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Could not determine a data directory for this platform")]
    NoDataDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Model file not found: {0} (downloading is disabled or no model_url is set)")]
    ModelMissing(PathBuf),
    #[error("Model download failed: {0}")]
    Download(String),
}

/// Get the application data directory
///
/// Settings live directly in it and models under `models/`.
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "llamachat", "llamachat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
