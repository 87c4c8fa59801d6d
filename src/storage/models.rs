//! Model file resolution
//!
//! Maps the configured model name to a file on disk, fetching it first if allowed.

use crate::storage::download::{download_model_blocking, sanitize_local_filename};
use crate::storage::settings::ChatSettings;
use crate::storage::StorageError;
use std::path::{Path, PathBuf};

/// Where a configured model name points, before anything is fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocation {
    /// The file exists
    Present(PathBuf),
    /// The file would live here once downloaded
    Missing(PathBuf),
}

/// Locate the model without touching the network
///
/// An existing path is used verbatim; anything else is looked up in the models directory.
pub fn locate_model(filename: &str, models_dir: &Path) -> Result<ModelLocation, StorageError> {
    let direct = Path::new(filename);
    if direct.is_file() {
        return Ok(ModelLocation::Present(direct.to_path_buf()));
    }

    let candidate = models_dir.join(sanitize_local_filename(filename)?);
    if candidate.is_file() {
        Ok(ModelLocation::Present(candidate))
    } else {
        Ok(ModelLocation::Missing(candidate))
    }
}

/// Resolve the configured model to a local path, downloading it on first use
pub fn resolve_model(settings: &ChatSettings) -> Result<PathBuf, StorageError> {
    match locate_model(&settings.model_filename, &settings.models_directory)? {
        ModelLocation::Present(path) => {
            tracing::debug!("Using model at {:?}", path);
            Ok(path)
        }
        ModelLocation::Missing(path) => match (&settings.model_url, settings.allow_download) {
            (Some(url), true) => {
                tracing::info!("Model not found locally, fetching {}", settings.model_filename);
                download_model_blocking(url, &path)?;
                Ok(path)
            }
            _ => Err(StorageError::ModelMissing(path)),
        },
    }
}
