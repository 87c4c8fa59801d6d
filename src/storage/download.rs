//! Model downloader
//!
//! Fetches a GGUF file over HTTP the first time it is needed.

use crate::storage::StorageError;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Turn a configured model name into a safe single-component file name
pub fn sanitize_local_filename(filename: &str) -> Result<String, StorageError> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(StorageError::Download("Invalid model filename".to_string()));
    }

    let no_query = trimmed.split('?').next().unwrap_or(trimmed);
    let no_fragment = no_query.split('#').next().unwrap_or(no_query);
    let no_leading = no_fragment.trim_start_matches('/');

    let flattened = no_leading.replace('\\', "/").replace('/', "__");

    let mut sanitized = String::with_capacity(flattened.len());
    for ch in flattened.chars() {
        let invalid = matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*');
        if invalid || ch.is_control() {
            sanitized.push('_');
        } else {
            sanitized.push(ch);
        }
    }

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(StorageError::Download("Invalid model filename".to_string()));
    }

    Ok(sanitized)
}

/// Temporary path used while a download is in flight
pub fn partial_path(output_path: &Path) -> PathBuf {
    let mut name = output_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    output_path.with_file_name(name)
}

fn progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Download `url` to `output_path`
///
/// Writes to a `.part` file first and renames it once the byte count matches
/// the announced length. The `.part` file is removed on any failure.
pub async fn download_model(url: &str, output_path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = partial_path(output_path);

    tracing::info!("Downloading from: {}", url);
    if let Err(e) = fetch_to(url, &temp_path, output_path).await {
        if temp_path.exists() {
            if let Err(rm) = fs::remove_file(&temp_path) {
                tracing::warn!("Failed to remove {:?}: {}", temp_path, rm);
            }
        }
        return Err(e);
    }

    tracing::info!("Download complete: {:?}", output_path);
    Ok(())
}

async fn fetch_to(url: &str, temp_path: &Path, output_path: &Path) -> Result<(), StorageError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3600)) // 1 hour timeout for large models
        .build()
        .map_err(|e| StorageError::Download(format!("Failed to create HTTP client: {}", e)))?;

    let mut response = client
        .get(url)
        .header("User-Agent", concat!("llamachat/", env!("CARGO_PKG_VERSION")))
        .send()
        .await
        .map_err(|e| StorageError::Download(e.to_string()))?;

    if !response.status().is_success() {
        return Err(StorageError::Download(format!(
            "server answered with status {}",
            response.status()
        )));
    }

    let total_size = response
        .content_length()
        .ok_or_else(|| StorageError::Download("Could not determine file size".to_string()))?;

    tracing::info!("File size: {}", format_size(total_size));

    let pb = progress_bar(total_size);
    pb.set_message(
        output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    let mut temp_file = File::create(temp_path).await?;
    let mut downloaded: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| StorageError::Download(e.to_string()))?
    {
        temp_file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        pb.set_position(downloaded);
    }
    temp_file.flush().await?;
    drop(temp_file);
    pb.finish_and_clear();

    if downloaded != total_size {
        return Err(StorageError::Download(format!(
            "incomplete: got {} bytes, expected {}",
            downloaded, total_size
        )));
    }

    fs::rename(temp_path, output_path)?;
    Ok(())
}

/// Run [`download_model`] to completion on a current-thread runtime
pub fn download_model_blocking(url: &str, output_path: &Path) -> Result<(), StorageError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(download_model(url, output_path))
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}
