//! Newline-delimited JSON helpers shared by every append-only record in ember.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

use crate::error::MemoryError;

/// Append one record as a single line, creating the file and its parent directory.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub async fn append<T: Serialize>(path: &Path, record: &T) -> Result<(), MemoryError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Read every parseable record. Malformed lines are skipped with a warning; a missing
/// file reads as empty.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub async fn read_all<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, MemoryError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .filter_map(|(i, l)| match serde_json::from_str(l) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = i + 1, "skipping malformed record: {e}");
                None
            }
        })
        .collect())
}

/// Replace a file's contents via a sibling temp file and rename.
///
/// # Errors
///
/// Returns an error if the write or rename fails.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
