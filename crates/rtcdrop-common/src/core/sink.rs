//! Where received files end up.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use crate::core::events::format_bytes;
use crate::core::protocol::FileMetadata;

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

/// Consumer of received files.
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Store `file`, returning its location when it lands on disk.
    async fn save(&self, file: ReceivedFile) -> Result<Option<PathBuf>>;
}

/// Writes received files into a directory, never overwriting.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn save(&self, file: ReceivedFile) -> Result<Option<PathBuf>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", self.dir.display()))?;

        let name = sanitize_file_name(&file.metadata.name);
        let target = find_available_filename(&self.dir.join(name));
        tokio::fs::write(&target, &file.data)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;

        log::info!(
            "Saved {} ({}) to {}",
            file.metadata.name,
            format_bytes(file.data.len() as u64),
            target.display()
        );
        Ok(Some(target))
    }
}

/// Reduce a sender-supplied name to a single safe path component.
///
/// Directory parts are dropped, as are characters outside alphanumerics and
/// `.`, `-`, `_`, ` `. Falls back to `"file"` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|part| !part.is_empty() && !matches!(*part, "." | ".."))
        .last()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_start_matches('.').trim();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}

/// Find an available filename by appending _2, _3, etc. if file exists
pub fn find_available_filename(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or(Path::new("."));

    for i in 2..=999 {
        let candidate = parent.join(format!("{}_{}{}", stem, i, ext));
        if !candidate.exists() {
            return candidate;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    parent.join(format!("{}_{}{}", stem, timestamp, ext))
}
