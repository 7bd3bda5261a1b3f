//! File sources for the sending side.

use anyhow::{Context, Result};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncRead;

use crate::core::events::format_bytes;
use crate::core::protocol::FileMetadata;

/// Fallback MIME type for unknown extensions
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const MIME_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
];

/// Guess a MIME type from the file extension.
pub fn guess_mime_type(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return DEFAULT_MIME_TYPE;
    };
    let ext = ext.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(known, _)| *known == ext.as_str())
        .map_or(DEFAULT_MIME_TYPE, |&(_, mime)| mime)
}

/// A file to send: what `hello` announces plus where the bytes come from.
pub struct FileSource {
    pub metadata: FileMetadata,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileSource {
    pub fn new(metadata: FileMetadata, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            metadata,
            reader: Box::new(reader),
        }
    }

    /// Open a file on disk.
    pub async fn open(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .context("Failed to read file metadata")?;
        if !metadata.is_file() {
            anyhow::bail!("Not a regular file: {}", path.display());
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Invalid filename")?
            .to_string();
        let file = File::open(path).await.context("Failed to open file")?;

        let metadata = FileMetadata::new(name, metadata.len(), guess_mime_type(path));
        log::debug!(
            "Prepared {} ({}, {})",
            metadata.name,
            format_bytes(metadata.size),
            metadata.mime_type
        );
        Ok(Self::new(metadata, file))
    }

    /// In-memory source.
    pub fn from_bytes(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let metadata = FileMetadata::new(name, data.len() as u64, mime_type);
        Self::new(metadata, Cursor::new(data))
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
