//! Transfer outcomes reported to the caller of a send or receive.

use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::core::protocol::FileMetadata;
use crate::error::TransferError;

/// What happened to one transfer.
///
/// A transfer emits `Started` once, any number of non-decreasing
/// `Progress` values, then exactly one of `Completed` or `Failed`.
#[derive(Debug)]
pub enum TransferEvent {
    Started(FileMetadata),
    /// Percentage in `0.0..=100.0`
    Progress(f64),
    /// Where the sink stored the file, when it stores to disk
    Completed(Option<PathBuf>),
    Failed(TransferError),
}

/// Where a transfer reports its [`TransferEvent`]s.
pub type EventSink = mpsc::UnboundedSender<TransferEvent>;

/// Create a sink and the stream its events are read from.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<TransferEvent>) {
    mpsc::unbounded_channel()
}

/// Report `event`, ignoring a caller that stopped listening.
pub fn emit(sink: &EventSink, event: TransferEvent) {
    if sink.send(event).is_err() {
        log::debug!("Transfer event dropped - listener gone");
    }
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
