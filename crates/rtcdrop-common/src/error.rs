//! Errors surfaced to the caller of a send or receive operation.

use thiserror::Error;

/// Failure of one send or receive operation.
///
/// Each operation reports at most one of these. Protocol-hygiene anomalies
/// (stray binary frames, unknown control frames) never become errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The session code does not resolve to a room carrying an offer.
    #[error("no session found for code {0}")]
    RoomNotFound(String),

    /// The transport rejected a description or the connection could not be built.
    #[error("transport negotiation failed: {0:#}")]
    Negotiation(anyhow::Error),

    /// The room store could not be reached or rejected a write.
    #[error("room store error: {0:#}")]
    Store(anyhow::Error),

    /// The file source failed mid-transfer.
    #[error("failed to read file: {0}")]
    Read(#[from] std::io::Error),

    /// A frame could not be put on the data channel.
    #[error("failed to send on data channel: {0:#}")]
    Send(anyhow::Error),

    /// The data channel went away before the transfer finished.
    #[error("data channel closed before the transfer finished")]
    ChannelClosed,

    /// The reassembled file could not be handed to the sink.
    #[error("failed to save received file: {0:#}")]
    Save(anyhow::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TransferError::RoomNotFound("123456".to_string());
        assert_eq!(err.to_string(), "no session found for code 123456");

        let err = TransferError::Negotiation(
            anyhow::anyhow!("bad sdp").context("Failed to set remote description"),
        );
        assert_eq!(
            err.to_string(),
            "transport negotiation failed: Failed to set remote description: bad sdp"
        );
    }

    #[test]
    fn test_io_error_converts_to_read() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        let err: TransferError = io.into();
        assert!(matches!(err, TransferError::Read(_)));
    }
}
