//! Transfer and transport configuration

use crate::error::TransferError;

/// Google STUN server for NAT traversal
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Hint for how many ICE candidates the transport may pre-gather
pub const DEFAULT_CANDIDATE_POOL_SIZE: u8 = 10;

/// Largest binary frame put on the data channel (256 KB)
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Bytes pulled from the file source per read
pub const DEFAULT_READ_SIZE: usize = 256 * 1024;

/// Label of the data channel created by the initiator
pub const DEFAULT_CHANNEL_LABEL: &str = "FileSender";

/// Table (collection) the room records live in
pub const ROOMS_TABLE: &str = "Rooms";

/// Capacity of the per-channel and per-connection event queues
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Settings for creating a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// STUN/TURN server URLs handed to the ICE agent
    pub ice_servers: Vec<String>,
    pub candidate_pool_size: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
        }
    }
}

/// Settings for one sender or receiver endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub transport: TransportConfig,
    pub max_chunk_size: usize,
    pub read_size: usize,
    /// Low-water mark for the channel's outbound buffer. The pump sends one
    /// chunk per buffered-amount-low signal, so this must stay below
    /// `max_chunk_size` or a chunk never crosses it.
    pub buffered_amount_low_threshold: usize,
    pub channel_label: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_chunk_size: MAX_CHUNK_SIZE,
            read_size: DEFAULT_READ_SIZE,
            buffered_amount_low_threshold: 0,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl TransferConfig {
    /// Reject settings the transfer protocol cannot run with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.max_chunk_size == 0 {
            return Err(TransferError::InvalidConfig(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.read_size == 0 {
            return Err(TransferError::InvalidConfig(
                "read_size must be greater than zero".to_string(),
            ));
        }
        if self.buffered_amount_low_threshold >= self.max_chunk_size {
            return Err(TransferError::InvalidConfig(format!(
                "buffered_amount_low_threshold ({}) must be below max_chunk_size ({})",
                self.buffered_amount_low_threshold, self.max_chunk_size
            )));
        }
        if self.channel_label.is_empty() {
            return Err(TransferError::InvalidConfig(
                "channel_label must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_chunk_size, 256 * 1024);
        assert_eq!(config.transport.candidate_pool_size, 10);
        assert_eq!(config.transport.ice_servers, vec![DEFAULT_STUN_SERVER]);
    }

    #[test]
    fn test_threshold_must_be_below_chunk_size() {
        let config = TransferConfig {
            buffered_amount_low_threshold: MAX_CHUNK_SIZE,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = TransferConfig {
            max_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
