//! Peer transport abstraction
//!
//! The handshake and transfer logic only talk to a peer connection through
//! these traits. Callbacks of the underlying stack are turned into events
//! on `mpsc` queues so that each side can process them on one task:
//! - [`PeerEvent`]s per connection (local candidates, incoming channels, state changes)
//! - [`ChannelEvent`]s per data channel (open, messages, buffered-amount-low, close)

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::TransportConfig;

pub mod loopback;
pub mod session;

pub use loopback::LoopbackTransport;
pub use session::TransportSession;

/// Which half of the negotiation a description is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as stored in the room: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its JSON form.
///
/// Equality and hashing are by content, which is what the remote-candidate
/// dedup relies on: the same candidate read back from two room snapshots
/// compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// State-change notifications of a peer connection. Logged, never acted upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerStateChange {
    Connection(String),
    IceConnection(String),
    IceGathering(String),
    Signaling(String),
}

impl fmt::Display for PeerStateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStateChange::Connection(s) => write!(f, "Connection state change: {}", s),
            PeerStateChange::IceConnection(s) => write!(f, "ICE connection state change: {}", s),
            PeerStateChange::IceGathering(s) => write!(f, "ICE gathering state changed: {}", s),
            PeerStateChange::Signaling(s) => write!(f, "Signaling state change: {}", s),
        }
    }
}

/// A data channel together with the queue its events arrive on.
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.channel.label())
            .finish()
    }
}

/// Events raised by a peer connection.
#[derive(Debug)]
pub enum PeerEvent {
    /// A candidate was discovered locally and should be sent to the remote side
    IceCandidate(IceCandidate),
    /// The remote side opened a data channel
    DataChannel(ChannelHandle),
    StateChanged(PeerStateChange),
}

/// A message received on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Events raised by a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    /// Outbound buffered bytes dropped to or below the low-water mark
    BufferedAmountLow,
    Error(String),
    Close,
}

/// Ordered, reliable message channel between the two peers.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes queued for sending and not yet acknowledged by the remote side
    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);
}

/// One peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an outbound data channel. Must happen before the offer is
    /// generated so the offer carries the data-channel media section.
    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Whether the connection has been closed
    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a connection and the queue its [`PeerEvent`]s arrive on.
    async fn connect(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<PeerEvent>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_json() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_string(&offer).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0\r\n"}"#);
        let back: SessionDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, offer);
    }

    #[test]
    fn test_candidate_json_uses_browser_keys() {
        let json = r#"{
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.username_fragment, None);
        assert_eq!(serde_json::to_string(&candidate).unwrap(), json);
    }

    #[test]
    fn test_state_change_display() {
        let change = PeerStateChange::Connection("connected".to_string());
        assert_eq!(change.to_string(), "Connection state change: connected");
    }
}
