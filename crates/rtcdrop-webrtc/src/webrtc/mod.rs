//! WebRTC transport module for peer-to-peer file transfer

pub mod peer;

pub use peer::WebRtcTransport;
