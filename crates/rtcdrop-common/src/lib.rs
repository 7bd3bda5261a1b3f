//! rtcdrop-common: Shared library for rtcdrop transports
//!
//! This crate provides the transport-independent half of rtcdrop:
//! the room-based signaling handshake, the transport session that owns one
//! peer connection, and the chunked transfer protocol with backpressure
//! driven by the data channel's buffered-amount-low signal.
//!
//! Concrete WebRTC stacks plug in through [`transport::PeerTransport`]; room
//! rendezvous services plug in through [`signaling::room::RoomStore`].

pub mod config;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod signaling;
pub mod transport;

pub use config::TransferConfig;
pub use core::events::{event_channel, EventSink, TransferEvent};
pub use core::sink::{DirectorySink, FileSink};
pub use core::source::FileSource;
pub use endpoint::{FileReceiver, FileSender};
pub use error::TransferError;
