//! Room-based signaling: the rendezvous store and the offer/answer handshake
//! performed through it.

pub mod exchange;
pub mod room;

pub use exchange::{SignalingExchange, SignalingState};
pub use room::{MemoryRoomStore, Room, RoomStore};
