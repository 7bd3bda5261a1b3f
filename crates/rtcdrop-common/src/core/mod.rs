pub mod buffer;
pub mod events;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod sink;
pub mod source;
