//! Room stores available to the CLI

pub mod dir_store;

pub use dir_store::DirRoomStore;
