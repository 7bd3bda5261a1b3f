//! Receiving side of the transfer protocol.

use crate::core::buffer::ByteCursorBuffer;
use crate::core::events::format_bytes;
use crate::core::protocol::{calc_percent, ControlFrame, FileMetadata, Frame};
use crate::core::sink::ReceivedFile;

/// What handling one frame produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveStep {
    Nothing,
    Started(FileMetadata),
    Progress(f64),
    Complete(ReceivedFile),
}

/// Reassembles one file at a time from protocol frames.
///
/// Idle until `hello`, receiving until `bye`. Data frames that arrive while
/// idle are dropped without touching any state.
#[derive(Debug, Default)]
pub struct ChunkReceiver {
    metadata: Option<FileMetadata>,
    accumulator: ByteCursorBuffer,
}

impl ChunkReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_receiving(&self) -> bool {
        self.metadata.is_some()
    }

    /// The file being received, if any.
    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    pub fn bytes_received(&self) -> u64 {
        self.accumulator.len() as u64
    }

    pub fn handle(&mut self, frame: Frame) -> ReceiveStep {
        match frame {
            Frame::Control(ControlFrame::Hello { data }) => {
                if let Some(previous) = &self.metadata {
                    log::warn!(
                        "New file announced while receiving {}, discarding {}",
                        previous.name,
                        format_bytes(self.bytes_received())
                    );
                }
                log::info!(
                    "Receiving {} ({}, {})",
                    data.name,
                    format_bytes(data.size),
                    data.mime_type
                );
                self.accumulator.clear();
                self.metadata = Some(data.clone());
                ReceiveStep::Started(data)
            }
            Frame::Data(bytes) => {
                let Some(metadata) = &self.metadata else {
                    log::debug!("Dropping {} bytes received outside a transfer", bytes.len());
                    return ReceiveStep::Nothing;
                };
                let total = metadata.size;
                self.accumulator.append(bytes);
                ReceiveStep::Progress(calc_percent(self.bytes_received(), total))
            }
            Frame::Control(ControlFrame::Bye) => {
                let Some(metadata) = self.metadata.take() else {
                    log::debug!("Ignoring bye outside a transfer");
                    return ReceiveStep::Nothing;
                };
                let data = self.accumulator.read(self.accumulator.len());
                if data.len() as u64 != metadata.size {
                    log::warn!(
                        "{}: announced {} but received {}",
                        metadata.name,
                        format_bytes(metadata.size),
                        format_bytes(data.len() as u64)
                    );
                }
                self.accumulator.clear();
                ReceiveStep::Complete(ReceivedFile { metadata, data })
            }
            Frame::Control(ControlFrame::Unknown) => {
                log::debug!("Ignoring unknown control frame");
                ReceiveStep::Nothing
            }
        }
    }

    /// Drop any partial file.
    pub fn reset(&mut self) {
        self.metadata = None;
        self.accumulator.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn hello(name: &str, size: u64) -> Frame {
        Frame::Control(ControlFrame::Hello {
            data: FileMetadata::new(name, size, "text/plain"),
        })
    }

    fn data(bytes: &'static [u8]) -> Frame {
        Frame::Data(Bytes::from_static(bytes))
    }

    #[test]
    fn test_reassembles_in_order() {
        let mut receiver = ChunkReceiver::new();
        assert_eq!(
            receiver.handle(hello("a.txt", 6)),
            ReceiveStep::Started(FileMetadata::new("a.txt", 6, "text/plain"))
        );
        assert_eq!(receiver.handle(data(b"abc")), ReceiveStep::Progress(50.0));
        assert_eq!(receiver.handle(data(b"def")), ReceiveStep::Progress(100.0));
        assert_eq!(receiver.metadata().map(|m| m.name.as_str()), Some("a.txt"));

        match receiver.handle(Frame::Control(ControlFrame::Bye)) {
            ReceiveStep::Complete(file) => {
                assert_eq!(&file.data[..], b"abcdef");
                assert_eq!(file.metadata.name, "a.txt");
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(!receiver.is_receiving());
        assert!(receiver.metadata().is_none());
        assert_eq!(receiver.bytes_received(), 0);
    }

    #[test]
    fn test_frames_outside_transfer_are_dropped() {
        let mut receiver = ChunkReceiver::new();
        assert_eq!(receiver.handle(data(b"stray")), ReceiveStep::Nothing);
        assert_eq!(receiver.bytes_received(), 0);
        assert_eq!(
            receiver.handle(Frame::Control(ControlFrame::Bye)),
            ReceiveStep::Nothing
        );

        receiver.handle(hello("b.bin", 2));
        receiver.handle(data(b"ok"));
        assert!(matches!(
            receiver.handle(Frame::Control(ControlFrame::Bye)),
            ReceiveStep::Complete(_)
        ));

        // After bye we are idle again
        assert_eq!(receiver.handle(data(b"late")), ReceiveStep::Nothing);
        assert!(!receiver.is_receiving());
    }

    #[test]
    fn test_unknown_control_frame_changes_nothing() {
        let mut receiver = ChunkReceiver::new();
        receiver.handle(hello("c.txt", 4));
        receiver.handle(data(b"ab"));
        assert_eq!(
            receiver.handle(Frame::Control(ControlFrame::Unknown)),
            ReceiveStep::Nothing
        );
        assert_eq!(receiver.bytes_received(), 2);
        assert!(receiver.is_receiving());
    }

    #[test]
    fn test_empty_file() {
        let mut receiver = ChunkReceiver::new();
        receiver.handle(hello("empty", 0));
        match receiver.handle(Frame::Control(ControlFrame::Bye)) {
            ReceiveStep::Complete(file) => assert!(file.data.is_empty()),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_second_hello_restarts() {
        let mut receiver = ChunkReceiver::new();
        receiver.handle(hello("first", 10));
        receiver.handle(data(b"12345"));
        receiver.handle(hello("second", 3));
        assert_eq!(receiver.bytes_received(), 0);
        assert_eq!(receiver.metadata().map(|m| m.size), Some(3));
        receiver.handle(data(b"xyz"));
        match receiver.handle(Frame::Control(ControlFrame::Bye)) {
            ReceiveStep::Complete(file) => {
                assert_eq!(file.metadata.name, "second");
                assert_eq!(&file.data[..], b"xyz");
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }
}
