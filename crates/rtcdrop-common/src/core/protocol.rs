//! Transfer protocol frames
//!
//! Three message shapes travel over the data channel:
//! - `hello` (text): `{"type":"hello","data":{"name","size","type"}}`, once, before any bytes
//! - data (binary): raw file bytes, at most one max-size chunk per message, no header
//! - `bye` (text): `{"type":"bye"}`, once, after the last data chunk
//!
//! Chunk boundaries carry no meaning; the receiver reassembles by byte count.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::transport::ChannelMessage;

/// Description of the file announced by `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", alias = "mimeType", default)]
    pub mime_type: String,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
        }
    }
}

/// Text frames of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Hello { data: FileMetadata },
    Bye,
    /// Any type this version does not know; ignored by the receiver
    #[serde(other)]
    Unknown,
}

impl ControlFrame {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode control frame")
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to decode control frame")
    }
}

/// One message received from the data channel, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlFrame),
    Data(Bytes),
}

impl Frame {
    /// Classify a channel message. Text that is not a well-formed control
    /// frame yields `None`.
    pub fn from_message(message: ChannelMessage) -> Option<Self> {
        match message {
            ChannelMessage::Binary(data) => Some(Frame::Data(data)),
            ChannelMessage::Text(text) => match ControlFrame::decode(&text) {
                Ok(frame) => Some(Frame::Control(frame)),
                Err(e) => {
                    log::debug!("Ignoring malformed text frame: {:#}", e);
                    None
                }
            },
        }
    }
}

/// Progress in percent, `100.0` for an empty file.
pub fn calc_percent(current: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (current as f64 / total as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_format() {
        let frame = ControlFrame::Hello {
            data: FileMetadata::new("report.pdf", 1234, "application/pdf"),
        };
        let text = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["data"]["name"], "report.pdf");
        assert_eq!(value["data"]["size"], 1234);
        assert_eq!(value["data"]["type"], "application/pdf");
        assert_eq!(ControlFrame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_bye_wire_format() {
        assert_eq!(ControlFrame::Bye.encode().unwrap(), r#"{"type":"bye"}"#);
        assert_eq!(
            ControlFrame::decode(r#"{"type":"bye"}"#).unwrap(),
            ControlFrame::Bye
        );
    }

    #[test]
    fn test_hello_accepts_mime_type_key() {
        let frame = ControlFrame::decode(
            r#"{"type":"hello","data":{"name":"a.txt","size":3,"mimeType":"text/plain"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ControlFrame::Hello {
                data: FileMetadata::new("a.txt", 3, "text/plain")
            }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let frame = ControlFrame::decode(r#"{"type":"ping","data":42}"#).unwrap();
        assert_eq!(frame, ControlFrame::Unknown);
    }

    #[test]
    fn test_frame_classification() {
        let data = Bytes::from_static(b"\x00\x01\x02");
        assert_eq!(
            Frame::from_message(ChannelMessage::Binary(data.clone())),
            Some(Frame::Data(data))
        );
        assert_eq!(
            Frame::from_message(ChannelMessage::Text("not json".to_string())),
            None
        );
    }

    #[test]
    fn test_calc_percent() {
        assert_eq!(calc_percent(0, 0), 100.0);
        assert_eq!(calc_percent(50, 200), 25.0);
        assert_eq!(calc_percent(200, 200), 100.0);
    }
}
