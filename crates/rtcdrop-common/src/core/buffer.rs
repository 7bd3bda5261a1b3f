//! FIFO byte queue with exact-size reads across segment boundaries.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Queue of byte segments read back in arbitrary-size pieces.
///
/// Segments are stored as [`Bytes`], so splitting the head segment is a
/// refcount bump rather than a copy. The only copy happens when a read
/// spans several segments and they are stitched into one buffer.
#[derive(Debug, Default)]
pub struct ByteCursorBuffer {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl ByteCursorBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a segment to the tail. Empty segments are dropped.
    pub fn append(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    /// Remove and return up to `max_bytes` from the head.
    ///
    /// Returns fewer bytes only when the buffer holds fewer than requested.
    pub fn read(&mut self, max_bytes: usize) -> Bytes {
        let wanted = max_bytes.min(self.len);
        if wanted == 0 {
            return Bytes::new();
        }

        // Fast path: the head segment alone satisfies the read
        let head_len = self.segments.front().map_or(0, Bytes::len);
        if head_len == wanted {
            self.len -= wanted;
            return self.segments.pop_front().unwrap_or_default();
        }
        if head_len > wanted {
            if let Some(head) = self.segments.front_mut() {
                self.len -= wanted;
                return head.split_to(wanted);
            }
        }

        let mut out = BytesMut::with_capacity(wanted);
        while out.len() < wanted {
            let Some(mut head) = self.segments.pop_front() else {
                break;
            };
            let remaining = wanted - out.len();
            if head.len() <= remaining {
                out.extend_from_slice(&head);
            } else {
                out.extend_from_slice(&head.split_to(remaining));
                self.segments.push_front(head);
            }
        }
        self.len -= out.len();
        out.freeze()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes available.
    pub fn len(&self) -> usize {
        self.len
    }
}
