//! Reassembly of length-prefixed frames from arbitrary byte chunks.
//!
//! Transport reads split and merge frames freely. [`FrameBuffer`] keeps the
//! leftover bytes between reads and hands out every complete frame, length
//! prefix included, as a zero-copy `Bytes` slice:
//!
//! - `WaitingForLength`: fewer than 3 bytes buffered
//! - `WaitingForBody`: length known, need the rest of the frame
//! - `Discarding`: an oversized frame is being skipped
//!
//! # Example
//!
//! ```
//! use rsocket_engine::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // "length 1, body X" split across two reads
//! assert!(buffer.push(&[0, 0]).is_empty());
//! let frames = buffer.push(&[1, b'X']);
//! assert_eq!(frames.len(), 1);
//! assert_eq!(&frames[0][..], &[0, 0, 1, b'X']);
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use super::wire_format::{read_u24, FRAME_LENGTH_SIZE, MAX_FRAME_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForLength,
    WaitingForBody { frame_len: usize },
    Discarding { remaining: usize },
}

/// Accumulates incoming bytes and extracts complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_length: u32,
}

impl FrameBuffer {
    /// Create a frame buffer accepting any frame the length prefix can describe.
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    /// Create a frame buffer that skips frames whose body exceeds `max_frame_length`.
    pub fn with_max_frame_length(max_frame_length: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_length,
        }
    }

    /// Append `data` and return every frame that is now complete, in order.
    ///
    /// Each returned slice starts with the 3-byte length prefix. Bytes of an
    /// incomplete trailing frame stay buffered for the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    fn try_extract_one(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    let length = read_u24(&self.buffer)?;
                    if length > self.max_frame_length {
                        warn!(
                            length,
                            max = self.max_frame_length,
                            "Skipping frame larger than the configured maximum"
                        );
                        self.buffer.advance(FRAME_LENGTH_SIZE);
                        self.state = State::Discarding {
                            remaining: length as usize,
                        };
                        continue;
                    }
                    self.state = State::WaitingForBody {
                        frame_len: FRAME_LENGTH_SIZE + length as usize,
                    };
                }

                State::WaitingForBody { frame_len } => {
                    if self.buffer.len() < frame_len {
                        return None;
                    }
                    self.state = State::WaitingForLength;
                    return Some(self.buffer.split_to(frame_len).freeze());
                }

                State::Discarding { remaining } => {
                    let skip = remaining.min(self.buffer.len());
                    self.buffer.advance(skip);
                    if skip < remaining {
                        self.state = State::Discarding {
                            remaining: remaining - skip,
                        };
                        return None;
                    }
                    self.state = State::WaitingForLength;
                }
            }
        }
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop buffered bytes and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForLength;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForLength => "WaitingForLength",
            State::WaitingForBody { .. } => "WaitingForBody",
            State::Discarding { .. } => "Discarding",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
