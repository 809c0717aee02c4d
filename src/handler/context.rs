//! Frame emitter for one outbound stream.
//!
//! [`StreamContext`] is the only path by which a producer's values, completion
//! or error become frames. Terminal frames are sent only by the caller that
//! wins the stream's terminal transition, so a completion racing a CANCEL or
//! an error never produces a second terminal frame.

use std::sync::Arc;

use tracing::trace;

use crate::error::{RSocketError, Result};
use crate::payload::Payload;
use crate::protocol::Frame;
use crate::stream::{StreamState, StreamStatus};
use crate::writer::WriterHandle;

/// Emits PAYLOAD / ERROR frames for one stream.
#[derive(Clone)]
pub struct StreamContext {
    stream_id: u32,
    writer: WriterHandle,
    state: Arc<StreamState>,
}

impl StreamContext {
    /// Create an emitter for `stream_id`.
    pub fn new(stream_id: u32, writer: WriterHandle, state: Arc<StreamState>) -> Self {
        Self {
            stream_id,
            writer,
            state,
        }
    }

    /// Get the stream ID.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Shared demand/terminal state of this stream.
    #[inline]
    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    /// Emit one value (NEXT).
    ///
    /// Returns `Ok(false)` without sending if the stream is already terminal.
    /// Demand is not checked here; callers take a credit first.
    pub async fn next(&self, payload: Payload) -> Result<bool> {
        if self.state.is_terminated() {
            return Ok(false);
        }
        self.send(&Frame::next(self.stream_id, payload, false)).await?;
        Ok(true)
    }

    /// Emit a single value that also completes the stream (NEXT | COMPLETE).
    pub async fn next_complete(&self, payload: Payload) -> Result<bool> {
        if !self.state.terminate(StreamStatus::Complete) {
            return Ok(false);
        }
        self.send(&Frame::next(self.stream_id, payload, true)).await?;
        Ok(true)
    }

    /// Complete the stream without a value (COMPLETE only).
    pub async fn complete(&self) -> Result<bool> {
        if !self.state.terminate(StreamStatus::Complete) {
            return Ok(false);
        }
        self.send(&Frame::complete(self.stream_id)).await?;
        Ok(true)
    }

    /// Terminate the stream with an ERROR frame carrying the error text.
    pub async fn error(&self, error: &RSocketError) -> Result<bool> {
        if !self.state.terminate(StreamStatus::Errored) {
            return Ok(false);
        }
        self.send(&Frame::application_error(self.stream_id, error))
            .await?;
        Ok(true)
    }

    /// Stop without sending anything. Only for a writer that is gone.
    pub fn abort(&self) -> bool {
        self.state.terminate(StreamStatus::Cancelled)
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        trace!(stream_id = self.stream_id, frame_type = ?frame.frame_type(), "Emitting");
        self.writer.send_frame_when_ready(frame).await
    }
}
