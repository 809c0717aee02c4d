//! Consumer side of a stream: values arriving from the peer.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::trace;

use super::registry::{InboundSignal, StreamRegistry};
use crate::error::Result;
use crate::payload::Payload;
use crate::protocol::{Frame, MAX_REQUEST_N};
use crate::writer::WriterHandle;

/// Stream of payloads the peer sends on one stream id.
///
/// Demand is granted to the peer in windows: once the consumer has drained
/// the buffer and fewer than half a window of values is still owed, a
/// REQUEST_N tops the grant back up to a full window. Dropping the flux
/// before it ends sends CANCEL.
pub struct InboundFlux {
    stream_id: u32,
    serial: u64,
    rx: mpsc::UnboundedReceiver<InboundSignal>,
    writer: WriterHandle,
    registry: Arc<StreamRegistry>,
    window: u32,
    outstanding: u32,
    done: bool,
}

impl InboundFlux {
    /// `outstanding` is the demand already granted (e.g. the initial request N).
    /// A `window` of 0 never grants more.
    pub(crate) fn new(
        stream_id: u32,
        serial: u64,
        rx: mpsc::UnboundedReceiver<InboundSignal>,
        writer: WriterHandle,
        registry: Arc<StreamRegistry>,
        window: u32,
        outstanding: u32,
    ) -> Self {
        Self {
            stream_id,
            serial,
            rx,
            writer,
            registry,
            window: window.min(MAX_REQUEST_N),
            outstanding: outstanding.min(MAX_REQUEST_N),
            done: false,
        }
    }

    /// Stream id this flux reads from.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Drop the stream locally without telling the peer.
    ///
    /// For requests whose opening frame never made it to the writer.
    pub(crate) fn release(mut self) {
        self.registry.abandon_inbound(self.stream_id, self.serial);
        self.done = true;
    }

    fn replenish(&mut self) {
        if self.done || self.window == 0 || self.outstanding >= MAX_REQUEST_N {
            return;
        }
        if self.outstanding > self.window / 2 {
            return;
        }
        let grant = self.window - self.outstanding;
        if grant == 0 {
            return;
        }
        self.outstanding = self.window;
        trace!(stream_id = self.stream_id, grant, "Granting demand");
        self.writer
            .send_detached(&Frame::request_n(self.stream_id, grant));
    }
}

impl Stream for InboundFlux {
    type Item = Result<Payload>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(InboundSignal::Next(payload))) => {
                if this.outstanding < MAX_REQUEST_N {
                    this.outstanding = this.outstanding.saturating_sub(1);
                }
                Poll::Ready(Some(Ok(payload)))
            }
            Poll::Ready(Some(InboundSignal::Error(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(InboundSignal::Complete)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                this.replenish();
                Poll::Pending
            }
        }
    }
}

impl Drop for InboundFlux {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.registry.abandon_inbound(self.stream_id, self.serial) {
            trace!(stream_id = self.stream_id, "Inbound dropped early, cancelling");
            self.writer.send_detached(&Frame::cancel(self.stream_id));
        }
    }
}
