//! Requester: issue requests to the peer.
//!
//! [`Requester`] implements [`RSocket`] by sending request frames and reading
//! the peer's answers from the stream registry, so the same trait covers a
//! local service and a remote one. It is cheap to clone and can be handed to
//! another connection as its responder to forward requests.
//!
//! Producers are lazy: a stream or channel request is sent when the returned
//! `Flux` is first polled, a request-response when the `Mono` is first polled.

use std::sync::Arc;

use futures::{stream, FutureExt, StreamExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{RSocketError, Result};
use crate::handler::{drive_outbound, Flux, Mono, RSocket, StreamContext, Unit};
use crate::payload::Payload;
use crate::protocol::Frame;
use crate::stream::{InboundFlux, InteractionModel, StreamRegistry, StreamState};
use crate::writer::WriterHandle;

/// Handle for sending requests over a connection.
#[derive(Clone)]
pub struct Requester {
    writer: WriterHandle,
    registry: Arc<StreamRegistry>,
    request_window: u32,
}

impl Requester {
    pub(crate) fn new(
        writer: WriterHandle,
        registry: Arc<StreamRegistry>,
        request_window: u32,
    ) -> Self {
        Self {
            writer,
            registry,
            request_window,
        }
    }

    /// Number of streams currently active on the connection.
    pub fn active_streams(&self) -> usize {
        self.registry.len()
    }

    /// Register a local stream and wrap its inbound side.
    fn open(
        &self,
        model: InteractionModel,
        outbound: Option<Arc<StreamState>>,
        window: u32,
    ) -> Result<InboundFlux> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stream_id, serial) = self.registry.register_local(model, outbound, Some(tx))?;
        trace!(stream_id, ?model, "Opening stream");
        Ok(InboundFlux::new(
            stream_id,
            serial,
            rx,
            self.writer.clone(),
            self.registry.clone(),
            window,
            window,
        ))
    }

    async fn open_stream(self, payload: Payload) -> Result<InboundFlux> {
        let window = self.request_window;
        let inbound = self.open(InteractionModel::RequestStream, None, window)?;
        let frame = Frame::request_stream(inbound.stream_id(), window, payload);
        if let Err(e) = self.writer.send_frame(&frame).await {
            inbound.release();
            return Err(e);
        }
        Ok(inbound)
    }

    async fn open_channel(self, mut payloads: Flux) -> Result<InboundFlux> {
        let (first, complete) = match payloads.next().await {
            Some(Ok(payload)) => (payload, false),
            Some(Err(e)) => return Err(e),
            None => (Payload::empty(), true),
        };

        let window = self.request_window;
        let state = Arc::new(StreamState::new(0));
        let outbound = (!complete).then(|| state.clone());
        let inbound = self.open(InteractionModel::RequestChannel, outbound, window)?;
        let stream_id = inbound.stream_id();

        let frame = Frame::request_channel(stream_id, window, first, complete);
        if let Err(e) = self.writer.send_frame(&frame).await {
            inbound.release();
            return Err(e);
        }

        if !complete {
            let ctx = StreamContext::new(stream_id, self.writer.clone(), state);
            let registry = self.registry.clone();
            let serial = inbound.serial();
            tokio::spawn(async move {
                drive_outbound(ctx, payloads).await;
                registry.finish_outbound(stream_id, serial);
            });
        }

        Ok(inbound)
    }
}

fn error_flux(error: RSocketError) -> Flux {
    stream::once(async move { Err(error) }).boxed()
}

impl RSocket for Requester {
    fn request_response(&self, payload: Payload) -> Mono {
        let this = self.clone();
        async move {
            let mut inbound = this.open(InteractionModel::RequestResponse, None, 0)?;
            let frame = Frame::request_response(inbound.stream_id(), payload);
            if let Err(e) = this.writer.send_frame(&frame).await {
                inbound.release();
                return Err(e);
            }

            match inbound.next().await {
                Some(Ok(value)) => Ok(Some(value)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn fire_and_forget(&self, payload: Payload) -> Unit {
        let this = self.clone();
        async move {
            let stream_id = this.registry.next_stream_id()?;
            this.writer
                .send_frame(&Frame::request_fnf(stream_id, payload))
                .await
        }
        .boxed()
    }

    fn request_stream(&self, payload: Payload) -> Flux {
        let this = self.clone();
        stream::once(async move {
            match this.open_stream(payload).await {
                Ok(inbound) => inbound.boxed(),
                Err(e) => error_flux(e),
            }
        })
        .flatten()
        .boxed()
    }

    fn request_channel(&self, payloads: Flux) -> Flux {
        let this = self.clone();
        stream::once(async move {
            match this.open_channel(payloads).await {
                Ok(inbound) => inbound.boxed(),
                Err(e) => error_flux(e),
            }
        })
        .flatten()
        .boxed()
    }

    fn metadata_push(&self, payload: Payload) -> Unit {
        let this = self.clone();
        async move {
            let (_, metadata) = payload.into_parts();
            this.writer
                .send_frame(&Frame::metadata_push(metadata.unwrap_or_default()))
                .await
        }
        .boxed()
    }
}
