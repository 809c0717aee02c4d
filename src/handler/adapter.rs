//! Responder side: run handler producers and turn their outcomes into frames.
//!
//! Each accepted request runs in its own task so a slow producer never stalls
//! the read loop or other streams. The task holds a concurrency permit for its
//! whole lifetime and releases its registry entry when it ends.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::debug;

use super::{Flux, RSocket, StreamContext};
use crate::payload::Payload;
use crate::stream::{
    InboundFlux, InboundSender, InboundSignal, InteractionModel, StreamRegistry, StreamState,
};
use crate::writer::WriterHandle;

/// Drive a multi-value producer onto one stream.
///
/// A value is pulled from the producer, then held until the peer has granted
/// demand for it. Completion and errors need no demand. The loop stops as
/// soon as the stream turns terminal (CANCEL, peer ERROR, shutdown), dropping
/// the producer.
pub(crate) async fn drive_outbound(ctx: StreamContext, mut flux: Flux) {
    let state = ctx.state().clone();
    let stream_id = ctx.stream_id();

    loop {
        let item = tokio::select! {
            biased;
            _ = state.terminated() => break,
            item = flux.next() => item,
        };

        match item {
            Some(Ok(payload)) => {
                if !state.acquire().await {
                    break;
                }
                if let Err(e) = ctx.next(payload).await {
                    debug!(stream_id, "Stopping stream, writer closed: {}", e);
                    ctx.abort();
                    break;
                }
            }
            Some(Err(e)) => {
                if let Err(send_err) = ctx.error(&e).await {
                    debug!(stream_id, "Could not send stream error: {}", send_err);
                }
                break;
            }
            None => {
                if let Err(e) = ctx.complete().await {
                    debug!(stream_id, "Could not send completion: {}", e);
                }
                break;
            }
        }
    }
}

/// Starts responder tasks for inbound requests.
#[derive(Clone)]
pub(crate) struct Responder {
    handler: Arc<dyn RSocket>,
    writer: WriterHandle,
    registry: Arc<StreamRegistry>,
    request_window: u32,
}

impl Responder {
    pub(crate) fn new(
        handler: Arc<dyn RSocket>,
        writer: WriterHandle,
        registry: Arc<StreamRegistry>,
        request_window: u32,
    ) -> Self {
        Self {
            handler,
            writer,
            registry,
            request_window,
        }
    }

    fn open_stream(
        &self,
        stream_id: u32,
        model: InteractionModel,
        initial_demand: u32,
        inbound: Option<InboundSender>,
    ) -> Option<(StreamContext, u64)> {
        let state = Arc::new(StreamState::new(initial_demand));
        match self
            .registry
            .register_remote(stream_id, model, Some(state.clone()), inbound)
        {
            Some(serial) => Some((
                StreamContext::new(stream_id, self.writer.clone(), state),
                serial,
            )),
            None => {
                debug!(stream_id, ?model, "Ignoring request for an active or closed stream");
                None
            }
        }
    }

    /// REQUEST_RESPONSE: one value with NEXT|COMPLETE, empty COMPLETE, or ERROR.
    pub(crate) fn request_response(
        &self,
        stream_id: u32,
        payload: Payload,
        permit: OwnedSemaphorePermit,
    ) {
        let Some((ctx, serial)) =
            self.open_stream(stream_id, InteractionModel::RequestResponse, 0, None)
        else {
            return;
        };
        let handler = self.handler.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let state = ctx.state().clone();
            let mono = handler.request_response(payload);

            let outcome = tokio::select! {
                biased;
                _ = state.terminated() => None,
                result = mono => Some(result),
            };

            let sent = match outcome {
                None => {
                    debug!(stream_id, "Request cancelled before a response");
                    Ok(false)
                }
                Some(Ok(Some(value))) => ctx.next_complete(value).await,
                Some(Ok(None)) => ctx.complete().await,
                Some(Err(e)) => ctx.error(&e).await,
            };
            if let Err(e) = sent {
                debug!(stream_id, "Response not sent: {}", e);
                ctx.abort();
            }

            registry.finish_outbound(stream_id, serial);
        });
    }

    /// REQUEST_FNF: run for side effects; nothing is ever sent back.
    pub(crate) fn fire_and_forget(&self, payload: Payload, permit: OwnedSemaphorePermit) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handler.fire_and_forget(payload).await {
                debug!("Fire-and-forget handler failed: {}", e);
            }
        });
    }

    /// METADATA_PUSH: like fire-and-forget, metadata only.
    pub(crate) fn metadata_push(&self, payload: Payload, permit: OwnedSemaphorePermit) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handler.metadata_push(payload).await {
                debug!("Metadata push handler failed: {}", e);
            }
        });
    }

    /// REQUEST_STREAM: values bounded by demand, then COMPLETE or ERROR.
    pub(crate) fn request_stream(
        &self,
        stream_id: u32,
        initial_request_n: u32,
        payload: Payload,
        permit: OwnedSemaphorePermit,
    ) {
        let Some((ctx, serial)) = self.open_stream(
            stream_id,
            InteractionModel::RequestStream,
            initial_request_n,
            None,
        ) else {
            return;
        };
        let handler = self.handler.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let flux = handler.request_stream(payload);
            drive_outbound(ctx, flux).await;
            registry.finish_outbound(stream_id, serial);
        });
    }

    /// REQUEST_CHANNEL: the request frame's payload is the first inbound value.
    ///
    /// An empty payload on a request that already carries COMPLETE opens a
    /// channel whose requester had nothing to send.
    pub(crate) fn request_channel(
        &self,
        stream_id: u32,
        initial_request_n: u32,
        payload: Payload,
        inbound_complete: bool,
        permit: OwnedSemaphorePermit,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        if !(inbound_complete && payload.is_empty()) {
            let _ = tx.send(InboundSignal::Next(payload));
        }
        let inbound_tx = if inbound_complete {
            let _ = tx.send(InboundSignal::Complete);
            None
        } else {
            Some(tx)
        };

        let Some((ctx, serial)) = self.open_stream(
            stream_id,
            InteractionModel::RequestChannel,
            initial_request_n,
            inbound_tx,
        ) else {
            return;
        };

        let inbound = InboundFlux::new(
            stream_id,
            serial,
            rx,
            self.writer.clone(),
            self.registry.clone(),
            self.request_window,
            0,
        );
        let handler = self.handler.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let flux = handler.request_channel(inbound.boxed());
            drive_outbound(ctx, flux).await;
            registry.finish_outbound(stream_id, serial);
        });
    }
}
