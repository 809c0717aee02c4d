//! Registry of active streams on one connection.
//!
//! Each entry tracks up to two directions of a stream:
//!
//! - `outbound`: values this side produces, governed by a [`StreamState`]
//! - `inbound`: values the peer produces, forwarded to an [`InboundFlux`]
//!   through an unbounded channel
//!
//! An entry is removed once its outbound side is terminal (or absent) and its
//! inbound side is closed. Every entry gets a serial number so that a task
//! finishing late cannot tear down a newer stream that reused its id.
//!
//! [`InboundFlux`]: super::InboundFlux

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::demand::{StreamState, StreamStatus};
use super::InteractionModel;
use crate::connection::Mode;
use crate::error::{RSocketError, Result};
use crate::payload::Payload;
use crate::protocol::MAX_STREAM_ID;

/// Signal delivered to the inbound side of a stream.
#[derive(Debug)]
pub(crate) enum InboundSignal {
    Next(Payload),
    Complete,
    Error(RSocketError),
}

pub(crate) type InboundSender = mpsc::UnboundedSender<InboundSignal>;

struct StreamEntry {
    serial: u64,
    model: InteractionModel,
    /// Initiated by this side of the connection.
    local: bool,
    outbound: Option<Arc<StreamState>>,
    inbound: Option<InboundSender>,
}

impl StreamEntry {
    fn is_finished(&self) -> bool {
        self.inbound.is_none() && self.outbound.as_ref().map_or(true, |s| s.is_terminated())
    }
}

struct Inner {
    streams: HashMap<u32, StreamEntry>,
    next_id: u32,
    next_serial: u64,
    closed: bool,
}

/// Tracks active stream ids, their demand and their inbound channels.
pub struct StreamRegistry {
    inner: Mutex<Inner>,
    first_id: u32,
}

impl StreamRegistry {
    /// Create a registry allocating ids for `mode` (client odd, server even).
    pub fn new(mode: Mode) -> Self {
        let first_id = mode.first_stream_id();
        Self {
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                next_id: first_id,
                next_serial: 1,
                closed: false,
            }),
            first_id,
        }
    }

    /// Allocate the next free locally-initiated stream id without registering it.
    ///
    /// Used for fire-and-forget, which has no stream lifecycle.
    pub fn next_stream_id(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RSocketError::ConnectionClosed);
        }
        allocate(&mut inner, self.first_id)
    }

    /// Register a locally-initiated stream under a fresh id.
    ///
    /// Returns `(stream_id, serial)`.
    pub(crate) fn register_local(
        &self,
        model: InteractionModel,
        outbound: Option<Arc<StreamState>>,
        inbound: Option<InboundSender>,
    ) -> Result<(u32, u64)> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RSocketError::ConnectionClosed);
        }
        let stream_id = allocate(&mut inner, self.first_id)?;
        let serial = insert(&mut inner, stream_id, model, true, outbound, inbound);
        Ok((stream_id, serial))
    }

    /// Register a stream opened by the peer.
    ///
    /// Returns `None` if the id is already active or the registry is closed.
    pub(crate) fn register_remote(
        &self,
        stream_id: u32,
        model: InteractionModel,
        outbound: Option<Arc<StreamState>>,
        inbound: Option<InboundSender>,
    ) -> Option<u64> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.streams.contains_key(&stream_id) {
            return None;
        }
        Some(insert(&mut inner, stream_id, model, false, outbound, inbound))
    }

    /// Add REQUEST_N credits to a stream's outbound side.
    pub fn add_demand(&self, stream_id: u32, n: u32) -> bool {
        let inner = self.inner.lock();
        match inner.streams.get(&stream_id).and_then(|e| e.outbound.as_ref()) {
            Some(state) => {
                state.add_demand(n);
                true
            }
            None => false,
        }
    }

    /// Deliver a PAYLOAD frame's value and/or completion to the inbound side.
    ///
    /// Both signals are queued under one lock so a consumer never observes the
    /// value without the completion that arrived in the same frame.
    pub(crate) fn deliver(&self, stream_id: u32, value: Option<Payload>, complete: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            return false;
        };
        let Some(tx) = entry.inbound.as_ref() else {
            return false;
        };

        if let Some(payload) = value {
            let _ = tx.send(InboundSignal::Next(payload));
        }
        if complete {
            let _ = tx.send(InboundSignal::Complete);
            entry.inbound = None;
        }

        if entry.is_finished() {
            inner.streams.remove(&stream_id);
        }
        true
    }

    /// Handle a CANCEL from the peer.
    ///
    /// Stops this side's production. When the peer was the requester the whole
    /// exchange ends, so the inbound side is closed as well. Unknown ids are a
    /// no-op.
    pub fn cancel(&self, stream_id: u32) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            return false;
        };

        if let Some(state) = &entry.outbound {
            state.terminate(StreamStatus::Cancelled);
        }
        if !entry.local {
            if let Some(tx) = entry.inbound.take() {
                let _ = tx.send(InboundSignal::Error(RSocketError::Cancelled));
            }
        }

        if entry.is_finished() {
            inner.streams.remove(&stream_id);
        }
        true
    }

    /// Handle an ERROR frame for a stream: both directions terminate.
    pub fn error(&self, stream_id: u32, error: RSocketError) -> bool {
        let Some(entry) = self.inner.lock().streams.remove(&stream_id) else {
            return false;
        };

        if let Some(state) = &entry.outbound {
            state.terminate(StreamStatus::Cancelled);
        }
        if let Some(tx) = entry.inbound {
            let _ = tx.send(InboundSignal::Error(error));
        }
        true
    }

    /// Called by a producer once its outbound side is terminal.
    ///
    /// An errored outbound side ends the whole exchange, closing the inbound
    /// side too.
    pub(crate) fn finish_outbound(&self, stream_id: u32, serial: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            return;
        };
        if entry.serial != serial {
            return;
        }

        let errored = entry
            .outbound
            .as_ref()
            .is_some_and(|s| s.status() == StreamStatus::Errored);
        if errored {
            if let Some(tx) = entry.inbound.take() {
                let _ = tx.send(InboundSignal::Error(RSocketError::Cancelled));
            }
        }

        if entry.is_finished() {
            trace!(stream_id, "Stream released");
            inner.streams.remove(&stream_id);
        }
    }

    /// Called when the consumer of an inbound side goes away.
    ///
    /// Returns `true` if the inbound side was still open, i.e. the peer should
    /// be told to stop with CANCEL. A requester abandoning its inbound side also
    /// stops its own outbound production.
    pub(crate) fn abandon_inbound(&self, stream_id: u32, serial: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            return false;
        };
        if entry.serial != serial {
            return false;
        }

        let was_open = entry.inbound.take().is_some();
        if was_open && entry.local {
            if let Some(state) = &entry.outbound {
                state.terminate(StreamStatus::Cancelled);
            }
        }

        if entry.is_finished() {
            inner.streams.remove(&stream_id);
        }
        was_open
    }

    /// Terminate every stream (transport closed) and refuse new ones.
    pub fn close_all(&self) {
        let entries: Vec<(u32, StreamEntry)> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.streams.drain().collect()
        };

        if !entries.is_empty() {
            debug!(count = entries.len(), "Terminating streams on shutdown");
        }
        for (_, entry) in entries {
            if let Some(state) = &entry.outbound {
                state.terminate(StreamStatus::Cancelled);
            }
            if let Some(tx) = entry.inbound {
                let _ = tx.send(InboundSignal::Error(RSocketError::ConnectionClosed));
            }
        }
    }

    /// Number of active streams.
    pub fn len(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Check if no stream is active.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().streams.is_empty()
    }

    /// Check if a stream id is active.
    pub fn contains(&self, stream_id: u32) -> bool {
        self.inner.lock().streams.contains_key(&stream_id)
    }

    /// Interaction model of an active stream.
    pub fn model(&self, stream_id: u32) -> Option<InteractionModel> {
        self.inner.lock().streams.get(&stream_id).map(|e| e.model)
    }

    /// Check if the registry was closed by shutdown.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    fn set_next_id(&self, next_id: u32) {
        self.inner.lock().next_id = next_id;
    }
}

fn allocate(inner: &mut Inner, first_id: u32) -> Result<u32> {
    for _ in 0..=inner.streams.len() {
        let stream_id = inner.next_id;
        inner.next_id = if stream_id > MAX_STREAM_ID - 2 {
            first_id
        } else {
            stream_id + 2
        };
        if !inner.streams.contains_key(&stream_id) {
            return Ok(stream_id);
        }
    }
    Err(RSocketError::Protocol("no free stream ids".to_string()))
}

fn insert(
    inner: &mut Inner,
    stream_id: u32,
    model: InteractionModel,
    local: bool,
    outbound: Option<Arc<StreamState>>,
    inbound: Option<InboundSender>,
) -> u64 {
    let serial = inner.next_serial;
    inner.next_serial += 1;
    inner.streams.insert(
        stream_id,
        StreamEntry {
            serial,
            model,
            local,
            outbound,
            inbound,
        },
    );
    serial
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<InboundSignal>) -> Vec<InboundSignal> {
        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        signals
    }

    #[test]
    fn test_client_ids_are_odd_and_increasing() {
        let registry = StreamRegistry::new(Mode::Client);
        let ids: Vec<u32> = (0..3)
            .map(|_| {
                registry
                    .register_local(InteractionModel::RequestResponse, None, None)
                    .unwrap()
                    .0
            })
            .collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn test_server_ids_are_even() {
        let registry = StreamRegistry::new(Mode::Server);
        assert_eq!(registry.next_stream_id().unwrap(), 2);
        assert_eq!(registry.next_stream_id().unwrap(), 4);
    }

    #[test]
    fn test_ids_wrap_and_skip_active() {
        let registry = StreamRegistry::new(Mode::Client);
        let (tx, _rx) = mpsc::unbounded_channel();
        registry
            .register_local(InteractionModel::RequestStream, None, Some(tx))
            .unwrap();
        assert!(registry.contains(1));

        registry.set_next_id(MAX_STREAM_ID);
        assert_eq!(registry.next_stream_id().unwrap(), MAX_STREAM_ID);
        // 1 is still active, so the allocator moves on to 3
        assert_eq!(registry.next_stream_id().unwrap(), 3);
    }

    #[test]
    fn test_register_remote_rejects_active_id() {
        let registry = StreamRegistry::new(Mode::Server);
        let state = Arc::new(StreamState::new(0));
        assert!(registry
            .register_remote(1, InteractionModel::RequestStream, Some(state.clone()), None)
            .is_some());
        assert!(registry
            .register_remote(1, InteractionModel::RequestResponse, Some(state), None)
            .is_none());
        assert_eq!(registry.model(1), Some(InteractionModel::RequestStream));
    }

    #[test]
    fn test_add_demand_reaches_outbound_state() {
        let registry = StreamRegistry::new(Mode::Server);
        let state = Arc::new(StreamState::new(0));
        registry.register_remote(1, InteractionModel::RequestStream, Some(state.clone()), None);

        assert!(registry.add_demand(1, 3));
        assert_eq!(state.demand(), 3);
        assert!(!registry.add_demand(99, 3));
    }

    #[test]
    fn test_deliver_value_and_completion() {
        let registry = StreamRegistry::new(Mode::Client);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, _) = registry
            .register_local(InteractionModel::RequestResponse, None, Some(tx))
            .unwrap();

        assert!(registry.deliver(id, Some(Payload::from("X")), true));
        let signals = drain(&mut rx);
        assert!(matches!(&signals[0], InboundSignal::Next(p) if p.data_utf8() == Some("X")));
        assert!(matches!(signals[1], InboundSignal::Complete));
        assert!(registry.is_empty());

        // Late frames for a finished stream are ignored
        assert!(!registry.deliver(id, Some(Payload::from("Y")), false));
    }

    #[test]
    fn test_cancel_terminates_and_is_idempotent() {
        let registry = StreamRegistry::new(Mode::Server);
        let state = Arc::new(StreamState::new(5));
        registry.register_remote(1, InteractionModel::RequestStream, Some(state.clone()), None);

        assert!(registry.cancel(1));
        assert_eq!(state.status(), StreamStatus::Cancelled);
        assert!(registry.is_empty());
        assert!(!registry.cancel(1));
    }

    #[test]
    fn test_cancel_of_remote_channel_closes_inbound() {
        let registry = StreamRegistry::new(Mode::Server);
        let state = Arc::new(StreamState::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_remote(1, InteractionModel::RequestChannel, Some(state.clone()), Some(tx));

        registry.cancel(1);
        assert_eq!(state.status(), StreamStatus::Cancelled);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [InboundSignal::Error(RSocketError::Cancelled)]
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_of_local_channel_keeps_inbound() {
        let registry = StreamRegistry::new(Mode::Client);
        let state = Arc::new(StreamState::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, _) = registry
            .register_local(InteractionModel::RequestChannel, Some(state.clone()), Some(tx))
            .unwrap();

        registry.cancel(id);
        assert_eq!(state.status(), StreamStatus::Cancelled);
        assert!(drain(&mut rx).is_empty());
        assert!(registry.contains(id));
    }

    #[test]
    fn test_error_terminates_both_directions() {
        let registry = StreamRegistry::new(Mode::Client);
        let state = Arc::new(StreamState::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, _) = registry
            .register_local(InteractionModel::RequestChannel, Some(state.clone()), Some(tx))
            .unwrap();

        assert!(registry.error(
            id,
            RSocketError::Remote {
                code: 0x201,
                message: "boom".into()
            }
        ));
        assert!(state.is_terminated());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [InboundSignal::Error(RSocketError::Remote { .. })]
        ));
        assert!(!registry.error(id, RSocketError::Cancelled));
    }

    #[test]
    fn test_finish_outbound_ignores_stale_serial() {
        let registry = StreamRegistry::new(Mode::Server);
        let old = Arc::new(StreamState::new(0));
        let old_serial = registry
            .register_remote(1, InteractionModel::RequestStream, Some(old.clone()), None)
            .unwrap();
        registry.cancel(1);

        let new = Arc::new(StreamState::new(0));
        registry.register_remote(1, InteractionModel::RequestStream, Some(new), None);

        registry.finish_outbound(1, old_serial);
        assert!(registry.contains(1));
    }

    #[test]
    fn test_finish_outbound_keeps_open_inbound() {
        let registry = StreamRegistry::new(Mode::Server);
        let state = Arc::new(StreamState::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let serial = registry
            .register_remote(1, InteractionModel::RequestChannel, Some(state.clone()), Some(tx))
            .unwrap();

        state.terminate(StreamStatus::Complete);
        registry.finish_outbound(1, serial);
        assert!(registry.contains(1));
        assert!(drain(&mut rx).is_empty());

        registry.deliver(1, None, true);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_errored_outbound_closes_inbound() {
        let registry = StreamRegistry::new(Mode::Server);
        let state = Arc::new(StreamState::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let serial = registry
            .register_remote(1, InteractionModel::RequestChannel, Some(state.clone()), Some(tx))
            .unwrap();

        state.terminate(StreamStatus::Errored);
        registry.finish_outbound(1, serial);
        assert!(registry.is_empty());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [InboundSignal::Error(RSocketError::Cancelled)]
        ));
    }

    #[test]
    fn test_abandon_inbound_reports_open_once() {
        let registry = StreamRegistry::new(Mode::Client);
        let state = Arc::new(StreamState::new(0));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, serial) = registry
            .register_local(InteractionModel::RequestChannel, Some(state.clone()), Some(tx))
            .unwrap();

        assert!(registry.abandon_inbound(id, serial));
        assert_eq!(state.status(), StreamStatus::Cancelled);
        assert!(!registry.abandon_inbound(id, serial));
    }

    #[test]
    fn test_close_all_terminates_everything() {
        let registry = StreamRegistry::new(Mode::Client);
        let state = Arc::new(StreamState::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register_local(InteractionModel::RequestChannel, Some(state.clone()), Some(tx))
            .unwrap();

        registry.close_all();
        assert!(registry.is_empty());
        assert!(registry.is_closed());
        assert!(state.is_terminated());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [InboundSignal::Error(RSocketError::ConnectionClosed)]
        ));
        assert!(matches!(
            registry.next_stream_id(),
            Err(RSocketError::ConnectionClosed)
        ));
    }
}
