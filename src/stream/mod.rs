//! Stream module - multiplexed stream bookkeeping.
//!
//! - [`StreamRegistry`] - active stream ids, id allocation, signal routing
//! - [`StreamState`] - outstanding demand and the exactly-once terminal flag
//! - [`InboundFlux`] - values arriving from the peer, with windowed REQUEST_N

mod demand;
mod inbound;
mod registry;

pub use demand::{StreamState, StreamStatus};
pub use inbound::InboundFlux;
pub use registry::StreamRegistry;

pub(crate) use registry::{InboundSender, InboundSignal};

/// Interaction model of a registered stream.
///
/// Fire-and-forget and metadata push never register a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionModel {
    /// One request, at most one response value.
    RequestResponse,
    /// One request, many response values.
    RequestStream,
    /// Values in both directions.
    RequestChannel,
}
