//! Handler module - the responder capability and how requests reach it.
//!
//! Provides:
//! - [`RSocket`] - the five interaction models as one trait; implemented by
//!   local services and by the remote [`Requester`](crate::Requester) proxy
//! - [`StreamContext`] - emits the frames of one outbound stream
//! - the responder adapter that drives a handler's producer onto the wire
//!
//! # Example
//!
//! ```
//! use futures::{stream, FutureExt, StreamExt};
//! use rsocket_engine::handler::{Flux, Mono, RSocket};
//! use rsocket_engine::Payload;
//!
//! struct Echo;
//!
//! impl RSocket for Echo {
//!     fn request_response(&self, payload: Payload) -> Mono {
//!         async move { Ok(Some(payload)) }.boxed()
//!     }
//!
//!     fn request_stream(&self, payload: Payload) -> Flux {
//!         stream::iter(vec![Ok(payload.clone()), Ok(payload)]).boxed()
//!     }
//! }
//! ```

mod adapter;
mod context;

pub(crate) use adapter::{drive_outbound, Responder};
pub use context::StreamContext;

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{stream, FutureExt, StreamExt};

use crate::error::{RSocketError, Result};
use crate::payload::Payload;

/// Producer of at most one value: `Ok(None)` completes without a value.
pub type Mono = BoxFuture<'static, Result<Option<Payload>>>;

/// Producer of zero or more values, ending with completion (`None`) or an error.
pub type Flux = BoxStream<'static, Result<Payload>>;

/// Producer with no value, used for fire-and-forget and metadata push.
pub type Unit = BoxFuture<'static, Result<()>>;

/// The five interaction models.
///
/// Every method has a default that fails with [`RSocketError::Unsupported`],
/// so a service implements only what it serves.
pub trait RSocket: Send + Sync + 'static {
    /// Single request, at most one response value.
    fn request_response(&self, payload: Payload) -> Mono {
        let _ = payload;
        async { Err(RSocketError::Unsupported("request_response")) }.boxed()
    }

    /// Request with no response. Errors are never reported to the peer.
    fn fire_and_forget(&self, payload: Payload) -> Unit {
        let _ = payload;
        async { Err(RSocketError::Unsupported("fire_and_forget")) }.boxed()
    }

    /// Single request, stream of response values.
    fn request_stream(&self, payload: Payload) -> Flux {
        let _ = payload;
        unsupported_flux("request_stream")
    }

    /// Stream of request values, stream of response values.
    fn request_channel(&self, payloads: Flux) -> Flux {
        drop(payloads);
        unsupported_flux("request_channel")
    }

    /// Connection-level metadata. Errors are never reported to the peer.
    fn metadata_push(&self, payload: Payload) -> Unit {
        let _ = payload;
        async { Err(RSocketError::Unsupported("metadata_push")) }.boxed()
    }
}

fn unsupported_flux(operation: &'static str) -> Flux {
    stream::once(async move { Err(RSocketError::Unsupported(operation)) }).boxed()
}

impl<T: RSocket + ?Sized> RSocket for Arc<T> {
    fn request_response(&self, payload: Payload) -> Mono {
        (**self).request_response(payload)
    }

    fn fire_and_forget(&self, payload: Payload) -> Unit {
        (**self).fire_and_forget(payload)
    }

    fn request_stream(&self, payload: Payload) -> Flux {
        (**self).request_stream(payload)
    }

    fn request_channel(&self, payloads: Flux) -> Flux {
        (**self).request_channel(payloads)
    }

    fn metadata_push(&self, payload: Payload) -> Unit {
        (**self).metadata_push(payload)
    }
}

/// Responder that implements nothing; every request fails as unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyResponder;

impl RSocket for EmptyResponder {}
