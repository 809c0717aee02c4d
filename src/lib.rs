//! # rsocket-engine
//!
//! Connection-level engine for the RSocket protocol over byte-stream
//! transports.
//!
//! The engine turns an arbitrarily chunked byte stream into frames, routes
//! each frame to the right interaction model, and turns the values produced
//! by application handlers back into frames on the same multiplexed
//! connection, honoring REQUEST_N demand and CANCEL.
//!
//! ## Architecture
//!
//! - **Protocol**: wire layout, frame codec and the length-prefix reassembler
//! - **Streams**: registry of active stream ids with per-stream demand
//! - **Handler**: the [`RSocket`] capability and the responder adapter
//! - **Requester**: the same capability, implemented by sending requests
//! - **Connection**: dispatcher, SETUP/keepalive handling and shutdown
//!
//! ## Example
//!
//! ```no_run
//! use futures::{stream, FutureExt, StreamExt};
//! use rsocket_engine::handler::{Flux, Mono, RSocket};
//! use rsocket_engine::transport::TcpAcceptor;
//! use rsocket_engine::{Connection, Payload};
//!
//! struct Service;
//!
//! impl RSocket for Service {
//!     fn request_response(&self, payload: Payload) -> Mono {
//!         async move { Ok(Some(payload)) }.boxed()
//!     }
//!
//!     fn request_stream(&self, _payload: Payload) -> Flux {
//!         stream::iter((0..10).map(|i| Ok(Payload::from(i.to_string())))).boxed()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> rsocket_engine::Result<()> {
//!     let acceptor = TcpAcceptor::bind("127.0.0.1:7878").await?;
//!     loop {
//!         let (stream, _) = acceptor.accept().await?;
//!         let connection = Connection::builder().responder(Service).start(stream).await?;
//!         tokio::spawn(connection.wait_for_shutdown());
//!     }
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod keepalive;
pub mod payload;
pub mod protocol;
pub mod requester;
pub mod stream;
pub mod transport;
pub mod writer;

pub use connection::{
    Connection, ConnectionBuilder, ConnectionConfig, DefaultLifecycle, Lifecycle, Mode,
};
pub use error::{RSocketError, Result};
pub use handler::{RSocket, StreamContext};
pub use payload::Payload;
pub use requester::Requester;
