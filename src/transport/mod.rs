//! Transport module - byte-stream connections the engine runs over.
//!
//! The engine only needs `AsyncRead + AsyncWrite`. TCP helpers live here;
//! anything else (e.g. `tokio::io::duplex` in tests) can be passed to
//! [`ConnectionBuilder::start`](crate::ConnectionBuilder::start) directly.

mod tcp;

pub use tcp::{connect, TcpAcceptor};
