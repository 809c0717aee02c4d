//! TCP transport.
//!
//! # Example
//!
//! ```no_run
//! use rsocket_engine::transport::TcpAcceptor;
//!
//! # async fn run() -> rsocket_engine::Result<()> {
//! let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
//! println!("listening on {}", acceptor.local_addr()?);
//! let (stream, peer) = acceptor.accept().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::error::Result;

/// Connect to a server.
///
/// Nagle's algorithm is disabled: frames are already batched by the writer.
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!(peer = ?stream.peer_addr().ok(), "Connected");
    Ok(stream)
}

/// TCP listener handing out connected streams.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to an address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%peer, "Accepted connection");
        Ok((stream, peer))
    }
}
