//! Echo server.
//!
//! Serves request-response by echoing, request-stream by counting up to the
//! number in the request data, and request-channel by echoing every value.
//!
//! ```text
//! RUST_LOG=rsocket_engine=debug cargo run --example echo_server -- 127.0.0.1:7878
//! ```

use std::time::Duration;

use futures::{stream, FutureExt, StreamExt};
use rsocket_engine::handler::{Flux, Mono, RSocket, Unit};
use rsocket_engine::transport::TcpAcceptor;
use rsocket_engine::{Connection, Payload, RSocketError};
use tracing::info;

struct Echo;

impl RSocket for Echo {
    fn request_response(&self, payload: Payload) -> Mono {
        async move { Ok(Some(payload)) }.boxed()
    }

    fn fire_and_forget(&self, payload: Payload) -> Unit {
        info!(data = ?payload.data_utf8(), "Fire-and-forget");
        async { Ok(()) }.boxed()
    }

    fn request_stream(&self, payload: Payload) -> Flux {
        let count: u64 = match payload.data_utf8().map(str::parse) {
            Some(Ok(n)) => n,
            _ => {
                let err = RSocketError::application("expected a number");
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        stream::iter(0..count)
            .then(|i| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Payload::from(i.to_string()))
            })
            .boxed()
    }

    fn request_channel(&self, payloads: Flux) -> Flux {
        payloads
            .map(|item| item.map(|p| Payload::new(p.data().cloned(), None)))
            .boxed()
    }

    fn metadata_push(&self, payload: Payload) -> Unit {
        info!(metadata = ?payload.metadata(), "Metadata push");
        async { Ok(()) }.boxed()
    }
}

#[tokio::main]
async fn main() -> rsocket_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let acceptor = TcpAcceptor::bind(&addr).await?;
    info!(addr = %acceptor.local_addr()?, "Listening");

    loop {
        let (stream, peer) = acceptor.accept().await?;
        let connection = Connection::builder().responder(Echo).start(stream).await?;

        tokio::spawn(async move {
            let _ = connection.wait_for_shutdown().await;
            info!(%peer, "Connection closed");
        });
    }
}
