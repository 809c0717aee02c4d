//! Client for the echo server.
//!
//! Sends one request of each kind and prints what comes back.
//!
//! ```text
//! RUST_LOG=rsocket_engine=debug cargo run --example stream_client -- 127.0.0.1:7878 25
//! ```

use std::time::Duration;

use futures::{stream, StreamExt};
use rsocket_engine::handler::RSocket;
use rsocket_engine::protocol::Setup;
use rsocket_engine::{Connection, Mode, Payload};
use tracing::info;

#[tokio::main]
async fn main() -> rsocket_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let count = args.next().unwrap_or_else(|| "10".to_string());

    let stream = rsocket_engine::transport::connect(&addr).await?;
    let connection = Connection::builder()
        .mode(Mode::Client)
        .setup(Setup::default().with_data_mime_type("text/plain"))
        .keepalive_interval(Duration::from_secs(5))
        .request_window(8)
        .start(stream)
        .await?;
    let requester = connection.requester();

    let reply = requester.request_response(Payload::from("ping")).await?;
    info!(reply = ?reply.as_ref().and_then(Payload::data_utf8), "Request-response");

    let mut values = requester.request_stream(Payload::from(count));
    while let Some(item) = values.next().await {
        let payload = item?;
        info!(value = ?payload.data_utf8(), "Stream value");
    }

    let outbound = stream::iter(["a", "b", "c"].map(|s| Ok(Payload::from(s)))).boxed();
    let echoed: Vec<_> = requester.request_channel(outbound).collect().await;
    info!(count = echoed.len(), "Channel finished");

    requester
        .fire_and_forget(Payload::from("fire and forget"))
        .await?;
    requester
        .metadata_push(Payload::from_metadata("client=demo"))
        .await?;

    connection.close();
    connection.wait_for_shutdown().await
}
