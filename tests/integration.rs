//! Integration tests for rsocket-engine.
//!
//! A connection runs over `tokio::io::duplex` against a raw frame-level peer,
//! or against a second connection for requester/responder round trips.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, FutureExt, StreamExt};
use rsocket_engine::codec::MsgPackCodec;
use rsocket_engine::handler::{Flux, Mono, RSocket, Unit};
use rsocket_engine::protocol::{error_codes, flags, Frame, FrameBuffer, FrameType, MAX_REQUEST_N};
use rsocket_engine::{Connection, Mode, Payload, RSocketError};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

/// How long a peer waits before deciding nothing more is coming.
const QUIET: Duration = Duration::from_millis(300);

#[derive(Default)]
struct Service {
    fire_and_forget_calls: AtomicUsize,
    metadata_pushes: AtomicUsize,
}

impl RSocket for Service {
    fn request_response(&self, payload: Payload) -> Mono {
        async move {
            match payload.data_utf8() {
                Some("fail") => Err(RSocketError::application("boom")),
                Some("nothing") => Ok(None),
                _ => Ok(Some(payload)),
            }
        }
        .boxed()
    }

    fn fire_and_forget(&self, payload: Payload) -> Unit {
        self.fire_and_forget_calls.fetch_add(1, Ordering::SeqCst);
        async move {
            match payload.data_utf8() {
                Some("fail") => Err(RSocketError::application("ignored")),
                _ => Ok(()),
            }
        }
        .boxed()
    }

    fn request_stream(&self, payload: Payload) -> Flux {
        match payload.data_utf8() {
            Some("forever") => stream::iter(0u64..)
                .map(|i| Ok(Payload::from(i.to_string())))
                .boxed(),
            Some("fail") => stream::iter(vec![
                Ok(Payload::from("first")),
                Err(RSocketError::application("stream broke")),
            ])
            .boxed(),
            Some(count) => {
                let n: usize = count.parse().unwrap_or(0);
                stream::iter((0..n).map(|i| Ok(Payload::from(i.to_string())))).boxed()
            }
            None => stream::empty().boxed(),
        }
    }

    fn request_channel(&self, payloads: Flux) -> Flux {
        payloads
            .map(|item| {
                item.map(|p| Payload::from(format!("echo:{}", p.data_utf8().unwrap_or(""))))
            })
            .boxed()
    }

    fn metadata_push(&self, _payload: Payload) -> Unit {
        self.metadata_pushes.fetch_add(1, Ordering::SeqCst);
        async { Err(RSocketError::application("never reported")) }.boxed()
    }
}

/// Frame-level peer on the other end of the transport.
struct Peer {
    io: DuplexStream,
    buffer: FrameBuffer,
    queued: VecDeque<Frame>,
}

impl Peer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            buffer: FrameBuffer::new(),
            queued: VecDeque::new(),
        }
    }

    async fn send(&mut self, frame: Frame) {
        let bytes = frame.serialize().unwrap();
        self.io.write_all(&bytes).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    /// Next frame from the connection, or `None` after a quiet period.
    async fn next(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Some(frame);
            }
            let mut buf = [0u8; 8192];
            let n = timeout(QUIET, self.io.read(&mut buf)).await.ok()?.ok()?;
            if n == 0 {
                return None;
            }
            for raw in self.buffer.push(&buf[..n]) {
                self.queued
                    .push_back(Frame::parse(&raw).expect("connection wrote a malformed frame"));
            }
        }
    }

    /// Next frame, skipping REQUEST_N grants.
    async fn next_skipping_grants(&mut self) -> Option<Frame> {
        loop {
            let frame = self.next().await?;
            if frame.frame_type() != FrameType::RequestN {
                return Some(frame);
            }
        }
    }

    async fn assert_silent(&mut self) {
        if let Some(frame) = self.next().await {
            panic!("unexpected frame: {:?}", frame);
        }
    }
}

async fn serve(service: Arc<Service>) -> (Connection, Peer) {
    let (local, remote) = duplex(256 * 1024);
    let connection = Connection::builder()
        .mode(Mode::Server)
        .responder(service)
        .start(local)
        .await
        .unwrap();
    (connection, Peer::new(remote))
}

async fn connected_pair(client_window: u32) -> (Connection, Connection, Arc<Service>) {
    let service = Arc::new(Service::default());
    let (a, b) = duplex(256 * 1024);
    let server = Connection::builder()
        .mode(Mode::Server)
        .responder(service.clone())
        .start(b)
        .await
        .unwrap();
    let client = Connection::builder()
        .mode(Mode::Client)
        .request_window(client_window)
        .start(a)
        .await
        .unwrap();
    (client, server, service)
}

/// Test full frame encode/decode cycle with MsgPack payload.
#[test]
fn test_frame_with_msgpack_payload() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Quote {
        symbol: String,
        price: f64,
    }

    let quote = Quote {
        symbol: "RSKT".to_string(),
        price: 42.5,
    };
    let data = MsgPackCodec::encode(&quote).unwrap();
    let frame = Frame::next(
        7,
        Payload::from(data).with_metadata(Bytes::from_static(b"quotes")),
        false,
    );

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&frame.serialize().unwrap());
    assert_eq!(frames.len(), 1);

    let parsed = Frame::parse(&frames[0]).unwrap();
    assert_eq!(parsed, frame);
    assert!(parsed.has_flag(flags::METADATA));

    let payload = parsed.into_payload();
    let decoded: Quote = payload.decode_msgpack().unwrap();
    assert_eq!(decoded, quote);
    assert_eq!(payload.metadata().map(|m| &m[..]), Some(&b"quotes"[..]));
}

/// Test reassembly of many frames split at every possible boundary.
#[test]
fn test_fragmented_frames_in_order() {
    let frames = vec![
        Frame::request_stream(1, 3, Payload::from("go")),
        Frame::cancel(3),
        Frame::next(5, Payload::from("value").with_metadata("m"), true),
        Frame::keepalive(9, true, None),
        Frame::error(7, error_codes::APPLICATION_ERROR, "boom"),
    ];
    let mut wire = Vec::new();
    for frame in &frames {
        wire.extend_from_slice(&frame.serialize().unwrap());
    }

    for chunk_size in 1..=wire.len() {
        let mut buffer = FrameBuffer::new();
        let parsed: Vec<Frame> = wire
            .chunks(chunk_size)
            .flat_map(|chunk| buffer.push(chunk))
            .map(|raw| Frame::parse(&raw).unwrap())
            .collect();
        assert_eq!(parsed, frames, "chunk size {}", chunk_size);
        assert!(buffer.is_empty());
    }
}

#[tokio::test]
async fn test_request_response_value() {
    let (_connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_response(1, Payload::from("X"))).await;

    let reply = peer.next().await.unwrap();
    assert_eq!(reply.frame_type(), FrameType::Payload);
    assert_eq!(reply.stream_id(), 1);
    assert!(reply.is_next());
    assert!(reply.is_complete());
    assert_eq!(reply.data.as_deref(), Some(&b"X"[..]));
    peer.assert_silent().await;
}

#[tokio::test]
async fn test_request_response_error() {
    let (_connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_response(1, Payload::from("fail"))).await;

    let reply = peer.next().await.unwrap();
    assert_eq!(reply.frame_type(), FrameType::Error);
    assert_eq!(reply.stream_id(), 1);
    assert_eq!(reply.error_code(), Some(error_codes::APPLICATION_ERROR));
    assert_eq!(reply.error_message(), "boom");
    peer.assert_silent().await;
}

#[tokio::test]
async fn test_request_response_empty_completion() {
    let (_connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_response(1, Payload::from("nothing")))
        .await;

    assert_eq!(peer.next().await.unwrap(), Frame::complete(1));
    peer.assert_silent().await;
}

#[tokio::test]
async fn test_stream_respects_demand() {
    let (connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_stream(1, 0, Payload::from("5"))).await;
    peer.assert_silent().await;
    assert_eq!(connection.active_streams(), 1);

    peer.send(Frame::request_n(1, 3)).await;
    for expected in ["0", "1", "2"] {
        let frame = peer.next().await.unwrap();
        assert_eq!(frame.stream_id(), 1);
        assert!(frame.is_next());
        assert!(!frame.is_complete());
        assert_eq!(frame.data.as_deref(), Some(expected.as_bytes()));
    }
    peer.assert_silent().await;

    peer.send(Frame::request_n(1, 10)).await;
    assert_eq!(peer.next().await.unwrap().data.as_deref(), Some(&b"3"[..]));
    assert_eq!(peer.next().await.unwrap().data.as_deref(), Some(&b"4"[..]));

    let completion = peer.next().await.unwrap();
    assert_eq!(completion, Frame::complete(1));
    assert!(completion.data.is_none());

    peer.send(Frame::request_n(1, 10)).await;
    peer.assert_silent().await;
    assert_eq!(connection.active_streams(), 0);
}

#[tokio::test]
async fn test_stream_error_ends_stream() {
    let (_connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_stream(1, 10, Payload::from("fail"))).await;

    assert_eq!(peer.next().await.unwrap().data.as_deref(), Some(&b"first"[..]));
    let error = peer.next().await.unwrap();
    assert_eq!(error.frame_type(), FrameType::Error);
    assert_eq!(error.error_message(), "stream broke");
    peer.assert_silent().await;
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let (connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_stream(1, 2, Payload::from("forever")))
        .await;
    assert!(peer.next().await.unwrap().is_next());
    assert!(peer.next().await.unwrap().is_next());

    peer.send(Frame::cancel(1)).await;
    peer.send(Frame::cancel(1)).await;
    peer.send(Frame::request_n(1, 5)).await;
    peer.assert_silent().await;
    assert_eq!(connection.active_streams(), 0);

    // CANCEL after a terminal state
    peer.send(Frame::request_response(3, Payload::from("X"))).await;
    assert!(peer.next().await.unwrap().is_complete());
    peer.send(Frame::cancel(3)).await;
    peer.assert_silent().await;

    // The connection still serves requests
    peer.send(Frame::request_response(5, Payload::from("Y"))).await;
    assert_eq!(
        peer.next().await.unwrap(),
        Frame::next(5, Payload::from("Y"), true)
    );
}

#[tokio::test]
async fn test_keepalive_echo() {
    let (_connection, mut peer) = serve(Arc::new(Service::default())).await;

    let ping = Frame::keepalive(1234, true, Some(Bytes::from_static(b"still there?")));
    peer.send(ping.clone()).await;

    let reply = peer.next().await.unwrap();
    assert_eq!(reply, ping.without_flag(flags::RESPOND));
    assert_eq!(reply.data, ping.data);

    peer.send(Frame::keepalive(1235, false, None)).await;
    peer.assert_silent().await;
}

#[tokio::test]
async fn test_fire_and_forget_and_metadata_push_are_silent() {
    let service = Arc::new(Service::default());
    let (_connection, mut peer) = serve(service.clone()).await;

    peer.send(Frame::request_fnf(1, Payload::from("ok"))).await;
    peer.send(Frame::request_fnf(3, Payload::from("fail"))).await;
    peer.send(Frame::metadata_push(Bytes::from_static(b"tenant=a")))
        .await;

    peer.assert_silent().await;
    assert_eq!(service.fire_and_forget_calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.metadata_pushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_and_malformed_frames_ignored() {
    let (_connection, mut peer) = serve(Arc::new(Service::default())).await;

    // Type 0x30 is not assigned
    peer.send_raw(&[0, 0, 8, 0, 0, 0, 1, 0x30 << 2, 0, 1, 2]).await;
    // Too short to hold a header
    peer.send_raw(&[0, 0, 3, 0, 0, 0]).await;
    // REQUEST_N without its count
    peer.send_raw(&[0, 0, 6, 0, 0, 0, 1, 0x08 << 2, 0]).await;
    // Unknown stream
    peer.send(Frame::request_n(99, 1)).await;
    peer.send(Frame::next(99, Payload::from("stray"), true)).await;
    peer.assert_silent().await;

    peer.send(Frame::request_response(1, Payload::from("ok"))).await;
    assert_eq!(
        peer.next().await.unwrap(),
        Frame::next(1, Payload::from("ok"), true)
    );
}

#[tokio::test]
async fn test_channel_from_raw_peer() {
    let (connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_channel(1, 8, Payload::from("a"), false))
        .await;
    peer.send(Frame::next(1, Payload::from("b"), false)).await;

    let first = peer.next_skipping_grants().await.unwrap();
    assert_eq!(first.data.as_deref(), Some(&b"echo:a"[..]));
    let second = peer.next_skipping_grants().await.unwrap();
    assert_eq!(second.data.as_deref(), Some(&b"echo:b"[..]));

    // Inbound completes, so does the echo
    peer.send(Frame::complete(1)).await;
    assert_eq!(peer.next_skipping_grants().await.unwrap(), Frame::complete(1));
    peer.assert_silent().await;
    assert_eq!(connection.active_streams(), 0);
}

#[tokio::test]
async fn test_channel_grants_inbound_demand() {
    let (_connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_channel(1, 0, Payload::from("a"), false))
        .await;

    // No outbound demand yet, so the echo waits
    peer.assert_silent().await;
    peer.send(Frame::request_n(1, 1)).await;
    assert_eq!(
        peer.next().await.unwrap().data.as_deref(),
        Some(&b"echo:a"[..])
    );

    // Inbound buffer drained: the responder grants a full window
    let grant = peer.next().await.unwrap();
    assert_eq!(grant.frame_type(), FrameType::RequestN);
    assert_eq!(grant.stream_id(), 1);
    assert_eq!(grant.request_n_value(), Some(256));
}

#[tokio::test]
async fn test_channel_cancel_from_requester() {
    let (connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_channel(1, 4, Payload::from("a"), false))
        .await;
    assert!(peer.next_skipping_grants().await.unwrap().is_next());

    peer.send(Frame::cancel(1)).await;
    peer.send(Frame::next(1, Payload::from("late"), false)).await;
    while let Some(frame) = peer.next().await {
        assert_eq!(frame.frame_type(), FrameType::RequestN);
    }
    assert_eq!(connection.active_streams(), 0);
}

#[tokio::test]
async fn test_slow_reader_receives_whole_stream() {
    let (local, remote) = duplex(256);
    let _connection = Connection::builder()
        .mode(Mode::Server)
        .responder(Arc::new(Service::default()))
        .max_pending_frames(4)
        .backpressure_timeout(Duration::from_millis(50))
        .start(local)
        .await
        .unwrap();
    let mut peer = Peer::new(remote);

    peer.send(Frame::request_stream(1, MAX_REQUEST_N, Payload::from("2000")))
        .await;
    // Stop reading for far longer than the writer's backpressure timeout
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut values = 0;
    let mut terminals = Vec::new();
    while let Some(frame) = peer.next().await {
        if frame.is_next() {
            assert_eq!(frame.data.as_deref(), Some(values.to_string().as_bytes()));
            values += 1;
        }
        if frame.is_complete() || frame.frame_type() == FrameType::Error {
            terminals.push(frame);
        }
    }

    assert_eq!(values, 2000);
    assert_eq!(terminals, vec![Frame::complete(1)]);
}

#[tokio::test]
async fn test_empty_requester_channel_sends_no_values() {
    let (client, server, _service) = connected_pair(4).await;

    let echoed: Vec<Payload> = client
        .requester()
        .request_channel(stream::empty().boxed())
        .map(|item| item.unwrap())
        .collect()
        .await;

    // The echo responder would answer "echo:" for any value it received
    assert!(echoed.is_empty());
    assert_eq!(client.active_streams(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.active_streams(), 0);
}

#[tokio::test]
async fn test_zero_request_window_still_streams() {
    let (client, _server, _service) = connected_pair(0).await;

    let values: Vec<String> = client
        .requester()
        .request_stream(Payload::from("5"))
        .map(|item| item.unwrap().data_utf8().unwrap().to_string())
        .collect()
        .await;
    assert_eq!(values, vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn test_requests_between_connections() {
    let (client, _server, service) = connected_pair(4).await;
    let requester = client.requester();

    let value = requester
        .request_response(Payload::from("hello"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value.data_utf8(), Some("hello"));

    let err = requester
        .request_response(Payload::from("fail"))
        .await
        .unwrap_err();
    match err {
        RSocketError::Remote { code, message } => {
            assert_eq!(code, error_codes::APPLICATION_ERROR);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert!(requester
        .request_response(Payload::from("nothing"))
        .await
        .unwrap()
        .is_none());

    // Window of 4 forces several REQUEST_N round trips
    let values: Vec<String> = requester
        .request_stream(Payload::from("20"))
        .map(|item| item.unwrap().data_utf8().unwrap().to_string())
        .collect()
        .await;
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(values, expected);

    let outbound = stream::iter(["x", "y", "z"].map(|s| Ok(Payload::from(s)))).boxed();
    let echoed: Vec<String> = requester
        .request_channel(outbound)
        .map(|item| item.unwrap().data_utf8().unwrap().to_string())
        .collect()
        .await;
    assert_eq!(echoed, vec!["echo:x", "echo:y", "echo:z"]);

    requester
        .fire_and_forget(Payload::from("ok"))
        .await
        .unwrap();
    requester
        .metadata_push(Payload::from_metadata("tenant=a"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.fire_and_forget_calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.metadata_pushes.load(Ordering::SeqCst), 1);
    assert_eq!(client.active_streams(), 0);
}

#[tokio::test]
async fn test_dropping_requester_stream_cancels() {
    let (client, server, _service) = connected_pair(2).await;

    let mut values = client.requester().request_stream(Payload::from("forever"));
    assert_eq!(values.next().await.unwrap().unwrap().data_utf8(), Some("0"));
    assert_eq!(server.active_streams(), 1);
    drop(values);

    timeout(Duration::from_secs(1), async {
        while server.active_streams() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server stream was not cancelled");
    assert_eq!(client.active_streams(), 0);
}

#[tokio::test]
async fn test_forwarding_through_requester() {
    // front <-> proxy serves requests by forwarding them to backend
    let backend_service = Arc::new(Service::default());
    let (p, b) = duplex(64 * 1024);
    let _backend = Connection::builder()
        .responder(backend_service)
        .start(b)
        .await
        .unwrap();
    let upstream = Connection::builder()
        .mode(Mode::Client)
        .start(p)
        .await
        .unwrap();

    let (f, x) = duplex(64 * 1024);
    let _proxy = Connection::builder()
        .responder(upstream.requester())
        .start(x)
        .await
        .unwrap();
    let front = Connection::builder()
        .mode(Mode::Client)
        .start(f)
        .await
        .unwrap();

    let value = front
        .requester()
        .request_response(Payload::from("via proxy"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value.data_utf8(), Some("via proxy"));

    let count = front
        .requester()
        .request_stream(Payload::from("3"))
        .count()
        .await;
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_transport_close_terminates_streams() {
    let (local, remote) = duplex(64 * 1024);
    let connection = Connection::builder()
        .mode(Mode::Server)
        .start(local)
        .await
        .unwrap();
    let mut peer = Peer::new(remote);

    let pending = tokio::spawn(connection.requester().request_response(Payload::from("?")));
    let request = peer.next().await.unwrap();
    assert_eq!(request.frame_type(), FrameType::RequestResponse);
    assert_eq!(request.stream_id(), 2);

    drop(peer);

    let result = timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(RSocketError::ConnectionClosed)));

    timeout(Duration::from_secs(1), connection.wait_for_shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_connection_error_keeps_streams() {
    let (connection, mut peer) = serve(Arc::new(Service::default())).await;

    peer.send(Frame::request_stream(1, 0, Payload::from("forever")))
        .await;
    peer.send(Frame::error(0, error_codes::CONNECTION_ERROR, "meh"))
        .await;
    peer.assert_silent().await;
    assert_eq!(connection.active_streams(), 1);

    // Stream-level ERROR from the requester ends its stream
    peer.send(Frame::error(1, error_codes::APPLICATION_ERROR, "stop"))
        .await;
    peer.send(Frame::request_n(1, 5)).await;
    peer.assert_silent().await;
    assert_eq!(connection.active_streams(), 0);
}
