//! Connection builder, frame dispatcher and lifecycle.
//!
//! The [`ConnectionBuilder`] provides a fluent API for configuring the
//! responder and the connection's tuning knobs. The [`Connection`] manages
//! the lifecycle:
//! 1. Spawn the writer task
//! 2. Send SETUP (client mode only)
//! 3. Read bytes, reassemble frames and dispatch them
//! 4. On transport close, terminate every open stream
//!
//! # Example
//!
//! ```no_run
//! use futures::FutureExt;
//! use rsocket_engine::handler::{Mono, RSocket};
//! use rsocket_engine::{Connection, Mode, Payload};
//!
//! struct Echo;
//!
//! impl RSocket for Echo {
//!     fn request_response(&self, payload: Payload) -> Mono {
//!         async move { Ok(Some(payload)) }.boxed()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> rsocket_engine::Result<()> {
//!     let stream = rsocket_engine::transport::connect("127.0.0.1:7878").await?;
//!     let connection = Connection::builder()
//!         .mode(Mode::Client)
//!         .responder(Echo)
//!         .start(stream)
//!         .await?;
//!
//!     connection.wait_for_shutdown().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{RSocketError, Result};
use crate::handler::{EmptyResponder, RSocket, Responder};
use crate::keepalive;
use crate::payload::Payload;
use crate::protocol::{
    error_codes, Frame, FrameBuffer, FrameType, Setup, CONNECTION_STREAM_ID, MAX_FRAME_LENGTH,
};
use crate::requester::Requester;
use crate::stream::StreamRegistry;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default maximum concurrent responder tasks.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default demand window granted to the peer for inbound streams.
pub const DEFAULT_REQUEST_WINDOW: u32 = 256;

/// Read buffer size for the transport read loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long shutdown waits for queued frames to reach the transport.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Which end of the transport this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Connecting side: sends SETUP, allocates odd stream ids.
    Client,
    /// Accepting side: receives SETUP, allocates even stream ids.
    Server,
}

impl Mode {
    /// First locally-initiated stream id for this side.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Mode::Client => 1,
            Mode::Server => 2,
        }
    }
}

/// Connection-level hooks.
///
/// Both methods have defaults: every SETUP is accepted and connection errors
/// are logged.
pub trait Lifecycle: Send + Sync + 'static {
    /// Inspect the peer's SETUP. Returning an error rejects it with
    /// `REJECTED_SETUP` on stream 0.
    fn on_setup(&self, setup: &Setup, payload: &Payload) -> Result<()> {
        let _ = payload;
        debug!(
            version = %format_args!("{}.{}", setup.major_version, setup.minor_version),
            data_mime_type = %setup.data_mime_type,
            "Accepted SETUP"
        );
        Ok(())
    }

    /// An ERROR frame on stream 0, or for a stream that is not active.
    fn on_connection_error(&self, code: u32, message: &str) {
        warn!(code, "Connection error from peer: {}", message);
    }
}

/// Lifecycle that accepts every SETUP and logs errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLifecycle;

impl Lifecycle for DefaultLifecycle {}

/// Tuning for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Client or server end.
    pub mode: Mode,
    /// Writer task settings.
    pub writer: WriterConfig,
    /// Frames declaring a larger length are skipped.
    pub max_frame_length: u32,
    /// Demand window granted to the peer on inbound streams. At least 1 is used.
    pub request_window: u32,
    /// Responder tasks allowed in flight at once.
    pub max_concurrent_handlers: usize,
    /// Originate KEEPALIVE frames at this interval. `None` disables it.
    pub keepalive_interval: Option<Duration>,
    /// SETUP sent by a client.
    pub setup: Setup,
    /// Data and metadata sent with SETUP.
    pub setup_payload: Payload,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Server,
            writer: WriterConfig::default(),
            max_frame_length: MAX_FRAME_LENGTH,
            request_window: DEFAULT_REQUEST_WINDOW,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            keepalive_interval: None,
            setup: Setup::default(),
            setup_payload: Payload::empty(),
        }
    }
}

/// Builder for configuring and starting a [`Connection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    responder: Arc<dyn RSocket>,
    lifecycle: Arc<dyn Lifecycle>,
}

impl ConnectionBuilder {
    /// Create a builder with default configuration (server mode, no responder).
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            responder: Arc::new(EmptyResponder),
            lifecycle: Arc::new(DefaultLifecycle),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set client or server mode.
    ///
    /// Default: server
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the handler serving the peer's requests.
    ///
    /// This may be a local service or a [`Requester`] of another connection.
    pub fn responder<R: RSocket>(mut self, responder: R) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    /// Set the connection lifecycle hooks.
    pub fn lifecycle<L: Lifecycle>(mut self, lifecycle: L) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    /// Set the SETUP parameters a client sends.
    pub fn setup(mut self, setup: Setup) -> Self {
        self.config.setup = setup;
        self
    }

    /// Set the payload a client sends with SETUP.
    pub fn setup_payload(mut self, payload: Payload) -> Self {
        self.config.setup_payload = payload;
        self
    }

    /// Originate a KEEPALIVE every `interval`.
    ///
    /// Default: disabled
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = Some(interval);
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Skip inbound frames longer than `limit` bytes.
    ///
    /// Default: 16,777,215
    pub fn max_frame_length(mut self, limit: u32) -> Self {
        self.config.max_frame_length = limit;
        self
    }

    /// Set the demand window granted to the peer on inbound streams.
    ///
    /// A window of 0 would never ask for a value, so it is raised to 1.
    ///
    /// Default: 256
    pub fn request_window(mut self, window: u32) -> Self {
        self.config.request_window = window.max(1);
        self
    }

    /// Set the maximum number of concurrent responder tasks.
    ///
    /// When this limit is reached, new requests are rejected.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Start the connection over a bidirectional byte stream.
    ///
    /// The connection reads from `io` on its own task until the peer closes.
    pub async fn start<T>(self, io: T) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let connection = self.start_with_writer(writer).await?;

        let shared = connection.shared.clone();
        let closing = connection.shared.closing.subscribe();
        tokio::spawn(read_loop(reader, shared, closing));

        Ok(connection)
    }

    /// Start the connection with only an outbound byte sink.
    ///
    /// Inbound bytes must then be fed through [`Connection::receive`].
    pub async fn start_with_writer<W>(self, writer: W) -> Result<Connection>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ConnectionBuilder {
            config,
            responder,
            lifecycle,
        } = self;

        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());
        let registry = Arc::new(StreamRegistry::new(config.mode));
        let (closing, closing_rx) = watch::channel(false);
        let request_window = config.request_window.max(1);

        let shared = Arc::new(Shared {
            mode: config.mode,
            reassembler: Mutex::new(FrameBuffer::with_max_frame_length(config.max_frame_length)),
            responder: Responder::new(
                responder,
                writer.clone(),
                registry.clone(),
                request_window,
            ),
            lifecycle,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            registry: registry.clone(),
            writer: writer.clone(),
            closing,
        });
        let requester = Requester::new(writer.clone(), registry.clone(), request_window);

        if config.mode == Mode::Client {
            let frame = Frame::setup(config.setup.clone(), config.setup_payload.clone());
            writer.send_frame(&frame).await?;
        }

        let keepalive = config
            .keepalive_interval
            .map(|interval| keepalive::spawn_keepalive(writer.clone(), interval));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(supervise(
            closing_rx,
            writer.clone(),
            writer_task,
            keepalive,
            registry,
            shutdown_tx,
        ));

        debug!(mode = ?config.mode, "Connection started");

        Ok(Connection {
            shared,
            requester,
            shutdown_rx,
        })
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running connection.
///
/// Use [`requester`](Self::requester) to issue requests to the peer.
/// Use [`wait_for_shutdown`](Self::wait_for_shutdown) to block until the
/// transport closes.
pub struct Connection {
    shared: Arc<Shared>,
    requester: Requester,
    shutdown_rx: oneshot::Receiver<()>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Feed bytes received from the transport.
    ///
    /// Bytes may be split at any boundary. Complete frames are dispatched in
    /// order before this returns; calls must not overlap.
    pub async fn receive(&self, bytes: &[u8]) {
        self.shared.receive(bytes).await;
    }

    /// Send a frame as-is.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.shared.writer.send_frame(frame).await
    }

    /// Handle for issuing requests to the peer.
    pub fn requester(&self) -> Requester {
        self.requester.clone()
    }

    /// Client or server end.
    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// Number of streams currently active.
    pub fn active_streams(&self) -> usize {
        self.shared.registry.len()
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.shared.writer.is_backpressure_active()
    }

    /// Get the current pending frame count.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }

    /// Close the connection, terminating every open stream.
    pub fn close(&self) {
        self.shared.closing.send_replace(true);
    }

    /// Check whether the connection is closing or closed.
    pub fn is_closed(&self) -> bool {
        *self.shared.closing.borrow()
    }

    /// Wait for shutdown (transport closed or [`close`](Self::close) called).
    ///
    /// This consumes the connection and resolves once every stream has been
    /// terminated.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        let _ = self.shutdown_rx.await;
        Ok(())
    }
}

/// State shared by the connection handle and its read loop.
struct Shared {
    mode: Mode,
    reassembler: Mutex<FrameBuffer>,
    responder: Responder,
    lifecycle: Arc<dyn Lifecycle>,
    semaphore: Arc<Semaphore>,
    registry: Arc<StreamRegistry>,
    writer: WriterHandle,
    closing: watch::Sender<bool>,
}

impl Shared {
    async fn receive(&self, bytes: &[u8]) {
        let frames = self.reassembler.lock().push(bytes);
        for raw in frames {
            match Frame::parse(&raw) {
                Some(frame) => self.dispatch(frame).await,
                None => debug!(len = raw.len(), "Dropping malformed frame"),
            }
        }
    }

    /// Route one frame.
    async fn dispatch(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        trace!(stream_id, frame_type = ?frame.frame_type(), "Dispatching frame");

        match frame.frame_type() {
            FrameType::Setup => self.on_setup(&frame).await,
            FrameType::RequestResponse
            | FrameType::RequestFnf
            | FrameType::RequestStream
            | FrameType::RequestChannel
            | FrameType::MetadataPush => self.on_request(frame).await,
            FrameType::Payload => {
                let complete = frame.is_complete();
                let value = frame.is_next().then(|| frame.into_payload());
                if !self.registry.deliver(stream_id, value, complete) {
                    debug!(stream_id, "PAYLOAD for unknown stream");
                }
            }
            FrameType::Error => {
                let code = frame.error_code().unwrap_or(error_codes::CONNECTION_ERROR);
                if stream_id == CONNECTION_STREAM_ID
                    || !self.registry.error(stream_id, frame.to_remote_error())
                {
                    self.lifecycle
                        .on_connection_error(code, &frame.error_message());
                }
            }
            FrameType::Cancel => {
                debug!(stream_id, "Received CANCEL");
                self.registry.cancel(stream_id);
            }
            FrameType::RequestN => {
                let n = frame.request_n_value().unwrap_or(0);
                debug!(stream_id, n, "Received REQUEST_N");
                if !self.registry.add_demand(stream_id, n) {
                    trace!(stream_id, "REQUEST_N for a stream with no outbound side");
                }
            }
            FrameType::Keepalive => {
                if let Some(reply) = keepalive::respond(&frame) {
                    debug!("Answering keepalive");
                    self.send(&reply).await;
                }
            }
            other => debug!(stream_id, frame_type = ?other, "Ignoring frame"),
        }
    }

    async fn on_setup(&self, frame: &Frame) {
        let Some(setup) = frame.setup_fields() else {
            return;
        };
        if self.mode == Mode::Client {
            warn!("Ignoring SETUP received by a client");
            return;
        }
        if let Err(e) = self.lifecycle.on_setup(setup, &frame.payload()) {
            warn!("Rejecting SETUP: {}", e);
            let reply = Frame::error(
                CONNECTION_STREAM_ID,
                error_codes::REJECTED_SETUP,
                &e.to_string(),
            );
            self.send(&reply).await;
        }
    }

    async fn on_request(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let frame_type = frame.frame_type();

        if frame_type != FrameType::MetadataPush && stream_id == CONNECTION_STREAM_ID {
            warn!(frame_type = ?frame_type, "Ignoring request on stream 0");
            return;
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    stream_id,
                    frame_type = ?frame_type,
                    "Handler capacity reached, rejecting request"
                );
                if matches!(frame_type, FrameType::RequestFnf | FrameType::MetadataPush) {
                    return;
                }
                let reply = Frame::application_error(
                    stream_id,
                    &RSocketError::Rejected("responder at capacity".to_string()),
                );
                self.send(&reply).await;
                return;
            }
        };

        let initial_request_n = frame.request_n_value().unwrap_or(0);
        let complete = frame.is_complete();
        let payload = frame.into_payload();

        match frame_type {
            FrameType::RequestResponse => {
                self.responder.request_response(stream_id, payload, permit)
            }
            FrameType::RequestFnf => self.responder.fire_and_forget(payload, permit),
            FrameType::RequestStream => {
                self.responder
                    .request_stream(stream_id, initial_request_n, payload, permit)
            }
            FrameType::RequestChannel => self.responder.request_channel(
                stream_id,
                initial_request_n,
                payload,
                complete,
                permit,
            ),
            FrameType::MetadataPush => self.responder.metadata_push(payload, permit),
            _ => {}
        }
    }

    async fn send(&self, frame: &Frame) {
        if let Err(e) = self.writer.send_frame(frame).await {
            debug!(stream_id = frame.stream_id(), "Reply not sent: {}", e);
        }
    }
}

/// Read from the transport until EOF, an error or close.
async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, mut closing: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = closing.changed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Transport closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("Read loop error: {}", e);
                    break;
                }
            },
        };

        shared.receive(&buf[..n]).await;
    }

    shared.closing.send_replace(true);
}

/// Wait for close or writer failure, then tear every stream down.
async fn supervise(
    mut closing: watch::Receiver<bool>,
    writer: WriterHandle,
    mut writer_task: JoinHandle<Result<()>>,
    keepalive: Option<JoinHandle<()>>,
    registry: Arc<StreamRegistry>,
    shutdown_tx: oneshot::Sender<()>,
) {
    let writer_done = tokio::select! {
        _ = closing.changed() => false,
        result = &mut writer_task => {
            match result {
                Ok(Ok(())) => debug!("Writer task finished"),
                Ok(Err(e)) => error!("Writer task failed: {}", e),
                Err(e) => error!("Writer task panicked: {}", e),
            }
            true
        }
    };

    registry.close_all();
    if let Some(task) = keepalive {
        task.abort();
    }
    if !writer_done {
        let drained = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
            while writer.pending_count() > 0 && !writer.is_closed() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pending = writer.pending_count(), "Dropping unsent frames on close");
        }
        writer_task.abort();
    }

    debug!("Connection closed");
    let _ = shutdown_tx.send(());
}
