//! Dedicated writer task for outgoing frames.
//!
//! Every producer on a connection (responder tasks, the requester, the
//! dispatcher's own replies) shares one transport write half. Instead of a
//! mutex around the writer, frames go through an mpsc channel to a single task
//! that batches whatever is queued into one vectored write.
//!
//! ```text
//! Stream 1 ──┐
//! Stream 3 ──┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► transport
//! Dispatch ──┘
//! ```
//!
//! Frames sent through one handle arrive on the wire in send order, which is
//! what keeps PAYLOAD frames of a single stream in emission order.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{RSocketError, Result};
use crate::protocol::Frame;

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded frame ready to be written to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Length prefix, header, fixed fields and metadata.
    pub head: Bytes,
    /// Data block (may be empty).
    pub data: Bytes,
}

impl OutboundFrame {
    /// Encode a frame.
    #[inline]
    pub fn encode(frame: &Frame) -> Result<Self> {
        let (head, data) = frame.encode_parts()?;
        Ok(Self { head, data })
    }

    /// Total size on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.head.len() + self.data.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone; every stream task holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Encode and send a frame, waiting while backpressure is active.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        trace!(
            stream_id = frame.stream_id(),
            frame_type = ?frame.frame_type(),
            "Sending frame"
        );
        self.send(OutboundFrame::encode(frame)?).await
    }

    /// Encode and send a frame, waiting for queue room without a deadline.
    ///
    /// Stream data goes through here: a slow reader only delays it. Fails
    /// only once the writer task is gone.
    pub async fn send_frame_when_ready(&self, frame: &Frame) -> Result<()> {
        self.send_when_ready(OutboundFrame::encode(frame)?).await
    }

    /// Send an encoded frame to the writer task.
    ///
    /// Waits if backpressure is active, timing out after the configured duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.wait_for_backpressure(Some(self.timeout)).await?;
        self.enqueue(frame).await
    }

    /// Send an encoded frame, waiting as long as backpressure lasts.
    pub async fn send_when_ready(&self, frame: OutboundFrame) -> Result<()> {
        self.wait_for_backpressure(None).await?;
        self.enqueue(frame).await
    }

    async fn enqueue(&self, frame: OutboundFrame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RSocketError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self, deadline: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if self.tx.is_closed() {
                return Err(RSocketError::ConnectionClosed);
            }

            if deadline.is_some_and(|timeout| start.elapsed() > timeout) {
                return Err(RSocketError::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Try to send a frame without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(RSocketError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => RSocketError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => RSocketError::ConnectionClosed,
            }
        })
    }

    /// Send a control frame from a synchronous context (e.g. `Drop`).
    ///
    /// Tries an immediate send; if the queue is full, hands the frame to a
    /// background task on the current runtime. Failures are logged and dropped.
    pub fn send_detached(&self, frame: &Frame) {
        let outbound = match OutboundFrame::encode(frame) {
            Ok(outbound) => outbound,
            Err(e) => {
                debug!("Dropping unencodable control frame: {}", e);
                return;
            }
        };

        match self.try_send(outbound.clone()) {
            Ok(()) => {}
            Err(RSocketError::ConnectionClosed) => {
                trace!(stream_id = frame.stream_id(), "Writer closed, control frame dropped");
            }
            Err(_) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let handle = self.clone();
                    runtime.spawn(async move {
                        if let Err(e) = handle.send(outbound).await {
                            debug!("Deferred control frame not sent: {}", e);
                        }
                    });
                }
                Err(_) => debug!("No runtime available, control frame dropped"),
            },
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check if the writer task has gone away.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The returned `JoinHandle` resolves when every handle is dropped (clean
/// shutdown) or when a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames with `write_vectored`, continuing after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RSocketError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice list for whatever is left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.head, &frame.data] {
            if part.is_empty() {
                continue;
            }
            let end = offset + part.len();
            if skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
