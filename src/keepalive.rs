//! KEEPALIVE handling.
//!
//! Answering a peer keepalive is stateless: a frame carrying the RESPOND flag
//! is sent back unchanged apart from that flag. Origination is optional and
//! runs as a ticker task owned by the connection.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::protocol::{flags, Frame, FrameType};
use crate::writer::WriterHandle;

/// Reply to a KEEPALIVE frame, if one is requested.
///
/// Returns the same frame with RESPOND cleared, or `None` when the frame is
/// not a keepalive or does not ask for an answer.
pub fn respond(frame: &Frame) -> Option<Frame> {
    if frame.frame_type() != FrameType::Keepalive || !frame.is_respond() {
        return None;
    }
    Some(frame.without_flag(flags::RESPOND))
}

/// Send a KEEPALIVE with RESPOND every `interval` until the writer closes.
pub(crate) fn spawn_keepalive(writer: WriterHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            trace!("Sending keepalive");
            if let Err(e) = writer.send_frame(&Frame::keepalive(0, true, None)).await {
                debug!("Keepalive stopped: {}", e);
                break;
            }
        }
    })
}
