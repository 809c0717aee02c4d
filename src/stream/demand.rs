//! Per-stream outstanding demand and terminal state.
//!
//! A [`StreamState`] is shared between the task producing values for one
//! stream and the dispatcher, which adds demand on REQUEST_N and cancels on
//! CANCEL. Both counters are atomics so neither side takes a lock:
//!
//! - demand is decremented once per emitted value and never below zero;
//!   `MAX_REQUEST_N` means unbounded and is never decremented
//! - the terminal state moves away from `Open` at most once; the caller whose
//!   compare-and-swap succeeds owns the terminal transition

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use tokio::sync::Notify;

use crate::protocol::MAX_REQUEST_N;

/// Lifecycle of one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Production in flight.
    Open,
    /// Completed normally.
    Complete,
    /// Cancelled by the peer or by shutdown.
    Cancelled,
    /// Terminated by an error.
    Errored,
}

impl StreamStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            OPEN => StreamStatus::Open,
            COMPLETE => StreamStatus::Complete,
            CANCELLED => StreamStatus::Cancelled,
            _ => StreamStatus::Errored,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StreamStatus::Open => OPEN,
            StreamStatus::Complete => COMPLETE,
            StreamStatus::Cancelled => CANCELLED,
            StreamStatus::Errored => ERRORED,
        }
    }

    /// Check if this is a terminal status.
    #[inline]
    pub fn is_terminal(self) -> bool {
        self != StreamStatus::Open
    }
}

const OPEN: u8 = 0;
const COMPLETE: u8 = 1;
const CANCELLED: u8 = 2;
const ERRORED: u8 = 3;

/// Demand counter and terminal flag for one outbound stream direction.
#[derive(Debug)]
pub struct StreamState {
    demand: AtomicU32,
    status: AtomicU8,
    demand_changed: Notify,
    terminated: Notify,
}

impl StreamState {
    /// Create an open stream with `initial_demand` credits.
    pub fn new(initial_demand: u32) -> Self {
        Self {
            demand: AtomicU32::new(initial_demand.min(MAX_REQUEST_N)),
            status: AtomicU8::new(OPEN),
            demand_changed: Notify::new(),
            terminated: Notify::new(),
        }
    }

    /// Current outstanding demand.
    #[inline]
    pub fn demand(&self) -> u32 {
        self.demand.load(Ordering::Acquire)
    }

    /// Check if demand is unbounded.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.demand() >= MAX_REQUEST_N
    }

    /// Add `n` credits (REQUEST_N). Saturates at unbounded.
    pub fn add_demand(&self, n: u32) {
        if n == 0 {
            return;
        }
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n).min(MAX_REQUEST_N))
            });
        self.demand_changed.notify_one();
    }

    /// Take one credit if any is available.
    pub fn try_take_demand(&self) -> bool {
        self.demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current >= MAX_REQUEST_N {
                    Some(current)
                } else {
                    current.checked_sub(1)
                }
            })
            .is_ok()
    }

    /// Wait until a credit is available and take it.
    ///
    /// Returns `false` without taking a credit once the stream is terminal.
    pub async fn acquire(&self) -> bool {
        loop {
            if self.is_terminated() {
                return false;
            }
            if self.try_take_demand() {
                return true;
            }
            // notify_one stores a permit, so a REQUEST_N landing between the
            // check above and this await still wakes us.
            self.demand_changed.notified().await;
        }
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> StreamStatus {
        StreamStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Check if the stream reached a terminal status.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.status().is_terminal()
    }

    /// Move from `Open` to `to`.
    ///
    /// Returns `true` for exactly one caller; later calls are no-ops.
    pub fn terminate(&self, to: StreamStatus) -> bool {
        debug_assert!(to.is_terminal());
        let won = self
            .status
            .compare_exchange(OPEN, to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.demand_changed.notify_one();
            self.terminated.notify_waiters();
        }
        won
    }

    /// Resolve once the stream is terminal.
    pub async fn terminated(&self) {
        loop {
            let notified = self.terminated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }
}
