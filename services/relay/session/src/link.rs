//! Per-connection state shared by the session loops and the producers.

use crate::queue::{OutboundQueue, QueueConfig};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake not finished yet
    Connecting,
    /// Both loops running
    Open,
    /// Shutdown requested, loops winding down
    Closing,
    /// Both loops finished and the socket is released
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Connecting => "connecting",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Traffic counters for a link
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Frames received
    pub frames_in: u64,
    /// Frames sent
    pub frames_out: u64,
    /// Payload bytes received
    pub bytes_in: u64,
    /// Payload bytes sent
    pub bytes_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// One peer-to-peer duplex connection.
///
/// Holds the lifecycle state, the outbound queue and the last known sensor
/// value. Shared behind an `Arc` between the receive loop, the send loop and
/// the producers of the same connection only.
#[derive(Debug)]
pub struct Link {
    id: Uuid,
    state: watch::Sender<LinkState>,
    queue: OutboundQueue,
    temperature: AtomicU64,
    close_frame: Mutex<Option<CloseFrame>>,
    counters: Counters,
}

impl Link {
    /// Create a link in the `Connecting` state
    pub fn new(queue: QueueConfig, temperature: f64) -> Self {
        let (state, _) = watch::channel(LinkState::Connecting);
        Self {
            id: Uuid::new_v4(),
            state,
            queue: OutboundQueue::new(queue),
            temperature: AtomicU64::new(temperature.to_bits()),
            close_frame: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Connection identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Whether the link is `Open`
    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Subscribe to state changes
    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// `Connecting -> Open`; returns false from any other state
    pub fn mark_open(&self) -> bool {
        self.transition(|state| *state == LinkState::Connecting, LinkState::Open)
    }

    /// `Connecting | Open -> Closing`; returns false if already shutting down
    pub fn begin_close(&self) -> bool {
        self.transition(
            |state| matches!(state, LinkState::Connecting | LinkState::Open),
            LinkState::Closing,
        )
    }

    /// Begin closing and remember the close frame the send loop should emit.
    ///
    /// The first recorded frame wins.
    pub fn close_with(&self, frame: CloseFrame) -> bool {
        {
            let mut slot = self.close_frame.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(frame);
            }
        }
        self.begin_close()
    }

    /// Take the pending close frame, if any
    pub fn take_close_frame(&self) -> Option<CloseFrame> {
        self.close_frame.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Final transition; closes the outbound queue
    pub fn mark_closed(&self) {
        self.queue.close();
        self.state.send_if_modified(|state| {
            let changed = *state != LinkState::Closed;
            *state = LinkState::Closed;
            changed
        });
    }

    fn transition(&self, from: impl Fn(&LinkState) -> bool, to: LinkState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if from(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Link {} is now {}", self.id, to);
        }
        changed
    }

    /// Resolve once the link has left `Open` (or never got there and is
    /// shutting down)
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx
            .wait_for(|state| matches!(state, LinkState::Closing | LinkState::Closed))
            .await;
    }

    /// Outbound queue of this link
    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Last known temperature
    pub fn temperature(&self) -> f64 {
        f64::from_bits(self.temperature.load(Ordering::Acquire))
    }

    /// Overwrite the last known temperature
    pub fn set_temperature(&self, value: f64) {
        self.temperature.store(value.to_bits(), Ordering::Release);
    }

    /// Atomically add `delta` and return the new temperature
    pub fn advance_temperature(&self, delta: f64) -> f64 {
        let previous = self
            .temperature
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            })
            .unwrap_or_else(|bits| bits);
        f64::from_bits(previous) + delta
    }

    /// Atomically reset the temperature to `reset_to` if it is above
    /// `threshold`; returns the value it had when the reset happened
    pub fn reset_temperature_above(&self, threshold: f64, reset_to: f64) -> Option<f64> {
        self.temperature
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (f64::from_bits(bits) > threshold).then(|| reset_to.to_bits())
            })
            .ok()
            .map(f64::from_bits)
    }

    pub(crate) fn record_in(&self, bytes: usize) {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, bytes: usize) {
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Utf8Bytes;

    #[test]
    fn test_lifecycle_transitions() {
        let link = Link::new(QueueConfig::default(), 70.0);
        assert_eq!(link.state(), LinkState::Connecting);

        assert!(link.mark_open());
        assert!(!link.mark_open());
        assert!(link.is_open());

        assert!(link.begin_close());
        assert!(!link.begin_close());
        assert_eq!(link.state(), LinkState::Closing);

        link.mark_closed();
        assert_eq!(link.state(), LinkState::Closed);
        assert!(link.queue().is_closed());
        assert!(!link.mark_open());
    }

    #[test]
    fn test_first_close_frame_wins() {
        let link = Link::new(QueueConfig::default(), 70.0);
        link.mark_open();

        let first = CloseFrame { code: CloseCode::Protocol, reason: Utf8Bytes::from_static("bad kind") };
        let second = CloseFrame { code: CloseCode::Normal, reason: Utf8Bytes::from_static("") };
        assert!(link.close_with(first));
        assert!(!link.close_with(second));

        let taken = link.take_close_frame().unwrap();
        assert_eq!(taken.code, CloseCode::Protocol);
        assert!(link.take_close_frame().is_none());
    }

    #[tokio::test]
    async fn test_closed_resolves_on_close() {
        let link = Arc::new(Link::new(QueueConfig::default(), 70.0));
        link.mark_open();

        let waiter = {
            let link = link.clone();
            tokio::spawn(async move { link.closed().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        link.begin_close();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn test_temperature_updates() {
        let link = Link::new(QueueConfig::default(), 70.0);
        assert_eq!(link.advance_temperature(2.5), 72.5);
        assert_eq!(link.temperature(), 72.5);

        assert_eq!(link.reset_temperature_above(90.0, 70.0), None);
        link.set_temperature(95.0);
        assert_eq!(link.reset_temperature_above(90.0, 70.0), Some(95.0));
        assert_eq!(link.temperature(), 70.0);
    }

    #[test]
    fn test_stats() {
        let link = Link::new(QueueConfig::default(), 0.0);
        link.record_in(10);
        link.record_out(4);
        link.record_out(6);
        assert_eq!(
            link.stats(),
            LinkStats { frames_in: 1, frames_out: 2, bytes_in: 10, bytes_out: 10 }
        );
    }
}
