//! Per-connection outbound FIFO.
//!
//! Any number of producers push, the connection's send loop is the only
//! consumer. Unbounded unless a capacity is configured, in which case the
//! overflow policy decides between evicting the oldest entry and suspending
//! the producer.

use relay_wire::Message;
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

/// What to do when a bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest pending message
    #[default]
    DropOldest,
    /// Suspend the producer until space frees up
    Block,
}

/// Queue sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueConfig {
    /// Maximum pending messages; `None` means unbounded
    pub capacity: Option<usize>,
    /// Applied only when `capacity` is set
    pub overflow: OverflowPolicy,
}

impl QueueConfig {
    /// Unbounded queue
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Bounded queue with the given overflow policy
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            overflow,
        }
    }
}

/// Result of a successful push
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// Message appended
    Queued,
    /// Message appended after evicting the returned one
    Displaced(Message),
}

/// The queue was closed; its connection is gone
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("outbound queue closed")]
pub struct QueueClosed;

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<Message>,
    closed: bool,
}

/// Ordered multi-producer, single-consumer message queue
#[derive(Debug)]
pub struct OutboundQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    available: Notify,
    space: Notify,
}

impl OutboundQueue {
    /// Create an empty queue
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner::default()),
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of pending messages
    pub fn len(&self) -> usize {
        self.inner().items.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }

    /// Append a message.
    ///
    /// Only suspends for a full bounded queue under [`OverflowPolicy::Block`].
    pub async fn push(&self, message: Message) -> Result<Enqueued, QueueClosed> {
        let mut message = Some(message);
        loop {
            let mut notified = pin!(self.space.notified());
            notified.as_mut().enable();

            {
                let mut inner = self.inner();
                if inner.closed {
                    return Err(QueueClosed);
                }

                let full = self
                    .config
                    .capacity
                    .is_some_and(|capacity| inner.items.len() >= capacity);

                if !full || self.config.overflow == OverflowPolicy::DropOldest {
                    let displaced = if full { inner.items.pop_front() } else { None };
                    if let Some(message) = message.take() {
                        inner.items.push_back(message);
                    }
                    drop(inner);
                    self.available.notify_one();

                    return Ok(match displaced {
                        Some(old) => {
                            warn!("Outbound queue full; dropped oldest {} message", old.kind());
                            Enqueued::Displaced(old)
                        }
                        None => Enqueued::Queued,
                    });
                }
            }

            notified.await;
        }
    }

    /// Take the oldest message without waiting
    pub fn try_pop(&self) -> Option<Message> {
        let message = self.inner().items.pop_front();
        if message.is_some() && self.config.capacity.is_some() {
            self.space.notify_one();
        }
        message
    }

    /// Wait for the oldest message; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<Message> {
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();

            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Reject further pushes and wake every waiter
    pub fn close(&self) {
        self.inner().closed = true;
        self.available.notify_waiters();
        self.space.notify_waiters();
    }

    /// Snapshot of pending messages in send order
    pub fn pending(&self) -> Vec<Message> {
        self.inner().items.iter().copied().collect()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
