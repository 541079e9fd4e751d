//! [`OutboundQueue`] – bounded per-client frame buffer with drop-oldest
//! semantics.
//!
//! The broadcast stage pushes, the client's writer task pops.  A push never
//! waits: when the queue is full the oldest frame is discarded and counted.
//! Once more than `max_consecutive_drops` frames were discarded without the
//! writer taking a single one, the queue closes itself and the connection is
//! dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest frame.
    DroppedOldest,
    /// The consecutive-drop limit was exceeded; the queue is now closed.
    Overflow,
    /// The queue no longer accepts frames (draining or closed).
    Closed,
}

#[derive(Debug, Default)]
struct Inner {
    frames: VecDeque<Arc<str>>,
    dropped: u64,
    consecutive_drops: u64,
    draining: bool,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    max_consecutive_drops: u64,
    notify: Notify,
    /// Woken once, when the queue closes.
    closed: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize, max_consecutive_drops: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                ..Inner::default()
            }),
            capacity,
            max_consecutive_drops,
            notify: Notify::new(),
            closed: Notify::new(),
        }
    }

    pub fn push(&self, frame: Arc<str>) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.draining {
                return PushOutcome::Closed;
            }
            if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                inner.dropped += 1;
                inner.consecutive_drops += 1;
                if inner.consecutive_drops > self.max_consecutive_drops {
                    inner.closed = true;
                    inner.frames.clear();
                    PushOutcome::Overflow
                } else {
                    inner.frames.push_back(frame);
                    PushOutcome::DroppedOldest
                }
            } else {
                inner.frames.push_back(frame);
                PushOutcome::Queued
            }
        };
        self.notify.notify_one();
        if outcome == PushOutcome::Overflow {
            self.closed.notify_waiters();
        }
        outcome
    }

    /// Wait for the next frame.  Returns `None` once the queue is closed, or
    /// once it is draining and empty.
    pub async fn pop(&self) -> Option<Arc<str>> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(frame) = inner.frames.pop_front() {
                    inner.consecutive_drops = 0;
                    return Some(frame);
                }
                if inner.draining {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse new frames; `pop` keeps returning what is already queued.
    pub fn begin_drain(&self) {
        self.inner.lock().draining = true;
        self.notify.notify_one();
    }

    /// Discard everything and wake the writer.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.frames.clear();
        }
        self.notify.notify_one();
        self.closed.notify_waiters();
    }

    /// Resolves once the queue is closed, by the writer or by overflow.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
