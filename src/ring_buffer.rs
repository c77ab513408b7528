//! Bounded in-memory frame queue between producers and the I/O worker.
//!
//! Multiple caller threads push encoded frames; the transport worker is the
//! single consumer. Capacity is bounded by record count or by byte size.
//! Overflow never blocks a logging call: in buffered mode the oldest frames
//! are evicted, in unbuffered mode pushes fail fast while no connection is
//! active. Every lost frame lands in a drop counter the consumer reads to
//! report the gap in-stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::encoder::Frame;

/// Capacity bound for the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capacity {
    /// At most this many frames.
    Records(usize),
    /// At most this many bytes of encoded frames.
    Bytes(usize),
}

impl Capacity {
    pub(crate) fn is_zero(self) -> bool {
        match self {
            Capacity::Records(n) | Capacity::Bytes(n) => n == 0,
        }
    }
}

/// Errors surfaced by [`RingBuffer::push`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// Buffering is disabled and no connection is active.
    #[error("record discarded: no active connection")]
    Discarded,
    /// The buffer was closed by `stop()`.
    #[error("buffer closed")]
    Closed,
}

#[derive(Default)]
struct Inner {
    frames: VecDeque<Frame>,
    bytes: usize,
    closed: bool,
}

/// Bounded MPSC queue of encoded frames.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    data_available: Condvar,
    capacity: Capacity,
    buffer_when_disconnected: bool,
    connected: AtomicBool,
    dropped: AtomicU64,
    lifetime_dropped: AtomicU64,
}

impl RingBuffer {
    /// Create a buffer. `buffer_when_disconnected` selects the overflow
    /// policy described in the module docs.
    pub fn new(capacity: Capacity, buffer_when_disconnected: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            data_available: Condvar::new(),
            capacity,
            buffer_when_disconnected,
            connected: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            lifetime_dropped: AtomicU64::new(0),
        }
    }

    /// Worker-side signal that a connection is (or is no longer) streaming.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Append a frame, evicting the oldest frames when the bound is hit.
    pub fn push(&self, frame: Frame) -> Result<(), PushError> {
        if !self.buffer_when_disconnected && !self.is_connected() {
            self.count_drops(1);
            return Err(PushError::Discarded);
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            self.count_drops(1);
            return Err(PushError::Closed);
        }

        inner.bytes += frame.len();
        inner.frames.push_back(frame);
        let evicted = self.evict_overflow(&mut inner);
        drop(inner);

        if evicted > 0 {
            self.count_drops(evicted);
        }
        self.data_available.notify_one();
        Ok(())
    }

    /// Evict from the front until the bound holds again. The newest frame is
    /// never evicted, so a frame larger than a byte bound still goes out.
    fn evict_overflow(&self, inner: &mut Inner) -> u64 {
        let mut evicted = 0;
        loop {
            let over = match self.capacity {
                Capacity::Records(max) => inner.frames.len() > max,
                Capacity::Bytes(max) => inner.bytes > max && inner.frames.len() > 1,
            };
            if !over {
                return evicted;
            }
            if let Some(old) = inner.frames.pop_front() {
                inner.bytes -= old.len();
                evicted += 1;
            } else {
                return evicted;
            }
        }
    }

    /// Remove up to `max_bytes` of frames, waiting up to `wait` for data.
    ///
    /// Always returns at least one frame when any is queued, even if it alone
    /// exceeds `max_bytes`. Returns an empty batch on timeout or once closed
    /// and drained.
    pub fn drain_batch(&self, max_bytes: usize, wait: Duration) -> Vec<Frame> {
        let mut inner = self.inner.lock();
        if inner.frames.is_empty() && !inner.closed {
            self.data_available.wait_for(&mut inner, wait);
        }

        let mut batch = Vec::new();
        let mut batch_bytes = 0;
        while let Some(frame) = inner.frames.front() {
            if !batch.is_empty() && batch_bytes + frame.len() > max_bytes {
                break;
            }
            let frame = inner.frames.pop_front().expect("front checked");
            inner.bytes -= frame.len();
            batch_bytes += frame.len();
            batch.push(frame);
        }
        batch
    }

    /// Number of frames currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn count_drops(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
        self.lifetime_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Records lost to overflow or fail-fast pushes since the last take.
    /// The consumer reads this to report the gap in-stream.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Records lost over the buffer's lifetime.
    pub fn total_dropped(&self) -> u64 {
        self.lifetime_dropped.load(Ordering::Relaxed)
    }

    /// Return drops taken by [`take_dropped`](Self::take_dropped) that could
    /// not be reported after all.
    pub(crate) fn restore_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Stop accepting frames and wake the consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.data_available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
