//! Log record representation.
//!
//! This module defines the `LogRecord` value captured on every facade call
//! together with its runtime context (timestamp, producing thread). Records
//! are immutable once constructed; the encoder turns them into wire frames
//! without further mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::SystemTime;

use crate::level::Level;

/// Payload variant carried by a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Formatted message text.
    Message(String),
    /// Raw byte buffer.
    Data(Vec<u8>),
    /// Encoded image bytes with pixel dimensions.
    Image {
        data: Vec<u8>,
        width: u32,
        height: u32,
    },
    /// Standalone marker text shown by viewers as a divider.
    Marker(String),
    /// Opens a logical group of records.
    BlockStart(String),
    /// Closes the innermost open group.
    BlockEnd,
}

impl Payload {
    /// Number of payload bytes this variant contributes to a frame body.
    pub(crate) fn body_len(&self) -> usize {
        match self {
            Payload::Message(text) | Payload::Marker(text) | Payload::BlockStart(text) => {
                4 + text.len()
            }
            Payload::Data(bytes) => 4 + bytes.len(),
            Payload::Image { data, .. } => 4 + 4 + 4 + data.len(),
            Payload::BlockEnd => 0,
        }
    }
}

/// A single structured log event.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    /// Monotonic sequence number assigned at enqueue time.
    pub sequence: u32,
    /// Wall-clock time the record was created.
    pub timestamp: SystemTime,
    /// Stable numeric identifier of the producing thread.
    pub thread_id: u64,
    /// Name of the producing thread, when it has one. Not part of the wire
    /// header (fixed-width); used for console echo.
    pub thread_name: Option<String>,
    /// Optional caller-supplied tag grouping related records.
    pub tag: Option<String>,
    /// Record severity.
    pub level: Level,
    /// Typed payload.
    pub payload: Payload,
}

impl LogRecord {
    /// Build a record from the current execution context.
    pub fn new(sequence: u32, tag: Option<&str>, level: Level, payload: Payload) -> Self {
        let current = thread::current();
        Self {
            sequence,
            timestamp: SystemTime::now(),
            thread_id: current_thread_id(),
            thread_name: current.name().map(ToString::to_string),
            tag: tag.map(ToString::to_string),
            level,
            payload,
        }
    }
}

/// Process-unique numeric id for the calling thread.
///
/// `std::thread::ThreadId` has no stable integer form, so ids are handed out
/// from a process-wide counter on first use per thread.
pub(crate) fn current_thread_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_ID: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_stable_within_a_thread() {
        let first = current_thread_id();
        let second = current_thread_id();
        assert_eq!(first, second);
    }

    #[test]
    fn thread_ids_differ_across_threads() {
        let here = current_thread_id();
        let there = thread::spawn(current_thread_id).join().expect("join probe");
        assert_ne!(here, there);
    }

    #[test]
    fn record_captures_thread_name() {
        let handle = thread::Builder::new()
            .name("producer".into())
            .spawn(|| LogRecord::new(0, None, Level::Info, Payload::BlockEnd))
            .expect("spawn named thread");
        let record = handle.join().expect("join producer");
        assert_eq!(record.thread_name.as_deref(), Some("producer"));
    }
}
