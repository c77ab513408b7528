//! Observable transport lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

/// States the transport worker moves through.
///
/// `Stopped` is terminal: `stop()` tears the worker down and a later
/// `start()` builds a fresh state machine rather than resurrecting this one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    /// Constructed, no connection attempted yet.
    Idle = 0,
    /// Waiting for a viewer advertisement.
    Discovering = 1,
    /// Opening the TCP socket.
    Connecting = 2,
    /// Running the TLS handshake.
    Handshaking = 3,
    /// Draining the ring buffer onto the wire.
    Streaming = 4,
    /// Waiting out a backoff interval after a failure.
    Reconnecting = 5,
    /// Terminal; all network activity has ceased.
    Stopped = 6,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Discovering,
            2 => Self::Connecting,
            3 => Self::Handshaking,
            4 => Self::Streaming,
            5 => Self::Reconnecting,
            _ => Self::Stopped,
        }
    }
}

/// Lock-free cell holding the current state, shared between the worker, the
/// facade, and the discovery listener.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(TransportState::Idle as u8))
    }

    pub fn set(&self, state: TransportState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::Acquire))
    }
}
