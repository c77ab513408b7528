//! Resilient socket transport to the viewer.
//!
//! This module owns the network side of the logger: a dedicated worker
//! thread walks the `Idle → Discovering → Connecting → Handshaking →
//! Streaming → Reconnecting → Stopped` state machine, draining the ring
//! buffer onto the active connection and reconnecting with capped
//! exponential backoff when the connection drops. Logging threads never
//! perform socket I/O.

mod backoff;
mod conn;
mod state;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

pub use backoff::{
    BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_BACKOFF_RESET,
};
pub use conn::{Endpoint, TlsOptions};
pub use state::TransportState;

pub(crate) use state::StateCell;
