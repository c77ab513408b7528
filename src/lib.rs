//! Resilient structured-log transport client.
//!
//! wirelog streams binary-framed log records from an application to a log
//! viewer over TCP, optionally encrypted with TLS. While no viewer is
//! reachable, records are held in a bounded ring buffer (or dropped with
//! explicit accounting, by configuration) and delivered in their original
//! order once a connection comes up. Viewers are reached through a static
//! host and port, or found on the local network via multicast
//! advertisements.
//!
//! ```no_run
//! use wirelog::{Level, Logger};
//!
//! # fn main() -> Result<(), wirelog::ConfigError> {
//! let logger = Logger::new();
//! logger.set_viewer_host("127.0.0.1", 50000)?;
//! logger.start()?;
//!
//! logger.log(Some("net"), Level::Info, "listener up");
//! let block = logger.begin_block("handshake");
//! logger.log(None, Level::Debug, "hello sent");
//! block.end();
//!
//! logger.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod encoder;
pub mod level;
pub mod logger;
pub mod record;
pub mod ring_buffer;
pub mod transport;

mod drop_warner;

pub use config::{ConfigError, LoggerConfig, LoggerOptions, TlsSettings};
pub use encoder::{DecodeError, EncodeError, Frame};
pub use level::Level;
pub use logger::{BlockGuard, LogError, Logger, clear_default, default_logger, set_default};
pub use record::{LogRecord, Payload};
pub use ring_buffer::{Capacity, PushError, RingBuffer};
pub use transport::{BackoffPolicy, Endpoint, TlsOptions, TransportState};
