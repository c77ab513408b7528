//! Public logger facade.
//!
//! A `Logger` owns its configuration until `start()` freezes it, then a
//! transport worker (and, in discovery mode, a listener thread) runs until
//! `stop()`. Logging calls encode a record and enqueue its frame; they never
//! block on the network and never raise on transport trouble.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{Sender, bounded};
use log::warn;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::config::{ConfigError, DiscoverySetup, LoggerConfig, LoggerOptions, ResolvedSource};
use crate::discovery::spawn_listener;
use crate::drop_warner::DropWarner;
use crate::encoder::{self, EncodeError};
use crate::level::Level;
use crate::record::{LogRecord, Payload};
use crate::ring_buffer::RingBuffer;
use crate::transport::worker::{
    ControlCommand, EndpointSupply, WorkerConfig, WorkerShared, spawn_worker,
};
use crate::transport::{Endpoint, StateCell, TransportState};

/// Errors surfaced by the checked logging variants.
///
/// The unchecked variants swallow these: a release logging call never
/// raises, loss is counted and reported instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    /// The encoded frame would exceed the configured maximum size.
    #[error("payload frame of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    /// The record was dropped: logger not started, buffering disabled while
    /// disconnected, or the logger is stopping.
    #[error("record discarded")]
    Discarded,
}

/// Everything that exists only while the logger runs.
struct Runtime {
    buffer: Arc<RingBuffer>,
    state: Arc<StateCell>,
    sequence: Arc<AtomicU32>,
    ctrl: Sender<ControlCommand>,
    worker: thread::JoinHandle<()>,
    listener: Option<thread::JoinHandle<()>>,
    listener_stop: Option<Arc<AtomicBool>>,
    echo: bool,
    max_frame_size: usize,
    flush_timeout: Duration,
}

impl Runtime {
    fn shutdown(self) {
        let Runtime {
            buffer,
            state,
            ctrl,
            worker,
            listener,
            listener_stop,
            ..
        } = self;
        buffer.close();
        let _ = ctrl.try_send(ControlCommand::Shutdown);
        // Dropping the only sender also unblocks a worker parked on recv.
        drop(ctrl);
        if let Some(stop) = listener_stop {
            stop.store(true, Ordering::Release);
        }
        if worker.join().is_err() {
            warn!("wirelog: transport worker panicked");
        }
        if let Some(listener) = listener
            && listener.join().is_err()
        {
            warn!("wirelog: discovery listener panicked");
        }
        state.set(TransportState::Stopped);
    }
}

/// Streams structured log records to a viewer process.
pub struct Logger {
    config: Mutex<LoggerConfig>,
    runtime: RwLock<Option<Runtime>>,
    warner: DropWarner,
    stopped: AtomicBool,
}

impl Logger {
    /// Create a logger with default configuration. An endpoint source must
    /// be supplied before `start()`.
    pub fn new() -> Self {
        Self::with_config(LoggerConfig::default())
    }

    /// Create a logger from a prepared configuration.
    pub fn with_config(config: LoggerConfig) -> Self {
        let warner = DropWarner::new(config.warn_interval);
        Self {
            config: Mutex::new(config),
            runtime: RwLock::new(None),
            warner,
            stopped: AtomicBool::new(false),
        }
    }

    /// Point the logger at a fixed viewer and disable discovery.
    pub fn set_viewer_host(&self, host: &str, port: u16) -> Result<(), ConfigError> {
        if host.is_empty() || port == 0 {
            return Err(ConfigError::InvalidEndpoint);
        }
        self.configure(|config| {
            config.static_endpoint = Some(Endpoint::new(host, port));
            config.discovery = None;
            config.options.browse_discovery = false;
        })
    }

    /// Browse for a named viewer, superseding any static endpoint.
    ///
    /// `service_type` defaults to the well-known type when `None`.
    pub fn set_discovery(
        &self,
        service_type: Option<&str>,
        service_name: &str,
    ) -> Result<(), ConfigError> {
        if service_name.is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }
        self.configure(|config| {
            config.discovery = Some(DiscoverySetup {
                service_type: service_type.map(ToString::to_string),
                service_name: service_name.to_string(),
            });
            config.static_endpoint = None;
            config.options.browse_discovery = true;
        })
    }

    /// Replace the option flags.
    pub fn set_options(&self, options: LoggerOptions) -> Result<(), ConfigError> {
        self.configure(|config| config.options = options)
    }

    /// Mutate the configuration in place. Fails once the logger is running.
    pub fn configure(&self, mutate: impl FnOnce(&mut LoggerConfig)) -> Result<(), ConfigError> {
        if self.runtime.read().is_some() {
            return Err(ConfigError::AlreadyStarted);
        }
        mutate(&mut self.config.lock());
        Ok(())
    }

    /// Validate the configuration and bring up the worker (and listener).
    ///
    /// Configuration is frozen from here until `stop()`.
    pub fn start(&self) -> Result<(), ConfigError> {
        let mut runtime = self.runtime.write();
        if runtime.is_some() {
            return Err(ConfigError::AlreadyStarted);
        }
        let config = self.config.lock().clone();
        let source = config.validate()?;

        let buffer = Arc::new(RingBuffer::new(
            config.capacity,
            config.options.buffer_until_connected,
        ));
        let state = Arc::new(StateCell::new());
        let sequence = Arc::new(AtomicU32::new(0));

        let (supply, listener, listener_stop) = match source {
            ResolvedSource::Static(endpoint) => (EndpointSupply::Static(endpoint), None, None),
            ResolvedSource::Discovery(listener_config) => {
                let (candidates_tx, candidates_rx) = bounded(8);
                let forwarding = Arc::new(AtomicBool::new(false));
                let stop = Arc::new(AtomicBool::new(false));
                let handle = spawn_listener(
                    listener_config,
                    candidates_tx,
                    Arc::clone(&forwarding),
                    Arc::clone(&stop),
                )?;
                (
                    EndpointSupply::Discovered {
                        candidates: candidates_rx,
                        forwarding,
                    },
                    Some(handle),
                    Some(stop),
                )
            }
        };

        let worker_config = WorkerConfig {
            supply,
            tls: config.options.use_tls.then(|| config.tls.clone()),
            connect_timeout: config.connect_timeout,
            write_timeout: config.write_timeout,
            backoff: config.backoff.clone(),
            max_frame_size: config.max_frame_size,
        };
        let shared = WorkerShared {
            buffer: Arc::clone(&buffer),
            state: Arc::clone(&state),
            sequence: Arc::clone(&sequence),
        };
        let (ctrl, worker) = match spawn_worker(worker_config, shared) {
            Ok(spawned) => spawned,
            Err(err) => {
                if let Some(stop) = &listener_stop {
                    stop.store(true, Ordering::Release);
                }
                return Err(err.into());
            }
        };

        *runtime = Some(Runtime {
            buffer,
            state,
            sequence,
            ctrl,
            worker,
            listener,
            listener_stop,
            echo: config.options.echo_to_console,
            max_frame_size: config.max_frame_size,
            flush_timeout: config.write_timeout.max(Duration::from_secs(2)),
        });
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    /// Tear down all network activity. Idempotent; returns once the worker
    /// and listener threads have exited, which is bounded even with a socket
    /// operation outstanding.
    pub fn stop(&self) {
        let Some(runtime) = self.runtime.write().take() else {
            return;
        };
        self.warner
            .flush(|count| warn!("wirelog: dropped {count} records"));
        runtime.shutdown();
        self.stopped.store(true, Ordering::Release);
    }

    /// Ask the worker to drain what the buffer currently holds.
    ///
    /// Returns true once the worker acknowledges a successful drain; false
    /// when the logger is not running, has no connection, or the drain
    /// times out.
    pub fn flush(&self) -> bool {
        let guard = self.runtime.read();
        let Some(runtime) = guard.as_ref() else {
            return false;
        };
        self.warner
            .flush(|count| warn!("wirelog: dropped {count} records"));
        let (ack_tx, ack_rx) = bounded(1);
        if runtime
            .ctrl
            .send_timeout(ControlCommand::Flush(ack_tx), runtime.flush_timeout)
            .is_err()
        {
            return false;
        }
        ack_rx.recv_timeout(runtime.flush_timeout).unwrap_or(false)
    }

    /// Current transport state, for observability and tests.
    pub fn state(&self) -> TransportState {
        if let Some(runtime) = self.runtime.read().as_ref() {
            return runtime.state.get();
        }
        if self.stopped.load(Ordering::Acquire) {
            TransportState::Stopped
        } else {
            TransportState::Idle
        }
    }

    /// Total records lost so far: facade-side rejections plus buffer
    /// overflow or fail-fast drops.
    pub fn dropped_records(&self) -> u64 {
        let buffered = self
            .runtime
            .read()
            .as_ref()
            .map_or(0, |runtime| runtime.buffer.total_dropped());
        self.warner.total_dropped() + buffered
    }

    /// Log formatted text.
    pub fn log(&self, tag: Option<&str>, level: Level, text: &str) {
        self.emit(tag, level, Payload::Message(text.to_string()));
    }

    /// Checked variant of [`log`](Self::log).
    pub fn try_log(&self, tag: Option<&str>, level: Level, text: &str) -> Result<(), LogError> {
        self.try_emit(tag, level, Payload::Message(text.to_string()))
    }

    /// Log a raw byte buffer.
    pub fn log_data(&self, tag: Option<&str>, level: Level, data: &[u8]) {
        self.emit(tag, level, Payload::Data(data.to_vec()));
    }

    /// Checked variant of [`log_data`](Self::log_data).
    pub fn try_log_data(
        &self,
        tag: Option<&str>,
        level: Level,
        data: &[u8],
    ) -> Result<(), LogError> {
        self.try_emit(tag, level, Payload::Data(data.to_vec()))
    }

    /// Log encoded image bytes with pixel dimensions.
    pub fn log_image(&self, tag: Option<&str>, level: Level, data: &[u8], width: u32, height: u32) {
        self.emit(
            tag,
            level,
            Payload::Image {
                data: data.to_vec(),
                width,
                height,
            },
        );
    }

    /// Checked variant of [`log_image`](Self::log_image).
    pub fn try_log_image(
        &self,
        tag: Option<&str>,
        level: Level,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> Result<(), LogError> {
        self.try_emit(
            tag,
            level,
            Payload::Image {
                data: data.to_vec(),
                width,
                height,
            },
        )
    }

    /// Emit a standalone marker.
    pub fn mark(&self, text: &str) {
        self.emit(None, Level::Info, Payload::Marker(text.to_string()));
    }

    /// Open a logical block; the guard emits the matching end record.
    ///
    /// Blocks nest: guards must be released innermost-first, which the
    /// borrow rules of a guard held on the stack already enforce.
    pub fn begin_block(&self, text: &str) -> BlockGuard<'_> {
        self.emit(None, Level::Info, Payload::BlockStart(text.to_string()));
        BlockGuard {
            logger: self,
            ended: false,
        }
    }

    fn emit(&self, tag: Option<&str>, level: Level, payload: Payload) {
        if self.try_emit(tag, level, payload).is_err() {
            self.warner
                .warn_if_due(|count| warn!("wirelog: dropped {count} records"));
        }
    }

    fn try_emit(&self, tag: Option<&str>, level: Level, payload: Payload) -> Result<(), LogError> {
        let guard = self.runtime.read();
        let Some(runtime) = guard.as_ref() else {
            self.warner.record_drop();
            return Err(LogError::Discarded);
        };
        let record = LogRecord::new(
            runtime.sequence.fetch_add(1, Ordering::Relaxed),
            tag,
            level,
            payload,
        );
        if runtime.echo {
            echo_record(&record);
        }
        let frame = encoder::encode(&record, runtime.max_frame_size).map_err(|err| {
            self.warner.record_drop();
            let EncodeError::PayloadTooLarge { size, max } = err;
            LogError::PayloadTooLarge { size, max }
        })?;
        runtime.buffer.push(frame).map_err(|_| LogError::Discarded)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("state", &self.state())
            .field("dropped_records", &self.dropped_records())
            .finish()
    }
}

/// Scoped handle for an open block.
///
/// The end record is emitted exactly once, either by an explicit
/// [`end`](Self::end) or when the guard leaves scope on any exit path.
#[must_use = "dropping the guard immediately ends the block"]
pub struct BlockGuard<'a> {
    logger: &'a Logger,
    ended: bool,
}

impl BlockGuard<'_> {
    /// Close the block now.
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            self.logger.emit(None, Level::Info, Payload::BlockEnd);
        }
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Echo one record to the local console.
fn echo_record(record: &LogRecord) {
    let time: DateTime<Local> = record.timestamp.into();
    let tag = record.tag.as_deref().unwrap_or("-");
    let thread = record.thread_name.as_deref().unwrap_or("");
    let body = match &record.payload {
        Payload::Message(text) => text.clone(),
        Payload::Data(data) => format!("<{} bytes>", data.len()),
        Payload::Image {
            data,
            width,
            height,
        } => format!("<image {width}x{height}, {} bytes>", data.len()),
        Payload::Marker(text) => format!("-- {text} --"),
        Payload::BlockStart(text) => format!("[begin] {text}"),
        Payload::BlockEnd => "[end]".to_string(),
    };
    eprintln!(
        "{} {:8} {tag} {thread} | {body}",
        time.format("%H:%M:%S%.3f"),
        record.level.to_string(),
    );
}

static DEFAULT_LOGGER: Lazy<RwLock<Option<Arc<Logger>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide default logger, replacing any previous one.
pub fn set_default(logger: Arc<Logger>) {
    *DEFAULT_LOGGER.write() = Some(logger);
}

/// The process-wide default logger, when one is installed.
pub fn default_logger() -> Option<Arc<Logger>> {
    DEFAULT_LOGGER.read().clone()
}

/// Remove the process-wide default logger.
pub fn clear_default() {
    *DEFAULT_LOGGER.write() = None;
}
