//! Worker thread driving socket I/O.
//!
//! One worker owns all network activity for a logger: it waits for an
//! endpoint (static or discovered), connects with an optional TLS handshake,
//! then drains the ring buffer onto the wire until the connection drops,
//! backing off between attempts. Logging calls never touch the socket; they
//! only enqueue frames.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, select};
use log::warn;

use crate::config::TlsSettings;
use crate::encoder;
use crate::level::Level;
use crate::record::{LogRecord, Payload};
use crate::ring_buffer::RingBuffer;

use super::backoff::{BackoffPolicy, BackoffState};
use super::conn::{ActiveConnection, Endpoint, TlsOptions, connect_tcp, wrap_tls};
use super::state::{StateCell, TransportState};

/// Commands processed by the worker thread.
pub(crate) enum ControlCommand {
    /// Drain what the buffer currently holds and acknowledge with success.
    Flush(Sender<bool>),
    /// Exit after a best-effort final drain.
    Shutdown,
}

/// Where the worker obtains candidate endpoints.
pub(crate) enum EndpointSupply {
    Static(Endpoint),
    Discovered {
        candidates: Receiver<Endpoint>,
        /// True while the listener should forward fresh candidates; cleared
        /// once the worker reaches `Streaming`.
        forwarding: Arc<AtomicBool>,
    },
}

pub(crate) struct WorkerConfig {
    pub supply: EndpointSupply,
    pub tls: Option<TlsSettings>,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_frame_size: usize,
}

/// State shared between the worker, the facade, and the listener.
pub(crate) struct WorkerShared {
    pub buffer: Arc<RingBuffer>,
    pub state: Arc<StateCell>,
    /// Sequence counter shared with the facade so synthetic gap markers slot
    /// into the record ordering.
    pub sequence: Arc<AtomicU32>,
}

/// Bytes drained per batch before control commands are re-checked.
const BATCH_BYTES: usize = 64 * 1024;
/// How long one drain waits for data before the loop re-checks control flow.
const DRAIN_WAIT: Duration = Duration::from_millis(200);
/// Budget for the best-effort final drain on shutdown.
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(1);

pub(crate) fn spawn_worker(
    config: WorkerConfig,
    shared: WorkerShared,
) -> io::Result<(Sender<ControlCommand>, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded(4);
    let handle = thread::Builder::new()
        .name("wirelog-transport".into())
        .spawn(move || Worker::new(config, shared, rx).run())?;
    Ok((tx, handle))
}

#[derive(PartialEq, Eq)]
enum StreamEnd {
    /// The connection failed; reconnect.
    Failed,
    /// Shutdown was requested; exit the worker.
    Exit,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Worker {
    config: WorkerConfig,
    shared: WorkerShared,
    ctrl: Receiver<ControlCommand>,
    backoff: BackoffState,
}

impl Worker {
    fn new(config: WorkerConfig, shared: WorkerShared, ctrl: Receiver<ControlCommand>) -> Self {
        let backoff = BackoffState::new(config.backoff.clone());
        Self {
            config,
            shared,
            ctrl,
            backoff,
        }
    }

    fn run(mut self) {
        loop {
            let Some(endpoint) = self.next_endpoint() else {
                break;
            };
            match self.establish(&endpoint) {
                Ok(conn) => match self.stream(conn) {
                    StreamEnd::Exit => break,
                    StreamEnd::Failed => {
                        if self.wait_backoff() == Flow::Exit {
                            break;
                        }
                    }
                },
                Err(err) => {
                    warn!("wirelog: connecting to {endpoint} failed: {err}");
                    if self.wait_backoff() == Flow::Exit {
                        break;
                    }
                }
            }
        }
        self.shared.buffer.set_connected(false);
        self.shared.state.set(TransportState::Stopped);
    }

    /// Yield the next endpoint to try, or `None` on shutdown.
    ///
    /// With a static endpoint this returns immediately; in discovery mode it
    /// parks in `Discovering` until the listener forwards a candidate.
    fn next_endpoint(&mut self) -> Option<Endpoint> {
        match &self.config.supply {
            EndpointSupply::Static(endpoint) => Some(endpoint.clone()),
            EndpointSupply::Discovered {
                candidates,
                forwarding,
            } => {
                self.shared.state.set(TransportState::Discovering);
                forwarding.store(true, Ordering::Release);
                loop {
                    select! {
                        recv(self.ctrl) -> cmd => match cmd {
                            Ok(ControlCommand::Flush(ack)) => {
                                let _ = ack.send(false);
                            }
                            Ok(ControlCommand::Shutdown) | Err(_) => return None,
                        },
                        recv(candidates) -> endpoint => match endpoint {
                            Ok(endpoint) => return Some(endpoint),
                            Err(_) => {
                                // Listener died; nothing more will arrive.
                                warn!("wirelog: discovery listener stopped unexpectedly");
                                loop {
                                    match self.ctrl.recv() {
                                        Ok(ControlCommand::Flush(ack)) => {
                                            let _ = ack.send(false);
                                        }
                                        Ok(ControlCommand::Shutdown) | Err(_) => return None,
                                    }
                                }
                            }
                        },
                    }
                }
            }
        }
    }

    fn establish(&mut self, endpoint: &Endpoint) -> io::Result<ActiveConnection> {
        self.shared.state.set(TransportState::Connecting);
        let stream = connect_tcp(endpoint, self.config.connect_timeout)?;
        let mut conn = match &self.config.tls {
            Some(settings) => {
                self.shared.state.set(TransportState::Handshaking);
                let tls = TlsOptions {
                    domain: settings
                        .domain
                        .clone()
                        .unwrap_or_else(|| endpoint.host.clone()),
                    insecure_skip_verify: settings.insecure_skip_verify,
                };
                wrap_tls(stream, &tls, self.config.connect_timeout)?
            }
            None => ActiveConnection::Plain(stream),
        };
        conn.set_write_timeout(self.config.write_timeout)?;
        Ok(conn)
    }

    fn stream(&mut self, mut conn: ActiveConnection) -> StreamEnd {
        if let EndpointSupply::Discovered { forwarding, .. } = &self.config.supply {
            forwarding.store(false, Ordering::Release);
        }
        self.shared.state.set(TransportState::Streaming);
        self.shared.buffer.set_connected(true);
        self.backoff.connection_established(Instant::now());

        let end = loop {
            match self.ctrl.try_recv() {
                Ok(ControlCommand::Flush(ack)) => {
                    let ok = self.drain_all(&mut conn);
                    let _ = ack.send(ok);
                    if !ok {
                        break StreamEnd::Failed;
                    }
                }
                Ok(ControlCommand::Shutdown) => {
                    let _ = self.drain_all(&mut conn);
                    break StreamEnd::Exit;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    let _ = self.drain_all(&mut conn);
                    break StreamEnd::Exit;
                }
            }

            if let Err(err) = self.forward_batch(&mut conn) {
                warn!("wirelog: write to viewer failed: {err}");
                break StreamEnd::Failed;
            }
        };

        self.shared.buffer.set_connected(false);
        if end == StreamEnd::Failed {
            self.backoff.connection_lost();
        }
        end
    }

    /// Send the next batch, preceded by a gap marker when records were lost.
    fn forward_batch(&mut self, conn: &mut ActiveConnection) -> io::Result<()> {
        self.report_gap(conn)?;
        let frames = self.shared.buffer.drain_batch(BATCH_BYTES, DRAIN_WAIT);
        if frames.is_empty() {
            return Ok(());
        }
        for frame in &frames {
            conn.write_all(frame)?;
        }
        conn.flush()?;
        self.backoff.write_succeeded(Instant::now());
        Ok(())
    }

    /// Inject a synthetic marker reporting dropped records.
    ///
    /// Evictions take the oldest frames, so the marker goes out ahead of the
    /// retained batch, where the gap sits in the stream.
    fn report_gap(&mut self, conn: &mut ActiveConnection) -> io::Result<()> {
        let dropped = self.shared.buffer.take_dropped();
        if dropped == 0 {
            return Ok(());
        }
        warn!("wirelog: {dropped} records lost before delivery");
        let record = LogRecord::new(
            self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            None,
            Level::Warn,
            Payload::Marker(format!("{dropped} records lost")),
        );
        let Ok(frame) = encoder::encode(&record, self.config.max_frame_size) else {
            return Ok(());
        };
        if let Err(err) = conn.write_all(&frame) {
            // The marker never made it; carry the count to the next attempt.
            self.shared.buffer.restore_dropped(dropped);
            return Err(err);
        }
        Ok(())
    }

    /// Drain everything currently buffered, bounded in time.
    fn drain_all(&mut self, conn: &mut ActiveConnection) -> bool {
        let deadline = Instant::now() + SHUTDOWN_DRAIN_BUDGET;
        loop {
            if self.report_gap(conn).is_err() {
                return false;
            }
            let frames = self.shared.buffer.drain_batch(BATCH_BYTES, Duration::ZERO);
            if frames.is_empty() {
                return conn.flush().is_ok();
            }
            for frame in &frames {
                if conn.write_all(frame).is_err() {
                    return false;
                }
            }
            if Instant::now() >= deadline {
                return conn.flush().is_ok();
            }
        }
    }

    /// Wait out the backoff delay, staying responsive to control commands.
    fn wait_backoff(&mut self) -> Flow {
        self.shared.state.set(TransportState::Reconnecting);
        let deadline = Instant::now() + self.backoff.next_delay();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Flow::Continue;
            }
            match self.ctrl.recv_timeout(remaining) {
                Ok(ControlCommand::Flush(ack)) => {
                    let _ = ack.send(false);
                }
                Ok(ControlCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    return Flow::Exit;
                }
                Err(RecvTimeoutError::Timeout) => return Flow::Continue,
            }
        }
    }
}
