//! Socket-level tests for the transport worker.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use rstest::{fixture, rstest};

use crate::encoder;
use crate::level::Level;
use crate::record::{LogRecord, Payload};
use crate::ring_buffer::{Capacity, RingBuffer};

use super::backoff::BackoffPolicy;
use super::conn::{Endpoint, TlsOptions, connect_tcp, wrap_tls};
use super::state::{StateCell, TransportState};
use super::worker::{
    ControlCommand, EndpointSupply, WorkerConfig, WorkerShared, spawn_worker,
};

#[fixture]
fn tcp_listener() -> TcpListener {
    TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener")
}

fn test_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(50),
        cap: Duration::from_millis(200),
        reset_after: Duration::from_secs(60),
    }
}

struct Harness {
    buffer: Arc<RingBuffer>,
    state: Arc<StateCell>,
    sequence: Arc<AtomicU32>,
    ctrl: Sender<ControlCommand>,
    handle: thread::JoinHandle<()>,
}

impl Harness {
    fn spawn(supply: EndpointSupply, capacity: Capacity, buffered: bool) -> Self {
        let buffer = Arc::new(RingBuffer::new(capacity, buffered));
        let state = Arc::new(StateCell::new());
        let sequence = Arc::new(AtomicU32::new(0));
        let config = WorkerConfig {
            supply,
            tls: None,
            connect_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            backoff: test_backoff(),
            max_frame_size: 1 << 20,
        };
        let shared = WorkerShared {
            buffer: Arc::clone(&buffer),
            state: Arc::clone(&state),
            sequence: Arc::clone(&sequence),
        };
        let (ctrl, handle) = spawn_worker(config, shared).expect("spawn worker");
        Self {
            buffer,
            state,
            sequence,
            ctrl,
            handle,
        }
    }

    fn spawn_static(endpoint: Endpoint) -> Self {
        Self::spawn(EndpointSupply::Static(endpoint), Capacity::Records(64), true)
    }

    fn push_message(&self, text: &str) {
        let record = LogRecord::new(
            self.sequence.fetch_add(1, Ordering::Relaxed),
            None,
            Level::Info,
            Payload::Message(text.to_string()),
        );
        let frame = encoder::encode(&record, 1 << 20).expect("encode record");
        self.buffer.push(frame).expect("push frame");
    }

    fn wait_for_state(&self, want: TransportState, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if self.state.get() == want {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn shutdown(self) {
        let _ = self.ctrl.try_send(ControlCommand::Shutdown);
        drop(self.ctrl);
        self.handle.join().expect("join worker");
    }
}

fn endpoint_for(addr: SocketAddr) -> Endpoint {
    Endpoint::new(addr.ip().to_string(), addr.port())
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut rest = vec![0u8; len];
    stream.read_exact(&mut rest)?;
    let mut frame = len_buf.to_vec();
    frame.extend_from_slice(&rest);
    Ok(frame)
}

fn decode_message(frame: &[u8]) -> String {
    let (record, _) = encoder::decode(frame).expect("decode frame");
    match record.payload {
        Payload::Message(text) => text,
        other => panic!("expected message payload, got {other:?}"),
    }
}

/// Reserve a port that is currently closed but can be bound later.
fn reserved_port() -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind probe listener");
    listener.local_addr().expect("probe addr")
}

#[rstest]
fn streams_frames_in_push_order(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().expect("listener addr");
    let harness = Harness::spawn_static(endpoint_for(addr));
    for text in ["one", "two", "three"] {
        harness.push_message(text);
    }

    let (mut stream, _) = tcp_listener.accept().expect("accept connection");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    for expected in ["one", "two", "three"] {
        let frame = read_frame(&mut stream).expect("read frame");
        assert_eq!(decode_message(&frame), expected);
    }

    assert!(harness.wait_for_state(TransportState::Streaming, Duration::from_secs(2)));
    harness.shutdown();
}

#[rstest]
fn shutdown_is_bounded_while_reconnecting() {
    // Nothing listens on the reserved port, so the worker sits in the
    // connect/backoff loop when shutdown arrives.
    let addr = reserved_port();
    let harness = Harness::spawn_static(endpoint_for(addr));
    assert!(harness.wait_for_state(TransportState::Reconnecting, Duration::from_secs(2)));

    let start = Instant::now();
    harness.shutdown();
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "stop must unblock the worker promptly"
    );
}

#[rstest]
fn buffered_frames_survive_reconnect_with_gap_marker() {
    let addr = reserved_port();
    let harness = Harness::spawn(
        EndpointSupply::Static(endpoint_for(addr)),
        Capacity::Records(3),
        true,
    );
    assert!(harness.wait_for_state(TransportState::Reconnecting, Duration::from_secs(2)));

    for text in ["msg-1", "msg-2", "msg-3", "msg-4", "msg-5"] {
        harness.push_message(text);
    }
    assert_eq!(harness.buffer.total_dropped(), 2);

    // The viewer comes up on the port the worker keeps retrying.
    let listener = TcpListener::bind(addr).expect("rebind reserved port");
    let (mut stream, _) = listener.accept().expect("accept reconnect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");

    let marker = read_frame(&mut stream).expect("read gap marker");
    let (record, _) = encoder::decode(&marker).expect("decode marker");
    assert_eq!(record.level, Level::Warn);
    assert_eq!(record.payload, Payload::Marker("2 records lost".into()));

    for expected in ["msg-3", "msg-4", "msg-5"] {
        let frame = read_frame(&mut stream).expect("read retained frame");
        assert_eq!(decode_message(&frame), expected);
    }
    harness.shutdown();
}

#[rstest]
fn flush_acknowledges_after_delivery(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().expect("listener addr");
    let harness = Harness::spawn_static(endpoint_for(addr));
    let (mut stream, _) = tcp_listener.accept().expect("accept connection");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    assert!(harness.wait_for_state(TransportState::Streaming, Duration::from_secs(2)));

    harness.push_message("flushed");
    let (ack_tx, ack_rx) = bounded(1);
    harness
        .ctrl
        .send(ControlCommand::Flush(ack_tx))
        .expect("send flush");
    assert!(
        ack_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("flush acknowledged"),
        "flush must succeed while streaming"
    );

    let frame = read_frame(&mut stream).expect("read flushed frame");
    assert_eq!(decode_message(&frame), "flushed");
    harness.shutdown();
}

#[rstest]
fn pending_frames_are_drained_on_shutdown(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().expect("listener addr");
    let harness = Harness::spawn_static(endpoint_for(addr));
    let (mut stream, _) = tcp_listener.accept().expect("accept connection");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    assert!(harness.wait_for_state(TransportState::Streaming, Duration::from_secs(2)));

    harness.push_message("last words");
    harness.shutdown();

    let frame = read_frame(&mut stream).expect("read final frame");
    assert_eq!(decode_message(&frame), "last words");
}

#[rstest]
fn discovered_endpoint_drives_connection(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().expect("listener addr");
    let (candidates_tx, candidates_rx) = bounded(8);
    let forwarding = Arc::new(AtomicBool::new(false));
    let harness = Harness::spawn(
        EndpointSupply::Discovered {
            candidates: candidates_rx,
            forwarding: Arc::clone(&forwarding),
        },
        Capacity::Records(64),
        true,
    );

    assert!(harness.wait_for_state(TransportState::Discovering, Duration::from_secs(2)));
    assert!(
        forwarding.load(Ordering::Acquire),
        "listener must forward while discovering"
    );

    candidates_tx
        .send(endpoint_for(addr))
        .expect("send candidate");
    let (mut stream, _) = tcp_listener.accept().expect("accept connection");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    assert!(harness.wait_for_state(TransportState::Streaming, Duration::from_secs(2)));
    assert!(
        !forwarding.load(Ordering::Acquire),
        "forwarding pauses once streaming"
    );

    harness.push_message("found you");
    let frame = read_frame(&mut stream).expect("read frame");
    assert_eq!(decode_message(&frame), "found you");
    harness.shutdown();
}

#[rstest]
fn tls_handshake_respects_timeout(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().expect("listener addr");
    let server = thread::spawn(move || {
        let (stream, _) = tcp_listener.accept().expect("accept connection");
        // Hold the TCP connection open without speaking TLS.
        thread::sleep(Duration::from_secs(2));
        drop(stream);
    });

    let endpoint = endpoint_for(addr);
    let start = Instant::now();
    let stream =
        connect_tcp(&endpoint, Duration::from_secs(1)).expect("tcp connect succeeds");
    let tls = TlsOptions {
        domain: "localhost".into(),
        insecure_skip_verify: true,
    };
    let result = wrap_tls(stream, &tls, Duration::from_millis(250));
    assert!(result.is_err(), "handshake against a silent peer must fail");
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "handshake must respect its timeout"
    );
    server.join().expect("join server");
}
