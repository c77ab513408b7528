//! Viewer discovery over UDP multicast.
//!
//! Viewers advertise themselves by periodically multicasting a small
//! datagram naming their service and TCP port. The listener joins the group
//! on its own thread, filters advertisements against the configured service
//! type and name, coalesces duplicates, and forwards fresh endpoints to the
//! transport worker. Forwarding pauses while the worker is streaming and
//! resumes when it returns to discovery.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::warn;
use thiserror::Error;

use crate::transport::Endpoint;

/// Service type assumed when the caller does not specify one.
pub const DEFAULT_SERVICE_TYPE: &str = "_wirelog._tcp";
/// Multicast group advertisements are sent to.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 109, 43);
/// UDP port advertisements are sent to.
pub const DEFAULT_MULTICAST_PORT: u16 = 50100;

/// First four bytes of every advertisement datagram ("WLAD").
const MAGIC: u32 = 0x574C_4144;
const VERSION: u16 = 1;

/// How long a coalesced endpoint stays quiet before it is forwarded again.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// Read timeout used so the listener notices its stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One viewer advertisement datagram.
///
/// Layout (big-endian): magic `u32`, version `u16`, TCP port `u16`, then
/// `u16`-prefixed UTF-8 service type and service name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub port: u16,
    pub service_type: String,
    pub service_name: String,
}

/// Errors produced while parsing an advertisement datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdvertisementError {
    #[error("datagram too short")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,
}

impl Advertisement {
    /// Encode the datagram a viewer multicasts.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + 2 + 2 + 2 + self.service_type.len() + 2 + self.service_name.len(),
        );
        out.extend(MAGIC.to_be_bytes());
        out.extend(VERSION.to_be_bytes());
        out.extend(self.port.to_be_bytes());
        for text in [&self.service_type, &self.service_name] {
            out.extend((text.len() as u16).to_be_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        out
    }

    /// Parse a received datagram.
    pub fn parse(data: &[u8]) -> Result<Self, AdvertisementError> {
        let mut rest = data;
        let magic = take_u32(&mut rest)?;
        if magic != MAGIC {
            return Err(AdvertisementError::BadMagic);
        }
        let version = take_u16(&mut rest)?;
        if version != VERSION {
            return Err(AdvertisementError::UnsupportedVersion(version));
        }
        let port = take_u16(&mut rest)?;
        let service_type = take_text(&mut rest)?;
        let service_name = take_text(&mut rest)?;
        Ok(Self {
            port,
            service_type,
            service_name,
        })
    }
}

fn take_u16(rest: &mut &[u8]) -> Result<u16, AdvertisementError> {
    if rest.len() < 2 {
        return Err(AdvertisementError::Truncated);
    }
    let value = u16::from_be_bytes([rest[0], rest[1]]);
    *rest = &rest[2..];
    Ok(value)
}

fn take_u32(rest: &mut &[u8]) -> Result<u32, AdvertisementError> {
    if rest.len() < 4 {
        return Err(AdvertisementError::Truncated);
    }
    let value = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    *rest = &rest[4..];
    Ok(value)
}

fn take_text(rest: &mut &[u8]) -> Result<String, AdvertisementError> {
    let len = take_u16(rest)? as usize;
    if rest.len() < len {
        return Err(AdvertisementError::Truncated);
    }
    let (head, tail) = rest.split_at(len);
    *rest = tail;
    String::from_utf8(head.to_vec()).map_err(|_| AdvertisementError::InvalidUtf8)
}

/// Listener configuration resolved from the logger config.
#[derive(Clone, Debug)]
pub(crate) struct ListenerConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub service_type: String,
    /// When set, only advertisements carrying this exact name are accepted.
    pub service_name: Option<String>,
    /// Reject advertisements from outside the local network segment.
    pub local_only: bool,
}

impl ListenerConfig {
    /// Apply the service and scope filters to a parsed advertisement.
    fn accept(&self, advert: &Advertisement, source: SocketAddr) -> Option<Endpoint> {
        if advert.service_type != self.service_type {
            return None;
        }
        if let Some(name) = &self.service_name
            && &advert.service_name != name
        {
            return None;
        }
        if self.local_only && !is_local_address(source.ip()) {
            return None;
        }
        Some(Endpoint::new(source.ip().to_string(), advert.port))
    }
}

/// Whether an address belongs to the local network segment.
fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Coalesces duplicate advertisements of the same endpoint.
///
/// Viewers re-advertise continuously; an endpoint is only forwarded again
/// once it has been quiet for the refresh interval, so the candidate stream
/// stays recency-ordered instead of growing with every datagram.
pub(crate) struct CandidateTracker {
    last_forwarded: HashMap<Endpoint, Instant>,
    refresh: Duration,
}

impl CandidateTracker {
    pub fn new(refresh: Duration) -> Self {
        Self {
            last_forwarded: HashMap::new(),
            refresh,
        }
    }

    /// Record a sighting; returns true when the endpoint should be forwarded.
    pub fn observe(&mut self, endpoint: &Endpoint, now: Instant) -> bool {
        match self.last_forwarded.get(endpoint) {
            Some(last) if now.duration_since(*last) < self.refresh => false,
            _ => {
                self.last_forwarded.insert(endpoint.clone(), now);
                true
            }
        }
    }
}

/// Spawn the listener thread.
///
/// Candidates are forwarded over `candidates` only while `forwarding` is
/// set; `stop` ends the thread within one poll interval.
pub(crate) fn spawn_listener(
    config: ListenerConfig,
    candidates: Sender<Endpoint>,
    forwarding: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) -> io::Result<thread::JoinHandle<()>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))?;
    socket.join_multicast_v4(&config.group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    thread::Builder::new()
        .name("wirelog-discovery".into())
        .spawn(move || listen_loop(socket, config, candidates, forwarding, stop))
}

fn listen_loop(
    socket: UdpSocket,
    config: ListenerConfig,
    candidates: Sender<Endpoint>,
    forwarding: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) {
    let mut tracker = CandidateTracker::new(REFRESH_INTERVAL);
    let mut buf = [0u8; 512];
    while !stop.load(Ordering::Acquire) {
        let (len, source) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                warn!("wirelog: discovery receive failed: {err}");
                continue;
            }
        };

        let advert = match Advertisement::parse(&buf[..len]) {
            Ok(advert) => advert,
            // Foreign traffic on the group is expected; drop it quietly.
            Err(_) => continue,
        };

        let Some(endpoint) = config.accept(&advert, source) else {
            continue;
        };
        if !tracker.observe(&endpoint, Instant::now()) {
            continue;
        }
        if forwarding.load(Ordering::Acquire) {
            let _ = candidates.try_send(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(name: &str) -> Advertisement {
        Advertisement {
            port: 50000,
            service_type: DEFAULT_SERVICE_TYPE.into(),
            service_name: name.into(),
        }
    }

    fn config(name: Option<&str>, local_only: bool) -> ListenerConfig {
        ListenerConfig {
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_MULTICAST_PORT,
            service_type: DEFAULT_SERVICE_TYPE.into(),
            service_name: name.map(ToString::to_string),
            local_only,
        }
    }

    fn local_source() -> SocketAddr {
        "192.168.1.20:49000".parse().expect("socket addr")
    }

    #[test]
    fn advertisement_round_trips() {
        let original = advert("build-box");
        let parsed = Advertisement::parse(&original.encode()).expect("parse advertisement");
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_rejects_foreign_datagrams() {
        assert_eq!(
            Advertisement::parse(b"mdns junk on the group"),
            Err(AdvertisementError::BadMagic)
        );
        assert_eq!(
            Advertisement::parse(&[0x57]),
            Err(AdvertisementError::Truncated)
        );

        let mut future = advert("x").encode();
        future[5] = 9;
        assert_eq!(
            Advertisement::parse(&future),
            Err(AdvertisementError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn parse_rejects_truncated_text() {
        let mut data = advert("build-box").encode();
        data.truncate(data.len() - 3);
        assert_eq!(
            Advertisement::parse(&data),
            Err(AdvertisementError::Truncated)
        );
    }

    #[test]
    fn accept_filters_service_type_and_name() {
        let cfg = config(Some("build-box"), false);
        assert!(cfg.accept(&advert("build-box"), local_source()).is_some());
        assert!(cfg.accept(&advert("other-box"), local_source()).is_none());

        let mut wrong_type = advert("build-box");
        wrong_type.service_type = "_other._tcp".into();
        assert!(cfg.accept(&wrong_type, local_source()).is_none());
    }

    #[test]
    fn unnamed_browse_accepts_any_name() {
        let cfg = config(None, false);
        assert!(cfg.accept(&advert("anything"), local_source()).is_some());
        let endpoint = cfg.accept(&advert("anything"), local_source()).unwrap();
        assert_eq!(endpoint, Endpoint::new("192.168.1.20", 50000));
    }

    #[test]
    fn local_only_rejects_public_sources() {
        let cfg = config(None, true);
        assert!(cfg.accept(&advert("x"), local_source()).is_some());
        let public: SocketAddr = "203.0.113.9:49000".parse().expect("socket addr");
        assert!(cfg.accept(&advert("x"), public).is_none());
    }

    #[test]
    fn listener_forwards_and_coalesces_real_datagrams() {
        // Pick a UDP port that is free right now.
        let probe = UdpSocket::bind(("127.0.0.1", 0)).expect("bind probe");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);

        let listener_config = ListenerConfig {
            group: DEFAULT_MULTICAST_GROUP,
            port,
            service_type: DEFAULT_SERVICE_TYPE.into(),
            service_name: Some("it-viewer".into()),
            local_only: true,
        };
        let (candidates_tx, candidates_rx) = crossbeam_channel::bounded(8);
        let forwarding = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = match spawn_listener(
            listener_config,
            candidates_tx,
            Arc::clone(&forwarding),
            Arc::clone(&stop),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                // Some sandboxes cannot join multicast groups.
                eprintln!("skipping listener test, multicast unavailable: {err}");
                return;
            }
        };

        // Unicast reaches the bound socket just like group traffic would.
        let sender = UdpSocket::bind(("127.0.0.1", 0)).expect("bind sender");
        let datagram = advert("it-viewer").encode();
        for _ in 0..3 {
            sender
                .send_to(&datagram, ("127.0.0.1", port))
                .expect("send advertisement");
        }

        let endpoint = candidates_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("endpoint forwarded");
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", 50000));
        assert!(
            candidates_rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "duplicate advertisements must be coalesced"
        );

        stop.store(true, Ordering::Release);
        handle.join().expect("join listener");
    }

    #[test]
    fn tracker_coalesces_repeat_sightings() {
        let mut tracker = CandidateTracker::new(Duration::from_secs(5));
        let endpoint = Endpoint::new("192.168.1.20", 50000);
        let start = Instant::now();
        assert!(tracker.observe(&endpoint, start));
        assert!(!tracker.observe(&endpoint, start + Duration::from_secs(1)));
        assert!(tracker.observe(&endpoint, start + Duration::from_secs(6)));

        let other = Endpoint::new("192.168.1.21", 50000);
        assert!(tracker.observe(&other, start + Duration::from_secs(1)));
    }
}
