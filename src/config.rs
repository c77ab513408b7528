//! Logger configuration: option flags, endpoint sources, and tunables.
//!
//! Configuration is mutable until `start()`, which validates everything
//! eagerly and freezes it for the lifetime of the running instance.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

use crate::discovery::{
    DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT, DEFAULT_SERVICE_TYPE, ListenerConfig,
};
use crate::drop_warner::DEFAULT_WARN_INTERVAL;
use crate::ring_buffer::Capacity;
use crate::transport::{BackoffPolicy, Endpoint};

/// Default ring buffer bound.
pub const DEFAULT_CAPACITY: Capacity = Capacity::Records(2048);
/// Default connection timeout applied when establishing sockets.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default write timeout applied to socket writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default maximum encoded frame size in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20; // 1 MiB

/// Smallest max-frame-size that still fits a header and a short payload.
const MIN_FRAME_SIZE: usize = 64;

/// Behaviour flags, the named-field form of the original option bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoggerOptions {
    /// Echo each record to the local console as well.
    pub echo_to_console: bool,
    /// Buffer records while no viewer connection is active. When false,
    /// records logged while disconnected are dropped with a counter.
    pub buffer_until_connected: bool,
    /// Browse for viewer advertisements instead of a static endpoint.
    pub browse_discovery: bool,
    /// Only accept advertisements from the local network segment.
    pub local_domain_only: bool,
    /// Encrypt the viewer connection with TLS.
    pub use_tls: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            echo_to_console: false,
            buffer_until_connected: true,
            browse_discovery: false,
            local_domain_only: false,
            use_tls: false,
        }
    }
}

/// TLS settings applied when `use_tls` is set.
#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// Domain presented during the handshake; defaults to the endpoint host.
    pub domain: Option<String>,
    /// Skip certificate validation (viewers commonly use self-signed certs;
    /// also intended for tests).
    pub insecure_skip_verify: bool,
}

/// Discovery parameters supplied through `set_discovery`.
#[derive(Clone, Debug)]
pub(crate) struct DiscoverySetup {
    pub service_type: Option<String>,
    pub service_name: String,
}

/// Errors surfaced synchronously at `start()` or from config mutators.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration cannot change once the logger is running.
    #[error("logger already started")]
    AlreadyStarted,
    /// Neither a static endpoint nor discovery was configured.
    #[error("no viewer endpoint configured: set a host or enable discovery")]
    MissingEndpoint,
    /// The static endpoint host is empty or the port is zero.
    #[error("invalid viewer endpoint")]
    InvalidEndpoint,
    /// A discovery service name must be non-empty.
    #[error("discovery service name must not be empty")]
    EmptyServiceName,
    /// The buffer capacity must be non-zero.
    #[error("buffer capacity must be greater than zero")]
    InvalidCapacity,
    /// A duration or size tunable must be greater than zero.
    #[error("{0} must be greater than zero")]
    InvalidTunable(&'static str),
    /// Spawning the worker or binding the discovery socket failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Complete logger configuration; immutable after `start()`.
#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub options: LoggerOptions,
    pub(crate) static_endpoint: Option<Endpoint>,
    pub(crate) discovery: Option<DiscoverySetup>,
    pub capacity: Capacity,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_frame_size: usize,
    pub tls: TlsSettings,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub warn_interval: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            options: LoggerOptions::default(),
            static_endpoint: None,
            discovery: None,
            capacity: DEFAULT_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            backoff: BackoffPolicy::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tls: TlsSettings::default(),
            multicast_group: DEFAULT_MULTICAST_GROUP,
            multicast_port: DEFAULT_MULTICAST_PORT,
            warn_interval: DEFAULT_WARN_INTERVAL,
        }
    }
}

/// Endpoint source resolved by validation: exactly one of the two.
#[derive(Debug)]
pub(crate) enum ResolvedSource {
    Static(Endpoint),
    Discovery(ListenerConfig),
}

impl LoggerConfig {
    /// Validate the configuration and resolve the endpoint source.
    pub(crate) fn validate(&self) -> Result<ResolvedSource, ConfigError> {
        if self.capacity.is_zero() {
            return Err(ConfigError::InvalidCapacity);
        }
        ensure_nonzero(self.connect_timeout, "connect_timeout")?;
        ensure_nonzero(self.write_timeout, "write_timeout")?;
        ensure_nonzero(self.backoff.base, "backoff base")?;
        ensure_nonzero(self.backoff.cap, "backoff cap")?;
        if self.max_frame_size < MIN_FRAME_SIZE {
            return Err(ConfigError::InvalidTunable("max_frame_size"));
        }

        if let Some(endpoint) = &self.static_endpoint {
            if endpoint.host.is_empty() || endpoint.port == 0 {
                return Err(ConfigError::InvalidEndpoint);
            }
            return Ok(ResolvedSource::Static(endpoint.clone()));
        }

        if self.discovery.is_some() || self.options.browse_discovery {
            let (service_type, service_name) = match &self.discovery {
                Some(setup) => {
                    if setup.service_name.is_empty() {
                        return Err(ConfigError::EmptyServiceName);
                    }
                    (
                        setup
                            .service_type
                            .clone()
                            .unwrap_or_else(|| DEFAULT_SERVICE_TYPE.to_string()),
                        Some(setup.service_name.clone()),
                    )
                }
                // Flag-only browse: default type, any advertised name.
                None => (DEFAULT_SERVICE_TYPE.to_string(), None),
            };
            return Ok(ResolvedSource::Discovery(ListenerConfig {
                group: self.multicast_group,
                port: self.multicast_port,
                service_type,
                service_name,
                local_only: self.options.local_domain_only,
            }));
        }

        Err(ConfigError::MissingEndpoint)
    }
}

fn ensure_nonzero(value: Duration, field: &'static str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidTunable(field));
    }
    Ok(())
}
