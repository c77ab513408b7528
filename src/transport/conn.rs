//! Connection primitives: endpoints, TLS options, and the active socket.

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};

/// Host and port identifying a viewer process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(|iter| iter.collect())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// TLS options for the encrypted transport.
#[derive(Clone, Debug)]
pub struct TlsOptions {
    /// Domain name presented during the handshake.
    pub domain: String,
    /// Skip certificate validation when true (intended for tests).
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    fn connector(&self) -> io::Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if self.insecure_skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        builder.build().map_err(io::Error::other)
    }
}

/// One live session to a viewer. At most one is active per logger.
pub enum ActiveConnection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ActiveConnection {
    /// Update the write timeout for the underlying socket.
    pub fn set_write_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        match self {
            ActiveConnection::Plain(stream) => stream.set_write_timeout(Some(timeout)),
            ActiveConnection::Tls(stream) => stream.get_ref().set_write_timeout(Some(timeout)),
        }
    }

    /// Write a full frame to the socket.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            ActiveConnection::Plain(stream) => stream.write_all(buf),
            ActiveConnection::Tls(stream) => stream.write_all(buf),
        }
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            ActiveConnection::Plain(stream) => stream.flush(),
            ActiveConnection::Tls(stream) => stream.flush(),
        }
    }
}

/// Open a TCP socket to the endpoint, trying each resolved address.
pub fn connect_tcp(endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in endpoint.socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {endpoint}"),
        )
    }))
}

/// Complete the TLS handshake over an established socket.
///
/// The socket carries temporary read/write timeouts for the handshake so a
/// stalled peer cannot wedge the worker, then reverts to blocking mode.
pub fn wrap_tls(
    stream: TcpStream,
    tls: &TlsOptions,
    handshake_timeout: Duration,
) -> io::Result<ActiveConnection> {
    let connector = tls.connector()?;
    stream.set_read_timeout(Some(handshake_timeout))?;
    stream.set_write_timeout(Some(handshake_timeout))?;
    let stream = connector
        .connect(&tls.domain, stream)
        .map_err(io::Error::other)?;
    let tcp_ref = stream.get_ref();
    tcp_ref.set_read_timeout(None)?;
    tcp_ref.set_write_timeout(None)?;
    Ok(ActiveConnection::Tls(Box::new(stream)))
}
