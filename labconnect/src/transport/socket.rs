//! A TCP or UDP socket with an internal byte buffer.
//!
//! The socket is created with [`socket2`] so that the address family, the socket type and the
//! protocol can be configured, and is then used as a [`std::net::TcpStream`] or
//! [`std::net::UdpSocket`].

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::{
    config::{Properties, PropertyError, PropertyValue},
    reader::{Framing, ReadRequest, read_message},
    transport::{Transport, TransportError},
};

/// The default number of bytes to receive at a time.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Settings of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketSettings {
    /// Use the IPv6 address family instead of IPv4.
    pub ipv6: bool,
    /// Use a connectionless datagram (UDP) socket instead of a stream (TCP) socket.
    pub datagram: bool,
    /// Protocol number, `None` selects the default protocol of the socket type.
    pub proto: Option<i32>,
    /// The maximum number of bytes to receive at a time.
    pub buffer_size: usize,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            ipv6: false,
            datagram: false,
            proto: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl SocketSettings {
    /// Read the settings from connection properties.
    ///
    /// Supported keys: `family` (`AF_INET`, `AF_INET6` or the platform's number),
    /// `socket_type` (`SOCK_STREAM`, `SOCK_DGRAM` or the platform's number), `proto` and
    /// `buffer_size`. The socket type must agree with the address.
    ///
    /// # Arguments
    /// * `properties` - The connection properties.
    /// * `datagram` - Whether the address asks for a UDP socket.
    pub fn from_properties(properties: &Properties, datagram: bool) -> Result<Self, PropertyError> {
        let mut settings = SocketSettings {
            datagram,
            ..Default::default()
        };
        if let Some(size) = properties.get_int("buffer_size")? {
            settings.buffer_size = usize::try_from(size)
                .ok()
                .filter(|&size| size > 0)
                .ok_or_else(|| PropertyError::invalid("buffer_size", "must be > 0"))?;
        }
        if let Some(domain) = socket_constant(properties, "family", "AF_", &FAMILIES)? {
            settings.ipv6 = domain == Domain::IPV6.into();
        }
        if let Some(ty) = socket_constant(properties, "socket_type", "SOCK_", &SOCKET_TYPES)? {
            if (ty == Type::DGRAM.into()) != datagram {
                return Err(PropertyError::invalid(
                    "socket_type",
                    "does not match the address",
                ));
            }
        }
        if let Some(proto) = properties.get_int("proto")? {
            let proto = i32::try_from(proto)
                .map_err(|_| PropertyError::invalid("proto", "out of range"))?;
            settings.proto = Some(proto);
        }
        Ok(settings)
    }
}

const FAMILIES: [(&str, Domain); 2] = [("INET", Domain::IPV4), ("INET6", Domain::IPV6)];

const SOCKET_TYPES: [(&str, Type); 2] = [("STREAM", Type::STREAM), ("DGRAM", Type::DGRAM)];

/// Look up a socket constant given by name, with or without `prefix`, or by number.
fn socket_constant<T: Copy + Into<i32>>(
    properties: &Properties,
    key: &str,
    prefix: &str,
    known: &[(&str, T)],
) -> Result<Option<i32>, PropertyError> {
    let value = match properties.get(key) {
        None => return Ok(None),
        Some(PropertyValue::Int(number)) => known
            .iter()
            .map(|&(_, constant)| Into::<i32>::into(constant))
            .find(|&constant| i64::from(constant) == *number),
        Some(PropertyValue::Text(name)) => {
            let name = name.to_ascii_uppercase();
            let name = name.strip_prefix(prefix).unwrap_or(&name);
            known
                .iter()
                .find(|(known_name, _)| *known_name == name)
                .map(|&(_, constant)| Into::<i32>::into(constant))
        }
        Some(other) => {
            return Err(PropertyError::Mismatch {
                key: key.to_string(),
                expected: "text or an integer",
                found: other.type_name(),
            });
        }
    };
    value
        .map(Some)
        .ok_or_else(|| PropertyError::invalid(key, "unsupported value"))
}

#[derive(Debug)]
enum Stream {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Stream {
    fn set_timeouts(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Stream::Udp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Udp(s) => s.set_read_timeout(timeout),
        }
    }
}

/// A transport over a TCP or UDP socket.
///
/// Received bytes are kept in a buffer, bytes that arrived after a complete message are returned
/// by the next read. If the peer resets a TCP connection, the transport reconnects once and
/// the connection retries the failed operation.
#[derive(Debug)]
pub struct SocketTransport {
    host: String,
    port: u16,
    settings: SocketSettings,
    timeout: Option<Duration>,
    stream: Option<Stream>,
    buffer: BytesMut,
    chunk: Vec<u8>,
    reconnect_count: usize,
}

impl SocketTransport {
    /// Try to open a socket to `host:port`.
    ///
    /// TCP sockets connect immediately. UDP sockets are connectionless, but are bound to the
    /// peer so that only its datagrams are received.
    ///
    /// # Arguments
    /// * `host` - Host name or IP address.
    /// * `port` - Port number.
    /// * `settings` - Family, type, protocol and chunk size of the socket.
    /// * `timeout` - Timeout for connecting and for every read and write.
    pub fn try_new(
        host: &str,
        port: u16,
        settings: SocketSettings,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let mut transport = Self {
            host: host.to_string(),
            port,
            settings,
            timeout,
            stream: None,
            buffer: BytesMut::with_capacity(settings.buffer_size),
            chunk: vec![0; settings.buffer_size.max(1)],
            reconnect_count: 0,
        };
        transport.connect()?;
        Ok(transport)
    }

    /// Host name or IP address of the peer.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the peer.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The settings the socket was created with.
    pub fn settings(&self) -> &SocketSettings {
        &self.settings
    }

    /// Number of bytes that were received but not read yet.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// How often the socket was reconnected.
    pub fn reconnect_count(&self) -> usize {
        self.reconnect_count
    }

    /// Close the socket and connect again.
    ///
    /// Buffered bytes are discarded.
    ///
    /// # Arguments
    /// * `max_attempts` - Maximum number of connection attempts. `None` or `Some(0)` tries until
    ///   a connection succeeds. The error of the last attempt is returned.
    pub fn reconnect(&mut self, max_attempts: Option<u32>) -> Result<(), TransportError> {
        self.stream = None;
        self.buffer.clear();

        let max_attempts = max_attempts.filter(|&n| n > 0);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connect() {
                Ok(()) => {
                    self.reconnect_count += 1;
                    info!(host = %self.host, port = self.port, attempt, "Reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(host = %self.host, port = self.port, attempt, %err, "Reconnect failed");
                    if max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn resolve(&self) -> Result<SocketAddr, TransportError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .find(|addr| addr.is_ipv6() == self.settings.ipv6)
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}:{}", self.host, self.port),
                ))
            })
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        let addr = self.resolve()?;
        let domain = if self.settings.ipv6 {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let (ty, default_proto) = if self.settings.datagram {
            (Type::DGRAM, Protocol::UDP)
        } else {
            (Type::STREAM, Protocol::TCP)
        };
        let proto = self.settings.proto.map_or(default_proto, Protocol::from);

        let socket = Socket::new(domain, ty, Some(proto))?;
        match self.timeout {
            Some(timeout) if !self.settings.datagram && !timeout.is_zero() => {
                socket.connect_timeout(&addr.into(), timeout)?
            }
            _ => socket.connect(&addr.into())?,
        }

        let stream = if self.settings.datagram {
            Stream::Udp(socket.into())
        } else {
            Stream::Tcp(socket.into())
        };
        stream.set_timeouts(self.timeout.filter(|t| !t.is_zero()))?;
        info!(host = %self.host, port = self.port, udp = self.settings.datagram, "Connected");
        self.stream = Some(stream);
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        match self.stream.as_mut().ok_or(TransportError::NotConnected)? {
            Stream::Tcp(s) => {
                s.write_all(data)?;
                s.flush()?;
            }
            Stream::Udp(s) => {
                s.send(data)?;
            }
        }
        Ok(data.len())
    }

    fn read_bytes(&mut self, request: &ReadRequest<'_>) -> Result<Bytes, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let chunk = &mut self.chunk;
        let configured = self.timeout.filter(|t| !t.is_zero());
        let mut shortened = false;

        let result = read_message(&mut self.buffer, request, Framing::Stream, |buf, remaining| {
            if let Some(remaining) = remaining {
                stream.set_read_timeout(Some(remaining))?;
                shortened = true;
            }
            let received = match &mut *stream {
                Stream::Tcp(s) => match s.read(&mut chunk[..])? {
                    0 => return Err(TransportError::ConnectionReset),
                    n => n,
                },
                Stream::Udp(s) => s.recv(&mut chunk[..])?,
            };
            buf.extend_from_slice(&chunk[..received]);
            Ok(received)
        });

        if shortened {
            stream.set_read_timeout(configured)?;
        }
        let message = result?;
        debug!(len = message.len(), buffered = self.buffer.len(), "Socket read");
        Ok(message)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.timeout = timeout;
        if let Some(stream) = &self.stream {
            stream.set_timeouts(timeout.filter(|t| !t.is_zero()))?;
        }
        Ok(())
    }

    fn recover(&mut self, error: &TransportError) -> Result<bool, TransportError> {
        if self.settings.datagram || !matches!(error, TransportError::ConnectionReset) {
            return Ok(false);
        }
        self.reconnect(Some(1))?;
        Ok(true)
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            self.buffer.clear();
            info!(host = %self.host, port = self.port, "Disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_connect_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut transport =
            SocketTransport::try_new("127.0.0.1", port, SocketSettings::default(), None).unwrap();
        assert_eq!(transport.host(), "127.0.0.1");
        assert_eq!(transport.port(), port);
        assert_eq!(transport.reconnect_count(), 0);

        transport.disconnect();
        transport.disconnect();
        assert!(matches!(
            transport.write_bytes(b"x"),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = SocketTransport::try_new(
            "127.0.0.1",
            port,
            SocketSettings::default(),
            Some(Duration::from_secs(1)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_settings_from_properties() {
        let properties = Properties::new()
            .with("buffer_size", 512)
            .with("family", "AF_INET6")
            .with("socket_type", "sock_dgram");
        let settings = SocketSettings::from_properties(&properties, true).unwrap();
        assert!(settings.datagram);
        assert!(settings.ipv6);
        assert_eq!(settings.buffer_size, 512);
        assert_eq!(settings.proto, None);

        let properties = Properties::new()
            .with("family", i64::from(i32::from(Domain::IPV4)))
            .with("socket_type", "STREAM");
        let settings = SocketSettings::from_properties(&properties, false).unwrap();
        assert!(!settings.ipv6);
        assert!(!settings.datagram);
    }

    #[test]
    fn test_invalid_socket_settings() {
        for properties in [
            Properties::new().with("buffer_size", 0),
            Properties::new().with("family", "AF_UNIX"),
            Properties::new().with("family", true),
            Properties::new().with("socket_type", "SOCK_RAW"),
            Properties::new().with("socket_type", "SOCK_DGRAM"),
        ] {
            assert!(SocketSettings::from_properties(&properties, false).is_err());
        }
    }
}
