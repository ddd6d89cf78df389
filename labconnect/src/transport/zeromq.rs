//! A ZeroMQ socket, a `REQ` socket unless configured otherwise.
//!
//! ZeroMQ delivers whole messages, so no termination sequences are used. A reply that is longer
//! than the requested size is trimmed and the rest is returned by the next read.

use std::{
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::{
    config::{Properties, PropertyError, PropertyValue},
    reader::{Framing, ReadRequest, read_message},
    transport::{Transport, TransportError},
};

/// The timeout of the TCP reachability check if no timeout is configured.
const PRECHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// ZeroMQ socket types by name and by number.
const SOCKET_TYPES: [(&str, i64, zmq::SocketType); 12] = [
    ("PAIR", 0, zmq::PAIR),
    ("PUB", 1, zmq::PUB),
    ("SUB", 2, zmq::SUB),
    ("REQ", 3, zmq::REQ),
    ("REP", 4, zmq::REP),
    ("DEALER", 5, zmq::DEALER),
    ("ROUTER", 6, zmq::ROUTER),
    ("PULL", 7, zmq::PULL),
    ("PUSH", 8, zmq::PUSH),
    ("XPUB", 9, zmq::XPUB),
    ("XSUB", 10, zmq::XSUB),
    ("STREAM", 11, zmq::STREAM),
];

/// Settings of a ZeroMQ socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZmqSettings {
    /// ZeroMQ transport protocol, e.g., `tcp` or `ipc`.
    pub protocol: String,
    /// The socket type.
    pub socket_type: zmq::SocketType,
}

impl Default for ZmqSettings {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            socket_type: zmq::REQ,
        }
    }
}

impl ZmqSettings {
    /// Read the settings from connection properties.
    ///
    /// Supported keys: `protocol` (default `tcp`) and `socket_type` (a name like `REQ` or
    /// `DEALER`, or the ZeroMQ number, default `REQ`).
    pub fn from_properties(properties: &Properties) -> Result<Self, PropertyError> {
        let mut settings = ZmqSettings::default();
        if let Some(protocol) = properties.get_text("protocol")? {
            settings.protocol = protocol.to_ascii_lowercase();
        }
        let socket_type = match properties.get("socket_type") {
            None => None,
            Some(PropertyValue::Text(name)) => {
                let name = name.to_ascii_uppercase();
                SOCKET_TYPES
                    .iter()
                    .find(|(known, _, _)| *known == name)
                    .map(|&(_, _, ty)| ty)
            }
            Some(PropertyValue::Int(number)) => SOCKET_TYPES
                .iter()
                .find(|(_, known, _)| known == number)
                .map(|&(_, _, ty)| ty),
            Some(other) => {
                return Err(PropertyError::Mismatch {
                    key: "socket_type".to_string(),
                    expected: "text or an integer",
                    found: other.type_name(),
                });
            }
        };
        if properties.contains("socket_type") {
            settings.socket_type = socket_type.ok_or_else(|| {
                PropertyError::invalid("socket_type", "unknown ZeroMQ socket type")
            })?;
        }
        Ok(settings)
    }
}

/// A transport over a ZeroMQ socket.
pub struct ZmqTransport {
    host: String,
    port: u16,
    settings: ZmqSettings,
    context: zmq::Context,
    socket: Option<zmq::Socket>,
    timeout: Option<Duration>,
    max_read_size: usize,
    buffer: BytesMut,
}

impl std::fmt::Debug for ZmqTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqTransport")
            .field("endpoint", &self.endpoint())
            .field("socket_type", &self.settings.socket_type)
            .field("connected", &self.socket.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    timeout.map_or(-1, |t| i32::try_from(t.as_millis()).unwrap_or(i32::MAX))
}

impl ZmqTransport {
    /// Try to connect a socket to `<protocol>://<host>:<port>`.
    ///
    /// ZeroMQ connects lazily. For the `tcp` protocol, a plain TCP connection to the peer is
    /// opened and closed first so that an unreachable host is reported right away.
    ///
    /// # Arguments
    /// * `host` - Host name or IP address.
    /// * `port` - Port number.
    /// * `settings` - Protocol and socket type.
    /// * `timeout` - Timeout of the send and receive operations.
    /// * `max_read_size` - Largest message that is accepted.
    pub fn try_new(
        host: &str,
        port: u16,
        settings: ZmqSettings,
        timeout: Option<Duration>,
        max_read_size: usize,
    ) -> Result<Self, TransportError> {
        let mut transport = Self {
            host: host.to_string(),
            port,
            settings,
            context: zmq::Context::new(),
            socket: None,
            timeout,
            max_read_size,
            buffer: BytesMut::new(),
        };
        transport.connect()?;
        Ok(transport)
    }

    /// The endpoint the socket connects to.
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.settings.protocol, self.host, self.port)
    }

    /// Close the socket and connect again.
    ///
    /// # Arguments
    /// * `max_attempts` - Maximum number of attempts, `None` or `Some(0)` retries until a
    ///   connection succeeds.
    pub fn reconnect(&mut self, max_attempts: Option<u32>) -> Result<(), TransportError> {
        self.close();
        let max_attempts = max_attempts.filter(|&n| n > 0);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connect() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(endpoint = %self.endpoint(), attempt, %err, "Reconnect failed");
                    if max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn precheck(&self) -> Result<(), TransportError> {
        let timeout = self.timeout.filter(|t| !t.is_zero()).unwrap_or(PRECHECK_TIMEOUT);
        let mut last = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(_) => return Ok(()),
                Err(err) => last = Some(err),
            }
        }
        Err(last.map_or(
            TransportError::Unsupported(format!("cannot resolve {}", self.host)),
            TransportError::from,
        ))
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        if self.settings.protocol == "tcp" {
            self.precheck()?;
        }
        let socket = self.context.socket(self.settings.socket_type)?;
        socket.set_linger(0)?;
        if self.settings.socket_type == zmq::REQ {
            socket.set_req_relaxed(true)?;
            socket.set_req_correlate(true)?;
        }
        socket.set_rcvtimeo(timeout_ms(self.timeout))?;
        socket.set_sndtimeo(timeout_ms(self.timeout))?;
        socket.set_maxmsgsize(i64::try_from(self.max_read_size).unwrap_or(i64::MAX))?;
        socket.connect(&self.endpoint())?;
        info!(endpoint = %self.endpoint(), "Connected");
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
        self.buffer.clear();
    }
}

impl Transport for ZmqTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        socket.send(data, 0)?;
        Ok(data.len())
    }

    fn read_bytes(&mut self, request: &ReadRequest<'_>) -> Result<Bytes, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        let message = read_message(&mut self.buffer, request, Framing::Message, |buf, _| {
            let reply = socket.recv_bytes(0)?;
            buf.extend_from_slice(&reply);
            Ok(reply.len())
        })?;
        debug!(len = message.len(), buffered = self.buffer.len(), "ZeroMQ read");
        Ok(message)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.timeout = timeout;
        if let Some(socket) = &self.socket {
            socket.set_rcvtimeo(timeout_ms(timeout))?;
            socket.set_sndtimeo(timeout_ms(timeout))?;
        }
        Ok(())
    }

    fn set_max_read_size(&mut self, size: usize) -> Result<(), TransportError> {
        self.max_read_size = size;
        if let Some(socket) = &self.socket {
            socket.set_maxmsgsize(i64::try_from(size).unwrap_or(i64::MAX))?;
        }
        Ok(())
    }

    fn uses_termination(&self) -> bool {
        false
    }

    fn disconnect(&mut self) {
        if self.socket.is_some() {
            self.close();
            info!(endpoint = %self.endpoint(), "Disconnected");
        }
    }
}
