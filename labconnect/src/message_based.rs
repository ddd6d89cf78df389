//! A message-based connection on top of any [`Transport`].

use std::{thread, time::Duration};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    instrument::{InstrumentError, InstrumentInterface},
    policy::{MessagePolicy, Termination},
    reader::ReadRequest,
    transport::{Transport, TransportError},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Connected,
    Disconnected,
}

/// A message-based connection.
///
/// `MessageBased` owns a transport and a [`MessagePolicy`]. Text is encoded and terminated on
/// write, reads return one message without its termination. If the transport can recover from a
/// failure, e.g., a socket that reconnects after the peer reset the connection, the failed
/// operation is repeated once.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
///
/// use labconnect::{InstrumentInterface, MessageBased, MessagePolicy};
/// use labconnect::transport::{SocketSettings, SocketTransport};
///
/// let transport = SocketTransport::try_new(
///     "192.168.1.10",
///     5025,
///     SocketSettings::default(),
///     Some(Duration::from_secs(2)),
/// )
/// .unwrap();
/// let mut inst = MessageBased::new("TCP::192.168.1.10::5025", transport, MessagePolicy::default())
///     .unwrap();
/// println!("{}", inst.query("*IDN?").unwrap());
/// ```
#[derive(Debug)]
pub struct MessageBased<T: Transport> {
    address: String,
    transport: T,
    policy: MessagePolicy,
    state: State,
}

impl<T: Transport> MessageBased<T> {
    /// Create a new connection.
    ///
    /// The timeout and maximum read size of the policy are pushed to the transport. Transports
    /// that deliver whole messages get a policy without terminations.
    ///
    /// # Arguments
    /// * `address` - The address, used in log messages and errors.
    /// * `transport` - A connected transport.
    /// * `policy` - Termination, encoding, size and timeout settings.
    pub fn new(
        address: &str,
        mut transport: T,
        mut policy: MessagePolicy,
    ) -> Result<Self, InstrumentError> {
        if !transport.uses_termination() {
            policy
                .set_read_termination(None)
                .and_then(|()| policy.set_write_termination(None))
                .map_err(|err| InstrumentError::configuration(address, err))?;
        }
        let timeout = policy.timeout();
        transport
            .set_timeout(timeout)
            .and_then(|()| transport.set_max_read_size(policy.max_read_size()))
            .map_err(|err| InstrumentError::from_transport(address, timeout, err))?;
        info!(address, "Connected");
        Ok(Self {
            address: address.to_string(),
            transport,
            policy,
            state: State::Connected,
        })
    }

    /// The transport of this connection.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the transport of this connection.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn error(&self, err: TransportError) -> InstrumentError {
        InstrumentError::from_transport(&self.address, self.policy.timeout(), err)
    }

    fn ensure_connected(&self) -> Result<(), InstrumentError> {
        match self.state {
            State::Connected => Ok(()),
            State::Disconnected => Err(InstrumentError::Disconnected {
                address: self.address.clone(),
            }),
        }
    }

    /// Run `op`, repeat it once if the transport recovered from the failure.
    fn run<R>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<R, TransportError>,
    ) -> Result<R, InstrumentError> {
        self.ensure_connected()?;
        let err = match op(self) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        match self.transport.recover(&err) {
            Ok(true) => {
                info!(address = %self.address, %err, "Recovered, retrying");
                op(self).map_err(|err| self.error(err))
            }
            Ok(false) => Err(self.error(err)),
            Err(recover_err) => {
                warn!(address = %self.address, %recover_err, "Recovery failed");
                Err(self.error(err))
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        debug!(address = %self.address, data = ?Bytes::copy_from_slice(data), "Write");
        self.transport.write_bytes(data)
    }

    fn receive(&mut self, size: Option<usize>) -> Result<Bytes, TransportError> {
        let request = ReadRequest {
            size,
            termination: self.policy.read_termination(),
            max_read_size: self.policy.max_read_size(),
            timeout: self.policy.timeout(),
        };
        let message = self.transport.read_bytes(&request)?;
        if let Some(requested) = size {
            if message.len() != requested {
                return Err(TransportError::SizeMismatch {
                    received: message.len(),
                    requested,
                });
            }
        }
        debug!(address = %self.address, data = ?message, "Read");
        Ok(message)
    }

    fn check_size(&self, size: Option<usize>) -> Result<(), InstrumentError> {
        let max_read_size = self.policy.max_read_size();
        match size {
            Some(len) if len > max_read_size => Err(InstrumentError::ExceededMaxReadSize {
                address: self.address.clone(),
                len,
                max_read_size,
            }),
            _ => Ok(()),
        }
    }

    fn decode(&self, data: &[u8]) -> Result<String, InstrumentError> {
        self.policy
            .decode_message(data)
            .map_err(|source| InstrumentError::Encoding {
                address: self.address.clone(),
                source,
            })
    }
}

impl<T: Transport> InstrumentInterface for MessageBased<T> {
    fn address(&self) -> &str {
        &self.address
    }

    fn policy(&self) -> MessagePolicy {
        self.policy.clone()
    }

    fn set_read_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError> {
        self.policy
            .set_read_termination(termination)
            .map_err(|err| InstrumentError::configuration(&self.address, err))
    }

    fn set_write_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError> {
        self.policy
            .set_write_termination(termination)
            .map_err(|err| InstrumentError::configuration(&self.address, err))
    }

    fn set_encoding(&mut self, encoding: &str) -> Result<(), InstrumentError> {
        self.policy
            .set_encoding(encoding)
            .map_err(|err| InstrumentError::configuration(&self.address, err))
    }

    fn set_encoding_errors(&mut self, errors: &str) -> Result<(), InstrumentError> {
        self.policy
            .set_encoding_errors(errors)
            .map_err(|err| InstrumentError::configuration(&self.address, err))
    }

    fn set_max_read_size(&mut self, size: i64) -> Result<(), InstrumentError> {
        self.policy
            .set_max_read_size(size)
            .map_err(|err| InstrumentError::configuration(&self.address, err))?;
        self.transport
            .set_max_read_size(self.policy.max_read_size())
            .map_err(|err| self.error(err))
    }

    fn set_timeout(&mut self, seconds: Option<f64>) -> Result<(), InstrumentError> {
        self.policy.set_timeout(seconds);
        self.transport
            .set_timeout(self.policy.timeout())
            .map_err(|err| self.error(err))
    }

    fn set_rstrip(&mut self, rstrip: bool) -> Result<(), InstrumentError> {
        self.policy.set_rstrip(rstrip);
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, InstrumentError> {
        let data = self.policy.terminate(data.to_vec());
        self.run(|this| this.send(&data))
    }

    fn read_bytes(&mut self, size: Option<usize>) -> Result<Bytes, InstrumentError> {
        self.ensure_connected()?;
        self.check_size(size)?;
        self.run(|this| this.receive(size))
    }

    fn query_with(
        &mut self,
        message: &str,
        delay: Duration,
        size: Option<usize>,
    ) -> Result<String, InstrumentError> {
        self.ensure_connected()?;
        self.check_size(size)?;
        let data = self
            .policy
            .encode_message(message)
            .map_err(|source| InstrumentError::Encoding {
                address: self.address.clone(),
                source,
            })?;
        let reply = self.run(|this| {
            this.send(&data)?;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            this.receive(size)
        })?;
        self.decode(&reply)
    }

    fn disconnect(&mut self) {
        if self.state == State::Connected {
            self.state = State::Disconnected;
            self.transport.disconnect();
            info!(address = %self.address, "Disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.state == State::Connected
    }
}
