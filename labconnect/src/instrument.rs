//! The [`InstrumentInterface`] trait that every message-based connection implements and the
//! [`InstrumentError`] that it returns.
//!
//! Instrument drivers should be written against `InstrumentInterface`, such that the same driver
//! works no matter if the instrument is attached via a serial port, a socket, a Prologix
//! controller or, in tests, a [`crate::LoopbackTransport`].

use std::{thread, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tracing::error;

use crate::{
    address::AddressError,
    block::{self, BlockError, BlockFormat, DataType},
    codec::CodecError,
    config::PropertyError,
    policy::{MessagePolicy, PolicyError, Termination},
    transport::TransportError,
};

/// Why a connection could not be configured.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The address is invalid.
    #[error(transparent)]
    Address(#[from] AddressError),
    /// A property has an invalid type or value.
    #[error(transparent)]
    Property(#[from] PropertyError),
    /// A setting was rejected.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// An argument is out of range.
    #[error("{0}")]
    InvalidArgument(String),
    /// The backend, interface or a feature is not available.
    #[error("{0}")]
    Unsupported(String),
}

/// The error enum of all message-based connections.
///
/// Every variant carries the address of the connection, so that the error tells which piece of
/// equipment failed. Errors of the underlying transport are kept as the [`std::error::Error::source`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstrumentError {
    /// Invalid configuration, e.g., a bad address, property or GPIB address.
    #[error("{address}: {source}")]
    Configuration {
        /// Address of the connection.
        address: String,
        /// What is wrong.
        source: ConfigError,
    },
    /// A message could not be encoded or decoded.
    #[error("{address}: {source}")]
    Encoding {
        /// Address of the connection.
        address: String,
        /// The codec error.
        source: CodecError,
    },
    /// The connection could not be established or broke down.
    #[error("{address}: {source}")]
    Connection {
        /// Address of the connection.
        address: String,
        /// The transport error.
        source: TransportError,
    },
    /// The operation did not finish within the timeout.
    #[error("{address}: Timeout occurred after {timeout:?}")]
    Timeout {
        /// Address of the connection.
        address: String,
        /// The timeout that was set.
        timeout: Option<Duration>,
        /// The transport error.
        source: TransportError,
    },
    /// A message grew larger than the maximum read size.
    #[error("{address}: len(message) [{len}] > max_read_size [{max_read_size}]")]
    ExceededMaxReadSize {
        /// Address of the connection.
        address: String,
        /// The number of bytes requested or received.
        len: usize,
        /// The maximum read size.
        max_read_size: usize,
    },
    /// A fixed-size read returned a different number of bytes.
    #[error("{address}: received {received} bytes, requested {requested} bytes")]
    SizeMismatch {
        /// Address of the connection.
        address: String,
        /// The number of bytes received.
        received: usize,
        /// The number of bytes requested.
        requested: usize,
    },
    /// A block of values could not be built or parsed.
    #[error("{address}: {source}")]
    Block {
        /// Address of the connection.
        address: String,
        /// The block error.
        source: BlockError,
    },
    /// The connection was disconnected.
    #[error("{address}: Disconnected")]
    Disconnected {
        /// Address of the connection.
        address: String,
    },
}

impl InstrumentError {
    /// Translate a transport error.
    ///
    /// # Arguments
    /// * `address` - Address of the connection.
    /// * `timeout` - The configured timeout, reported in timeout errors.
    /// * `err` - The transport error.
    pub fn from_transport(address: &str, timeout: Option<Duration>, err: TransportError) -> Self {
        let address = address.to_string();
        match err {
            TransportError::Timeout => {
                error!(%address, ?timeout, "Timeout occurred");
                InstrumentError::Timeout {
                    address,
                    timeout,
                    source: err,
                }
            }
            TransportError::ExceededMaxReadSize { len, max_read_size } => {
                InstrumentError::ExceededMaxReadSize {
                    address,
                    len,
                    max_read_size,
                }
            }
            TransportError::SizeMismatch {
                received,
                requested,
            } => InstrumentError::SizeMismatch {
                address,
                received,
                requested,
            },
            source => InstrumentError::Connection { address, source },
        }
    }

    /// Create a configuration error.
    pub fn configuration(address: &str, source: impl Into<ConfigError>) -> Self {
        InstrumentError::Configuration {
            address: address.to_string(),
            source: source.into(),
        }
    }

    /// The address of the connection that failed.
    pub fn address(&self) -> &str {
        match self {
            InstrumentError::Configuration { address, .. }
            | InstrumentError::Encoding { address, .. }
            | InstrumentError::Connection { address, .. }
            | InstrumentError::Timeout { address, .. }
            | InstrumentError::ExceededMaxReadSize { address, .. }
            | InstrumentError::SizeMismatch { address, .. }
            | InstrumentError::Block { address, .. }
            | InstrumentError::Disconnected { address } => address,
        }
    }

    /// Replace the address, e.g., when an error of a shared controller is reported for the
    /// device behind it.
    pub fn with_address(mut self, new: &str) -> Self {
        match &mut self {
            InstrumentError::Configuration { address, .. }
            | InstrumentError::Encoding { address, .. }
            | InstrumentError::Connection { address, .. }
            | InstrumentError::Timeout { address, .. }
            | InstrumentError::ExceededMaxReadSize { address, .. }
            | InstrumentError::SizeMismatch { address, .. }
            | InstrumentError::Block { address, .. }
            | InstrumentError::Disconnected { address } => *address = new.to_string(),
        }
        self
    }

    /// Whether the error is a connection error. Timeouts, oversized messages and operations on
    /// a disconnected connection are connection errors as well.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            InstrumentError::Connection { .. }
                | InstrumentError::Timeout { .. }
                | InstrumentError::ExceededMaxReadSize { .. }
                | InstrumentError::Disconnected { .. }
        )
    }

    /// Whether the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrumentError::Timeout { .. })
    }

    /// Whether the error is a configuration error. Encoding errors are configuration errors.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            InstrumentError::Configuration { .. } | InstrumentError::Encoding { .. }
        )
    }
}

/// The `InstrumentInterface` trait defines how to talk to an instrument with messages.
///
/// Implementations provide raw byte access, the message policy and its setters. Text messages,
/// queries and blocks of values are then provided on top of that. Setters return an error if the
/// new value is invalid or could not be applied to the transport.
pub trait InstrumentInterface: Send {
    /// The address of the connection.
    fn address(&self) -> &str;

    /// A snapshot of the termination, encoding, size and timeout settings.
    fn policy(&self) -> MessagePolicy;

    /// Set the read termination, `None` reads until `size` bytes arrived or `max_read_size` is
    /// exceeded.
    fn set_read_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError>;

    /// Set the write termination, `None` appends nothing to written messages.
    fn set_write_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError>;

    /// Set the encoding, e.g., `utf-8`, `ascii` or `latin-1`.
    fn set_encoding(&mut self, encoding: &str) -> Result<(), InstrumentError>;

    /// Set the error handler of the encoding, e.g., `strict` or `replace`.
    fn set_encoding_errors(&mut self, errors: &str) -> Result<(), InstrumentError>;

    /// Set the maximum number of bytes that a read may return.
    fn set_max_read_size(&mut self, size: i64) -> Result<(), InstrumentError>;

    /// Set the timeout in seconds. `None` or a negative value blocks forever.
    fn set_timeout(&mut self, seconds: Option<f64>) -> Result<(), InstrumentError>;

    /// Remove trailing whitespace from read messages.
    fn set_rstrip(&mut self, rstrip: bool) -> Result<(), InstrumentError>;

    /// Write bytes, the write termination is appended unless `data` already ends with it.
    ///
    /// Returns the number of bytes written.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, InstrumentError>;

    /// Read a message without decoding it.
    ///
    /// # Arguments
    /// * `size` - Read exactly this many bytes and ignore the read termination. `None` reads up
    ///   to the read termination, which is not part of the message.
    fn read_bytes(&mut self, size: Option<usize>) -> Result<Bytes, InstrumentError>;

    /// Disconnect. Calling this more than once is fine.
    fn disconnect(&mut self);

    /// Whether the connection is still usable.
    fn is_connected(&self) -> bool;

    /// The timeout of read and write operations.
    fn timeout(&self) -> Option<Duration> {
        self.policy().timeout()
    }

    /// Write a text message and return the number of bytes written.
    fn write(&mut self, message: &str) -> Result<usize, InstrumentError> {
        let data = self
            .policy()
            .encode_message(message)
            .map_err(|source| InstrumentError::Encoding {
                address: self.address().to_string(),
                source,
            })?;
        self.write_bytes(&data)
    }

    /// Read a text message.
    fn read(&mut self) -> Result<String, InstrumentError> {
        self.read_with(None)
    }

    /// Read a text message of exactly `size` bytes, or up to the read termination if `None`.
    fn read_with(&mut self, size: Option<usize>) -> Result<String, InstrumentError> {
        let data = self.read_bytes(size)?;
        self.policy()
            .decode_message(&data)
            .map_err(|source| InstrumentError::Encoding {
                address: self.address().to_string(),
                source,
            })
    }

    /// Write a message and read the reply.
    fn query(&mut self, message: &str) -> Result<String, InstrumentError> {
        self.query_with(message, Duration::ZERO, None)
    }

    /// Write a message, wait for `delay` and read the reply.
    ///
    /// # Arguments
    /// * `message` - The message to write.
    /// * `delay` - Time to wait between writing and reading.
    /// * `size` - See [`InstrumentInterface::read_bytes`].
    fn query_with(
        &mut self,
        message: &str,
        delay: Duration,
        size: Option<usize>,
    ) -> Result<String, InstrumentError> {
        self.write(message)?;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.read_with(size)
    }

    /// Write a message followed by a block of values.
    ///
    /// # Arguments
    /// * `message` - The message, e.g., a command header.
    /// * `values` - The values to append.
    /// * `format` - The block format.
    /// * `dtype` - How each value is stored.
    fn write_values(
        &mut self,
        message: &str,
        values: &[f64],
        format: BlockFormat,
        dtype: DataType,
    ) -> Result<usize, InstrumentError> {
        let policy = self.policy();
        let mut data = policy
            .encoding()
            .encode(message, policy.encoding_errors())
            .map_err(|source| InstrumentError::Encoding {
                address: self.address().to_string(),
                source,
            })?;
        let block = block::to_bytes(values, format, dtype).map_err(|source| {
            InstrumentError::Block {
                address: self.address().to_string(),
                source,
            }
        })?;
        data.extend_from_slice(&block);
        self.write_bytes(&data)
    }

    /// Read a block of values.
    fn read_values(
        &mut self,
        format: BlockFormat,
        dtype: DataType,
        size: Option<usize>,
    ) -> Result<Vec<f64>, InstrumentError> {
        let data = self.read_bytes(size)?;
        block::from_bytes(&data, format, dtype).map_err(|source| InstrumentError::Block {
            address: self.address().to_string(),
            source,
        })
    }

    /// Write a message and read a block of values as the reply.
    fn query_values(
        &mut self,
        message: &str,
        format: BlockFormat,
        dtype: DataType,
        delay: Duration,
    ) -> Result<Vec<f64>, InstrumentError> {
        self.write(message)?;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.read_values(format, dtype, None)
    }
}

impl<I: InstrumentInterface + ?Sized> InstrumentInterface for Box<I> {
    fn address(&self) -> &str {
        (**self).address()
    }

    fn policy(&self) -> MessagePolicy {
        (**self).policy()
    }

    fn set_read_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError> {
        (**self).set_read_termination(termination)
    }

    fn set_write_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError> {
        (**self).set_write_termination(termination)
    }

    fn set_encoding(&mut self, encoding: &str) -> Result<(), InstrumentError> {
        (**self).set_encoding(encoding)
    }

    fn set_encoding_errors(&mut self, errors: &str) -> Result<(), InstrumentError> {
        (**self).set_encoding_errors(errors)
    }

    fn set_max_read_size(&mut self, size: i64) -> Result<(), InstrumentError> {
        (**self).set_max_read_size(size)
    }

    fn set_timeout(&mut self, seconds: Option<f64>) -> Result<(), InstrumentError> {
        (**self).set_timeout(seconds)
    }

    fn set_rstrip(&mut self, rstrip: bool) -> Result<(), InstrumentError> {
        (**self).set_rstrip(rstrip)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, InstrumentError> {
        (**self).write_bytes(data)
    }

    fn read_bytes(&mut self, size: Option<usize>) -> Result<Bytes, InstrumentError> {
        (**self).read_bytes(size)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn query_with(
        &mut self,
        message: &str,
        delay: Duration,
        size: Option<usize>,
    ) -> Result<String, InstrumentError> {
        (**self).query_with(message, delay, size)
    }

    fn query_values(
        &mut self,
        message: &str,
        format: BlockFormat,
        dtype: DataType,
        delay: Duration,
    ) -> Result<Vec<f64>, InstrumentError> {
        (**self).query_values(message, format, dtype, delay)
    }
}
