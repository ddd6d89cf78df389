//! Transports move raw bytes between the host and a device.
//!
//! A [`Transport`] knows how to write bytes, how to pull bytes from its device and how to keep
//! its native timeout in sync. It does not know anything about encodings: the
//! [`crate::MessageBased`] connection wraps a transport and takes care of that.
//!
//! The following transports are provided:
//! - [`SocketTransport`] for TCP and UDP sockets.
//! - [`SerialTransport`] for serial ports (feature `serial`).
//! - [`ZmqTransport`] for ZeroMQ request/reply sockets (feature `zeromq`).
//!
//! The [`crate::LoopbackTransport`] is a scripted transport to test drivers with.

use std::{io, time::Duration};

use bytes::Bytes;
use thiserror::Error;

use crate::reader::ReadRequest;

#[cfg(feature = "serial")]
mod serial;
mod serial_settings;
mod socket;
#[cfg(feature = "zeromq")]
mod zeromq;

#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use serial_settings::{DataBits, Parity, SerialSettings, StopBits};
pub use socket::{SocketSettings, SocketTransport};
#[cfg(feature = "zeromq")]
pub use zeromq::{ZmqSettings, ZmqTransport};

/// Errors that a transport can return.
///
/// These errors never reach the user directly: the message-based connection translates them
/// into an [`crate::InstrumentError`] that carries the address of the connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The native timeout of the transport expired.
    #[error("timed out")]
    Timeout,
    /// The peer closed or reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,
    /// The transport was disconnected.
    #[error("not connected")]
    NotConnected,
    /// More bytes were requested or accumulated than allowed.
    #[error("len(message) [{len}] > max_read_size [{max_read_size}]")]
    ExceededMaxReadSize {
        /// The number of bytes requested or accumulated.
        len: usize,
        /// The maximum number of bytes that may be read.
        max_read_size: usize,
    },
    /// A fixed-size read ended early.
    #[error("received {received} bytes, requested {requested} bytes")]
    SizeMismatch {
        /// The number of bytes received.
        received: usize,
        /// The number of bytes requested.
        requested: usize,
    },
    /// The operation is not supported by this transport.
    #[error("{0}")]
    Unsupported(String),
    /// Any other I/O error.
    #[error(transparent)]
    Io(io::Error),
    #[cfg(feature = "serial")]
    /// Errors of the [`serialport`] crate.
    #[error(transparent)]
    Serialport(#[from] serialport::Error),
    #[cfg(feature = "zeromq")]
    /// Errors of the [`zmq`] crate.
    #[error(transparent)]
    Zmq(zmq::Error),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => TransportError::ConnectionReset,
            _ => TransportError::Io(err),
        }
    }
}

#[cfg(feature = "zeromq")]
impl From<zmq::Error> for TransportError {
    fn from(err: zmq::Error) -> Self {
        match err {
            zmq::Error::EAGAIN => TransportError::Timeout,
            err => TransportError::Zmq(err),
        }
    }
}

/// The contract between a message-based connection and the device it talks to.
///
/// Implement this trait to bring your own transport, e.g., a USB bulk endpoint. Only writing and
/// reading are required, the remaining methods have defaults for transports without a native
/// timeout or the ability to reconnect.
pub trait Transport: Send {
    /// Write all bytes to the device and return the number of bytes written.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read a single message from the device.
    ///
    /// Implementations usually call [`crate::reader::read_message`] with a closure that pulls
    /// bytes from the device.
    fn read_bytes(&mut self, request: &ReadRequest<'_>) -> Result<Bytes, TransportError>;

    /// Propagate a new timeout to the native primitive of the transport.
    fn set_timeout(&mut self, _timeout: Option<Duration>) -> Result<(), TransportError> {
        Ok(())
    }

    /// Propagate a new maximum read size to the transport.
    fn set_max_read_size(&mut self, _size: usize) -> Result<(), TransportError> {
        Ok(())
    }

    /// Whether messages on this transport are delimited by termination sequences.
    ///
    /// Transports that deliver whole messages return `false`, the connection then clears its
    /// terminations.
    fn uses_termination(&self) -> bool {
        true
    }

    /// Try to recover from `error`. Returns `true` if the failed operation should be retried.
    fn recover(&mut self, _error: &TransportError) -> Result<bool, TransportError> {
        Ok(false)
    }

    /// Close the transport. Calling this more than once is fine.
    fn disconnect(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write_bytes(data)
    }

    fn read_bytes(&mut self, request: &ReadRequest<'_>) -> Result<Bytes, TransportError> {
        (**self).read_bytes(request)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        (**self).set_timeout(timeout)
    }

    fn set_max_read_size(&mut self, size: usize) -> Result<(), TransportError> {
        (**self).set_max_read_size(size)
    }

    fn uses_termination(&self) -> bool {
        (**self).uses_termination()
    }

    fn recover(&mut self, error: &TransportError) -> Result<bool, TransportError> {
        (**self).recover(error)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let timeout: TransportError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(timeout, TransportError::Timeout));
        let reset: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(reset, TransportError::ConnectionReset));
        let other: TransportError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(other, TransportError::Io(_)));
    }
}
