//! The loopback module provides an instrument simulator for testing purposes.
//!
//! The [`LoopbackTransport`] is scripted with the bytes that are expected from the host and the
//! bytes the instrument answers with. Wrap it in a [`crate::MessageBased`] connection and hand
//! that to your driver: every write is compared to the next expected write, and reads are served
//! from the scripted replies. When the transport is dropped, it panics if not all scripted bytes
//! were used.
//!
//! # Example
//! ```
//! use labconnect::{InstrumentInterface, LoopbackTransport, MessageBased, MessagePolicy};
//!
//! let transport = LoopbackTransport::from_text(&["*IDN?\r\n"], &["Loopback,0,0,1.0\n"]);
//! let mut inst = MessageBased::new("loopback", transport, MessagePolicy::default()).unwrap();
//! assert_eq!(inst.query("*IDN?").unwrap(), "Loopback,0,0,1.0");
//! ```

use std::{thread, time::Instant};

use bytes::{Bytes, BytesMut};

use crate::{
    reader::{Framing, ReadRequest, read_message},
    transport::{Transport, TransportError},
};

/// A self-incrementing index structure that by default starts at 0 and increments whenever `next`
/// is called.
#[derive(Debug, Default)]
struct IncrIndex {
    index: usize,
}

impl IncrIndex {
    fn next(&mut self) -> usize {
        let current = self.index;
        self.index += 1;
        current
    }

    fn current(&self) -> usize {
        self.index
    }
}

/// What happened on a [`LoopbackTransport`].
#[derive(Clone, Debug, PartialEq)]
pub enum LoopbackEvent {
    /// The host wrote these bytes.
    Write(Vec<u8>),
    /// The host read this message.
    Read(Bytes),
    /// A read timed out.
    Timeout,
}

/// A transport that replays a script instead of talking to a device.
#[derive(Debug)]
pub struct LoopbackTransport {
    from_host: Vec<Vec<u8>>,
    from_inst: Vec<Vec<u8>>,
    from_host_index: IncrIndex,
    from_inst_index: IncrIndex,
    buffer: BytesMut,
    log: Vec<(Instant, LoopbackEvent)>,
    connected: bool,
}

impl LoopbackTransport {
    /// Create a new loopback transport.
    ///
    /// Each entry of `from_inst` is delivered by a single receive, so a message may be split
    /// into several entries or several messages may share one entry.
    ///
    /// # Arguments:
    /// * `from_host` - Bytes that the host is expected to write, in order.
    /// * `from_inst` - Bytes that the instrument sends to the host, in order.
    pub fn new(from_host: Vec<Vec<u8>>, from_inst: Vec<Vec<u8>>) -> Self {
        LoopbackTransport {
            from_host,
            from_inst,
            from_host_index: IncrIndex::default(),
            from_inst_index: IncrIndex::default(),
            buffer: BytesMut::new(),
            log: Vec::new(),
            connected: true,
        }
    }

    /// Create a new loopback transport from text. Terminations must be part of the text.
    pub fn from_text(from_host: &[&str], from_inst: &[&str]) -> Self {
        Self::new(
            from_host.iter().map(|s| s.as_bytes().to_vec()).collect(),
            from_inst.iter().map(|s| s.as_bytes().to_vec()).collect(),
        )
    }

    /// Everything that happened so far, with the time it happened.
    pub fn log(&self) -> &[(Instant, LoopbackEvent)] {
        &self.log
    }

    /// This command panics if not all scripted bytes in the [`LoopbackTransport`] have been used.
    ///
    /// It is automatically called when the [`LoopbackTransport`] is dropped, but you can also
    /// call it manually to ensure that all commands have been used.
    pub fn finalize(&mut self) {
        if let Some(leftover) = self.from_host.get(self.from_host_index.current()) {
            panic!(
                "Leftover expected commands found from host to instrument: {:?}",
                String::from_utf8_lossy(leftover)
            );
        }
        if let Some(leftover) = self.from_inst.get(self.from_inst_index.current()) {
            panic!(
                "Leftover expected commands found from instrument to host: {:?}",
                String::from_utf8_lossy(leftover)
            );
        }
        if !self.buffer.is_empty() {
            panic!(
                "Leftover bytes from instrument to host were never read: {:?}",
                String::from_utf8_lossy(&self.buffer)
            );
        }
    }
}

impl Transport for LoopbackTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let exp = self
            .from_host
            .get(self.from_host_index.next())
            .unwrap_or_else(|| {
                panic!(
                    "No more bytes were expected from host to instrument, got {:?}",
                    String::from_utf8_lossy(data)
                )
            });
        assert_eq!(
            exp.as_slice(),
            data,
            "Expected sendcmd '{0:?}', got '{1:?}'",
            String::from_utf8_lossy(exp),
            String::from_utf8_lossy(data)
        );
        self.log
            .push((Instant::now(), LoopbackEvent::Write(data.to_vec())));
        Ok(data.len())
    }

    fn read_bytes(&mut self, request: &ReadRequest<'_>) -> Result<Bytes, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let from_inst = &self.from_inst;
        let index = &mut self.from_inst_index;
        let result = read_message(&mut self.buffer, request, Framing::Stream, |buf, remaining| {
            match from_inst.get(index.current()) {
                Some(chunk) => {
                    index.next();
                    buf.extend_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => match remaining {
                    Some(remaining) => {
                        thread::sleep(remaining);
                        Err(TransportError::Timeout)
                    }
                    None => panic!("No more bytes were expected from instrument to host."),
                },
            }
        });
        let event = match &result {
            Ok(message) => LoopbackEvent::Read(message.clone()),
            Err(TransportError::Timeout) => LoopbackEvent::Timeout,
            Err(_) => return result,
        };
        self.log.push((Instant::now(), event));
        result
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.finalize();
        }
    }
}

// Tests of internal functionality
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incrementing_index() {
        let mut idx = IncrIndex::default();
        assert_eq!(0, idx.next());
        assert_eq!(1, idx.next());
        assert_eq!(1, idx.current());
    }

    #[test]
    #[should_panic(expected = "Leftover expected commands found from host to instrument")]
    fn test_finalize_panics_on_leftover_writes() {
        let mut transport = LoopbackTransport::from_text(&["*RST\r\n"], &[]);
        transport.finalize();
    }

    #[test]
    #[should_panic(expected = "Expected sendcmd")]
    fn test_unexpected_write_panics() {
        let mut transport = LoopbackTransport::from_text(&["*RST\r\n"], &[]);
        let _ = transport.write_bytes(b"*CLS\r\n");
    }
}
