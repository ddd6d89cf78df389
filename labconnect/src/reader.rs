//! The read loop that all stream transports share.
//!
//! A transport only knows how to pull more bytes from its device. [`read_message`] decides when
//! a read is complete: when `size` bytes are buffered, when the read termination shows up, or
//! when the message has to be abandoned because it grew larger than `max_read_size` or took
//! longer than the timeout. Bytes that were received after a complete message stay in the buffer
//! for the next read.

use std::{
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes, BytesMut};

use crate::transport::TransportError;

/// Time to back off when a byte source returned no data and no timeout.
const POLL_BACKOFF: Duration = Duration::from_millis(1);

/// How a transport delivers data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Framing {
    /// An unstructured byte stream, messages are delimited by a termination or a size.
    Stream,
    /// Each pull delivers exactly one complete message.
    Message,
}

/// The parameters of a single read operation.
#[derive(Clone, Copy, Debug)]
pub struct ReadRequest<'a> {
    /// The exact number of bytes to read, if given the termination is ignored.
    pub size: Option<usize>,
    /// The termination sequence that ends a message.
    pub termination: Option<&'a [u8]>,
    /// The maximum number of bytes that may be accumulated.
    pub max_read_size: usize,
    /// The total time the read may take, `None` blocks forever.
    pub timeout: Option<Duration>,
}

impl<'a> ReadRequest<'a> {
    /// Number of bytes the byte source should be asked for, given what is already buffered.
    ///
    /// Fixed-size reads ask for exactly the missing bytes, terminated reads for one byte at a
    /// time. Used by byte sources without internal buffering, e.g., a serial port.
    pub fn wanted(&self, buffered: usize) -> usize {
        match self.size {
            Some(size) => size.saturating_sub(buffered).max(1),
            None => 1,
        }
    }
}

/// Read a single message from a byte source.
///
/// The `pull` closure performs one blocking receive, appends what it received to the buffer
/// and returns the number of bytes appended. It gets the time that is left of the timeout and
/// must not block longer than that. Returning `Ok(0)` means that the source has no more data
/// right now. On failure, everything that was accumulated for this read is discarded.
///
/// # Arguments
/// * `buffer` - The buffer of the transport, may already contain bytes of earlier receives.
/// * `request` - Size, termination, maximum size and timeout of this read.
/// * `framing` - Whether the source delivers a byte stream or whole messages.
/// * `pull` - Receive more bytes.
pub fn read_message<F>(
    buffer: &mut BytesMut,
    request: &ReadRequest<'_>,
    framing: Framing,
    pull: F,
) -> Result<Bytes, TransportError>
where
    F: FnMut(&mut BytesMut, Option<Duration>) -> Result<usize, TransportError>,
{
    if let Some(size) = request.size {
        if size > request.max_read_size {
            return Err(TransportError::ExceededMaxReadSize {
                len: size,
                max_read_size: request.max_read_size,
            });
        }
    }

    let result = accumulate(buffer, request, framing, pull);
    if result.is_err() {
        buffer.clear();
    }
    result
}

fn accumulate<F>(
    buffer: &mut BytesMut,
    request: &ReadRequest<'_>,
    framing: Framing,
    mut pull: F,
) -> Result<Bytes, TransportError>
where
    F: FnMut(&mut BytesMut, Option<Duration>) -> Result<usize, TransportError>,
{
    let started = Instant::now();
    let mut scanner = TerminationScanner::default();

    loop {
        if let Some(message) = extract(buffer, request, framing, &mut scanner) {
            return Ok(message);
        }

        let remaining = match request.timeout {
            Some(timeout) => {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    return Err(TransportError::Timeout);
                }
                Some(timeout - elapsed)
            }
            None => None,
        };

        let received = pull(buffer, remaining)?;

        // checked before scanning, a terminated message may not be longer than allowed either
        if buffer.len() > request.max_read_size {
            return Err(TransportError::ExceededMaxReadSize {
                len: buffer.len(),
                max_read_size: request.max_read_size,
            });
        }

        if framing == Framing::Message {
            match request.size {
                None => return Ok(buffer.split().freeze()),
                Some(size) if buffer.len() < size => {
                    return Err(TransportError::SizeMismatch {
                        received: buffer.len(),
                        requested: size,
                    });
                }
                Some(_) => continue,
            }
        }

        if received == 0 {
            if let Some(size) = request.size {
                if buffer.len() < size {
                    return Err(TransportError::SizeMismatch {
                        received: buffer.len(),
                        requested: size,
                    });
                }
            } else {
                thread::sleep(POLL_BACKOFF);
            }
        }
    }
}

/// Remembers how much of the buffer has been searched for the termination already.
#[derive(Debug, Default)]
struct TerminationScanner {
    scanned: usize,
}

impl TerminationScanner {
    fn find(&mut self, haystack: &[u8], needle: &[u8]) -> Option<usize> {
        // a termination may straddle the end of the previously scanned part
        let from = self.scanned.saturating_sub(needle.len() - 1);
        let found = find_subsequence(&haystack[from..], needle).map(|i| i + from);
        self.scanned = if found.is_some() { 0 } else { haystack.len() };
        found
    }
}

fn extract(
    buffer: &mut BytesMut,
    request: &ReadRequest<'_>,
    framing: Framing,
    scanner: &mut TerminationScanner,
) -> Option<Bytes> {
    if let Some(size) = request.size {
        return (buffer.len() >= size).then(|| buffer.split_to(size).freeze());
    }

    if framing == Framing::Message {
        return (!buffer.is_empty()).then(|| buffer.split().freeze());
    }

    let term = request.termination.filter(|t| !t.is_empty())?;
    let index = scanner.find(buffer, term)?;
    let message = buffer.split_to(index).freeze();
    buffer.advance(term.len());
    Some(message)
}

/// Find the first occurrence of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Build a pull closure that hands out the given chunks and then times out.
    fn chunks(
        chunks: Vec<&'static str>,
    ) -> impl FnMut(&mut BytesMut, Option<Duration>) -> Result<usize, TransportError> {
        let mut chunks: VecDeque<&'static str> = chunks.into();
        move |buf: &mut BytesMut, _: Option<Duration>| match chunks.pop_front() {
            Some(chunk) => {
                buf.extend_from_slice(chunk.as_bytes());
                Ok(chunk.len())
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn request(size: Option<usize>, termination: Option<&[u8]>) -> ReadRequest<'_> {
        ReadRequest {
            size,
            termination,
            max_read_size: 64,
            timeout: Some(Duration::from_secs(1)),
        }
    }

    #[test]
    fn test_termination_straddles_chunks() {
        let mut buf = BytesMut::new();
        let req = request(None, Some(b"\r\n"));
        let msg = read_message(&mut buf, &req, Framing::Stream, chunks(vec!["ab\r", "\ncd"]))
            .unwrap();
        assert_eq!(&msg[..], b"ab");
        assert_eq!(&buf[..], b"cd");
    }

    #[test]
    fn test_buffered_message_needs_no_pull() {
        let mut buf = BytesMut::from(&b"one\ntwo\n"[..]);
        let req = request(None, Some(b"\n"));
        let first = read_message(&mut buf, &req, Framing::Stream, chunks(vec![])).unwrap();
        let second = read_message(&mut buf, &req, Framing::Stream, chunks(vec![])).unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_exact_size_keeps_excess() {
        let mut buf = BytesMut::new();
        let req = request(Some(3), Some(b"\n"));
        let msg = read_message(&mut buf, &req, Framing::Stream, chunks(vec!["a\nbcd"])).unwrap();
        assert_eq!(&msg[..], b"a\nb");
        assert_eq!(&buf[..], b"cd");
    }

    #[test]
    fn test_size_above_max_never_pulls() {
        let mut buf = BytesMut::new();
        let req = request(Some(65), None);
        let result = read_message(&mut buf, &req, Framing::Stream, |_, _| {
            panic!("the byte source must not be touched")
        });
        assert!(matches!(
            result,
            Err(TransportError::ExceededMaxReadSize { len: 65, .. })
        ));
    }

    #[test]
    fn test_unterminated_stream_exceeds_max() {
        let mut buf = BytesMut::new();
        let req = request(None, Some(b"\n"));
        let result = read_message(&mut buf, &req, Framing::Stream, |buf, _| {
            buf.extend_from_slice(&[b'x'; 16]);
            Ok(16)
        });
        assert!(matches!(
            result,
            Err(TransportError::ExceededMaxReadSize { len: 80, max_read_size: 64 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_terminated_chunk_exceeds_max() {
        let mut buf = BytesMut::new();
        let mut req = request(None, Some(b"\n"));
        req.max_read_size = 8;
        let result = read_message(
            &mut buf,
            &req,
            Framing::Stream,
            chunks(vec!["0123456789ABCDEF\n"]),
        );
        assert!(matches!(
            result,
            Err(TransportError::ExceededMaxReadSize { len: 17, max_read_size: 8 })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_read_is_size_mismatch() {
        let mut buf = BytesMut::new();
        let req = request(Some(4), None);
        let mut sent = false;
        let result = read_message(&mut buf, &req, Framing::Stream, |buf, _| {
            if sent {
                return Ok(0);
            }
            sent = true;
            buf.extend_from_slice(b"abc");
            Ok(3)
        });
        assert!(matches!(
            result,
            Err(TransportError::SizeMismatch { received: 3, requested: 4 })
        ));
    }

    #[test]
    fn test_message_framing_returns_whole_message() {
        let mut buf = BytesMut::new();
        let req = request(None, None);
        let msg = read_message(&mut buf, &req, Framing::Message, chunks(vec!["hello"])).unwrap();
        assert_eq!(&msg[..], b"hello");
    }

    #[test]
    fn test_message_framing_trims_to_size() {
        let mut buf = BytesMut::new();
        let req = request(Some(2), None);
        let msg = read_message(&mut buf, &req, Framing::Message, chunks(vec!["hello"])).unwrap();
        assert_eq!(&msg[..], b"he");
        let rest = read_message(&mut buf, &request(None, None), Framing::Message, chunks(vec![]))
            .unwrap();
        assert_eq!(&rest[..], b"llo");
    }

    #[test]
    fn test_remaining_time_shrinks() {
        let mut buf = BytesMut::new();
        let req = ReadRequest {
            size: None,
            termination: Some(b"\n"),
            max_read_size: 64,
            timeout: Some(Duration::from_millis(50)),
        };
        let mut budgets = vec![];
        let result = read_message(&mut buf, &req, Framing::Stream, |buf, remaining| {
            budgets.push(remaining.unwrap());
            thread::sleep(Duration::from_millis(20));
            buf.extend_from_slice(b"x");
            Ok(1)
        });
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(budgets.windows(2).all(|w| w[1] < w[0]));
        assert!(budgets[0] <= Duration::from_millis(50));
    }

    #[test]
    fn test_find_subsequence() {
        assert_eq!(find_subsequence(b"abcabc", b"ca"), Some(2));
        assert_eq!(find_subsequence(b"ab", b"abc"), None);
        assert_eq!(find_subsequence(b"ab", b""), None);
    }
}
