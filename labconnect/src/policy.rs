//! Termination and encoding policy of a message-based connection.
//!
//! The [`MessagePolicy`] keeps the read and write termination sequences, the text encoding and
//! its error handler, the maximum read size and the timeout. Terminations are always available
//! as bytes in the current encoding, however, a termination that was given as text remembers the
//! text so that it can be re-encoded when the encoding changes.

use std::time::Duration;

use thiserror::Error;

use crate::codec::{CodecError, Encoding, EncodingErrors};

/// The default read termination.
pub const DEFAULT_READ_TERMINATION: &str = "\n";

/// The default write termination.
pub const DEFAULT_WRITE_TERMINATION: &str = "\r\n";

/// The default maximum number of bytes that a single read may return.
pub const DEFAULT_MAX_READ_SIZE: usize = 1 << 16;

/// Errors that can occur when changing the policy.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum PolicyError {
    /// Encoding lookup or conversion failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The maximum read size must be at least one byte.
    #[error("The maximum number of bytes to read must be > 0, got {0}")]
    InvalidMaxReadSize(i64),
}

/// A termination sequence as it was provided by the user.
#[derive(Clone, Debug, PartialEq)]
pub enum Termination {
    /// Text, encoded with the current encoding of the connection.
    Text(String),
    /// Raw bytes, used as they are and never re-encoded.
    Bytes(Vec<u8>),
}

impl From<&str> for Termination {
    fn from(value: &str) -> Self {
        Termination::Text(value.to_string())
    }
}

impl From<String> for Termination {
    fn from(value: String) -> Self {
        Termination::Text(value)
    }
}

impl From<&[u8]> for Termination {
    fn from(value: &[u8]) -> Self {
        Termination::Bytes(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Termination {
    fn from(value: &[u8; N]) -> Self {
        Termination::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Termination {
    fn from(value: Vec<u8>) -> Self {
        Termination::Bytes(value)
    }
}

/// A resolved termination: where it came from and its encoded bytes.
#[derive(Clone, Debug, PartialEq)]
struct ResolvedTermination {
    source: Termination,
    encoded: Vec<u8>,
}

impl ResolvedTermination {
    /// Resolve `source`, returns `None` for an empty termination.
    fn resolve(
        source: Termination,
        encoding: Encoding,
        errors: EncodingErrors,
    ) -> Result<Option<Self>, CodecError> {
        let encoded = match &source {
            Termination::Text(text) => encoding.encode(text, errors)?,
            Termination::Bytes(bytes) => bytes.clone(),
        };
        if encoded.is_empty() {
            return Ok(None);
        }
        Ok(Some(ResolvedTermination { source, encoded }))
    }

    /// A text termination that is plain ASCII, which encodes to the same bytes in every
    /// ASCII-compatible encoding.
    fn ascii(text: &str) -> Self {
        ResolvedTermination {
            source: Termination::Text(text.to_string()),
            encoded: text.as_bytes().to_vec(),
        }
    }
}

/// Termination, encoding, size and timeout settings of a message-based connection.
#[derive(Clone, Debug, PartialEq)]
pub struct MessagePolicy {
    encoding: Encoding,
    encoding_errors: EncodingErrors,
    read_termination: Option<ResolvedTermination>,
    write_termination: Option<ResolvedTermination>,
    max_read_size: usize,
    timeout: Option<Duration>,
    rstrip: bool,
}

impl Default for MessagePolicy {
    fn default() -> Self {
        MessagePolicy {
            encoding: Encoding::default(),
            encoding_errors: EncodingErrors::default(),
            read_termination: Some(ResolvedTermination::ascii(DEFAULT_READ_TERMINATION)),
            write_termination: Some(ResolvedTermination::ascii(DEFAULT_WRITE_TERMINATION)),
            max_read_size: DEFAULT_MAX_READ_SIZE,
            timeout: None,
            rstrip: false,
        }
    }
}

impl MessagePolicy {
    /// The encoding that is used for read and write operations.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Set the encoding from its name.
    ///
    /// Unless both terminations are unset, the codec is tested by encoding and decoding a test
    /// string. Terminations that were given as text are re-encoded with the new codec,
    /// terminations given as bytes are kept as they are.
    ///
    /// # Arguments
    /// * `name` - Name of the encoding, e.g., `"utf-8"` or `"ascii"`.
    pub fn set_encoding(&mut self, name: &str) -> Result<(), PolicyError> {
        let encoding: Encoding = name.parse()?;
        if self.read_termination.is_some() || self.write_termination.is_some() {
            let probe = encoding.encode("test encoding", EncodingErrors::Strict)?;
            encoding.decode(&probe, EncodingErrors::Strict)?;
        }

        let read = self.reencode(self.read_termination.as_ref(), encoding)?;
        let write = self.reencode(self.write_termination.as_ref(), encoding)?;
        self.encoding = encoding;
        self.read_termination = read;
        self.write_termination = write;
        Ok(())
    }

    fn reencode(
        &self,
        termination: Option<&ResolvedTermination>,
        encoding: Encoding,
    ) -> Result<Option<ResolvedTermination>, CodecError> {
        match termination {
            Some(term) => {
                ResolvedTermination::resolve(term.source.clone(), encoding, self.encoding_errors)
            }
            None => Ok(None),
        }
    }

    /// The error handler used for encoding and decoding messages.
    pub fn encoding_errors(&self) -> EncodingErrors {
        self.encoding_errors
    }

    /// Set the error handler from its name, e.g., `"strict"` or `"replace"`.
    pub fn set_encoding_errors(&mut self, name: &str) -> Result<(), PolicyError> {
        self.encoding_errors = name.parse()?;
        Ok(())
    }

    /// The encoded read termination, `None` if reads are not terminated.
    pub fn read_termination(&self) -> Option<&[u8]> {
        self.read_termination.as_ref().map(|t| t.encoded.as_slice())
    }

    /// Set the read termination. `None` or an empty value disables it.
    pub fn set_read_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), PolicyError> {
        self.read_termination = self.resolve(termination)?;
        Ok(())
    }

    /// The encoded write termination, `None` if nothing is appended to written messages.
    pub fn write_termination(&self) -> Option<&[u8]> {
        self.write_termination.as_ref().map(|t| t.encoded.as_slice())
    }

    /// Set the write termination. `None` or an empty value disables it.
    pub fn set_write_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), PolicyError> {
        self.write_termination = self.resolve(termination)?;
        Ok(())
    }

    fn resolve(
        &self,
        termination: Option<Termination>,
    ) -> Result<Option<ResolvedTermination>, CodecError> {
        match termination {
            Some(source) => {
                ResolvedTermination::resolve(source, self.encoding, self.encoding_errors)
            }
            None => Ok(None),
        }
    }

    /// The maximum number of bytes that a single read may return.
    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    /// Set the maximum number of bytes that a single read may return. Must be `>= 1`.
    pub fn set_max_read_size(&mut self, size: i64) -> Result<(), PolicyError> {
        match usize::try_from(size) {
            Ok(size) if size > 0 => {
                self.max_read_size = size;
                Ok(())
            }
            _ => Err(PolicyError::InvalidMaxReadSize(size)),
        }
    }

    /// The timeout of read and write operations, `None` blocks forever.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the timeout in seconds. `None`, zero, a negative or a non-finite value blocks
    /// forever.
    pub fn set_timeout(&mut self, seconds: Option<f64>) {
        self.timeout = seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
            .filter(|t| !t.is_zero());
    }

    /// Whether trailing whitespace is removed from read messages.
    pub fn rstrip(&self) -> bool {
        self.rstrip
    }

    /// Enable or disable removing trailing whitespace from read messages.
    pub fn set_rstrip(&mut self, rstrip: bool) {
        self.rstrip = rstrip;
    }

    /// Encode a message and append the write termination unless it is already there.
    pub fn encode_message(&self, message: &str) -> Result<Vec<u8>, CodecError> {
        let data = self.encoding.encode(message, self.encoding_errors)?;
        Ok(self.terminate(data))
    }

    /// Append the write termination to `data` unless `data` already ends with it.
    pub fn terminate(&self, mut data: Vec<u8>) -> Vec<u8> {
        if let Some(term) = self.write_termination() {
            if !data.ends_with(term) {
                data.extend_from_slice(term);
            }
        }
        data
    }

    /// Decode a message that was read, honouring `rstrip`.
    pub fn decode_message(&self, data: &[u8]) -> Result<String, CodecError> {
        let data = if self.rstrip { rstrip_bytes(data) } else { data };
        self.encoding.decode(data, self.encoding_errors)
    }
}

/// Strip trailing ASCII whitespace.
pub(crate) fn rstrip_bytes(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0x0b)
        .map_or(0, |i| i + 1);
    &data[..end]
}
