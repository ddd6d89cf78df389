//! Text encodings and error handlers used to convert messages to and from bytes.
//!
//! Instruments talk in bytes, users mostly talk in strings. The [`Encoding`] decides how a
//! character becomes bytes, the [`EncodingErrors`] handler decides what happens to characters
//! (or bytes) that the encoding cannot represent.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Errors that can occur while looking up or applying a codec.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum CodecError {
    /// The name of the encoding is not known.
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),
    /// The name of the error handler is not known.
    #[error("unknown encoding error handler {0:?}")]
    UnknownErrorHandler(String),
    /// A character could not be encoded with the `strict` error handler.
    #[error("{encoding} codec can't encode character {ch:?} in position {position}")]
    Encode {
        /// The encoding that was used.
        encoding: Encoding,
        /// The character that could not be encoded.
        ch: char,
        /// Character position within the message.
        position: usize,
    },
    /// Bytes could not be decoded with the `strict` (or an unsupported) error handler.
    #[error("{encoding} codec can't decode byte 0x{byte:02x} in position {position}")]
    Decode {
        /// The encoding that was used.
        encoding: Encoding,
        /// The first offending byte.
        byte: u8,
        /// Byte position within the message.
        position: usize,
    },
}

/// The text encodings that messages can be converted with.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Encoding {
    /// UTF-8, the default.
    #[default]
    Utf8,
    /// 7-bit ASCII.
    Ascii,
    /// ISO-8859-1, every byte maps to the code point with the same value.
    Latin1,
    /// UTF-16, little endian, without a byte order mark.
    Utf16Le,
    /// UTF-16, big endian, without a byte order mark.
    Utf16Be,
}

impl Encoding {
    /// The canonical name of the encoding.
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin-1",
            Encoding::Utf16Le => "utf-16-le",
            Encoding::Utf16Be => "utf-16-be",
        }
    }

    /// Encode `text` into bytes.
    ///
    /// # Arguments
    /// * `text` - The text to encode.
    /// * `errors` - How to handle characters the encoding cannot represent.
    pub fn encode(&self, text: &str, errors: EncodingErrors) -> Result<Vec<u8>, CodecError> {
        let limit = match self {
            Encoding::Ascii => 0x80,
            Encoding::Latin1 => 0x100,
            Encoding::Utf8 => return Ok(text.as_bytes().to_vec()),
            Encoding::Utf16Le => {
                return Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect());
            }
            Encoding::Utf16Be => {
                return Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect());
            }
        };

        let mut out = Vec::with_capacity(text.len());
        for (position, ch) in text.chars().enumerate() {
            let cp = ch as u32;
            if cp < limit {
                out.push(cp as u8);
                continue;
            }
            match errors {
                EncodingErrors::Strict => {
                    return Err(CodecError::Encode {
                        encoding: *self,
                        ch,
                        position,
                    });
                }
                EncodingErrors::Ignore => {}
                EncodingErrors::Replace => out.push(b'?'),
                EncodingErrors::XmlCharRefReplace => {
                    out.extend_from_slice(format!("&#{cp};").as_bytes());
                }
                EncodingErrors::BackslashReplace => {
                    out.extend_from_slice(backslash_escape(cp).as_bytes());
                }
            }
        }
        Ok(out)
    }

    /// Decode `data` into a string.
    ///
    /// The `xmlcharrefreplace` handler only exists for encoding, decoding with it behaves like
    /// `strict`.
    ///
    /// # Arguments
    /// * `data` - The bytes to decode.
    /// * `errors` - How to handle bytes that are invalid for the encoding.
    pub fn decode(&self, data: &[u8], errors: EncodingErrors) -> Result<String, CodecError> {
        match self {
            Encoding::Utf8 => decode_utf8(data, errors),
            Encoding::Latin1 => Ok(data.iter().map(|&b| b as char).collect()),
            Encoding::Ascii => {
                let mut out = String::with_capacity(data.len());
                for (position, &byte) in data.iter().enumerate() {
                    if byte.is_ascii() {
                        out.push(byte as char);
                    } else {
                        self.handle_invalid(&mut out, &[byte], position, errors)?;
                    }
                }
                Ok(out)
            }
            Encoding::Utf16Le | Encoding::Utf16Be => self.decode_utf16(data, errors),
        }
    }

    fn decode_utf16(&self, data: &[u8], errors: EncodingErrors) -> Result<String, CodecError> {
        let big_endian = matches!(self, Encoding::Utf16Be);
        let units = data.chunks_exact(2).map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        });

        let mut out = String::with_capacity(data.len() / 2);
        let mut position = 0;
        for decoded in char::decode_utf16(units) {
            match decoded {
                Ok(ch) => {
                    position += 2 * ch.len_utf16();
                    out.push(ch);
                }
                Err(_) => {
                    self.handle_invalid(&mut out, &data[position..position + 2], position, errors)?;
                    position += 2;
                }
            }
        }

        let odd = data.chunks_exact(2).remainder();
        if !odd.is_empty() {
            self.handle_invalid(&mut out, odd, data.len() - 1, errors)?;
        }
        Ok(out)
    }

    fn handle_invalid(
        &self,
        out: &mut String,
        bytes: &[u8],
        position: usize,
        errors: EncodingErrors,
    ) -> Result<(), CodecError> {
        match errors {
            EncodingErrors::Ignore => Ok(()),
            EncodingErrors::Replace => {
                out.push(char::REPLACEMENT_CHARACTER);
                Ok(())
            }
            EncodingErrors::BackslashReplace => {
                for byte in bytes {
                    out.push_str(&format!("\\x{byte:02x}"));
                }
                Ok(())
            }
            EncodingErrors::Strict | EncodingErrors::XmlCharRefReplace => Err(CodecError::Decode {
                encoding: *self,
                byte: bytes[0],
                position,
            }),
        }
    }
}

fn decode_utf8(data: &[u8], errors: EncodingErrors) -> Result<String, CodecError> {
    let mut out = String::with_capacity(data.len());
    let mut rest = data;
    let mut offset = 0;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return Ok(out);
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                // `valid` is guaranteed to be UTF-8 by `valid_up_to`
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                let bad_len = err.error_len().unwrap_or(after.len());
                Encoding::Utf8.handle_invalid(
                    &mut out,
                    &after[..bad_len],
                    offset + valid.len(),
                    errors,
                )?;
                offset += valid.len() + bad_len;
                rest = &after[bad_len..];
            }
        }
    }
}

fn backslash_escape(cp: u32) -> String {
    if cp < 0x100 {
        format!("\\x{cp:02x}")
    } else if cp < 0x10000 {
        format!("\\u{cp:04x}")
    } else {
        format!("\\U{cp:08x}")
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace('_', "-");
        match name.as_str() {
            "utf-8" | "utf8" | "u8" | "utf" => Ok(Encoding::Utf8),
            "ascii" | "us-ascii" | "646" => Ok(Encoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" | "l1" | "cp819" => {
                Ok(Encoding::Latin1)
            }
            "utf-16-le" | "utf-16le" | "utf16le" => Ok(Encoding::Utf16Le),
            "utf-16-be" | "utf-16be" | "utf16be" => Ok(Encoding::Utf16Be),
            _ => Err(CodecError::UnknownEncoding(s.to_string())),
        }
    }
}

/// The error handling scheme to use when encoding and decoding messages.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum EncodingErrors {
    /// Fail on the first character or byte that cannot be converted.
    #[default]
    Strict,
    /// Drop whatever cannot be converted.
    Ignore,
    /// Substitute `?` when encoding and U+FFFD when decoding.
    Replace,
    /// Substitute an XML character reference (`&#946;`) when encoding.
    XmlCharRefReplace,
    /// Substitute a backslash escape (`\xNN`, `\uNNNN`, `\UNNNNNNNN`).
    BackslashReplace,
}

impl EncodingErrors {
    /// The name of the handler.
    pub fn name(&self) -> &'static str {
        match self {
            EncodingErrors::Strict => "strict",
            EncodingErrors::Ignore => "ignore",
            EncodingErrors::Replace => "replace",
            EncodingErrors::XmlCharRefReplace => "xmlcharrefreplace",
            EncodingErrors::BackslashReplace => "backslashreplace",
        }
    }
}

impl fmt::Display for EncodingErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EncodingErrors {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(EncodingErrors::Strict),
            "ignore" => Ok(EncodingErrors::Ignore),
            "replace" => Ok(EncodingErrors::Replace),
            "xmlcharrefreplace" => Ok(EncodingErrors::XmlCharRefReplace),
            "backslashreplace" => Ok(EncodingErrors::BackslashReplace),
            _ => Err(CodecError::UnknownErrorHandler(s.to_string())),
        }
    }
}
