//! Binary and ASCII blocks of numeric values.
//!
//! Instruments often transfer arrays of numbers as IEEE 488.2 arbitrary blocks, as HP blocks or
//! as comma-separated text. [`to_bytes`] builds such a block from values, [`from_bytes`] parses
//! one. Values are passed around as `f64`, the [`DataType`] describes how each value is stored.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Errors when converting blocks.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum BlockError {
    /// The block header is malformed.
    #[error("Invalid {format} format, {reason}")]
    Header {
        /// The block format.
        format: &'static str,
        /// What is wrong with the header.
        reason: &'static str,
    },
    /// The header announces more bytes than the block contains.
    #[error("block announces {expected} bytes but only {found} bytes follow the header")]
    Truncated {
        /// The announced number of bytes.
        expected: usize,
        /// The number of bytes after the header.
        found: usize,
    },
    /// The length does not fit into the header of the format.
    #[error("length {0} is too big for the {1} format")]
    Overflow(usize, &'static str),
    /// The data is not a whole number of values.
    #[error("{len} bytes is not a multiple of the element size {size}")]
    Length {
        /// The number of data bytes.
        len: usize,
        /// The size of one element.
        size: usize,
    },
    /// An ASCII value could not be parsed.
    #[error("cannot parse {0:?} as a number")]
    Parse(String),
    /// Unknown data type name.
    #[error("unknown data type {0:?}")]
    DataType(String),
}

/// The format of a block of values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BlockFormat {
    /// The values as they are, without a header.
    None,
    /// Comma-separated text.
    Ascii,
    /// IEEE 488.2 definite length (`#<n><length><data>`) or indefinite length (`#0<data>`).
    #[default]
    Ieee,
    /// HP format (`#A<u16 length><data>`).
    Hp,
}

/// Order of the bytes of a multi-byte value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ByteOrder {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

/// The numeric type of a single value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum NumberKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl NumberKind {
    /// Size of one value in bytes.
    pub fn size(&self) -> usize {
        match self {
            NumberKind::I8 | NumberKind::U8 => 1,
            NumberKind::I16 | NumberKind::U16 => 2,
            NumberKind::I32 | NumberKind::U32 | NumberKind::F32 => 4,
            NumberKind::I64 | NumberKind::U64 | NumberKind::F64 => 8,
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, NumberKind::F32 | NumberKind::F64)
    }
}

/// How a value is stored: its numeric type and byte order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataType {
    /// The numeric type.
    pub kind: NumberKind,
    /// The byte order.
    pub order: ByteOrder,
}

impl Default for DataType {
    /// Little-endian `f32`.
    fn default() -> Self {
        Self::new(NumberKind::F32, ByteOrder::Little)
    }
}

impl DataType {
    /// Create a data type.
    pub const fn new(kind: NumberKind, order: ByteOrder) -> Self {
        Self { kind, order }
    }

    fn encode(&self, value: f64, out: &mut Vec<u8>) {
        macro_rules! put {
            ($ty:ty) => {{
                let v = value as $ty;
                match self.order {
                    ByteOrder::Little => out.extend_from_slice(&v.to_le_bytes()),
                    ByteOrder::Big => out.extend_from_slice(&v.to_be_bytes()),
                }
            }};
        }
        match self.kind {
            NumberKind::I8 => put!(i8),
            NumberKind::U8 => put!(u8),
            NumberKind::I16 => put!(i16),
            NumberKind::U16 => put!(u16),
            NumberKind::I32 => put!(i32),
            NumberKind::U32 => put!(u32),
            NumberKind::I64 => put!(i64),
            NumberKind::U64 => put!(u64),
            NumberKind::F32 => put!(f32),
            NumberKind::F64 => put!(f64),
        }
    }

    fn decode(&self, bytes: &[u8]) -> f64 {
        macro_rules! get {
            ($ty:ty, $n:literal) => {{
                let mut raw = [0u8; $n];
                raw.copy_from_slice(&bytes[..$n]);
                match self.order {
                    ByteOrder::Little => <$ty>::from_le_bytes(raw) as f64,
                    ByteOrder::Big => <$ty>::from_be_bytes(raw) as f64,
                }
            }};
        }
        match self.kind {
            NumberKind::I8 => get!(i8, 1),
            NumberKind::U8 => get!(u8, 1),
            NumberKind::I16 => get!(i16, 2),
            NumberKind::U16 => get!(u16, 2),
            NumberKind::I32 => get!(i32, 4),
            NumberKind::U32 => get!(u32, 4),
            NumberKind::I64 => get!(i64, 8),
            NumberKind::U64 => get!(u64, 8),
            NumberKind::F32 => get!(f32, 4),
            NumberKind::F64 => get!(f64, 8),
        }
    }

    fn format_ascii(&self, value: f64) -> String {
        if self.kind.is_float() {
            format!("{value}")
        } else {
            format!("{}", value as i64)
        }
    }
}

impl FromStr for DataType {
    type Err = BlockError;

    /// Parse a NumPy-style type string, e.g., `<f`, `>i2`, `u1` or `d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (order, code) = match s.as_bytes().first() {
            Some(b'<' | b'=' | b'@' | b'|') => (ByteOrder::Little, &s[1..]),
            Some(b'>' | b'!') => (ByteOrder::Big, &s[1..]),
            _ => (ByteOrder::Little, s),
        };
        let kind = match code {
            "b" | "i1" | "int8" => NumberKind::I8,
            "B" | "u1" | "uint8" => NumberKind::U8,
            "h" | "i2" | "int16" => NumberKind::I16,
            "H" | "u2" | "uint16" => NumberKind::U16,
            "i" | "l" | "i4" | "int32" => NumberKind::I32,
            "I" | "L" | "u4" | "uint32" => NumberKind::U32,
            "q" | "i8" | "int64" => NumberKind::I64,
            "Q" | "u8" | "uint64" => NumberKind::U64,
            "f" | "f4" | "float32" => NumberKind::F32,
            "d" | "f8" | "float64" => NumberKind::F64,
            _ => return Err(BlockError::DataType(s.to_string())),
        };
        Ok(DataType::new(kind, order))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.order {
            ByteOrder::Little => '<',
            ByteOrder::Big => '>',
        };
        let code = match self.kind {
            NumberKind::I8 => "i1",
            NumberKind::U8 => "u1",
            NumberKind::I16 => "i2",
            NumberKind::U16 => "u2",
            NumberKind::I32 => "i4",
            NumberKind::U32 => "u4",
            NumberKind::I64 => "i8",
            NumberKind::U64 => "u8",
            NumberKind::F32 => "f4",
            NumberKind::F64 => "f8",
        };
        write!(f, "{order}{code}")
    }
}

/// Convert values into a block.
///
/// # Arguments
/// * `values` - The values to convert.
/// * `format` - The block format.
/// * `dtype` - How each value is stored. For [`BlockFormat::Ascii`] only integer versus float
///   matters.
pub fn to_bytes(
    values: &[f64],
    format: BlockFormat,
    dtype: DataType,
) -> Result<Vec<u8>, BlockError> {
    if format == BlockFormat::Ascii {
        let text: Vec<String> = values.iter().map(|v| dtype.format_ascii(*v)).collect();
        return Ok(text.join(",").into_bytes());
    }

    let mut data = Vec::with_capacity(values.len() * dtype.kind.size());
    for value in values {
        dtype.encode(*value, &mut data);
    }

    match format {
        BlockFormat::Ieee => {
            let nbytes = data.len().to_string();
            if nbytes.len() > 9 {
                return Err(BlockError::Overflow(data.len(), "IEEE-488.2"));
            }
            let mut block = format!("#{}{}", nbytes.len(), nbytes).into_bytes();
            block.extend_from_slice(&data);
            Ok(block)
        }
        BlockFormat::Hp => {
            let len = u16::try_from(data.len())
                .map_err(|_| BlockError::Overflow(data.len(), "HP"))?;
            let mut block = b"#A".to_vec();
            match dtype.order {
                ByteOrder::Little => block.extend_from_slice(&len.to_le_bytes()),
                ByteOrder::Big => block.extend_from_slice(&len.to_be_bytes()),
            }
            block.extend_from_slice(&data);
            Ok(block)
        }
        _ => Ok(data),
    }
}

/// Parse values from a block.
///
/// Anything before the `#` of an IEEE or HP header is skipped. The trailing newline of an
/// indefinite-length IEEE block is not part of the data.
///
/// # Arguments
/// * `buffer` - The bytes that were read.
/// * `format` - The block format.
/// * `dtype` - How each value is stored.
pub fn from_bytes(
    buffer: &[u8],
    format: BlockFormat,
    dtype: DataType,
) -> Result<Vec<f64>, BlockError> {
    let size = dtype.kind.size();
    let data = match format {
        BlockFormat::Ascii => return parse_ascii(buffer),
        BlockFormat::None => buffer,
        BlockFormat::Ieee => ieee_data(buffer)?,
        BlockFormat::Hp => hp_data(buffer, dtype.order)?,
    };
    if data.len() % size != 0 {
        return Err(BlockError::Length {
            len: data.len(),
            size,
        });
    }
    Ok(data
        .chunks_exact(size)
        .map(|chunk| dtype.decode(chunk))
        .collect())
}

fn parse_ascii(buffer: &[u8]) -> Result<Vec<f64>, BlockError> {
    let text = String::from_utf8_lossy(buffer);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|item| {
            let item = item.trim();
            item.parse::<f64>()
                .map_err(|_| BlockError::Parse(item.to_string()))
        })
        .collect()
}

fn ieee_data(buffer: &[u8]) -> Result<&[u8], BlockError> {
    let header = |reason| BlockError::Header {
        format: "IEEE-488.2",
        reason,
    };
    let offset = buffer
        .iter()
        .position(|&b| b == b'#')
        .ok_or(header("cannot find # character"))?;
    let ndigits = buffer
        .get(offset + 1)
        .filter(|b| b.is_ascii_digit())
        .map(|b| usize::from(b - b'0'))
        .ok_or(header("character after # is not an integer"))?;

    let start = offset + 2;
    if ndigits == 0 {
        let data = &buffer[start..];
        return Ok(data.strip_suffix(b"\n").unwrap_or(data));
    }

    let nbytes = buffer
        .get(start..start + ndigits)
        .and_then(|digits| std::str::from_utf8(digits).ok())
        .and_then(|digits| digits.parse::<usize>().ok())
        .ok_or(header("characters after #<n> are not integers"))?;
    let data = &buffer[start + ndigits..];
    data.get(..nbytes).ok_or(BlockError::Truncated {
        expected: nbytes,
        found: data.len(),
    })
}

fn hp_data(buffer: &[u8], order: ByteOrder) -> Result<&[u8], BlockError> {
    let header = |reason| BlockError::Header {
        format: "HP",
        reason,
    };
    let offset = buffer
        .windows(2)
        .position(|w| w == b"#A")
        .ok_or(header("cannot find #A characters"))?;
    let raw: [u8; 2] = buffer
        .get(offset + 2..offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(header("characters after #A are not an unsigned short integer"))?;
    let nbytes = usize::from(match order {
        ByteOrder::Little => u16::from_le_bytes(raw),
        ByteOrder::Big => u16::from_be_bytes(raw),
    });
    let data = &buffer[offset + 4..];
    data.get(..nbytes).ok_or(BlockError::Truncated {
        expected: nbytes,
        found: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parsing() {
        let dtype: DataType = ">i2".parse().unwrap();
        assert_eq!(dtype, DataType::new(NumberKind::I16, ByteOrder::Big));
        assert_eq!("d".parse::<DataType>().unwrap().kind, NumberKind::F64);
        assert_eq!(dtype.to_string(), ">i2");
        assert!("x".parse::<DataType>().is_err());
    }

    #[test]
    fn test_ieee_header() {
        let block = to_bytes(&[1.0, 2.0], BlockFormat::Ieee, DataType::default()).unwrap();
        assert_eq!(&block[..3], b"#18");
        assert_eq!(block.len(), 3 + 8);
    }

    #[test]
    fn test_hp_length_is_u16() {
        let block = to_bytes(&[1.0], BlockFormat::Hp, "<d".parse().unwrap()).unwrap();
        assert_eq!(&block[..4], b"#A\x08\x00");
    }
}
