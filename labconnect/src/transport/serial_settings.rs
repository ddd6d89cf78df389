//! Serial port settings and how they are read from connection properties.

use crate::config::{Properties, PropertyError, PropertyValue};

/// The number of data bits per character.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DataBits {
    /// 5 bits.
    Five,
    /// 6 bits.
    Six,
    /// 7 bits.
    Seven,
    /// 8 bits.
    #[default]
    Eight,
}

/// Parity checking.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always set.
    Mark,
    /// Parity bit always cleared.
    Space,
}

/// The number of stop bits.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    One,
    /// One and a half stop bits.
    OnePointFive,
    /// Two stop bits.
    Two,
}

/// Settings of a serial port.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SerialSettings {
    /// Baud rate. Default: 9600.
    pub baud_rate: u32,
    /// Data bits. Default: 8.
    pub data_bits: DataBits,
    /// Parity. Default: none.
    pub parity: Parity,
    /// Stop bits. Default: 1.
    pub stop_bits: StopBits,
    /// Software (XON/XOFF) flow control.
    pub xon_xoff: bool,
    /// Hardware (RTS/CTS) flow control.
    pub rts_cts: bool,
    /// Hardware (DSR/DTR) flow control.
    pub dsr_dtr: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            xon_xoff: false,
            rts_cts: false,
            dsr_dtr: false,
        }
    }
}

/// Look up a property by its name or its alias.
fn lookup<'a>(
    props: &'a Properties,
    key: &'a str,
    alias: &'a str,
) -> Option<(&'a str, &'a PropertyValue)> {
    props
        .get(key)
        .map(|v| (key, v))
        .or_else(|| props.get(alias).map(|v| (alias, v)))
}

fn flag(props: &Properties, key: &str, alias: &str) -> Result<bool, PropertyError> {
    Ok(props.get_bool(key)?.or(props.get_bool(alias)?).unwrap_or(false))
}

impl SerialSettings {
    /// Read the serial settings from connection properties.
    ///
    /// Every property may also be given by its alias.
    /// * `baud_rate` (`baudrate`) - An integer.
    /// * `data_bits` (`bytesize`) - 5 to 8, or a name like `"EIGHT"`.
    /// * `parity` - `N`, `O`, `E`, `M`, `S` or the full name, case-insensitive.
    /// * `stop_bits` (`stopbits`) - 1, 1.5, 2, or a name like `"ONE_POINT_FIVE"`.
    /// * `xon_xoff` (`xonxoff`), `rts_cts` (`rtscts`), `dsr_dtr` (`dsrdtr`) - Flow control flags.
    pub fn from_properties(props: &Properties) -> Result<Self, PropertyError> {
        let mut settings = SerialSettings::default();

        if let Some((key, value)) = lookup(props, "baud_rate", "baudrate") {
            settings.baud_rate = match value {
                PropertyValue::Int(i) => {
                    u32::try_from(*i).map_err(|_| PropertyError::invalid(key, i))?
                }
                other => {
                    return Err(PropertyError::Mismatch {
                        key: key.to_string(),
                        expected: "an integer",
                        found: other.type_name(),
                    });
                }
            };
        }

        if let Some((key, value)) = lookup(props, "data_bits", "bytesize") {
            settings.data_bits = match value {
                PropertyValue::Int(5) => DataBits::Five,
                PropertyValue::Int(6) => DataBits::Six,
                PropertyValue::Int(7) => DataBits::Seven,
                PropertyValue::Int(8) => DataBits::Eight,
                PropertyValue::Text(s) => match s.to_ascii_uppercase().as_str() {
                    "5" | "FIVE" => DataBits::Five,
                    "6" | "SIX" => DataBits::Six,
                    "7" | "SEVEN" => DataBits::Seven,
                    "8" | "EIGHT" => DataBits::Eight,
                    _ => return Err(PropertyError::invalid(key, format!("{s:?}"))),
                },
                other => return Err(PropertyError::invalid(key, format!("{other:?}"))),
            };
        }

        if let Some((key, value)) = lookup(props, "parity", "parity") {
            settings.parity = match value {
                PropertyValue::Text(s) => match s.to_ascii_uppercase().as_str() {
                    "N" | "NONE" => Parity::None,
                    "O" | "ODD" => Parity::Odd,
                    "E" | "EVEN" => Parity::Even,
                    "M" | "MARK" => Parity::Mark,
                    "S" | "SPACE" => Parity::Space,
                    _ => return Err(PropertyError::invalid(key, format!("{s:?}"))),
                },
                other => return Err(PropertyError::invalid(key, format!("{other:?}"))),
            };
        }

        if let Some((key, value)) = lookup(props, "stop_bits", "stopbits") {
            settings.stop_bits = match value {
                PropertyValue::Int(1) => StopBits::One,
                PropertyValue::Int(2) => StopBits::Two,
                PropertyValue::Float(f) if *f == 1.0 => StopBits::One,
                PropertyValue::Float(f) if *f == 1.5 => StopBits::OnePointFive,
                PropertyValue::Float(f) if *f == 2.0 => StopBits::Two,
                PropertyValue::Text(s) => match s.to_ascii_uppercase().as_str() {
                    "1" | "ONE" => StopBits::One,
                    "1.5" | "ONE_POINT_FIVE" => StopBits::OnePointFive,
                    "2" | "TWO" => StopBits::Two,
                    _ => return Err(PropertyError::invalid(key, format!("{s:?}"))),
                },
                other => return Err(PropertyError::invalid(key, format!("{other:?}"))),
            };
        }

        settings.xon_xoff = flag(props, "xon_xoff", "xonxoff")?;
        settings.rts_cts = flag(props, "rts_cts", "rtscts")?;
        settings.dsr_dtr = flag(props, "dsr_dtr", "dsrdtr")?;
        Ok(settings)
    }
}
