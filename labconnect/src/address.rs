//! Parsing of VISA-style addresses.
//!
//! Prefixes are case-insensitive. The following formats are understood:
//!
//! | Interface | Format |
//! |-----------|--------|
//! | Serial    | `ASRL<n>`, `COM<n>`, `ASRLCOM<n>`, `ASRL/dev/<name>`, `/dev/<name>`, optionally followed by `::INSTR` |
//! | Socket    | `TCPIP[board]::<host>::<port>::SOCKET`, `TCP::<host>::<port>`, `TCP::<host>:<port>`, `UDP::<host>::<port>`, `SOCKET::<host>::<port>` |
//! | Prologix  | `Prologix::<host>::<enet_port>[::GPIB[n]]::<pad>[::<sad>]` or `Prologix::<port>[::GPIB[n]]::<pad>[::<sad>]` |
//! | ZeroMQ    | `ZMQ::<host>::<port>` |

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::config::Interface;

/// Lowest valid primary GPIB address.
pub const MIN_PAD: u8 = 0;
/// Highest valid primary GPIB address.
pub const MAX_PAD: u8 = 30;
/// Lowest valid secondary GPIB address.
pub const MIN_SAD: u8 = 96;
/// Highest valid secondary GPIB address.
pub const MAX_SAD: u8 = 126;

/// Errors when parsing an address.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum AddressError {
    /// The address does not match any format of the interface.
    #[error("Invalid {interface} address {address:?}")]
    Invalid {
        /// The address.
        address: String,
        /// The interface that was tried.
        interface: &'static str,
    },
    /// The primary GPIB address is out of range.
    #[error("Invalid primary GPIB address {0}, must be in the range [0, 30]")]
    PrimaryAddress(u32),
    /// The secondary GPIB address is out of range.
    #[error("Invalid secondary GPIB address {0}, must be in the range [96, 126]")]
    SecondaryAddress(u32),
}

impl AddressError {
    fn invalid(address: &str, interface: &'static str) -> Self {
        AddressError::Invalid {
            address: address.to_string(),
            interface,
        }
    }
}

/// Where the Prologix controller is attached.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ControllerEndpoint {
    /// A GPIB-ETHERNET controller.
    Ethernet {
        /// Host name or IP address.
        host: String,
        /// The port of the controller, 1234 for real hardware.
        port: u16,
    },
    /// A GPIB-USB controller, which shows up as a serial port.
    Usb {
        /// Name of the serial port.
        port: String,
    },
}

impl ControllerEndpoint {
    /// The key under which the controller is shared.
    pub fn key(&self) -> String {
        match self {
            ControllerEndpoint::Ethernet { host, port } => format!("{host}:{port}"),
            ControllerEndpoint::Usb { port } => port.clone(),
        }
    }
}

/// A GPIB device behind a Prologix controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrologixAddress {
    /// The controller.
    pub endpoint: ControllerEndpoint,
    /// Primary GPIB address, 0 to 30.
    pub pad: u8,
    /// Secondary GPIB address, 96 to 126.
    pub sad: Option<u8>,
}

impl PrologixAddress {
    /// The `++addr` command that selects this device.
    pub fn addr_command(&self) -> String {
        match self.sad {
            Some(sad) => format!("++addr {} {}", self.pad, sad),
            None => format!("++addr {}", self.pad),
        }
    }
}

/// A parsed address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Address {
    /// A serial port.
    Serial {
        /// Name of the port, e.g., `COM3` or `/dev/ttyUSB0`.
        port: String,
    },
    /// A TCP or UDP socket.
    Socket {
        /// Host name or IP address.
        host: String,
        /// Port number.
        port: u16,
        /// Whether it is a UDP socket.
        datagram: bool,
    },
    /// A GPIB device behind a Prologix controller.
    Prologix(PrologixAddress),
    /// A ZeroMQ endpoint.
    Zmq {
        /// Host name or IP address.
        host: String,
        /// Port number.
        port: u16,
    },
}

impl Address {
    /// Parse an address and infer the interface from it.
    pub fn parse(address: &str) -> Result<Self, AddressError> {
        let prefix = address
            .split("::")
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        if prefix == "PROLOGIX" {
            parse_prologix(address).map(Address::Prologix)
        } else if prefix == "ZMQ" {
            parse_zmq(address)
        } else if prefix == "TCP"
            || prefix == "UDP"
            || prefix == "SOCKET"
            || prefix.strip_prefix("TCPIP").is_some_and(is_digits_or_empty)
        {
            parse_socket(address)
        } else {
            parse_serial(address).map(|port| Address::Serial { port })
        }
    }

    /// Parse an address that must belong to `interface`.
    ///
    /// [`Interface::None`] infers the interface, see [`Address::parse`].
    pub fn parse_as(address: &str, interface: Interface) -> Result<Self, AddressError> {
        match interface {
            Interface::Serial => parse_serial(address).map(|port| Address::Serial { port }),
            Interface::Socket => parse_socket(address),
            Interface::Prologix => parse_prologix(address).map(Address::Prologix),
            Interface::Zmq => parse_zmq(address),
            _ => Address::parse(address),
        }
    }

    /// The interface the address belongs to.
    pub fn interface(&self) -> Interface {
        match self {
            Address::Serial { .. } => Interface::Serial,
            Address::Socket { .. } => Interface::Socket,
            Address::Prologix(_) => Interface::Prologix,
            Address::Zmq { .. } => Interface::Zmq,
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Serial { port } => write!(f, "ASRL{port}"),
            Address::Socket {
                host,
                port,
                datagram,
            } => {
                let prefix = if *datagram { "UDP" } else { "TCP" };
                write!(f, "{prefix}::{host}::{port}")
            }
            Address::Prologix(p) => {
                match &p.endpoint {
                    ControllerEndpoint::Ethernet { host, port } => {
                        write!(f, "Prologix::{host}::{port}::GPIB::{}", p.pad)?
                    }
                    ControllerEndpoint::Usb { port } => {
                        write!(f, "Prologix::{port}::GPIB::{}", p.pad)?
                    }
                }
                match p.sad {
                    Some(sad) => write!(f, "::{sad}"),
                    None => Ok(()),
                }
            }
            Address::Zmq { host, port } => write!(f, "ZMQ::{host}::{port}"),
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_digits_or_empty(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

fn valid_name(s: &str) -> bool {
    !s.is_empty() && !s.contains(':') && !s.chars().any(char::is_whitespace)
}

/// Strip `prefix` if `s` starts with it, ignoring ASCII case.
fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Get the name of the serial port from an address.
pub fn parse_serial(address: &str) -> Result<String, AddressError> {
    let trimmed = match address.len().checked_sub("::INSTR".len()) {
        Some(i) if address.is_char_boundary(i) && address[i..].eq_ignore_ascii_case("::INSTR") => {
            &address[..i]
        }
        _ => address,
    };

    if trimmed.starts_with("/dev/") && valid_name(trimmed) {
        return Ok(trimmed.to_string());
    }

    for prefix in ["ASRLCOM", "ASRL", "COM"] {
        if let Some(rest) = strip_prefix_ignore_case(trimmed, prefix) {
            if rest.starts_with("/dev/") && valid_name(rest) {
                return Ok(rest.to_string());
            }
            if is_digits(rest) {
                return Ok(format!("COM{rest}"));
            }
        }
    }
    Err(AddressError::invalid(address, "serial"))
}

/// Parse a socket address.
pub fn parse_socket(address: &str) -> Result<Address, AddressError> {
    let invalid = || AddressError::invalid(address, "socket");
    let segments: Vec<&str> = address.split("::").collect();
    let prefix = segments[0].to_ascii_uppercase();
    let ivi = prefix.strip_prefix("TCPIP").is_some_and(is_digits_or_empty);
    if !(ivi || prefix == "TCP" || prefix == "UDP" || prefix == "SOCKET") {
        return Err(invalid());
    }

    let (host, port) = match segments.as_slice() {
        [_, host_port] if !ivi => host_port.rsplit_once(':').ok_or_else(invalid)?,
        [_, host, port] if !ivi => (*host, *port),
        [_, host, port, suffix] if suffix.eq_ignore_ascii_case("SOCKET") => (*host, *port),
        _ => return Err(invalid()),
    };
    if !valid_name(host) || !is_digits(port) {
        return Err(invalid());
    }
    Ok(Address::Socket {
        host: host.to_string(),
        port: port.parse().map_err(|_| invalid())?,
        datagram: prefix == "UDP",
    })
}

/// Parse a ZeroMQ address.
pub fn parse_zmq(address: &str) -> Result<Address, AddressError> {
    let invalid = || AddressError::invalid(address, "ZeroMQ");
    match address.split("::").collect::<Vec<_>>().as_slice() {
        [prefix, host, port]
            if prefix.eq_ignore_ascii_case("ZMQ") && valid_name(host) && is_digits(port) =>
        {
            Ok(Address::Zmq {
                host: host.to_string(),
                port: port.parse().map_err(|_| invalid())?,
            })
        }
        _ => Err(invalid()),
    }
}

/// Parse a Prologix address and check the GPIB address ranges.
pub fn parse_prologix(address: &str) -> Result<PrologixAddress, AddressError> {
    let invalid = || AddressError::invalid(address, "Prologix");
    let segments: Vec<&str> = address.split("::").collect();
    let (hw, mut rest) = match segments.as_slice() {
        [prefix, hw, rest @ ..] if prefix.eq_ignore_ascii_case("PROLOGIX") => (*hw, rest),
        _ => return Err(invalid()),
    };
    if !valid_name(hw) {
        return Err(invalid());
    }

    let mut enet_port = None;
    if let [port, tail @ ..] = rest {
        // a PAD has to follow, otherwise the digits are the PAD
        if port.len() >= 4 && is_digits(port) && !tail.is_empty() {
            enet_port = Some(port.parse::<u16>().map_err(|_| invalid())?);
            rest = tail;
        }
    }
    if let [gpib, tail @ ..] = rest {
        if strip_prefix_ignore_case(gpib, "GPIB").is_some_and(is_digits_or_empty) {
            rest = tail;
        }
    }

    let (pad, sad) = match rest {
        [pad] if is_digits(pad) => (*pad, None),
        [pad, sad] if is_digits(pad) && is_digits(sad) => (*pad, Some(*sad)),
        _ => return Err(invalid()),
    };

    let pad: u32 = pad.parse().map_err(|_| invalid())?;
    if pad > u32::from(MAX_PAD) {
        return Err(AddressError::PrimaryAddress(pad));
    }
    let sad = match sad {
        Some(sad) => {
            let sad: u32 = sad.parse().map_err(|_| invalid())?;
            if !(u32::from(MIN_SAD)..=u32::from(MAX_SAD)).contains(&sad) {
                return Err(AddressError::SecondaryAddress(sad));
            }
            Some(sad as u8)
        }
        None => None,
    };

    let endpoint = match enet_port {
        Some(port) => ControllerEndpoint::Ethernet {
            host: hw.to_string(),
            port,
        },
        None => ControllerEndpoint::Usb {
            port: parse_serial(&format!("ASRL{hw}"))?,
        },
    };
    Ok(PrologixAddress {
        endpoint,
        pad: pad as u8,
        sad,
    })
}
