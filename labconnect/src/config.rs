//! Connection records and their properties.
//!
//! A [`ConnectionConfig`] describes how to reach one piece of equipment: its address, the
//! backend and interface to use and a free-form map of [`Properties`]. Records are usually
//! loaded from a file, all types therefore implement [`serde::Deserialize`]:
//!
//! ```
//! use labconnect::{ConnectionConfig, Interface};
//!
//! let mut config = ConnectionConfig::new("TCP::192.168.1.10::5025");
//! config.interface = Interface::Socket;
//! config.properties.insert("timeout", 2.5);
//! assert_eq!(config.properties.get_float("timeout").unwrap(), Some(2.5));
//! ```

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

use crate::policy::{MessagePolicy, PolicyError, Termination};

/// Errors when reading properties.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum PropertyError {
    /// The property has a different type than expected.
    #[error("property {key:?} must be {expected}, got {found}")]
    Mismatch {
        /// Name of the property.
        key: String,
        /// The expected type.
        expected: &'static str,
        /// The type that was found.
        found: &'static str,
    },
    /// The property has the right type but an invalid value.
    #[error("invalid value for property {key:?}: {reason}")]
    Invalid {
        /// Name of the property.
        key: String,
        /// Why the value is invalid.
        reason: String,
    },
    /// The property was rejected by the message policy.
    #[error("invalid value for property {key:?}: {source}")]
    Policy {
        /// Name of the property.
        key: String,
        /// The policy error.
        source: PolicyError,
    },
}

impl PropertyError {
    /// Create an [`PropertyError::Invalid`] error.
    pub fn invalid(key: &str, reason: impl fmt::Display) -> Self {
        PropertyError::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// The value of a single property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// No value, e.g., to disable a termination or a timeout.
    Null,
    /// A boolean flag.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// Text.
    Text(String),
    /// Raw bytes, given as an array of integers.
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// A short name of the value type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Bool(_) => "a bool",
            PropertyValue::Int(_) => "an integer",
            PropertyValue::Float(_) => "a float",
            PropertyValue::Text(_) => "text",
            PropertyValue::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<&[u8]> for PropertyValue {
    fn from(value: &[u8]) -> Self {
        PropertyValue::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        PropertyValue::Bytes(value)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(PropertyValue::Null, Into::into)
    }
}

/// Free-form key/value configuration of a connection.
///
/// The typed getters return `Ok(None)` if a key is absent and a [`PropertyError`] if it has the
/// wrong type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, PropertyValue>);

impl Properties {
    /// Create an empty set of properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a property, replacing any previous value.
    pub fn insert(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Builder style [`Properties::insert`].
    pub fn with(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Get the raw value of a property.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Whether a property is set, also if its value is null.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate over all properties.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn mismatch(key: &str, expected: &'static str, found: &PropertyValue) -> PropertyError {
        PropertyError::Mismatch {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    /// Get a boolean property.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, PropertyError> {
        match self.get(key) {
            None => Ok(None),
            Some(PropertyValue::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(Self::mismatch(key, "a bool", other)),
        }
    }

    /// Get an integer property.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>, PropertyError> {
        match self.get(key) {
            None => Ok(None),
            Some(PropertyValue::Int(i)) => Ok(Some(*i)),
            Some(other) => Err(Self::mismatch(key, "an integer", other)),
        }
    }

    /// Get a floating-point property, integers are converted.
    pub fn get_float(&self, key: &str) -> Result<Option<f64>, PropertyError> {
        match self.get(key) {
            None => Ok(None),
            Some(PropertyValue::Float(f)) => Ok(Some(*f)),
            Some(PropertyValue::Int(i)) => Ok(Some(*i as f64)),
            Some(other) => Err(Self::mismatch(key, "a number", other)),
        }
    }

    /// Get a floating-point property that may be null.
    ///
    /// Returns `Ok(Some(None))` if the property is set to null.
    pub fn get_nullable_float(&self, key: &str) -> Result<Option<Option<f64>>, PropertyError> {
        match self.get(key) {
            Some(PropertyValue::Null) => Ok(Some(None)),
            _ => self.get_float(key).map(|v| v.map(Some)),
        }
    }

    /// Get a text property.
    pub fn get_text(&self, key: &str) -> Result<Option<&str>, PropertyError> {
        match self.get(key) {
            None => Ok(None),
            Some(PropertyValue::Text(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(Self::mismatch(key, "text", other)),
        }
    }

    /// Get a termination property, which is text, bytes or null.
    ///
    /// Returns `Ok(Some(None))` if the property is set to null.
    pub fn get_termination(
        &self,
        key: &str,
    ) -> Result<Option<Option<Termination>>, PropertyError> {
        match self.get(key) {
            None => Ok(None),
            Some(PropertyValue::Null) => Ok(Some(None)),
            Some(PropertyValue::Text(s)) => Ok(Some(Some(Termination::Text(s.clone())))),
            Some(PropertyValue::Bytes(b)) => Ok(Some(Some(Termination::Bytes(b.clone())))),
            Some(other) => Err(Self::mismatch(key, "text or bytes", other)),
        }
    }

    /// Build the message policy from the properties.
    ///
    /// The following properties are used, all others are ignored:
    /// * `encoding` - Text encoding. Default: `utf-8`.
    /// * `encoding_errors` - Error handler of the encoding. Default: `strict`.
    /// * `termination` - Sets both terminations.
    /// * `read_termination` - Default: `"\n"`.
    /// * `write_termination` - Default: `"\r\n"`.
    /// * `max_read_size` - Default: 65536.
    /// * `timeout` - Seconds, null or negative blocks forever. Default: null.
    /// * `rstrip` - Remove trailing whitespace from read messages. Default: `false`.
    pub fn message_policy(&self) -> Result<MessagePolicy, PropertyError> {
        let mut policy = MessagePolicy::default();
        let wrap = |key: &str| {
            let key = key.to_string();
            move |source: PolicyError| PropertyError::Policy { key, source }
        };

        if let Some(size) = self.get_int("max_read_size")? {
            policy
                .set_max_read_size(size)
                .map_err(wrap("max_read_size"))?;
        }
        if let Some(timeout) = self.get_nullable_float("timeout")? {
            policy.set_timeout(timeout);
        }
        if let Some(name) = self.get_text("encoding")? {
            policy.set_encoding(name).map_err(wrap("encoding"))?;
        }
        if let Some(name) = self.get_text("encoding_errors")? {
            policy
                .set_encoding_errors(name)
                .map_err(wrap("encoding_errors"))?;
        }
        if let Some(rstrip) = self.get_bool("rstrip")? {
            policy.set_rstrip(rstrip);
        }

        if let Some(term) = self.get_termination("termination")? {
            policy
                .set_read_termination(term.clone())
                .map_err(wrap("termination"))?;
            policy
                .set_write_termination(term)
                .map_err(wrap("termination"))?;
        } else {
            if let Some(term) = self.get_termination("read_termination")? {
                policy
                    .set_read_termination(term)
                    .map_err(wrap("read_termination"))?;
            }
            if let Some(term) = self.get_termination("write_termination")? {
                policy
                    .set_write_termination(term)
                    .map_err(wrap("write_termination"))?;
            }
        }
        Ok(policy)
    }
}

impl<K: Into<String>, V: Into<PropertyValue>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Properties(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Implement `FromStr`, `Display`, `Serialize` and case-insensitive `Deserialize` for a
/// name-based enum.
macro_rules! named_enum {
    ($ty:ident, $what:literal, { $($variant:ident => [$name:literal $(, $alias:literal)*]),+ $(,)? }) => {
        impl $ty {
            /// The canonical name.
            pub fn name(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lower = s.trim().to_ascii_lowercase();
                $(
                    if lower == $name.to_ascii_lowercase() $(|| lower == $alias)* {
                        return Ok($ty::$variant);
                    }
                )+
                Err(format!("unknown {} {:?}", $what, s))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = String::deserialize(deserializer)?;
                name.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// The software backend that talks to the equipment.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Backend {
    /// The transports of this crate.
    #[default]
    Native,
    /// A VISA library.
    Visa,
    /// The NI-DAQmx library.
    Nidaq,
}

named_enum!(Backend, "backend", {
    Native => ["Native"],
    Visa => ["VISA", "pyvisa"],
    Nidaq => ["NIDAQ"],
});

/// The interface of the native backend.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Interface {
    /// Infer the interface from the address.
    #[default]
    None,
    /// A serial port.
    Serial,
    /// A TCP or UDP socket.
    Socket,
    /// A Prologix GPIB-USB or GPIB-ETHERNET controller.
    Prologix,
    /// A ZeroMQ request socket.
    Zmq,
}

named_enum!(Interface, "interface", {
    None => ["None", ""],
    Serial => ["Serial", "asrl"],
    Socket => ["Socket", "tcp", "udp"],
    Prologix => ["Prologix"],
    Zmq => ["ZMQ", "zeromq"],
});

/// A connection record: the address of the equipment, how to talk to it and its properties.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// VISA-style address, e.g., `ASRL/dev/ttyUSB0` or `TCP::192.168.1.10::5025`.
    pub address: String,
    /// The backend to use.
    #[serde(default)]
    pub backend: Backend,
    /// The interface of the native backend.
    #[serde(default)]
    pub interface: Interface,
    /// Free-form configuration.
    #[serde(default)]
    pub properties: Properties,
}

impl ConnectionConfig {
    /// Create a record with the default backend, an inferred interface and no properties.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    /// Builder style property setter.
    pub fn with_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key, value);
        self
    }
}
