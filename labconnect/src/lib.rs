//! labconnect: Message-based connections to laboratory equipment
//!
//! Most laboratory equipment talks in messages: a command is written as text followed by a
//! termination sequence, and the reply is read back until the equipment's termination sequence
//! arrives. labconnect takes care of the framing, the encoding, the timeouts and the size limits,
//! no matter which port the equipment is attached to. Instrument drivers are written against the
//! [`InstrumentInterface`] trait and return an [`InstrumentError`].
//!
//! # Currently implemented interfaces are:
//! - Serial ports using the [`serialport`] crate (feature `serial`, enabled by default).
//! - TCP and UDP sockets, with a reconnect if the peer resets a TCP connection.
//! - GPIB devices behind a Prologix GPIB-ETHERNET or GPIB-USB controller.
//! - ZeroMQ request sockets (feature `zeromq`, requires the system `libzmq`).
//!
//! # Usage
//!
//! Connections are usually opened from a [`ConnectionConfig`], which can be deserialized from a
//! configuration file:
//!
//! ```no_run
//! use labconnect::{ConnectionConfig, InstrumentInterface};
//!
//! let config: ConnectionConfig = toml::from_str(
//!     r#"
//!     address = "TCP::192.168.1.10::5025"
//!
//!     [properties]
//!     timeout = 2.0
//!     read_termination = "\n"
//!     "#,
//! )
//! .unwrap();
//! let mut inst = config.connect().unwrap();
//! println!("{}", inst.query("*IDN?").unwrap());
//! ```
//!
//! Every transport can also be wrapped in a [`MessageBased`] connection directly. To test your
//! driver without hardware, use the [`LoopbackTransport`].
//!
//! # Logging
//!
//! labconnect logs with [`tracing`]: every write and read on the `debug` level, connects,
//! disconnects and reconnects on the `info` level. Install a subscriber to see the messages.
//!
//! # License
//!
//! Licensed under either of
//!
//! - Apache License, Version 2.0 ([LICENSE-APACHE](http://www.apache.org/licenses/LICENSE-2.0))
//! - MIT license ([LICENSE-MIT](http://opensource.org/licenses/MIT))
//!
//! at your option.
//!
//! # Contribution
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted
//! for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
//! dual licensed as above, without any additional terms or conditions.

#![warn(missing_docs)]

pub mod address;
pub mod block;
pub mod codec;
pub mod config;
mod factory;
mod instrument;
mod loopback;
mod message_based;
pub mod policy;
mod prologix;
pub mod reader;
pub mod transport;

pub use address::Address;
pub use block::{BlockFormat, ByteOrder, DataType};
pub use codec::{Encoding, EncodingErrors};
pub use config::{Backend, ConnectionConfig, Interface, Properties, PropertyValue};
pub use factory::{connect, connect_prologix};
pub use instrument::{ConfigError, InstrumentError, InstrumentInterface};
pub use loopback::{LoopbackEvent, LoopbackTransport};
pub use message_based::MessageBased;
pub use policy::{MessagePolicy, Termination};
pub use prologix::{
    MAX_TRIGGER_ADDRESSES, PrologixConnection, PrologixOptions, PrologixRegistry,
    SharedController,
};
