//! Open a connection from a [`ConnectionConfig`].

use tracing::debug;

use crate::{
    address::{Address, ControllerEndpoint, PrologixAddress},
    config::{Backend, ConnectionConfig, Properties},
    instrument::{ConfigError, InstrumentError, InstrumentInterface},
    message_based::MessageBased,
    policy::MessagePolicy,
    prologix::{PrologixConnection, PrologixOptions, PrologixRegistry},
    transport::{SocketSettings, SocketTransport, Transport},
};

/// Open a connection.
///
/// The address is parsed for the configured interface, or the interface is inferred from the
/// address if none is configured. Devices behind a Prologix controller share the controller that
/// is registered in `registry`.
///
/// # Arguments
/// * `config` - The connection record.
/// * `registry` - Where Prologix controllers are shared, usually [`PrologixRegistry::global`].
///
/// # Example
/// ```no_run
/// use labconnect::{ConnectionConfig, PrologixRegistry, connect};
///
/// let config = ConnectionConfig::new("TCP::192.168.1.10::5025").with_property("timeout", 2.0);
/// let mut inst = connect(&config, PrologixRegistry::global()).unwrap();
/// println!("{}", inst.query("*IDN?").unwrap());
/// ```
pub fn connect(
    config: &ConnectionConfig,
    registry: &PrologixRegistry,
) -> Result<Box<dyn InstrumentInterface>, InstrumentError> {
    let address = config.address.as_str();
    if config.backend != Backend::Native {
        return Err(InstrumentError::configuration(
            address,
            ConfigError::Unsupported(format!("The {} backend is not supported", config.backend)),
        ));
    }
    let parsed = Address::parse_as(address, config.interface)
        .map_err(|err| InstrumentError::configuration(address, err))?;
    let policy = config
        .properties
        .message_policy()
        .map_err(|err| InstrumentError::configuration(address, err))?;
    debug!(address, interface = %parsed.interface(), "Connecting");

    match parsed {
        Address::Serial { port } => {
            let transport = open_serial(address, &port, &config.properties, &policy)?;
            Ok(Box::new(MessageBased::new(address, transport, policy)?))
        }
        Address::Socket {
            host,
            port,
            datagram,
        } => {
            let transport =
                open_socket(address, &host, port, datagram, &config.properties, &policy)?;
            Ok(Box::new(MessageBased::new(address, transport, policy)?))
        }
        Address::Prologix(prologix) => Ok(Box::new(connect_prologix(
            address,
            &prologix,
            &config.properties,
            registry,
        )?)),
        Address::Zmq { host, port } => connect_zmq(address, &host, port, &config.properties, policy),
    }
}

impl ConnectionConfig {
    /// Open the connection, sharing Prologix controllers process-wide.
    pub fn connect(&self) -> Result<Box<dyn InstrumentInterface>, InstrumentError> {
        connect(self, PrologixRegistry::global())
    }
}

/// Attach to a device behind a Prologix controller, opening the controller if needed.
///
/// # Arguments
/// * `address` - The address of the device.
/// * `prologix` - The parsed address.
/// * `properties` - Properties of the controller connection and the Prologix options.
/// * `registry` - Where the controller is shared.
pub fn connect_prologix(
    address: &str,
    prologix: &PrologixAddress,
    properties: &Properties,
    registry: &PrologixRegistry,
) -> Result<PrologixConnection, InstrumentError> {
    let options = PrologixOptions::from_properties(properties)
        .map_err(|err| InstrumentError::configuration(address, err))?;
    let controller = registry.get_or_open(&prologix.endpoint.key(), || {
        let policy = properties
            .message_policy()
            .map_err(|err| InstrumentError::configuration(address, err))?;
        let (controller_address, transport): (String, Box<dyn Transport>) =
            match &prologix.endpoint {
                ControllerEndpoint::Ethernet { host, port } => {
                    let controller_address = format!("TCP::{host}::{port}");
                    let transport = open_socket(
                        &controller_address,
                        host,
                        *port,
                        false,
                        properties,
                        &policy,
                    )?;
                    (controller_address, Box::new(transport) as Box<dyn Transport>)
                }
                ControllerEndpoint::Usb { port } => {
                    let controller_address = format!("ASRL{port}");
                    let transport = open_serial(&controller_address, port, properties, &policy)?;
                    (controller_address, transport)
                }
            };
        MessageBased::new(&controller_address, transport, policy)
    })?;
    PrologixConnection::attach(address, prologix, &options, controller)
}

fn open_socket(
    address: &str,
    host: &str,
    port: u16,
    datagram: bool,
    properties: &Properties,
    policy: &MessagePolicy,
) -> Result<SocketTransport, InstrumentError> {
    let settings = SocketSettings::from_properties(properties, datagram)
        .map_err(|err| InstrumentError::configuration(address, err))?;
    SocketTransport::try_new(host, port, settings, policy.timeout())
        .map_err(|err| InstrumentError::from_transport(address, policy.timeout(), err))
}

#[cfg(feature = "serial")]
fn open_serial(
    address: &str,
    port: &str,
    properties: &Properties,
    policy: &MessagePolicy,
) -> Result<Box<dyn Transport>, InstrumentError> {
    use crate::transport::{SerialSettings, SerialTransport};

    let settings = SerialSettings::from_properties(properties)
        .map_err(|err| InstrumentError::configuration(address, err))?;
    let transport = SerialTransport::try_new(port, &settings, policy.timeout())
        .map_err(|err| InstrumentError::from_transport(address, policy.timeout(), err))?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "serial"))]
fn open_serial(
    address: &str,
    _port: &str,
    _properties: &Properties,
    _policy: &MessagePolicy,
) -> Result<Box<dyn Transport>, InstrumentError> {
    Err(InstrumentError::configuration(
        address,
        ConfigError::Unsupported("Serial ports require the `serial` feature".to_string()),
    ))
}

#[cfg(feature = "zeromq")]
fn connect_zmq(
    address: &str,
    host: &str,
    port: u16,
    properties: &Properties,
    policy: MessagePolicy,
) -> Result<Box<dyn InstrumentInterface>, InstrumentError> {
    use crate::transport::{ZmqSettings, ZmqTransport};

    let settings = ZmqSettings::from_properties(properties)
        .map_err(|err| InstrumentError::configuration(address, err))?;
    let transport = ZmqTransport::try_new(
        host,
        port,
        settings,
        policy.timeout(),
        policy.max_read_size(),
    )
    .map_err(|err| InstrumentError::from_transport(address, policy.timeout(), err))?;
    Ok(Box::new(MessageBased::new(address, transport, policy)?))
}

#[cfg(not(feature = "zeromq"))]
fn connect_zmq(
    address: &str,
    _host: &str,
    _port: u16,
    _properties: &Properties,
    _policy: MessagePolicy,
) -> Result<Box<dyn InstrumentInterface>, InstrumentError> {
    Err(InstrumentError::configuration(
        address,
        ConfigError::Unsupported("ZeroMQ requires the `zeromq` feature".to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_native_backend() {
        let config = ConnectionConfig {
            backend: Backend::Visa,
            ..ConnectionConfig::new("TCP::localhost::5025")
        };
        let err = connect(&config, &PrologixRegistry::new()).err().unwrap();
        assert!(err.is_configuration_error());
        assert_eq!(err.address(), "TCP::localhost::5025");
    }

    #[test]
    fn test_invalid_property() {
        let config = ConnectionConfig::new("TCP::localhost::5025").with_property("timeout", "soon");
        let err = connect(&config, &PrologixRegistry::new()).err().unwrap();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_invalid_gpib_address_is_rejected_before_connecting() {
        let registry = PrologixRegistry::new();
        let config = ConnectionConfig::new("Prologix::localhost::1234::31");
        let err = connect(&config, &registry).err().unwrap();
        assert!(err.is_configuration_error());
        assert!(registry.is_empty());
    }
}
