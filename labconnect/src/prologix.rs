//! GPIB devices behind a Prologix GPIB-ETHERNET or GPIB-USB controller.
//!
//! Several GPIB devices share one controller and therefore one serial or socket connection. The
//! [`PrologixRegistry`] hands out one shared controller per physical endpoint, and every
//! [`PrologixConnection`] selects its device with `++addr` before each write and read.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use bytes::Bytes;
use tracing::{debug, info};

use crate::{
    address::PrologixAddress,
    block::{BlockFormat, DataType},
    config::{Properties, PropertyError},
    instrument::{ConfigError, InstrumentError, InstrumentInterface},
    message_based::MessageBased,
    policy::{MessagePolicy, Termination},
    transport::Transport,
};

/// The maximum number of addresses of a group execute trigger.
pub const MAX_TRIGGER_ADDRESSES: usize = 15;

/// The connection to a Prologix controller, shared by all devices behind it.
pub type SharedController = Arc<Mutex<MessageBased<Box<dyn Transport>>>>;

/// Controllers that are in use, keyed by their endpoint.
#[derive(Default)]
pub struct PrologixRegistry {
    controllers: Mutex<HashMap<String, SharedController>>,
}

impl std::fmt::Debug for PrologixRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrologixRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

impl PrologixRegistry {
    /// Create an empty registry, e.g., for tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry of the process.
    pub fn global() -> &'static PrologixRegistry {
        static REGISTRY: OnceLock<PrologixRegistry> = OnceLock::new();
        REGISTRY.get_or_init(PrologixRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedController>> {
        self.controllers
            .lock()
            .expect("Mutex should not be poisoned")
    }

    /// Get the controller for `key`, or open and register it if there is none yet.
    ///
    /// The registry stays locked while `open` runs, so that a controller is never opened twice.
    ///
    /// # Arguments
    /// * `key` - The key of the endpoint, see [`crate::address::ControllerEndpoint::key`].
    /// * `open` - Opens the connection to the controller.
    pub fn get_or_open<F>(&self, key: &str, open: F) -> Result<SharedController, InstrumentError>
    where
        F: FnOnce() -> Result<MessageBased<Box<dyn Transport>>, InstrumentError>,
    {
        let mut controllers = self.lock();
        if let Some(controller) = controllers.get(key) {
            return Ok(Arc::clone(controller));
        }
        let controller = Arc::new(Mutex::new(open()?));
        info!(key, "Registered Prologix controller");
        controllers.insert(key.to_string(), Arc::clone(&controller));
        Ok(controller)
    }

    /// The controller for `key`, if it is registered.
    pub fn get(&self, key: &str) -> Option<SharedController> {
        self.lock().get(key).cloned()
    }

    /// Remove the controller for `key` and disconnect it.
    ///
    /// Devices that still hold the controller fail with [`InstrumentError::Disconnected`].
    pub fn close(&self, key: &str) -> bool {
        let Some(controller) = self.lock().remove(key) else {
            return false;
        };
        controller
            .lock()
            .expect("Mutex should not be poisoned")
            .disconnect();
        true
    }

    /// The keys of all registered controllers.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The number of registered controllers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no controller is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Options that are written to the controller whenever a device attaches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrologixOptions {
    /// `1` for CONTROLLER mode, `0` for DEVICE mode. Default: `1`.
    pub mode: i64,
    /// Assert EOI with the last byte.
    pub eoi: Option<i64>,
    /// GPIB termination: 0 (CR+LF), 1 (CR), 2 (LF) or 3 (none).
    pub eos: Option<i64>,
    /// Append `eot_char` when EOI is detected.
    pub eot_enable: Option<i64>,
    /// The character appended when EOI is detected.
    pub eot_char: Option<i64>,
    /// Inter-character timeout in milliseconds.
    pub read_tmo_ms: Option<i64>,
    /// Bracket queries with `++auto 1` and `++auto 0`. Not a controller command, the
    /// setting belongs to the device. Default: `true`.
    pub query_auto: bool,
}

impl Default for PrologixOptions {
    fn default() -> Self {
        Self {
            mode: 1,
            eoi: None,
            eos: None,
            eot_enable: None,
            eot_char: None,
            read_tmo_ms: None,
            query_auto: true,
        }
    }
}

impl PrologixOptions {
    /// Read the options from connection properties.
    pub fn from_properties(properties: &Properties) -> Result<Self, PropertyError> {
        Ok(Self {
            mode: properties.get_int("mode")?.unwrap_or(1),
            eoi: properties.get_int("eoi")?,
            eos: properties.get_int("eos")?,
            eot_enable: properties.get_int("eot_enable")?,
            eot_char: properties.get_int("eot_char")?,
            read_tmo_ms: properties.get_int("read_tmo_ms")?,
            query_auto: properties.get_bool("query_auto")?.unwrap_or(true),
        })
    }

    /// The commands that apply these options, in order.
    pub fn commands(&self) -> Vec<String> {
        let mut commands = vec![format!("++mode {}", self.mode)];
        let optional = [
            ("eoi", self.eoi),
            ("eos", self.eos),
            ("eot_enable", self.eot_enable),
            ("eot_char", self.eot_char),
            ("read_tmo_ms", self.read_tmo_ms),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                commands.push(format!("++{name} {value}"));
            }
        }
        commands
    }
}

/// A GPIB device behind a Prologix controller.
///
/// Termination, encoding, size and timeout settings belong to the controller and are shared by
/// all devices behind it. One write or read, including the `++addr` that precedes it, holds the
/// controller exclusively. A write followed by a separate read is not atomic: callers that use
/// one controller from several threads must serialize such sequences themselves.
pub struct PrologixConnection {
    address: String,
    key: String,
    addr_command: String,
    controller: SharedController,
    query_auto: bool,
    connected: bool,
}

impl std::fmt::Debug for PrologixConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrologixConnection")
            .field("address", &self.address)
            .field("controller", &self.key)
            .field("query_auto", &self.query_auto)
            .field("connected", &self.connected)
            .finish()
    }
}

impl PrologixConnection {
    /// Attach a device to a controller and write the controller options.
    ///
    /// # Arguments
    /// * `address` - The address of the device, used in log messages and errors.
    /// * `prologix` - The parsed address.
    /// * `options` - Options to write to the controller.
    /// * `controller` - The shared controller, see [`PrologixRegistry::get_or_open`].
    pub fn attach(
        address: &str,
        prologix: &PrologixAddress,
        options: &PrologixOptions,
        controller: SharedController,
    ) -> Result<Self, InstrumentError> {
        let connection = Self {
            address: address.to_string(),
            key: prologix.endpoint.key(),
            addr_command: prologix.addr_command(),
            controller,
            query_auto: options.query_auto,
            connected: true,
        };
        {
            let mut controller = connection.lock()?;
            for command in options.commands() {
                controller
                    .write(&command)
                    .map_err(|err| err.with_address(&connection.address))?;
            }
        }
        info!(address, controller = %connection.key, "Attached to Prologix controller");
        Ok(connection)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MessageBased<Box<dyn Transport>>>, InstrumentError> {
        if !self.connected {
            return Err(InstrumentError::Disconnected {
                address: self.address.clone(),
            });
        }
        Ok(self
            .controller
            .lock()
            .expect("Mutex should not be poisoned"))
    }

    /// Lock the controller and select this device.
    fn select(&self) -> Result<MutexGuard<'_, MessageBased<Box<dyn Transport>>>, InstrumentError> {
        let mut controller = self.lock()?;
        debug!(address = %self.address, command = %self.addr_command, "Select GPIB device");
        controller
            .write(&self.addr_command)
            .map_err(|err| err.with_address(&self.address))?;
        Ok(controller)
    }

    /// Run `op` on the selected device, bracketed by `++auto 1` and `++auto 0` if enabled.
    fn auto_query<R>(
        &self,
        op: impl FnOnce(&mut MessageBased<Box<dyn Transport>>) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        let mut controller = self.select()?;
        if self.query_auto {
            controller
                .write("++auto 1")
                .map_err(|err| err.with_address(&self.address))?;
        }
        let reply = op(&mut *controller);
        if self.query_auto {
            let restored = controller.write("++auto 0");
            if reply.is_ok() {
                restored.map_err(|err| err.with_address(&self.address))?;
            }
        }
        reply.map_err(|err| err.with_address(&self.address))
    }

    fn configure<R>(
        &self,
        op: impl FnOnce(&mut MessageBased<Box<dyn Transport>>) -> Result<R, InstrumentError>,
    ) -> Result<R, InstrumentError> {
        let mut controller = self.lock()?;
        op(&mut *controller).map_err(|err| err.with_address(&self.address))
    }

    /// The key of the controller in the registry.
    pub fn controller_key(&self) -> &str {
        &self.key
    }

    /// The shared controller.
    pub fn controller(&self) -> SharedController {
        Arc::clone(&self.controller)
    }

    /// Whether queries send `++auto 1` before and `++auto 0` after the exchange.
    pub fn query_auto(&self) -> bool {
        self.query_auto
    }

    /// Enable or disable `++auto` around queries.
    pub fn set_query_auto(&mut self, enabled: bool) {
        self.query_auto = enabled;
    }

    /// Send the Group Execute Trigger command.
    ///
    /// Without addresses, the currently addressed device is triggered.
    ///
    /// # Arguments
    /// * `addresses` - Up to 15 GPIB addresses. A secondary address follows its primary address,
    ///   e.g., `[3, 96, 12, 21]`.
    pub fn group_execute_trigger(&mut self, addresses: &[u8]) -> Result<usize, InstrumentError> {
        if addresses.len() > MAX_TRIGGER_ADDRESSES {
            return Err(InstrumentError::configuration(
                &self.address,
                ConfigError::InvalidArgument(format!(
                    "At most {MAX_TRIGGER_ADDRESSES} addresses can be triggered, got {}",
                    addresses.len()
                )),
            ));
        }
        let mut command = String::from("++trg");
        for address in addresses {
            command.push_str(&format!(" {address}"));
        }
        self.configure(|controller| controller.write(&command))
    }

    /// The version string of the controller.
    pub fn version(&mut self) -> Result<String, InstrumentError> {
        self.configure(|controller| controller.query("++ver"))
    }
}

impl InstrumentInterface for PrologixConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn policy(&self) -> MessagePolicy {
        self.controller
            .lock()
            .expect("Mutex should not be poisoned")
            .policy()
    }

    fn set_read_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError> {
        self.configure(|c| c.set_read_termination(termination))
    }

    fn set_write_termination(
        &mut self,
        termination: Option<Termination>,
    ) -> Result<(), InstrumentError> {
        self.configure(|c| c.set_write_termination(termination))
    }

    fn set_encoding(&mut self, encoding: &str) -> Result<(), InstrumentError> {
        self.configure(|c| c.set_encoding(encoding))
    }

    fn set_encoding_errors(&mut self, errors: &str) -> Result<(), InstrumentError> {
        self.configure(|c| c.set_encoding_errors(errors))
    }

    fn set_max_read_size(&mut self, size: i64) -> Result<(), InstrumentError> {
        self.configure(|c| c.set_max_read_size(size))
    }

    fn set_timeout(&mut self, seconds: Option<f64>) -> Result<(), InstrumentError> {
        self.configure(|c| c.set_timeout(seconds))
    }

    fn set_rstrip(&mut self, rstrip: bool) -> Result<(), InstrumentError> {
        self.configure(|c| c.set_rstrip(rstrip))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, InstrumentError> {
        let mut controller = self.select()?;
        controller
            .write_bytes(data)
            .map_err(|err| err.with_address(&self.address))
    }

    fn read_bytes(&mut self, size: Option<usize>) -> Result<Bytes, InstrumentError> {
        let mut controller = self.select()?;
        controller
            .read_bytes(size)
            .map_err(|err| err.with_address(&self.address))
    }

    /// Detach from the controller. The controller stays connected for the other devices.
    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            info!(address = %self.address, "Disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn query_with(
        &mut self,
        message: &str,
        delay: Duration,
        size: Option<usize>,
    ) -> Result<String, InstrumentError> {
        self.auto_query(|c| c.query_with(message, delay, size))
    }

    fn query_values(
        &mut self,
        message: &str,
        format: BlockFormat,
        dtype: DataType,
        delay: Duration,
    ) -> Result<Vec<f64>, InstrumentError> {
        self.auto_query(|c| c.query_values(message, format, dtype, delay))
    }
}
