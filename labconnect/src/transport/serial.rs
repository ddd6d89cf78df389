//! A serial port transport using the `serialport` crate.

use std::{
    io::{Read, Write},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::{
    reader::{Framing, ReadRequest, read_message},
    transport::{
        Transport, TransportError,
        serial_settings::{DataBits, Parity, SerialSettings, StopBits},
    },
};

/// Native timeout of the port while reads block forever. Reads that time out are repeated.
const BLOCKING_POLL: Duration = Duration::from_secs(1);

/// A blocking serial port.
///
/// Termination reads poll the port one byte at a time, fixed-size reads ask the port for
/// exactly the missing number of bytes. Nothing is ever read past the end of a message.
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Option<Duration>,
    buffer: BytesMut,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .field("open", &self.port.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SerialTransport {
    /// Try to open a serial port.
    ///
    /// # Arguments
    /// * `name` - Name of the port, e.g., `COM3` or `/dev/ttyUSB0`.
    /// * `settings` - Baud rate, framing and flow control.
    /// * `timeout` - Timeout of read and write operations, `None` blocks forever.
    pub fn try_new(
        name: &str,
        settings: &SerialSettings,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let builder = serialport::new(name, settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .parity(parity(settings.parity)?)
            .stop_bits(stop_bits(settings.stop_bits)?)
            .flow_control(flow_control(settings))
            .timeout(native_timeout(timeout));
        let port = builder.open()?;
        info!(port = name, baud_rate = settings.baud_rate, "Opened serial port");
        Ok(Self {
            name: name.to_string(),
            port: Some(port),
            timeout,
            buffer: BytesMut::new(),
        })
    }

    /// Name of the serial port.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn native_timeout(timeout: Option<Duration>) -> Duration {
    timeout.unwrap_or(BLOCKING_POLL)
}

fn data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> Result<serialport::Parity, TransportError> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        other => Err(TransportError::Unsupported(format!(
            "{other:?} parity is not supported by the serial port driver"
        ))),
    }
}

fn stop_bits(bits: StopBits) -> Result<serialport::StopBits, TransportError> {
    match bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        StopBits::OnePointFive => Err(TransportError::Unsupported(
            "1.5 stop bits are not supported by the serial port driver".to_string(),
        )),
    }
}

fn flow_control(settings: &SerialSettings) -> serialport::FlowControl {
    if settings.dsr_dtr {
        warn!("DSR/DTR flow control is not supported, ignoring it");
    }
    match (settings.rts_cts, settings.xon_xoff) {
        (true, true) => {
            warn!("Both RTS/CTS and XON/XOFF flow control requested, using RTS/CTS");
            serialport::FlowControl::Hardware
        }
        (true, false) => serialport::FlowControl::Hardware,
        (false, true) => serialport::FlowControl::Software,
        (false, false) => serialport::FlowControl::None,
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    fn read_bytes(&mut self, request: &ReadRequest<'_>) -> Result<Bytes, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        let mut single = [0u8; 1];
        let mut chunk = Vec::new();

        let result = read_message(&mut self.buffer, request, Framing::Stream, |buf, remaining| {
            port.set_timeout(native_timeout(remaining))?;
            let wanted = request.wanted(buf.len());
            let target: &mut [u8] = if wanted == 1 {
                &mut single
            } else {
                chunk.resize(wanted, 0);
                &mut chunk
            };
            let received = loop {
                match port.read(target) {
                    Err(err)
                        if remaining.is_none() && err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    other => break other?,
                }
            };
            buf.extend_from_slice(&target[..received]);
            Ok(received)
        });

        port.set_timeout(native_timeout(self.timeout))?;
        let message = result?;
        debug!(port = %self.name, len = message.len(), "Serial read");
        Ok(message)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(native_timeout(timeout))?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.name, "Closed serial port");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_framing() {
        assert!(matches!(
            parity(Parity::Mark),
            Err(TransportError::Unsupported(_))
        ));
        assert!(matches!(
            stop_bits(StopBits::OnePointFive),
            Err(TransportError::Unsupported(_))
        ));
        assert_eq!(stop_bits(StopBits::Two).unwrap(), serialport::StopBits::Two);
    }

    #[test]
    fn test_flow_control_prefers_hardware() {
        let settings = SerialSettings {
            rts_cts: true,
            xon_xoff: true,
            ..Default::default()
        };
        assert_eq!(flow_control(&settings), serialport::FlowControl::Hardware);
    }

    #[test]
    fn test_missing_port_fails_to_open() {
        let result = SerialTransport::try_new(
            "/dev/this-port-does-not-exist",
            &SerialSettings::default(),
            Some(Duration::from_millis(10)),
        );
        assert!(result.is_err());
    }
}
