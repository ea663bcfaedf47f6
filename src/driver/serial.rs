//! Native serial port driver
//!
//! Wraps the `serialport` crate. Serial lines have no message delimiting, so
//! handles report `native_framing() == false` and the owning connection scans
//! for the read terminator byte by byte.

use std::time::Duration;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

use super::{Driver, Handle, SerialParams};
use crate::address::Address;
use crate::error::{InstrumentError, InstrumentResult};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;

/// Opens `ASRL::<port>::INSTR` addresses.
#[derive(Debug, Clone, Default)]
pub struct SerialDriver {
    params: SerialParams,
    timeout: Option<Duration>,
}

impl SerialDriver {
    /// Driver using the native serial ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Line parameters applied when a port is opened.
    pub fn with_params(mut self, params: SerialParams) -> Self {
        self.params = params;
        self
    }

    /// Initial read timeout of opened handles.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[cfg(feature = "instrument_serial")]
    fn initial_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_millis(2000))
    }
}

impl Driver for SerialDriver {
    fn name(&self) -> &str {
        "serial"
    }

    fn works_with(&self, address: &Address) -> bool {
        address.to_serial().is_some()
    }

    fn open(&self, address: &Address) -> InstrumentResult<Box<dyn Handle>> {
        let serial = address
            .to_serial()
            .ok_or_else(|| InstrumentError::IncompatibleAddress {
                driver: self.name().to_string(),
                address: address.to_string(),
            })?;
        self.params.validate()?;

        #[cfg(feature = "instrument_serial")]
        {
            let port = open_port(&serial.port, &self.params, self.initial_timeout())?;
            debug!(
                port = %serial.port,
                baud = self.params.baud_rate,
                "Serial port opened"
            );
            Ok(Box::new(SerialHandle {
                name: serial.port,
                port: Some(port),
                timeout: self.initial_timeout(),
            }))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = serial;
            Err(InstrumentError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }

    fn search(&self) -> InstrumentResult<Vec<Address>> {
        #[cfg(feature = "instrument_serial")]
        {
            let ports = serialport::available_ports()
                .map_err(|e| InstrumentError::Connection(e.to_string()))?;
            Ok(ports
                .into_iter()
                .map(|info| {
                    Address::Serial(crate::address::SerialAddress {
                        port: info.port_name,
                    })
                })
                .collect())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Ok(Vec::new())
        }
    }
}

/// Open a raw serial port with the given line parameters.
///
/// Shared with the Modbus RTU bus, which needs the bare port rather than a handle.
#[cfg(feature = "instrument_serial")]
pub(crate) fn open_port(
    name: &str,
    params: &SerialParams,
    timeout: Duration,
) -> InstrumentResult<Box<dyn SerialPort>> {
    let available = serialport::available_ports()
        .map_err(|e| InstrumentError::Connection(e.to_string()))?;
    if !available.iter().any(|p| p.port_name.trim() == name.trim()) {
        return Err(InstrumentError::Connection(format!(
            "No serial port \"{}\" was found",
            name.trim()
        )));
    }

    serialport::new(name.trim(), params.baud_rate)
        .data_bits(data_bits(params.data_bits)?)
        .parity(parity(params.parity))
        .stop_bits(stop_bits(params.stop_bits)?)
        .flow_control(flow_control(params.flow_control))
        .timeout(timeout)
        .open()
        .map_err(|e| {
            InstrumentError::Connection(format!(
                "Failed to open serial port '{}' at {} baud: {}",
                name, params.baud_rate, e
            ))
        })
}

#[cfg(feature = "instrument_serial")]
fn data_bits(bits: u8) -> InstrumentResult<serialport::DataBits> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(InstrumentError::Connection(format!(
            "Unsupported data bits: {other}"
        ))),
    }
}

#[cfg(feature = "instrument_serial")]
fn stop_bits(bits: u8) -> InstrumentResult<serialport::StopBits> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(InstrumentError::Connection(format!(
            "Unsupported stop bits: {other}"
        ))),
    }
}

#[cfg(feature = "instrument_serial")]
fn parity(parity: super::Parity) -> serialport::Parity {
    match parity {
        super::Parity::None => serialport::Parity::None,
        super::Parity::Odd => serialport::Parity::Odd,
        super::Parity::Even => serialport::Parity::Even,
    }
}

#[cfg(feature = "instrument_serial")]
fn flow_control(flow: super::FlowControl) -> serialport::FlowControl {
    match flow {
        super::FlowControl::None => serialport::FlowControl::None,
        super::FlowControl::Software => serialport::FlowControl::Software,
        super::FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

/// Open serial port.
#[cfg(feature = "instrument_serial")]
pub struct SerialHandle {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

#[cfg(feature = "instrument_serial")]
impl SerialHandle {
    fn port(&mut self) -> InstrumentResult<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| InstrumentError::Closed(self.name.clone()))
    }
}

#[cfg(feature = "instrument_serial")]
impl Handle for SerialHandle {
    fn write(&mut self, bytes: &[u8]) -> InstrumentResult<usize> {
        use std::io::Write;

        let timeout = self.timeout;
        let port = self.port()?;
        let mut written = 0;
        while written < bytes.len() {
            match port.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(InstrumentError::from_io(e, timeout)),
            }
        }
        port.flush()
            .map_err(|e| InstrumentError::from_io(e, timeout))?;
        Ok(written)
    }

    fn read(&mut self, buf: &mut [u8]) -> InstrumentResult<usize> {
        use std::io::Read;

        let timeout = self.timeout;
        match self.port()?.read(buf) {
            Ok(0) => Err(InstrumentError::Connection(
                "Unexpected EOF from serial port".to_string(),
            )),
            Ok(n) => Ok(n),
            Err(e) => Err(InstrumentError::from_io(e, timeout)),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> InstrumentResult<()> {
        self.port()?
            .set_timeout(timeout)
            .map_err(|e| InstrumentError::Connection(e.to_string()))?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_serial_params(&mut self, params: &SerialParams) -> InstrumentResult<()> {
        params.validate()?;
        let port = self.port()?;
        let to_conn = |e: serialport::Error| InstrumentError::Connection(e.to_string());
        port.set_baud_rate(params.baud_rate).map_err(to_conn)?;
        port.set_data_bits(data_bits(params.data_bits)?)
            .map_err(to_conn)?;
        port.set_parity(parity(params.parity)).map_err(to_conn)?;
        port.set_stop_bits(stop_bits(params.stop_bits)?)
            .map_err(to_conn)?;
        port.set_flow_control(flow_control(params.flow_control))
            .map_err(to_conn)?;
        debug!(port = %self.name, ?params, "Serial parameters changed");
        Ok(())
    }

    fn clear(&mut self) -> InstrumentResult<()> {
        self.port()?
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| InstrumentError::Connection(e.to_string()))
    }

    fn close(&mut self) -> InstrumentResult<()> {
        let port = self
            .port
            .take()
            .ok_or_else(|| InstrumentError::AlreadyClosed(self.name.clone()))?;
        // Purge before release; the OS closes the descriptor on drop.
        let purge = port.clear(serialport::ClearBuffer::All);
        drop(port);
        debug!(port = %self.name, "Serial port closed");
        purge.map_err(|e| InstrumentError::Connection(e.to_string()))
    }

    fn transport(&self) -> &str {
        "serial"
    }
}
