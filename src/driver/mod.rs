//! Transport drivers
//!
//! A [`Driver`] knows how to open one family of [`Address`]es and hands back a
//! [`Handle`]: an exclusively owned, opaque transport resource with a
//! `open -> {write, read}* -> close` lifecycle. Everything above this layer
//! (framing, pacing, retries) lives in [`Connection`](crate::connection::Connection).
//!
//! Backends:
//! - [`SerialDriver`] - native serial ports via the `serialport` crate
//! - [`TcpIpDriver`] - raw TCP sockets
//! - [`VisaDriver`] - GPIB and LXI through a vendor VISA library (`instrument_visa`)
//! - [`mock::MockDriver`] - scripted in-memory transport for tests

pub mod mock;
pub mod registry;
pub mod serial;
pub mod tcpip;
pub mod visa;

pub use registry::DriverRegistry;
pub use serial::SerialDriver;
pub use tcpip::TcpIpDriver;
pub use visa::VisaDriver;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::address::Address;
use crate::error::{InstrumentError, InstrumentResult};

/// Pluggable transport backend.
pub trait Driver: Send + Sync {
    /// Short name used in logs and aggregated open errors.
    fn name(&self) -> &str;

    /// Whether this driver can serve `address` at all.
    fn works_with(&self, address: &Address) -> bool;

    /// Open a new exclusive handle to `address`.
    fn open(&self, address: &Address) -> InstrumentResult<Box<dyn Handle>>;

    /// List addresses of attached devices this driver can see.
    fn search(&self) -> InstrumentResult<Vec<Address>>;
}

/// An open transport resource.
///
/// A handle is owned by exactly one connection. `close()` consumes the
/// resource; calling it twice is an error.
pub trait Handle: Send {
    /// Write bytes, returning how many the transport accepted.
    fn write(&mut self, bytes: &[u8]) -> InstrumentResult<usize>;

    /// Read up to `buf.len()` bytes, blocking at most for the configured timeout.
    ///
    /// Never returns `Ok(0)`; expiry is reported as [`InstrumentError::Timeout`].
    fn read(&mut self, buf: &mut [u8]) -> InstrumentResult<usize>;

    /// True when one `read` call returns one complete message (GPIB EOI / VISA
    /// termchar). Otherwise the connection scans for the terminator itself.
    fn native_framing(&self) -> bool {
        false
    }

    /// Assert EOI with the final byte of each write.
    fn set_eoi(&mut self, _enabled: bool) -> InstrumentResult<()> {
        Ok(())
    }

    /// Set the end-of-string sequence for transports that delimit natively.
    fn set_eos(&mut self, _terminator: &[u8]) -> InstrumentResult<()> {
        Ok(())
    }

    /// Bound each blocking read.
    fn set_timeout(&mut self, timeout: Duration) -> InstrumentResult<()>;

    /// Current read bound.
    fn timeout(&self) -> Duration;

    /// Reconfigure a serial line; other transports refuse.
    fn set_serial_params(&mut self, _params: &SerialParams) -> InstrumentResult<()> {
        Err(InstrumentError::unsupported(
            self.transport(),
            "serial parameters",
        ))
    }

    /// Discard anything buffered in either direction.
    fn clear(&mut self) -> InstrumentResult<()>;

    /// Release the transport. Called at most once by [`Connection`](crate::connection::Connection).
    fn close(&mut self) -> InstrumentResult<()>;

    /// Transport name for diagnostics.
    fn transport(&self) -> &str;
}

/// Serial word parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No handshaking
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Serial line parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialParams {
    /// Bits per second
    pub baud_rate: u32,
    /// 5 to 8
    pub data_bits: u8,
    /// Parity bit
    pub parity: Parity,
    /// 1 or 2
    pub stop_bits: u8,
    /// Handshaking
    pub flow_control: FlowControl,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialParams {
    /// 8N1 without flow control at `baud_rate`.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    /// Check the values are representable on a real UART.
    pub fn validate(&self) -> InstrumentResult<()> {
        if self.baud_rate == 0 {
            return Err(InstrumentError::Connection(
                "Baud rate must be greater than zero".to_string(),
            ));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(InstrumentError::Connection(format!(
                "Unsupported data bits: {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(InstrumentError::Connection(format!(
                "Unsupported stop bits: {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_params_default_is_9600_8n1() {
        let params = SerialParams::default();
        assert_eq!(params.baud_rate, 9600);
        assert_eq!(params.data_bits, 8);
        assert_eq!(params.parity, Parity::None);
        assert_eq!(params.stop_bits, 1);
        params.validate().unwrap();
    }

    #[test]
    fn test_serial_params_validation() {
        let params = SerialParams {
            data_bits: 9,
            ..SerialParams::new(115200)
        };
        assert!(params.validate().is_err());

        let params = SerialParams {
            stop_bits: 3,
            ..SerialParams::default()
        };
        assert!(params.validate().is_err());
    }
}
