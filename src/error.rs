//! Custom error types for the instrument I/O layer.
//!
//! This module defines the primary error type, `InstrumentError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! everything that can go wrong between an address string and a stabilized reading.
//!
//! ## Error Hierarchy
//!
//! - **`AddressFormat`**: a resource locator matched none of the known grammars.
//! - **`Connection`**: opening, closing or driving a transport failed. Driver failures
//!   propagate through [`Connection`](crate::connection::Connection) unchanged.
//! - **`Timeout`**: a read or write deadline expired. Partial data is never returned.
//! - **`Communication`**: a response stayed malformed after the configured retries.
//! - **`Protocol`** / **`ModbusException`**: a Modbus frame could not be decoded, or the
//!   slave answered with an exception code.
//! - **`Closed`** / **`AlreadyClosed`**: use of a connection after `close()`, or a second
//!   `close()`. Double-close is an error, not a no-op.
//!
//! Nothing in this crate swallows an error or reconnects on its own; recovery after a
//! dropped connection is the caller's responsibility.

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the crate error type.
pub type InstrumentResult<T> = std::result::Result<T, InstrumentError>;

/// Errors raised by the instrument I/O layer.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// Address text matched no known grammar
    #[error("Invalid instrument address '{0}'")]
    AddressFormat(String),

    /// Transport failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// No complete response before the deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The device answered but the reply could not be interpreted
    #[error("Malformed response to '{command}' after {attempts} attempt(s): {reason}")]
    Communication {
        command: String,
        attempts: u32,
        reason: String,
    },

    /// Malformed Modbus frame
    #[error("Modbus protocol error: {0}")]
    Protocol(String),

    /// Exception response; `function` is the base function code
    #[error("Modbus exception 0x{code:02X} from unit {unit} (function 0x{function:02X})")]
    ModbusException { unit: u8, function: u8, code: u8 },

    /// The transport took fewer bytes than were sent
    #[error("Short write: only {accepted} of {sent} bytes were accepted")]
    ShortWrite { sent: usize, accepted: usize },

    /// Operation on a closed connection
    #[error("Connection to {0} is closed")]
    Closed(String),

    /// Second `close` on the same connection
    #[error("Connection to {0} was already closed")]
    AlreadyClosed(String),

    /// Every driver refused or failed; `errors` has one line per driver
    #[error("Could not open {address} using any driver:\n{errors}")]
    NoDriver { address: String, errors: String },

    /// A driver was asked to open an address kind it does not serve
    #[error("Driver '{driver}' cannot open address {address}")]
    IncompatibleAddress { driver: String, address: String },

    /// The identity reply was rejected by the caller
    #[error("Device at {address} is not compatible: {identity}")]
    IncompatibleDevice { address: String, identity: String },

    /// Identity handshake never got an intelligible reply
    #[error("No instrument responded at {0}")]
    DeviceAbsent(String),

    /// Setting not available on this transport
    #[error("{transport} does not support {operation}")]
    Unsupported {
        transport: String,
        operation: String,
    },

    /// Command template could not be rendered
    #[error("Cannot render command template '{template}': {reason}")]
    Template { template: String, reason: String },

    /// Filter window of zero
    #[error("Filter window count must be at least 1 (got {0})")]
    InvalidFilterCount(usize),

    /// Transport compiled out
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Settings failed to load or validate
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl InstrumentError {
    /// Classify a transport-level `std::io::Error`.
    ///
    /// Read timeouts surface as `TimedOut` on most platforms and as `WouldBlock` on
    /// sockets with `SO_RCVTIMEO` set; both become [`InstrumentError::Timeout`].
    pub fn from_io(err: std::io::Error, timeout: Duration) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                InstrumentError::Timeout(timeout)
            }
            _ => InstrumentError::Connection(err.to_string()),
        }
    }

    pub(crate) fn unsupported(transport: &str, operation: &str) -> Self {
        InstrumentError::Unsupported {
            transport: transport.to_string(),
            operation: operation.to_string(),
        }
    }

    /// True for deadline expiry on a read or write.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrumentError::Timeout(_))
    }

    /// True when the transport worked but the payload could not be interpreted.
    pub fn is_malformed_response(&self) -> bool {
        matches!(
            self,
            InstrumentError::Communication { .. } | InstrumentError::Protocol(_)
        )
    }
}
