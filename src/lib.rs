//! Instrument I/O layer for laboratory data acquisition.
//!
//! This library takes an instrument from a resource string to a stabilized
//! reading. It is used by the per-model device drivers, which only format
//! command strings on top of it.
//!
//! - [`address`] parses resource locators into typed transport addresses
//! - [`driver`] holds the pluggable transport backends (serial, raw TCP, VISA)
//! - [`connection`] frames text commands and responses over one driver handle
//! - [`modbus`] is a Modbus RTU master with a shared reader per serial line
//! - [`filter`] contains the averaging read filters
//! - [`instrument`] opens and identifies devices and defines capability traits
//!
//! ```no_run
//! use daq_io::{Address, DriverRegistry, Instrument, IoSettings};
//!
//! # fn main() -> daq_io::InstrumentResult<()> {
//! let settings = IoSettings::load_from("daq_io.toml")?;
//! let address = Address::parse("TCPIP0::192.168.1.5::5025::SOCKET")?;
//! let smu = Instrument::open(&address, &DriverRegistry::with_defaults(), &settings)?;
//! let volts = smu.connection().query_f64(":MEAS:VOLT?")?;
//! # let _ = volts;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod error_recovery;
pub mod filter;
pub mod instrument;
pub mod modbus;

pub use address::{Address, AddressKind};
pub use config::{ConnectionSettings, IoSettings, ModbusSettings};
pub use connection::Connection;
pub use driver::{Driver, DriverRegistry, Handle, SerialParams};
pub use error::{InstrumentError, InstrumentResult};
pub use error_recovery::RetryPolicy;
pub use filter::{AMode, FilterChannel, ReadFilter};
pub use instrument::Instrument;
pub use modbus::{ModbusBus, ModbusDevice, ModbusFrame};
