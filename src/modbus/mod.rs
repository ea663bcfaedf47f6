//! Modbus RTU master
//!
//! - [`frame`] - frame codec and CRC-16, request builders, response decoding
//! - [`bus`] - one reader thread per physical line, per-unit reply queues
//! - [`registers`] - [`ModbusDevice`] with read-only and read-write register
//!   and coil handles

pub mod bus;
pub mod frame;
pub mod registers;

pub use bus::ModbusBus;
pub use frame::{crc16, function, request, ModbusFrame};
pub use registers::{ModbusDevice, RoCoil, RoRegister, RwCoil, RwRegister};
