//! Instrument resource addresses.
//!
//! An [`Address`] is parsed once from a VISA-style resource locator and never
//! mutated. Each transport kind has a narrowing conversion (`to_gpib()`,
//! `to_serial()`, ...) that returns `None` for other kinds, so a driver can
//! test compatibility before it tries to open anything.
//!
//! | Kind   | Canonical form                         |
//! |--------|----------------------------------------|
//! | GPIB   | `GPIB0::12::INSTR`                     |
//! | Serial | `ASRL::/dev/ttyUSB0::INSTR`            |
//! | TCP/IP | `TCPIP0::192.168.1.5::5025::SOCKET`    |
//! | LXI    | `TCPIP0::192.168.1.5::INSTR`           |
//! | Modbus | `MODBUS::/dev/ttyUSB1::3::INSTR`       |

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{InstrumentError, InstrumentResult};

static GPIB_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^GPIB([0-9]*)::([0-9]+)::INSTR$").expect("valid address pattern")
});
static SERIAL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^ASRL::(.+)::INSTR$").expect("valid address pattern"));
static SOCKET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^TCPIP([0-9]*)::(.+)::([0-9]+)::SOCKET$").expect("valid address pattern")
});
static LXI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^TCPIP([0-9]*)::(.+)::INSTR$").expect("valid address pattern")
});
static MODBUS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^MODBUS::(.+)::([0-9]+)::INSTR$").expect("valid address pattern")
});

/// Highest primary address on a GPIB bus.
pub const MAX_GPIB_ADDRESS: u8 = 30;
/// Highest assignable Modbus unit id (0 is broadcast).
pub const MAX_MODBUS_UNIT: u8 = 247;

/// Instrument on a GPIB bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GpibAddress {
    /// Interface board number
    pub board: u16,
    /// Primary address (0-30)
    pub address: u8,
}

/// Instrument on a local serial port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialAddress {
    /// OS port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
}

/// Instrument behind a raw TCP socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpIpAddress {
    /// Host name or IPv4 address
    pub host: String,
    /// TCP port
    pub port: u16,
}

/// VXI-11 / HiSLIP instrument reached through VISA.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LxiAddress {
    /// Host name or IPv4 address
    pub host: String,
}

/// Slave on a Modbus RTU line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModbusAddress {
    /// Serial port carrying the RTU bus
    pub port: String,
    /// Slave unit id
    pub unit: u8,
}

/// Transport kind of an address, in the order discovered addresses are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressKind {
    /// GPIB bus instrument
    Gpib,
    /// LXI instrument via VISA
    Lxi,
    /// Raw TCP socket
    TcpIp,
    /// RS-232 / USB serial line
    Serial,
    /// Modbus RTU slave
    Modbus,
}

/// A parsed resource locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// `GPIB<board>::<address>::INSTR`
    Gpib(GpibAddress),
    /// `ASRL::<port>::INSTR`
    Serial(SerialAddress),
    /// `TCPIP::<host>::<port>::SOCKET`
    TcpIp(TcpIpAddress),
    /// `TCPIP::<host>::INSTR`
    Lxi(LxiAddress),
    /// `MODBUS::<port>::<unit>::INSTR`
    Modbus(ModbusAddress),
}

impl Address {
    /// Parse a resource locator.
    ///
    /// # Errors
    ///
    /// Returns [`InstrumentError::AddressFormat`] when no grammar matches or a
    /// numeric field is out of range.
    pub fn parse(raw: &str) -> InstrumentResult<Self> {
        let text = raw.trim();
        let invalid = || InstrumentError::AddressFormat(raw.to_string());

        if let Some(caps) = GPIB_PATTERN.captures(text) {
            let board = parse_board(&caps[1]).ok_or_else(invalid)?;
            let address: u8 = caps[2].parse().map_err(|_| invalid())?;
            if address > MAX_GPIB_ADDRESS {
                return Err(invalid());
            }
            return Ok(Address::Gpib(GpibAddress { board, address }));
        }

        if let Some(caps) = SERIAL_PATTERN.captures(text) {
            return Ok(Address::Serial(SerialAddress {
                port: caps[1].to_string(),
            }));
        }

        if let Some(caps) = SOCKET_PATTERN.captures(text) {
            let port: u16 = caps[3].parse().map_err(|_| invalid())?;
            return Ok(Address::TcpIp(TcpIpAddress {
                host: caps[2].to_string(),
                port,
            }));
        }

        if let Some(caps) = LXI_PATTERN.captures(text) {
            return Ok(Address::Lxi(LxiAddress {
                host: caps[2].to_string(),
            }));
        }

        if let Some(caps) = MODBUS_PATTERN.captures(text) {
            let unit: u8 = caps[2].parse().map_err(|_| invalid())?;
            if unit > MAX_MODBUS_UNIT {
                return Err(invalid());
            }
            return Ok(Address::Modbus(ModbusAddress {
                port: caps[1].to_string(),
                unit,
            }));
        }

        Err(invalid())
    }

    /// Transport kind, used to pick drivers.
    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Gpib(_) => AddressKind::Gpib,
            Address::Serial(_) => AddressKind::Serial,
            Address::TcpIp(_) => AddressKind::TcpIp,
            Address::Lxi(_) => AddressKind::Lxi,
            Address::Modbus(_) => AddressKind::Modbus,
        }
    }

    /// The GPIB form, if this is a GPIB address.
    pub fn to_gpib(&self) -> Option<GpibAddress> {
        match self {
            Address::Gpib(a) => Some(a.clone()),
            _ => None,
        }
    }

    /// The serial form, if this is a serial address.
    pub fn to_serial(&self) -> Option<SerialAddress> {
        match self {
            Address::Serial(a) => Some(a.clone()),
            _ => None,
        }
    }

    /// The raw socket form, if this is a TCP/IP socket address.
    pub fn to_tcpip(&self) -> Option<TcpIpAddress> {
        match self {
            Address::TcpIp(a) => Some(a.clone()),
            _ => None,
        }
    }

    /// The LXI form, if this is an LXI address.
    pub fn to_lxi(&self) -> Option<LxiAddress> {
        match self {
            Address::Lxi(a) => Some(a.clone()),
            _ => None,
        }
    }

    /// The Modbus form, if this is a Modbus address.
    pub fn to_modbus(&self) -> Option<ModbusAddress> {
        match self {
            Address::Modbus(a) => Some(a.clone()),
            _ => None,
        }
    }
}

fn parse_board(text: &str) -> Option<u16> {
    if text.is_empty() {
        Some(0)
    } else {
        text.parse().ok()
    }
}

impl fmt::Display for GpibAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIB{}::{}::INSTR", self.board, self.address)
    }
}

impl fmt::Display for SerialAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ASRL::{}::INSTR", self.port)
    }
}

impl fmt::Display for TcpIpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCPIP0::{}::{}::SOCKET", self.host, self.port)
    }
}

impl fmt::Display for LxiAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TCPIP0::{}::INSTR", self.host)
    }
}

impl fmt::Display for ModbusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MODBUS::{}::{}::INSTR", self.port, self.unit)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Gpib(a) => a.fmt(f),
            Address::Serial(a) => a.fmt(f),
            Address::TcpIp(a) => a.fmt(f),
            Address::Lxi(a) => a.fmt(f),
            Address::Modbus(a) => a.fmt(f),
        }
    }
}

impl FromStr for Address {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = InstrumentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl From<GpibAddress> for Address {
    fn from(a: GpibAddress) -> Self {
        Address::Gpib(a)
    }
}

impl From<SerialAddress> for Address {
    fn from(a: SerialAddress) -> Self {
        Address::Serial(a)
    }
}

impl From<TcpIpAddress> for Address {
    fn from(a: TcpIpAddress) -> Self {
        Address::TcpIp(a)
    }
}

impl From<LxiAddress> for Address {
    fn from(a: LxiAddress) -> Self {
        Address::Lxi(a)
    }
}

impl From<ModbusAddress> for Address {
    fn from(a: ModbusAddress) -> Self {
        Address::Modbus(a)
    }
}
