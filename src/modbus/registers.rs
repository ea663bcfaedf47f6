//! Slave-side view of a Modbus bus: a device and its registers and coils.

use std::sync::Arc;
use tracing::debug;

use super::bus::ModbusBus;
use super::frame::{request, ModbusFrame};
use crate::address::Address;
use crate::config::ModbusSettings;
use crate::error::{InstrumentError, InstrumentResult};

/// One slave unit on a [`ModbusBus`].
#[derive(Debug, Clone)]
pub struct ModbusDevice {
    bus: Arc<ModbusBus>,
    unit: u8,
}

impl ModbusDevice {
    /// Address `unit` on an already open bus.
    pub fn new(bus: Arc<ModbusBus>, unit: u8) -> Self {
        Self { bus, unit }
    }

    /// Open the unit named by a `MODBUS::<port>::<unit>::INSTR` address,
    /// sharing the port's bus with any other open device on it.
    pub fn open(address: &Address, settings: &ModbusSettings) -> InstrumentResult<Self> {
        let target = address
            .to_modbus()
            .ok_or_else(|| InstrumentError::IncompatibleAddress {
                driver: "modbus".to_string(),
                address: address.to_string(),
            })?;
        let bus = ModbusBus::open_serial(&target.port, settings)?;
        debug!(bus = bus.name(), unit = target.unit, "Modbus device opened");
        Ok(Self::new(bus, target.unit))
    }

    /// Unit address on the bus.
    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Bus shared with other units on the same line.
    pub fn bus(&self) -> &Arc<ModbusBus> {
        &self.bus
    }

    /// Function 0x03.
    pub fn read_holding_registers(&self, start: u16, count: u16) -> InstrumentResult<Vec<u16>> {
        let reply = self
            .bus
            .transact(&request::read_holding_registers(self.unit, start, count))?;
        expect_count(reply.registers()?, count)
    }

    /// Function 0x04.
    pub fn read_input_registers(&self, start: u16, count: u16) -> InstrumentResult<Vec<u16>> {
        let reply = self
            .bus
            .transact(&request::read_input_registers(self.unit, start, count))?;
        expect_count(reply.registers()?, count)
    }

    /// Function 0x01.
    pub fn read_coils(&self, start: u16, count: u16) -> InstrumentResult<Vec<bool>> {
        let reply = self
            .bus
            .transact(&request::read_coils(self.unit, start, count))?;
        reply.coils(usize::from(count))
    }

    /// Function 0x02.
    pub fn read_discrete_inputs(&self, start: u16, count: u16) -> InstrumentResult<Vec<bool>> {
        let reply = self
            .bus
            .transact(&request::read_discrete_inputs(self.unit, start, count))?;
        reply.coils(usize::from(count))
    }

    /// Function 0x06; the reply must echo the request.
    pub fn write_register(&self, register: u16, value: u16) -> InstrumentResult<()> {
        let sent = request::write_single_register(self.unit, register, value);
        let reply = self.bus.transact(&sent)?;
        expect_echo(&sent, &reply)
    }

    /// Function 0x10.
    pub fn write_registers(&self, start: u16, values: &[u16]) -> InstrumentResult<()> {
        let sent = request::write_multiple_registers(self.unit, start, values)?;
        let reply = self.bus.transact(&sent)?;
        // Reply echoes start address and quantity only.
        expect_echo_prefix(&sent, &reply)
    }

    /// Function 0x05; the reply must echo the request.
    pub fn write_coil(&self, coil: u16, on: bool) -> InstrumentResult<()> {
        let sent = request::write_single_coil(self.unit, coil, on);
        let reply = self.bus.transact(&sent)?;
        expect_echo(&sent, &reply)
    }

    /// Function 0x0F.
    pub fn write_coils(&self, start: u16, values: &[bool]) -> InstrumentResult<()> {
        let sent = request::write_multiple_coils(self.unit, start, values)?;
        let reply = self.bus.transact(&sent)?;
        expect_echo_prefix(&sent, &reply)
    }

    /// Read-only handle to an input register.
    pub fn input_register(&self, register: u16) -> RoRegister {
        RoRegister {
            device: self.clone(),
            register,
            holding: false,
        }
    }

    /// Read-write handle to a holding register.
    pub fn holding_register(&self, register: u16) -> RwRegister {
        RwRegister {
            device: self.clone(),
            register,
        }
    }

    /// Read-only handle to a discrete input.
    pub fn discrete_input(&self, input: u16) -> RoCoil {
        RoCoil {
            device: self.clone(),
            coil: input,
            is_coil: false,
        }
    }

    /// Read-write handle to a coil.
    pub fn coil(&self, coil: u16) -> RwCoil {
        RwCoil {
            device: self.clone(),
            coil,
        }
    }
}

fn expect_count(values: Vec<u16>, count: u16) -> InstrumentResult<Vec<u16>> {
    if values.len() != usize::from(count) {
        return Err(InstrumentError::Protocol(format!(
            "Asked for {} registers, received {}",
            count,
            values.len()
        )));
    }
    Ok(values)
}

fn expect_echo(sent: &ModbusFrame, reply: &ModbusFrame) -> InstrumentResult<()> {
    if reply.payload() != sent.payload() {
        return Err(InstrumentError::Protocol(format!(
            "Write to unit {} was not echoed back",
            sent.address()
        )));
    }
    Ok(())
}

fn expect_echo_prefix(sent: &ModbusFrame, reply: &ModbusFrame) -> InstrumentResult<()> {
    if reply.payload().len() != 4 || !sent.payload().starts_with(reply.payload()) {
        return Err(InstrumentError::Protocol(format!(
            "Write to unit {} was not acknowledged",
            sent.address()
        )));
    }
    Ok(())
}

/// Read-only register: an input register, or a holding register used as input.
#[derive(Debug, Clone)]
pub struct RoRegister {
    device: ModbusDevice,
    register: u16,
    holding: bool,
}

impl RoRegister {
    /// View a holding register through the read-only role.
    pub fn holding(device: &ModbusDevice, register: u16) -> Self {
        Self {
            device: device.clone(),
            register,
            holding: true,
        }
    }

    /// Current register value.
    pub fn get(&self) -> InstrumentResult<u16> {
        let values = if self.holding {
            self.device.read_holding_registers(self.register, 1)?
        } else {
            self.device.read_input_registers(self.register, 1)?
        };
        Ok(values[0])
    }
}

/// Holding register.
#[derive(Debug, Clone)]
pub struct RwRegister {
    device: ModbusDevice,
    register: u16,
}

impl RwRegister {
    /// Current register value.
    pub fn get(&self) -> InstrumentResult<u16> {
        Ok(self.device.read_holding_registers(self.register, 1)?[0])
    }

    /// Write the register.
    pub fn set(&self, value: u16) -> InstrumentResult<()> {
        self.device.write_register(self.register, value)
    }
}

/// Read-only bit: a discrete input, or a coil used as input.
#[derive(Debug, Clone)]
pub struct RoCoil {
    device: ModbusDevice,
    coil: u16,
    is_coil: bool,
}

impl RoCoil {
    /// View a coil through the read-only role.
    pub fn coil(device: &ModbusDevice, coil: u16) -> Self {
        Self {
            device: device.clone(),
            coil,
            is_coil: true,
        }
    }

    /// Current bit state.
    pub fn get(&self) -> InstrumentResult<bool> {
        let values = if self.is_coil {
            self.device.read_coils(self.coil, 1)?
        } else {
            self.device.read_discrete_inputs(self.coil, 1)?
        };
        Ok(values[0])
    }
}

/// Coil.
#[derive(Debug, Clone)]
pub struct RwCoil {
    device: ModbusDevice,
    coil: u16,
}

impl RwCoil {
    /// Current bit state.
    pub fn get(&self) -> InstrumentResult<bool> {
        Ok(self.device.read_coils(self.coil, 1)?[0])
    }

    /// Switch the coil.
    pub fn set(&self, on: bool) -> InstrumentResult<()> {
        self.device.write_coil(self.coil, on)
    }
}
