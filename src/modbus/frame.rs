//! Modbus RTU frame codec
//!
//! Layout on the wire: `[address][function][payload ...][crc lo][crc hi]`.
//! The CRC is CRC-16/MODBUS (init 0xFFFF, reflected polynomial 0xA001)
//! over address, function and payload, transmitted low byte first.

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{InstrumentError, InstrumentResult};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Address 0 addresses every slave; nobody answers.
pub const BROADCAST: u8 = 0;

/// Largest RTU frame allowed on the wire.
pub const MAX_FRAME_LEN: usize = 256;

/// Public function codes.
pub mod function {
    /// Read coils
    pub const READ_COILS: u8 = 0x01;
    /// Read discrete inputs
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    /// Read holding registers
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    /// Read input registers
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    /// Write single coil
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    /// Write single register
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    /// Write multiple coils
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    /// Write multiple registers
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    /// Set on the function byte of an exception response.
    pub const EXCEPTION_FLAG: u8 = 0x80;
}

/// CRC-16/MODBUS of `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC_MODBUS.checksum(bytes)
}

/// One RTU frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    address: u8,
    function: u8,
    payload: Vec<u8>,
    crc: u16,
}

impl ModbusFrame {
    /// Build an outgoing frame; the CRC is computed here.
    pub fn build(address: u8, function: u8, payload: &[u8]) -> Self {
        let mut covered = Vec::with_capacity(payload.len() + 2);
        covered.push(address);
        covered.push(function);
        covered.extend_from_slice(payload);
        Self {
            address,
            function,
            payload: payload.to_vec(),
            crc: crc16(&covered),
        }
    }

    /// Slice a raw frame into its fields without checking the CRC.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::Protocol`] when fewer than four bytes are given.
    pub fn parse(raw: &[u8]) -> InstrumentResult<Self> {
        if raw.len() < 4 {
            return Err(InstrumentError::Protocol(format!(
                "Frame of {} bytes is too short",
                raw.len()
            )));
        }
        let end = raw.len() - 2;
        Ok(Self {
            address: raw[0],
            function: raw[1],
            payload: raw[2..end].to_vec(),
            crc: u16::from_le_bytes([raw[end], raw[end + 1]]),
        })
    }

    /// Like [`parse`](Self::parse), but rejects a frame whose CRC does not match.
    pub fn parse_verified(raw: &[u8]) -> InstrumentResult<Self> {
        let frame = Self::parse(raw)?;
        let expected = frame.computed_crc();
        if frame.crc != expected {
            return Err(InstrumentError::Protocol(format!(
                "CRC mismatch: received 0x{:04X}, computed 0x{:04X}",
                frame.crc, expected
            )));
        }
        Ok(frame)
    }

    /// Unit address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Function code as sent, exception flag included.
    pub fn function(&self) -> u8 {
        self.function
    }

    /// Bytes between the function code and the CRC.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// CRC as carried by the frame.
    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// CRC the frame's contents should carry.
    pub fn computed_crc(&self) -> u16 {
        let mut digest = CRC_MODBUS.digest();
        digest.update(&[self.address, self.function]);
        digest.update(&self.payload);
        digest.finalize()
    }

    /// True when the carried CRC matches the contents.
    pub fn is_valid(&self) -> bool {
        self.crc == self.computed_crc()
    }

    /// Wire representation, CRC low byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 4);
        bytes.push(self.address);
        bytes.push(self.function);
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    /// True for an exception response.
    pub fn is_exception(&self) -> bool {
        self.function & function::EXCEPTION_FLAG != 0
    }

    /// Function code with the exception flag removed.
    pub fn base_function(&self) -> u8 {
        self.function & !function::EXCEPTION_FLAG
    }

    /// Turn an exception response into [`InstrumentError::ModbusException`].
    pub fn check_exception(&self) -> InstrumentResult<()> {
        if self.is_exception() {
            return Err(InstrumentError::ModbusException {
                unit: self.address,
                function: self.base_function(),
                code: self.payload.first().copied().unwrap_or(0),
            });
        }
        Ok(())
    }

    /// Register values of a function 0x03 / 0x04 response.
    pub fn registers(&self) -> InstrumentResult<Vec<u16>> {
        let data = self.counted_data()?;
        if data.len() % 2 != 0 {
            return Err(InstrumentError::Protocol(format!(
                "Odd register byte count {}",
                data.len()
            )));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// The first `count` bits of a function 0x01 / 0x02 response.
    pub fn coils(&self, count: usize) -> InstrumentResult<Vec<bool>> {
        let data = self.counted_data()?;
        if data.len() * 8 < count {
            return Err(InstrumentError::Protocol(format!(
                "{} data bytes cannot hold {} coils",
                data.len(),
                count
            )));
        }
        Ok(unpack_bits(data, count))
    }

    /// Payload of a read response after its leading byte count.
    fn counted_data(&self) -> InstrumentResult<&[u8]> {
        self.check_exception()?;
        let (&count, data) = self
            .payload
            .split_first()
            .ok_or_else(|| InstrumentError::Protocol("Empty read response".to_string()))?;
        if data.len() != usize::from(count) {
            return Err(InstrumentError::Protocol(format!(
                "Byte count {} does not match {} data bytes",
                count,
                data.len()
            )));
        }
        Ok(data)
    }
}

/// Total length of the response frame that starts with `prefix`, or `None`
/// while too few bytes are known. `Some(0)` marks an unknown function code.
pub(crate) fn response_len(prefix: &[u8]) -> Option<usize> {
    let &code = prefix.get(1)?;
    if code & function::EXCEPTION_FLAG != 0 {
        return Some(5);
    }
    match code {
        function::READ_COILS
        | function::READ_DISCRETE_INPUTS
        | function::READ_HOLDING_REGISTERS
        | function::READ_INPUT_REGISTERS => prefix.get(2).map(|&count| 3 + usize::from(count) + 2),
        function::WRITE_SINGLE_COIL
        | function::WRITE_SINGLE_REGISTER
        | function::WRITE_MULTIPLE_COILS
        | function::WRITE_MULTIPLE_REGISTERS => Some(8),
        _ => Some(0),
    }
}

fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, &on) in values.iter().enumerate() {
        if on {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

fn range_request(unit: u8, function: u8, start: u16, count: u16) -> ModbusFrame {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&start.to_be_bytes());
    payload.extend_from_slice(&count.to_be_bytes());
    ModbusFrame::build(unit, function, &payload)
}

/// Request builders for the public function codes.
pub mod request {
    use super::*;

    /// Read `count` coils from `start`.
    pub fn read_coils(unit: u8, start: u16, count: u16) -> ModbusFrame {
        range_request(unit, function::READ_COILS, start, count)
    }

    /// Read `count` discrete inputs from `start`.
    pub fn read_discrete_inputs(unit: u8, start: u16, count: u16) -> ModbusFrame {
        range_request(unit, function::READ_DISCRETE_INPUTS, start, count)
    }

    /// Read `count` holding registers from `start`.
    pub fn read_holding_registers(unit: u8, start: u16, count: u16) -> ModbusFrame {
        range_request(unit, function::READ_HOLDING_REGISTERS, start, count)
    }

    /// Read `count` input registers from `start`.
    pub fn read_input_registers(unit: u8, start: u16, count: u16) -> ModbusFrame {
        range_request(unit, function::READ_INPUT_REGISTERS, start, count)
    }

    /// On is sent as 0xFF00, off as 0x0000.
    pub fn write_single_coil(unit: u8, coil: u16, on: bool) -> ModbusFrame {
        let value: u16 = if on { 0xFF00 } else { 0x0000 };
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&coil.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
        ModbusFrame::build(unit, function::WRITE_SINGLE_COIL, &payload)
    }

    /// Write one holding register.
    pub fn write_single_register(unit: u8, register: u16, value: u16) -> ModbusFrame {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&register.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
        ModbusFrame::build(unit, function::WRITE_SINGLE_REGISTER, &payload)
    }

    /// Write up to 1968 coils, packed LSB first.
    pub fn write_multiple_coils(unit: u8, start: u16, values: &[bool]) -> InstrumentResult<ModbusFrame> {
        let packed = pack_bits(values);
        let count = u16::try_from(values.len())
            .ok()
            .filter(|&n| (1..=0x07B0).contains(&n))
            .ok_or_else(|| {
                InstrumentError::Protocol(format!("Cannot write {} coils at once", values.len()))
            })?;
        let mut payload = Vec::with_capacity(5 + packed.len());
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.push(packed.len() as u8);
        payload.extend_from_slice(&packed);
        Ok(ModbusFrame::build(unit, function::WRITE_MULTIPLE_COILS, &payload))
    }

    /// Write up to 123 consecutive holding registers.
    pub fn write_multiple_registers(
        unit: u8,
        start: u16,
        values: &[u16],
    ) -> InstrumentResult<ModbusFrame> {
        let count = u16::try_from(values.len())
            .ok()
            .filter(|&n| (1..=0x7B).contains(&n))
            .ok_or_else(|| {
                InstrumentError::Protocol(format!(
                    "Cannot write {} registers at once",
                    values.len()
                ))
            })?;
        let mut payload = Vec::with_capacity(5 + values.len() * 2);
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.push((values.len() * 2) as u8);
        for value in values {
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Ok(ModbusFrame::build(unit, function::WRITE_MULTIPLE_REGISTERS, &payload))
    }
}
