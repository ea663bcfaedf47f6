//! Modbus RTU master against a simulated slave on a local socket pair.
#![cfg(unix)]

use daq_io::modbus::{function, ModbusBus, ModbusDevice, ModbusFrame};
use daq_io::{InstrumentError, ModbusSettings};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Units 3 and 4 answer; unit 9 rejects everything with "illegal data
/// address"; any other unit stays silent. Replies are written in two pieces.
fn spawn_slave(mut line: UnixStream) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut registers: HashMap<(u8, u16), u16> = HashMap::new();
        let mut request = [0u8; 8];
        while line.read_exact(&mut request).is_ok() {
            let Ok(frame) = ModbusFrame::parse_verified(&request) else {
                continue;
            };
            let unit = frame.address();
            let payload = frame.payload();
            let start = u16::from_be_bytes([payload[0], payload[1]]);
            let operand = u16::from_be_bytes([payload[2], payload[3]]);

            let reply = match (unit, frame.function()) {
                (9, f) => ModbusFrame::build(unit, f | function::EXCEPTION_FLAG, &[0x02]),
                (3 | 4, function::READ_HOLDING_REGISTERS) => {
                    let mut data = vec![(operand * 2) as u8];
                    for register in start..start + operand {
                        let value = registers
                            .get(&(unit, register))
                            .copied()
                            .unwrap_or(u16::from(unit) * 100 + register);
                        data.extend_from_slice(&value.to_be_bytes());
                    }
                    ModbusFrame::build(unit, function::READ_HOLDING_REGISTERS, &data)
                }
                (3 | 4, function::WRITE_SINGLE_REGISTER) => {
                    registers.insert((unit, start), operand);
                    frame.clone()
                }
                _ => continue,
            };
            let bytes = reply.to_bytes();
            let (head, tail) = bytes.split_at(2);
            if line.write_all(head).and_then(|()| line.write_all(tail)).is_err() {
                break;
            }
        }
    })
}

fn bus() -> (Arc<ModbusBus>, JoinHandle<()>) {
    // RUST_LOG=daq_io=trace shows every frame on the simulated line
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (master, slave) = UnixStream::pair().unwrap();
    let settings = ModbusSettings {
        transaction_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    master.set_read_timeout(Some(settings.poll_interval)).unwrap();
    let reader = master.try_clone().unwrap();
    let bus = ModbusBus::from_io("sim", Box::new(reader), Box::new(master), &settings).unwrap();
    (bus, spawn_slave(slave))
}

#[test]
fn test_read_and_write_registers() {
    let (bus, slave) = bus();
    let device = ModbusDevice::new(Arc::clone(&bus), 3);

    assert_eq!(device.read_holding_registers(10, 2).unwrap(), vec![310, 311]);

    let setpoint = device.holding_register(20);
    setpoint.set(1234).unwrap();
    assert_eq!(setpoint.get().unwrap(), 1234);

    drop(device);
    drop(setpoint);
    drop(bus);
    slave.join().unwrap();
}

#[test]
fn test_exception_reply_is_decoded() {
    let (bus, _slave) = bus();
    let device = ModbusDevice::new(bus, 9);
    match device.read_holding_registers(0, 1) {
        Err(InstrumentError::ModbusException {
            unit,
            function: rejected,
            code,
        }) => {
            assert_eq!(unit, 9);
            assert_eq!(rejected, 0x03);
            assert_eq!(code, 0x02);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_silent_unit_times_out() {
    let (bus, _slave) = bus();
    let device = ModbusDevice::new(bus, 7);
    let result = device.read_holding_registers(0, 1);
    assert!(matches!(result, Err(InstrumentError::Timeout(_))));
}

#[test]
fn test_units_share_one_bus_without_crosstalk() {
    let (bus, _slave) = bus();
    let workers: Vec<_> = [3u8, 4u8]
        .into_iter()
        .map(|unit| {
            let device = ModbusDevice::new(Arc::clone(&bus), unit);
            std::thread::spawn(move || {
                for register in 0..20u16 {
                    let values = device.read_holding_registers(register, 1).unwrap();
                    assert_eq!(values, vec![u16::from(unit) * 100 + register]);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(bus.is_running());
}
