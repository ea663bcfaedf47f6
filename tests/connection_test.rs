//! Connection framing, timeout and serialization scenarios against the mock
//! transport.

use daq_io::driver::mock::{MockDevice, MockDriver};
use daq_io::{Address, Connection, ConnectionSettings, DriverRegistry, InstrumentError, RetryPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serial_settings(timeout_ms: u64) -> ConnectionSettings {
    ConnectionSettings {
        read_timeout: Duration::from_millis(timeout_ms),
        write_terminator: "\r\n".to_string(),
        read_terminator: "\r\n".to_string(),
        ..Default::default()
    }
}

fn open(device: &MockDevice, settings: &ConnectionSettings) -> Connection {
    let address = Address::parse("ASRL::/dev/ttyUSB0::INSTR").unwrap();
    Connection::open(&address, &MockDriver::new(device.clone()), settings).unwrap()
}

#[test]
fn test_response_split_across_reads() {
    let device = MockDevice::new();
    device.push(b"1.2");
    device.push(b"345\r");
    device.push(b"\n");
    let conn = open(&device, &serial_settings(500));

    assert_eq!(conn.read().unwrap(), "1.2345");
    assert_eq!(device.pending_bytes(), 0);

    // Nothing left over: the next read must time out rather than repeat.
    assert!(conn.read().unwrap_err().is_timeout());
}

#[test]
fn test_withheld_data_times_out() {
    let device = MockDevice::new();
    device.withhold(true);
    device.push(b"late\r\n");
    let conn = open(&device, &serial_settings(150));

    let started = Instant::now();
    let result = conn.query("MEAS?");
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(InstrumentError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(100), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(300), "blocked too long: {elapsed:?}");
}

#[test]
fn test_concurrent_queries_never_cross() {
    let device = MockDevice::echo();
    let conn = Arc::new(open(&device, &serial_settings(1000)));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let conn = Arc::clone(&conn);
            std::thread::spawn(move || {
                for i in 0..25 {
                    let command = format!("W{worker}:Q{i}");
                    assert_eq!(conn.query(&command).unwrap(), command);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(device.writes().len(), 100);
}

#[test]
fn test_malformed_reply_retried_once_then_reported() {
    let device = MockDevice::new();
    device.script_replies(["OVERFLOW\r\n", "ERR\r\n", "1.0\r\n"]);
    let conn = open(&device, &serial_settings(200));

    match conn.query_f64("READ?") {
        Err(InstrumentError::Communication {
            command, attempts, ..
        }) => {
            assert_eq!(command, "READ?");
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(device.writes().len(), 2);
    assert_eq!(device.clear_calls(), 1);
}

#[test]
fn test_retry_policy_is_configurable() {
    let device = MockDevice::new();
    device.script_replies(["?\r\n", "?\r\n", "7\r\n"]);
    let conn = open(&device, &serial_settings(200));
    conn.set_retry_policy(RetryPolicy {
        retries: 2,
        backoff: Duration::from_millis(5),
    });
    assert_eq!(conn.query_i64("COUNT?").unwrap(), 7);
    assert_eq!(device.writes().len(), 3);
}

#[test]
fn test_locked_sequence_is_atomic() {
    let device = MockDevice::echo();
    let conn = open(&device, &serial_settings(500));
    let mut session = conn.lock();
    session.write("A").unwrap();
    session.write("B").unwrap();
    assert_eq!(session.read().unwrap(), "A");
    assert_eq!(session.read().unwrap(), "B");
}

#[test]
fn test_open_through_registry_reports_every_failure() {
    let mut registry = DriverRegistry::new();
    registry.register(MockDriver::failing("first"));
    registry.register(MockDriver::failing("second"));
    let address = Address::parse("TCPIP0::10.1.1.1::5025::SOCKET").unwrap();

    match Connection::open_with(&registry, &address, &ConnectionSettings::default()) {
        Err(InstrumentError::NoDriver { errors, .. }) => {
            assert!(errors.contains("first"));
            assert!(errors.contains("second"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_close_releases_handle_exactly_once() {
    let device = MockDevice::new();
    let conn = open(&device, &serial_settings(100));
    conn.close().unwrap();
    assert!(matches!(conn.close(), Err(InstrumentError::AlreadyClosed(_))));
    assert!(matches!(conn.write("X"), Err(InstrumentError::Closed(_))));
    drop(conn);
    assert_eq!(device.close_calls(), 1);
}

#[test]
fn test_binary_block_inside_locked_sequence() {
    let device = MockDevice::new();
    let conn = open(&device, &serial_settings(300));
    // Header line, then a 4-byte block that is not valid UTF-8.
    device.script_replies(["#4\r\n"]);

    let mut session = conn.lock();
    session.write("CURV?").unwrap();
    assert_eq!(session.read().unwrap(), "#4");
    device.push([0x01u8, 0xFF, 0xFE, 0x42]);
    assert_eq!(session.read_bytes(4).unwrap(), vec![0x01, 0xFF, 0xFE, 0x42]);
    session.write_bytes(&[0xAA, 0x55]).unwrap();
    drop(session);

    assert_eq!(device.writes(), vec![b"CURV?\r\n".to_vec(), vec![0xAA, 0x55]]);
}
