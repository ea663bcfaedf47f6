//! Shared Modbus RTU bus
//!
//! One physical RTU line carries at most one outstanding transaction. A
//! [`ModbusBus`] owns the line, runs a single background reader thread that
//! cuts the incoming byte stream into response frames, and files each frame
//! into a queue keyed by slave address. Callers send through one write path
//! under the transaction lock and block on a condition variable until their
//! unit's reply arrives or the transaction timeout expires.
//!
//! Serial-backed buses are cached per port name, so every device on a line
//! shares one reader thread.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::frame::{response_len, ModbusFrame, BROADCAST, MAX_FRAME_LEN};
use crate::config::ModbusSettings;
use crate::error::{InstrumentError, InstrumentResult};

static SERIAL_BUSES: Lazy<Mutex<HashMap<String, Weak<ModbusBus>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn bus_key(port: &str) -> String {
    port.trim().to_lowercase()
}

struct Inbox {
    queues: Mutex<HashMap<u8, VecDeque<ModbusFrame>>>,
    arrived: Condvar,
    running: AtomicBool,
}

/// Master side of one RTU line.
pub struct ModbusBus {
    name: String,
    writer: Mutex<Box<dyn Write + Send>>,
    transaction: Mutex<()>,
    inbox: Arc<Inbox>,
    reader: Mutex<Option<JoinHandle<()>>>,
    settings: ModbusSettings,
}

impl std::fmt::Debug for ModbusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusBus")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ModbusBus {
    /// Run a bus over an arbitrary byte stream.
    ///
    /// `reader` must time out periodically (ideally after
    /// `settings.poll_interval`); a timeout with a partial frame buffered
    /// discards that frame, and the reader thread only notices shutdown
    /// between reads.
    pub fn from_io(
        name: &str,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        settings: &ModbusSettings,
    ) -> InstrumentResult<Arc<Self>> {
        let inbox = Arc::new(Inbox {
            queues: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let thread_inbox = Arc::clone(&inbox);
        let verify = settings.verify_crc;
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("modbus-rx-{name}"))
            .spawn(move || read_loop(&thread_name, reader, &thread_inbox, verify))
            .map_err(|e| InstrumentError::Connection(format!("Cannot start Modbus reader: {e}")))?;

        info!(bus = name, "Modbus bus started");
        Ok(Arc::new(Self {
            name: name.to_string(),
            writer: Mutex::new(writer),
            transaction: Mutex::new(()),
            inbox,
            reader: Mutex::new(Some(handle)),
            settings: settings.clone(),
        }))
    }

    /// The bus on serial `port`, opened on first use and shared afterwards.
    ///
    /// Port names are compared trimmed and case-insensitively.
    pub fn open_serial(port: &str, settings: &ModbusSettings) -> InstrumentResult<Arc<Self>> {
        let key = bus_key(port);
        #[cfg_attr(not(feature = "instrument_serial"), allow(unused_mut))]
        let mut buses = SERIAL_BUSES.lock();
        if let Some(bus) = buses.get(&key).and_then(Weak::upgrade) {
            if bus.is_running() {
                debug!(bus = %key, "Reusing Modbus bus");
                return Ok(bus);
            }
        }

        #[cfg(feature = "instrument_serial")]
        {
            let port_handle =
                crate::driver::serial::open_port(port, &settings.serial, settings.poll_interval)?;
            let reader = port_handle
                .try_clone()
                .map_err(|e| InstrumentError::Connection(format!("{}: {}", port.trim(), e)))?;
            let bus = Self::from_io(port.trim(), Box::new(reader), Box::new(port_handle), settings)?;
            buses.retain(|_, weak| weak.strong_count() > 0);
            buses.insert(key, Arc::downgrade(&bus));
            Ok(bus)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = settings;
            Err(InstrumentError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }

    /// Port name the bus was opened on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timing the bus was opened with.
    pub fn settings(&self) -> &ModbusSettings {
        &self.settings
    }

    /// False once the reader thread has stopped (line closed or failed).
    pub fn is_running(&self) -> bool {
        self.inbox.running.load(Ordering::Acquire)
    }

    /// Send `request` and wait for the matching reply from its unit.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::Timeout`] after the transaction timeout,
    /// [`InstrumentError::ModbusException`] for exception replies.
    pub fn transact(&self, request: &ModbusFrame) -> InstrumentResult<ModbusFrame> {
        let unit = request.address();
        if unit == BROADCAST {
            return Err(InstrumentError::Protocol(
                "Broadcast requests receive no reply; use broadcast()".to_string(),
            ));
        }

        let _transaction = self.transaction.lock();
        if let Some(stale) = self.inbox.queues.lock().remove(&unit) {
            if !stale.is_empty() {
                debug!(bus = %self.name, unit, dropped = stale.len(), "Dropping stale replies");
            }
        }
        self.send(request)?;

        let timeout = self.settings.transaction_timeout;
        let deadline = Instant::now() + timeout;
        let mut queues = self.inbox.queues.lock();
        loop {
            while let Some(reply) = queues.get_mut(&unit).and_then(VecDeque::pop_front) {
                if reply.base_function() != request.function() {
                    debug!(bus = %self.name, unit, function = reply.function(), "Ignoring reply to another function");
                    continue;
                }
                reply.check_exception()?;
                return Ok(reply);
            }
            if !self.is_running() {
                return Err(InstrumentError::Connection(format!(
                    "Modbus bus {} is no longer running",
                    self.name
                )));
            }
            if Instant::now() >= deadline {
                return Err(InstrumentError::Timeout(timeout));
            }
            self.inbox.arrived.wait_until(&mut queues, deadline);
        }
    }

    /// Send a request to every slave (address 0); no reply is awaited.
    pub fn broadcast(&self, request: &ModbusFrame) -> InstrumentResult<()> {
        if request.address() != BROADCAST {
            return Err(InstrumentError::Protocol(format!(
                "Broadcast frame must use address 0, not {}",
                request.address()
            )));
        }
        let _transaction = self.transaction.lock();
        self.send(request)
    }

    fn send(&self, frame: &ModbusFrame) -> InstrumentResult<()> {
        let bytes = frame.to_bytes();
        trace!(bus = %self.name, frame = %hex(&bytes), "Modbus TX");
        let mut writer = self.writer.lock();
        let timeout = self.settings.transaction_timeout;
        writer
            .write_all(&bytes)
            .and_then(|()| writer.flush())
            .map_err(|e| InstrumentError::from_io(e, timeout))
    }
}

impl Drop for ModbusBus {
    fn drop(&mut self) {
        self.inbox.running.store(false, Ordering::Release);
        if let Some(handle) = self.reader.get_mut().take() {
            if handle.join().is_err() {
                warn!(bus = %self.name, "Modbus reader thread panicked");
            }
        }
        info!(bus = %self.name, "Modbus bus stopped");
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_loop(name: &str, mut reader: Box<dyn Read + Send>, inbox: &Inbox, verify: bool) {
    let mut pending: Vec<u8> = Vec::with_capacity(MAX_FRAME_LEN);
    let mut chunk = [0u8; MAX_FRAME_LEN];

    while inbox.running.load(Ordering::Acquire) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                warn!(bus = name, "Modbus line closed");
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                extract_frames(name, &mut pending, inbox, verify);
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                // Inter-frame silence: whatever is left cannot complete.
                if !pending.is_empty() {
                    debug!(bus = name, partial = %hex(&pending), "Discarding incomplete frame");
                    pending.clear();
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(bus = name, error = %e, "Modbus read failed");
                break;
            }
        }
    }

    inbox.running.store(false, Ordering::Release);
    // Wake waiters so they see the bus is down.
    let _queues = inbox.queues.lock();
    inbox.arrived.notify_all();
}

/// Move every complete frame at the front of `pending` into the inbox.
fn extract_frames(name: &str, pending: &mut Vec<u8>, inbox: &Inbox, verify: bool) {
    loop {
        let needed = match response_len(pending) {
            None => return,
            Some(0) => {
                trace!(bus = name, byte = pending[0], "Unknown function code, resynchronising");
                pending.remove(0);
                continue;
            }
            Some(len) => len,
        };
        if pending.len() < needed {
            if pending.len() >= MAX_FRAME_LEN {
                pending.clear();
            }
            return;
        }

        let parsed = if verify {
            ModbusFrame::parse_verified(&pending[..needed])
        } else {
            ModbusFrame::parse(&pending[..needed])
        };
        match parsed {
            Ok(frame) => {
                trace!(bus = name, frame = %hex(&pending[..needed]), "Modbus RX");
                pending.drain(..needed);
                let mut queues = inbox.queues.lock();
                queues.entry(frame.address()).or_default().push_back(frame);
                inbox.arrived.notify_all();
            }
            Err(e) => {
                debug!(bus = name, error = %e, "Bad frame, resynchronising");
                pending.remove(0);
            }
        }
    }
}
