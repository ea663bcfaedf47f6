//! Framed, serialized sessions on top of a driver handle.
//!
//! A [`Connection`] owns exactly one [`Handle`] for its whole life and turns
//! the handle's raw byte I/O into text commands and responses:
//!
//! - every write gets the configured write terminator appended and may be
//!   paced to keep a minimum spacing from the previous write
//! - on transports without native framing, reads consume one byte at a time
//!   until the read terminator is seen, the buffer size is reached, or the
//!   overall read deadline expires
//! - `query` is write-then-read under the connection mutex, so concurrent
//!   callers queue instead of interleaving
//! - `write_bytes` / `read_bytes` bypass terminators and text decoding for
//!   binary payloads
//!
//! State is `OPEN` from construction until [`Connection::close`]; after that
//! every operation fails with [`InstrumentError::Closed`] and a second
//! `close` with [`InstrumentError::AlreadyClosed`].

pub mod framing;
pub mod pacing;

pub use framing::TerminatorScanner;
pub use pacing::WritePacer;

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::address::{Address, AddressKind};
use crate::config::ConnectionSettings;
use crate::driver::{Driver, DriverRegistry, Handle, SerialParams};
use crate::error::{InstrumentError, InstrumentResult};
use crate::error_recovery::RetryPolicy;
use framing::{strip_phrases, strip_terminator};

/// Render a `{name}` command template.
///
/// # Errors
///
/// [`InstrumentError::Template`] when the template references an unknown key
/// or is syntactically invalid.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> InstrumentResult<String> {
    strfmt::strfmt(template, vars).map_err(|e| InstrumentError::Template {
        template: template.to_string(),
        reason: e.to_string(),
    })
}

/// An open session with one instrument.
pub struct Connection {
    address: Address,
    driver: String,
    inner: Mutex<Inner>,
}

struct Inner {
    name: String,
    handle: Option<Box<dyn Handle>>,
    write_terminator: Vec<u8>,
    read_terminator: Vec<u8>,
    scanner: TerminatorScanner,
    read_buffer_size: usize,
    timeout: Duration,
    clear_timeout: Duration,
    retry: RetryPolicy,
    pacer: WritePacer,
    auto_remove: Vec<String>,
    last_command: Option<String>,
    last_read: Option<String>,
}

impl Connection {
    /// Open `address` with a specific driver and apply `settings`.
    ///
    /// # Errors
    ///
    /// Driver open failures propagate unchanged. If configuring the fresh
    /// handle fails, the handle is closed before the error is returned.
    pub fn open(
        address: &Address,
        driver: &dyn Driver,
        settings: &ConnectionSettings,
    ) -> InstrumentResult<Self> {
        let handle = driver.open(address)?;
        Self::from_handle(address.clone(), driver.name(), handle, settings)
    }

    /// Open `address` with the first driver in `registry` that accepts it.
    pub fn open_with(
        registry: &DriverRegistry,
        address: &Address,
        settings: &ConnectionSettings,
    ) -> InstrumentResult<Self> {
        let (handle, driver) = registry.open(address, None)?;
        Self::from_handle(address.clone(), &driver, handle, settings)
    }

    fn from_handle(
        address: Address,
        driver: &str,
        mut handle: Box<dyn Handle>,
        settings: &ConnectionSettings,
    ) -> InstrumentResult<Self> {
        let prepared = settings
            .validate()
            .map_err(InstrumentError::from)
            .and_then(|()| TerminatorScanner::new(settings.read_terminator.as_bytes()))
            .and_then(|scanner| configure(handle.as_mut(), &address, settings).map(|()| scanner));
        let scanner = match prepared {
            Ok(scanner) => scanner,
            Err(e) => {
                if let Err(close_err) = handle.close() {
                    warn!(address = %address, error = %close_err, "Failed to close handle after configuration error");
                }
                return Err(e);
            }
        };

        info!(address = %address, driver, transport = handle.transport(), "Connection opened");
        let name = address.to_string();
        Ok(Self {
            address,
            driver: driver.to_string(),
            inner: Mutex::new(Inner {
                name,
                handle: Some(handle),
                write_terminator: settings.write_terminator.as_bytes().to_vec(),
                read_terminator: settings.read_terminator.as_bytes().to_vec(),
                scanner,
                read_buffer_size: settings.read_buffer_size,
                timeout: settings.read_timeout,
                clear_timeout: settings.clear_timeout,
                retry: settings.retry.clone(),
                pacer: WritePacer::new(settings.min_write_interval),
                auto_remove: Vec::new(),
                last_command: None,
                last_read: None,
            }),
        })
    }

    /// Address the connection was opened on.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Name of the driver that opened the handle.
    pub fn driver_name(&self) -> &str {
        &self.driver
    }

    /// Take exclusive use of the connection for a multi-step exchange.
    ///
    /// Other callers block on their next operation until the guard drops.
    pub fn lock(&self) -> ConnectionGuard<'_> {
        ConnectionGuard {
            inner: self.inner.lock(),
        }
    }

    /// Send `command` followed by the write terminator.
    pub fn write(&self, command: &str) -> InstrumentResult<()> {
        self.lock().write(command)
    }

    /// Read one response with the read terminator and auto-remove phrases
    /// stripped. Invalid UTF-8 is replaced; use [`Connection::read_bytes`]
    /// for binary replies.
    pub fn read(&self) -> InstrumentResult<String> {
        self.lock().read()
    }

    /// Send `bytes` exactly as given: no terminator is appended.
    ///
    /// Write pacing and short-write detection still apply.
    pub fn write_bytes(&self, bytes: &[u8]) -> InstrumentResult<()> {
        self.lock().write_bytes(bytes)
    }

    /// Read up to `count` bytes verbatim, terminator included.
    ///
    /// On natively framed transports one message is returned, possibly
    /// shorter than `count`. On byte streams the call blocks until exactly
    /// `count` bytes have arrived.
    ///
    /// # Errors
    ///
    /// [`InstrumentError::Timeout`] if the read deadline passes first.
    pub fn read_bytes(&self, count: usize) -> InstrumentResult<Vec<u8>> {
        self.lock().read_bytes(count)
    }

    /// Write `command` and read its response as one atomic unit.
    pub fn query(&self, command: &str) -> InstrumentResult<String> {
        self.lock().query(command)
    }

    /// Query and parse the trimmed response, retrying malformed replies
    /// according to the connection's [`RetryPolicy`].
    pub fn query_parsed<T>(&self, command: &str) -> InstrumentResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.lock().query_parsed(command)
    }

    /// [`Connection::query_parsed`] as a float.
    pub fn query_f64(&self, command: &str) -> InstrumentResult<f64> {
        self.query_parsed(command)
    }

    /// [`Connection::query_parsed`] as an integer.
    pub fn query_i64(&self, command: &str) -> InstrumentResult<i64> {
        self.query_parsed(command)
    }

    /// Read a number without sending a command first.
    pub fn read_f64(&self) -> InstrumentResult<f64> {
        self.lock().read_parsed()
    }

    /// Render `template` with [`render_template`] and write it.
    pub fn write_template(
        &self,
        template: &str,
        vars: &HashMap<String, String>,
    ) -> InstrumentResult<()> {
        self.write(&render_template(template, vars)?)
    }

    /// Render `template` with [`render_template`] and query it.
    pub fn query_template(
        &self,
        template: &str,
        vars: &HashMap<String, String>,
    ) -> InstrumentResult<String> {
        self.query(&render_template(template, vars)?)
    }

    /// Bound every blocking read.
    pub fn set_timeout(&self, timeout: Duration) -> InstrumentResult<()> {
        let mut inner = self.inner.lock();
        inner.handle_mut()?.set_timeout(timeout)?;
        inner.timeout = timeout;
        Ok(())
    }

    /// Current read deadline.
    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// Use `terminator` for both outgoing commands and incoming responses.
    pub fn set_terminator(&self, terminator: &str) -> InstrumentResult<()> {
        self.set_read_terminator(terminator)?;
        self.set_write_terminator(terminator)
    }

    /// Bytes appended to every command.
    pub fn set_write_terminator(&self, terminator: &str) -> InstrumentResult<()> {
        let mut inner = self.inner.lock();
        inner.handle_mut()?;
        inner.write_terminator = terminator.as_bytes().to_vec();
        Ok(())
    }

    /// Sequence that ends a response; empty means one transport read per response.
    pub fn set_read_terminator(&self, terminator: &str) -> InstrumentResult<()> {
        let scanner = TerminatorScanner::new(terminator.as_bytes())?;
        let mut inner = self.inner.lock();
        inner.handle_mut()?.set_eos(terminator.as_bytes())?;
        inner.read_terminator = terminator.as_bytes().to_vec();
        inner.scanner = scanner;
        Ok(())
    }

    /// Assert EOI with the last byte of each write (GPIB).
    pub fn set_eoi(&self, enabled: bool) -> InstrumentResult<()> {
        self.inner.lock().handle_mut()?.set_eoi(enabled)
    }

    /// Reconfigure a serial line at runtime.
    pub fn set_serial_params(&self, params: &SerialParams) -> InstrumentResult<()> {
        self.inner.lock().handle_mut()?.set_serial_params(params)
    }

    /// Largest response, in bytes, returned by one read.
    pub fn set_read_buffer_size(&self, size: usize) -> InstrumentResult<()> {
        if size == 0 {
            return Err(InstrumentError::Connection(
                "Read buffer size must be at least 1".to_string(),
            ));
        }
        self.inner.lock().read_buffer_size = size;
        Ok(())
    }

    /// Minimum spacing between writes; zero disables pacing.
    pub fn set_min_write_interval(&self, interval: Duration) {
        self.inner.lock().pacer.set_interval(interval);
    }

    /// Policy used by the parsed queries.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.inner.lock().retry = policy;
    }

    /// Strip `phrase` from every response (e.g. XON/XOFF characters echoed in-band).
    pub fn add_auto_remove(&self, phrase: &str) {
        self.inner.lock().auto_remove.push(phrase.to_string());
    }

    /// Purge the transport's buffers.
    pub fn clear(&self) -> InstrumentResult<()> {
        self.lock().clear()
    }

    /// Read and discard input until the line stays quiet for the clear timeout.
    pub fn drain_input(&self) -> InstrumentResult<usize> {
        self.lock().drain_input()
    }

    /// Last command written, without terminator.
    pub fn last_command(&self) -> Option<String> {
        self.inner.lock().last_command.clone()
    }

    /// Last response read, after terminator and auto-remove stripping.
    pub fn last_read(&self) -> Option<String> {
        self.inner.lock().last_read.clone()
    }

    /// False once [`Connection::close`] has run.
    pub fn is_open(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    /// Release the handle.
    ///
    /// The connection is unusable afterwards even if the driver reports an
    /// error while closing.
    pub fn close(&self) -> InstrumentResult<()> {
        let mut inner = self.inner.lock();
        let mut handle = inner
            .handle
            .take()
            .ok_or_else(|| InstrumentError::AlreadyClosed(inner.name.clone()))?;
        match handle.close() {
            Ok(()) => {
                info!(address = %inner.name, "Connection closed");
                Ok(())
            }
            Err(e) => {
                warn!(address = %inner.name, error = %e, "Error while closing connection");
                Err(e)
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(mut handle) = inner.handle.take() {
            if let Err(e) = handle.close() {
                warn!(address = %inner.name, error = %e, "Error closing dropped connection");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address.to_string())
            .field("driver", &self.driver)
            .finish()
    }
}

fn configure(
    handle: &mut dyn Handle,
    address: &Address,
    settings: &ConnectionSettings,
) -> InstrumentResult<()> {
    handle.set_timeout(settings.read_timeout)?;
    handle.set_eoi(settings.send_eoi)?;
    handle.set_eos(settings.read_terminator.as_bytes())?;
    if address.kind() == AddressKind::Serial {
        handle.set_serial_params(&settings.serial)?;
    }
    Ok(())
}

fn parse_response<T>(response: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err("empty response".to_string());
    }
    trimmed
        .parse::<T>()
        .map_err(|e| format!("cannot interpret {trimmed:?}: {e}"))
}

/// Exclusive access to a [`Connection`], obtained from [`Connection::lock`].
pub struct ConnectionGuard<'a> {
    inner: MutexGuard<'a, Inner>,
}

impl ConnectionGuard<'_> {
    /// See [`Connection::write`].
    pub fn write(&mut self, command: &str) -> InstrumentResult<()> {
        self.inner.write(command)
    }

    /// See [`Connection::read`].
    pub fn read(&mut self) -> InstrumentResult<String> {
        self.inner.read()
    }

    /// Write then read while the guard is held.
    pub fn query(&mut self, command: &str) -> InstrumentResult<String> {
        self.inner.write(command)?;
        self.inner.read()
    }

    /// See [`Connection::query_parsed`].
    pub fn query_parsed<T>(&mut self, command: &str) -> InstrumentResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let policy = self.inner.retry.clone();
        let inner = &mut *self.inner;
        policy.run(command, |attempt| {
            if attempt > 0 {
                inner.handle_mut()?.clear()?;
            }
            inner.write(command)?;
            let response = inner.read()?;
            Ok(parse_response(&response))
        })
    }

    /// Read and parse one response without writing, retrying as for queries.
    pub fn read_parsed<T>(&mut self) -> InstrumentResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let policy = self.inner.retry.clone();
        let inner = &mut *self.inner;
        policy.run("<read>", |_| {
            let response = inner.read()?;
            Ok(parse_response(&response))
        })
    }

    /// Send `bytes` exactly as given, without a terminator.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> InstrumentResult<()> {
        self.inner.write_bytes(bytes)
    }

    /// Read up to `count` raw bytes; see [`Connection::read_bytes`].
    pub fn read_bytes(&mut self, count: usize) -> InstrumentResult<Vec<u8>> {
        self.inner.read_bytes(count)
    }

    /// Purge the transport's buffers.
    pub fn clear(&mut self) -> InstrumentResult<()> {
        self.inner.handle_mut()?.clear()
    }

    /// See [`Connection::drain_input`].
    pub fn drain_input(&mut self) -> InstrumentResult<usize> {
        self.inner.drain_input()
    }
}

impl Inner {
    fn handle_mut(&mut self) -> InstrumentResult<&mut Box<dyn Handle>> {
        self.handle
            .as_mut()
            .ok_or_else(|| InstrumentError::Closed(self.name.clone()))
    }

    fn write(&mut self, command: &str) -> InstrumentResult<()> {
        let mut bytes = Vec::with_capacity(command.len() + self.write_terminator.len());
        bytes.extend_from_slice(command.as_bytes());
        bytes.extend_from_slice(&self.write_terminator);

        let accepted = self.send(&bytes)?;
        debug!(address = %self.name, command, "Write");
        self.last_command = Some(command.to_string());
        check_accepted(bytes.len(), accepted)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> InstrumentResult<()> {
        let accepted = self.send(bytes)?;
        debug!(address = %self.name, len = bytes.len(), "Raw write");
        check_accepted(bytes.len(), accepted)
    }

    /// Hand `bytes` to the transport, honouring the write pacer.
    fn send(&mut self, bytes: &[u8]) -> InstrumentResult<usize> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| InstrumentError::Closed(self.name.clone()))?;
        self.pacer.acquire();
        let accepted = handle.write(bytes);
        self.pacer.release();
        accepted
    }

    fn read(&mut self) -> InstrumentResult<String> {
        let raw = self.read_raw()?;
        let text = strip_phrases(&String::from_utf8_lossy(&raw), &self.auto_remove);
        debug!(address = %self.name, response = %text, "Read");
        self.last_read = Some(text.clone());
        Ok(text)
    }

    fn read_raw(&mut self) -> InstrumentResult<Vec<u8>> {
        let timeout = self.timeout;
        let limit = self.read_buffer_size;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| InstrumentError::Closed(self.name.clone()))?;

        if handle.native_framing() {
            let mut buf = vec![0u8; limit];
            let n = handle.read(&mut buf).map_err(|e| normalize(e, timeout))?;
            buf.truncate(n);
            let kept = strip_terminator(&buf, &self.read_terminator).len();
            buf.truncate(kept);
            return Ok(buf);
        }

        if self.scanner.is_empty() {
            let mut buf = vec![0u8; limit];
            let n = handle.read(&mut buf).map_err(|e| normalize(e, timeout))?;
            buf.truncate(n);
            return Ok(buf);
        }

        scan_response(handle.as_mut(), &mut self.scanner, limit, timeout)
    }

    /// Up to `count` bytes with no terminator or text handling. Natively
    /// framed transports return after one message; byte streams keep reading
    /// until `count` bytes have arrived or the deadline passes.
    fn read_bytes(&mut self, count: usize) -> InstrumentResult<Vec<u8>> {
        let timeout = self.timeout;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| InstrumentError::Closed(self.name.clone()))?;
        let mut buf = vec![0u8; count];
        if count == 0 {
            return Ok(buf);
        }

        if handle.native_framing() {
            let n = handle.read(&mut buf).map_err(|e| normalize(e, timeout))?;
            buf.truncate(n);
        } else {
            fill_before_deadline(handle.as_mut(), &mut buf, timeout)?;
        }
        debug!(address = %self.name, len = buf.len(), "Raw read");
        Ok(buf)
    }

    fn drain_input(&mut self) -> InstrumentResult<usize> {
        let timeout = self.timeout;
        let quiet = self.clear_timeout;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| InstrumentError::Closed(self.name.clone()))?;

        handle.set_timeout(quiet)?;
        let deadline = Instant::now() + timeout;
        let mut discarded = 0;
        let mut scratch = [0u8; 64];
        let outcome = loop {
            if Instant::now() >= deadline {
                break Ok(());
            }
            match handle.read(&mut scratch) {
                Ok(n) => discarded += n,
                Err(e) if e.is_timeout() => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        handle.set_timeout(timeout)?;
        outcome?;
        if discarded > 0 {
            debug!(address = %self.name, discarded, "Drained stale input");
        }
        Ok(discarded)
    }
}

/// Report a handle timeout against the connection's configured deadline.
fn normalize(err: InstrumentError, timeout: Duration) -> InstrumentError {
    if err.is_timeout() {
        InstrumentError::Timeout(timeout)
    } else {
        err
    }
}

fn check_accepted(sent: usize, accepted: usize) -> InstrumentResult<()> {
    if accepted < sent {
        return Err(InstrumentError::ShortWrite { sent, accepted });
    }
    Ok(())
}

/// Fill `buf` completely or fail with a timeout once `timeout` has elapsed.
fn fill_before_deadline(
    handle: &mut dyn Handle,
    buf: &mut [u8],
    timeout: Duration,
) -> InstrumentResult<()> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;
    let mut shortened = false;

    let outcome = loop {
        if filled == buf.len() {
            break Ok(());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Err(InstrumentError::Timeout(timeout));
        }
        if remaining < handle.timeout() {
            if let Err(e) = handle.set_timeout(remaining) {
                break Err(e);
            }
            shortened = true;
        }
        match handle.read(&mut buf[filled..]) {
            Ok(n) => filled += n,
            Err(e) => break Err(normalize(e, timeout)),
        }
    };

    if shortened {
        handle.set_timeout(timeout)?;
    }
    outcome
}

/// Consume bytes one at a time until the terminator, `limit` bytes, or the
/// overall deadline. Returns the bytes preceding the terminator.
fn scan_response(
    handle: &mut dyn Handle,
    scanner: &mut TerminatorScanner,
    limit: usize,
    timeout: Duration,
) -> InstrumentResult<Vec<u8>> {
    scanner.reset();
    let deadline = Instant::now() + timeout;
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    let mut shortened = false;

    let outcome = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Err(InstrumentError::Timeout(timeout));
        }
        // Keep a trickling device from stretching one read past the deadline.
        if remaining < handle.timeout() {
            if let Err(e) = handle.set_timeout(remaining) {
                break Err(e);
            }
            shortened = true;
        }
        match handle.read(&mut byte) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => break Err(normalize(e, timeout)),
        }
        response.push(byte[0]);
        if scanner.push(byte[0]) {
            response.truncate(response.len() - scanner.len());
            break Ok(response);
        }
        if response.len() >= limit {
            break Ok(response);
        }
    };

    if shortened {
        handle.set_timeout(timeout)?;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDevice, MockDriver};

    fn open(device: &MockDevice, settings: &ConnectionSettings) -> Connection {
        let address = Address::parse("ASRL::MOCK::INSTR").unwrap();
        Connection::open(&address, &MockDriver::new(device.clone()), settings).unwrap()
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            read_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_write_appends_terminator() {
        let device = MockDevice::new();
        let conn = open(&device, &settings());
        conn.write("OUTP ON").unwrap();
        assert_eq!(device.writes(), vec![b"OUTP ON\n".to_vec()]);
        assert_eq!(conn.last_command().as_deref(), Some("OUTP ON"));
    }

    #[test]
    fn test_open_applies_settings() {
        let device = MockDevice::new();
        let settings = ConnectionSettings {
            serial: SerialParams::new(19200),
            read_terminator: "\r".to_string(),
            ..settings()
        };
        let _conn = open(&device, &settings);
        assert_eq!(device.serial_params().unwrap().baud_rate, 19200);
        assert_eq!(device.eos(), Some(b"\r".to_vec()));
        assert_eq!(device.eoi(), Some(true));
    }

    #[test]
    fn test_short_write_detected() {
        let device = MockDevice::new();
        device.limit_write(Some(3));
        let conn = open(&device, &settings());
        match conn.write("VOLT 1.0") {
            Err(InstrumentError::ShortWrite { sent, accepted }) => {
                assert_eq!(sent, 9);
                assert_eq!(accepted, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_read_stops_at_buffer_size() {
        let device = MockDevice::new();
        device.push(b"0123456789\n");
        let conn = open(&device, &settings());
        conn.set_read_buffer_size(4).unwrap();
        assert_eq!(conn.read().unwrap(), "0123");
        assert_eq!(conn.read().unwrap(), "4567");
        assert_eq!(conn.read().unwrap(), "89");
    }

    #[test]
    fn test_native_framing_returns_whole_message() {
        let device = MockDevice::new().with_native_framing();
        device.push(b"KEITHLEY,2400\n");
        let conn = open(&device, &settings());
        assert_eq!(conn.read().unwrap(), "KEITHLEY,2400");
        assert_eq!(device.read_calls(), 1);
    }

    #[test]
    fn test_auto_remove_phrases() {
        let device = MockDevice::new();
        device.push(b"\x11+1.25E-3\x13\n");
        let conn = open(&device, &settings());
        conn.add_auto_remove("\u{0011}");
        conn.add_auto_remove("\u{0013}");
        assert_eq!(conn.read_f64().unwrap(), 1.25e-3);
        assert_eq!(conn.last_read().as_deref(), Some("+1.25E-3"));
    }

    #[test]
    fn test_query_parsed_retries_after_clear() {
        let device = MockDevice::new();
        device.script_replies(["garbled\n", "42\n"]);
        let conn = open(&device, &settings());
        assert_eq!(conn.query_i64("COUNT?").unwrap(), 42);
        assert_eq!(device.writes().len(), 2);
        assert_eq!(device.clear_calls(), 1);
    }

    #[test]
    fn test_query_template() {
        let device = MockDevice::echo();
        let conn = open(&device, &settings());
        let vars = HashMap::from([
            ("channel".to_string(), "2".to_string()),
            ("value".to_string(), "0.5".to_string()),
        ]);
        assert_eq!(
            conn.query_template("SOUR{channel}:VOLT {value}", &vars).unwrap(),
            "SOUR2:VOLT 0.5"
        );
        assert!(matches!(
            conn.write_template("{missing}", &vars),
            Err(InstrumentError::Template { .. })
        ));
    }

    #[test]
    fn test_drain_input_discards_stale_bytes() {
        let device = MockDevice::new();
        let settings = ConnectionSettings {
            clear_timeout: Duration::from_millis(20),
            ..settings()
        };
        let conn = open(&device, &settings);
        device.push(b"stale\nresponse\n");
        assert_eq!(conn.drain_input().unwrap(), 15);
        assert_eq!(device.pending_bytes(), 0);
        assert_eq!(conn.timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_close_lifecycle() {
        let device = MockDevice::new();
        let conn = open(&device, &settings());
        assert!(conn.is_open());
        conn.close().unwrap();
        assert!(!conn.is_open());
        assert!(matches!(conn.write("X"), Err(InstrumentError::Closed(_))));
        assert!(matches!(conn.close(), Err(InstrumentError::AlreadyClosed(_))));
        drop(conn);
        assert_eq!(device.close_calls(), 1);
    }

    #[test]
    fn test_drop_closes_handle() {
        let device = MockDevice::new();
        drop(open(&device, &settings()));
        assert_eq!(device.close_calls(), 1);
    }

    #[test]
    fn test_binary_reply_survives_read_bytes() {
        let device = MockDevice::new();
        device.push([0x01, 0xFF, 0xFE, 0x42, b'\n']);
        let conn = open(&device, &settings());
        assert_eq!(conn.read_bytes(5).unwrap(), vec![0x01, 0xFF, 0xFE, 0x42, b'\n']);
        assert_eq!(device.pending_bytes(), 0);
    }

    #[test]
    fn test_read_bytes_waits_for_full_count() {
        let device = MockDevice::new();
        device.push([0x80u8, 0x81]);
        device.push([0x82u8]);
        let conn = open(&device, &settings());
        assert_eq!(conn.read_bytes(3).unwrap(), vec![0x80, 0x81, 0x82]);

        device.push([0x90u8]);
        let started = Instant::now();
        assert!(matches!(conn.read_bytes(2), Err(InstrumentError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(conn.read_bytes(0).unwrap().is_empty());
    }

    #[test]
    fn test_read_bytes_native_framing_keeps_terminator() {
        let device = MockDevice::new().with_native_framing();
        device.push([0xC3, 0x28, b'\n']);
        let conn = open(&device, &settings());
        assert_eq!(conn.read_bytes(64).unwrap(), vec![0xC3, 0x28, b'\n']);
    }

    #[test]
    fn test_write_bytes_sends_no_terminator() {
        let device = MockDevice::new();
        let conn = open(&device, &settings());
        conn.write_bytes(&[0x00, 0xFF, 0x0A]).unwrap();
        assert_eq!(device.writes(), vec![vec![0x00, 0xFF, 0x0A]]);
        assert_eq!(conn.last_command(), None);

        device.limit_write(Some(1));
        assert!(matches!(
            conn.write_bytes(&[0x01, 0x02]),
            Err(InstrumentError::ShortWrite { sent: 2, accepted: 1 })
        ));
    }

    #[test]
    fn test_write_pacing() {
        let device = MockDevice::new();
        let settings = ConnectionSettings {
            min_write_interval: Duration::from_millis(50),
            ..settings()
        };
        let conn = open(&device, &settings);
        conn.write("A").unwrap();
        conn.write("B").unwrap();
        let times = device.write_times();
        assert!(times[1].duration_since(times[0]) >= Duration::from_millis(50));
    }

    #[test]
    fn test_pacing_never_delays_reads() {
        let device = MockDevice::echo();
        let settings = ConnectionSettings {
            min_write_interval: Duration::from_millis(300),
            ..settings()
        };
        let conn = open(&device, &settings);

        let started = Instant::now();
        assert_eq!(conn.query("MEAS?").unwrap(), "MEAS?");
        // The write window is still open; a read must not wait for it.
        device.push(b"+1.0\n");
        assert_eq!(conn.read().unwrap(), "+1.0");
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "read held back: {:?}",
            started.elapsed()
        );

        conn.write("NEXT").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
