//! Scripted in-memory transport
//!
//! [`MockDevice`] is the far end of the wire: tests push byte chunks into it,
//! install a responder that reacts to each write, or tell it to withhold data
//! entirely. [`MockDriver`] opens handles onto a shared `MockDevice`.
//!
//! Reads block on a condition variable until a chunk is available or the
//! handle's timeout expires, so timeout behaviour is exercised for real.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Driver, Handle, SerialParams};
use crate::address::{Address, AddressKind};
use crate::error::{InstrumentError, InstrumentResult};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    pending: VecDeque<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    withhold: bool,
    accept_limit: Option<usize>,
    native_framing: bool,
    writes: Vec<Vec<u8>>,
    write_times: Vec<Instant>,
    reads: usize,
    clears: usize,
    closes: usize,
    opens: usize,
    eoi: Option<bool>,
    eos: Option<Vec<u8>>,
    serial: Option<SerialParams>,
}

/// Simulated instrument shared between a test and the handles it opens.
#[derive(Clone, Default)]
pub struct MockDevice {
    shared: Arc<(Mutex<MockState>, Condvar)>,
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.0.lock();
        f.debug_struct("MockDevice")
            .field("pending", &state.pending.len())
            .field("writes", &state.writes.len())
            .field("closes", &state.closes)
            .finish()
    }
}

impl MockDevice {
    /// A silent device: reads time out until data is pushed.
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that answers every write with the written bytes.
    pub fn echo() -> Self {
        let device = Self::new();
        device.set_responder(|written| vec![written.to_vec()]);
        device
    }

    /// Reads return one whole chunk per call, like a GPIB/VISA session.
    pub fn with_native_framing(self) -> Self {
        self.shared.0.lock().native_framing = true;
        self
    }

    /// Queue one chunk; a non-framing read returns at most this chunk.
    pub fn push(&self, chunk: impl AsRef<[u8]>) {
        let chunk = chunk.as_ref();
        if chunk.is_empty() {
            return;
        }
        let (lock, cvar) = &*self.shared;
        lock.lock().pending.push_back(chunk.to_vec());
        cvar.notify_all();
    }

    /// Queue replies handed out one per write, in order.
    pub fn script_replies<I, B>(&self, replies: I)
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut state = self.shared.0.lock();
        state
            .replies
            .extend(replies.into_iter().map(|r| r.as_ref().to_vec()));
    }

    /// React to every write; returned chunks are queued for reading.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.shared.0.lock().responder = Some(Box::new(responder));
    }

    /// While set, reads see no data at all and run into their timeout.
    pub fn withhold(&self, withhold: bool) {
        let (lock, cvar) = &*self.shared;
        lock.lock().withhold = withhold;
        cvar.notify_all();
    }

    /// Accept at most `limit` bytes per write.
    pub fn limit_write(&self, limit: Option<usize>) {
        self.shared.0.lock().accept_limit = limit;
    }

    /// Everything written so far, one entry per write call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.0.lock().writes.clone()
    }

    /// When each write arrived.
    pub fn write_times(&self) -> Vec<Instant> {
        self.shared.0.lock().write_times.clone()
    }

    /// Bytes queued but not yet read.
    pub fn pending_bytes(&self) -> usize {
        self.shared.0.lock().pending.iter().map(Vec::len).sum()
    }

    /// Number of `read` calls on any handle.
    pub fn read_calls(&self) -> usize {
        self.shared.0.lock().reads
    }

    /// Number of buffer purges.
    pub fn clear_calls(&self) -> usize {
        self.shared.0.lock().clears
    }

    /// Number of handle closes.
    pub fn close_calls(&self) -> usize {
        self.shared.0.lock().closes
    }

    /// Number of handles opened.
    pub fn open_calls(&self) -> usize {
        self.shared.0.lock().opens
    }

    /// Last EOI setting applied.
    pub fn eoi(&self) -> Option<bool> {
        self.shared.0.lock().eoi
    }

    /// Last end-of-string sequence applied.
    pub fn eos(&self) -> Option<Vec<u8>> {
        self.shared.0.lock().eos.clone()
    }

    /// Last serial parameters applied.
    pub fn serial_params(&self) -> Option<SerialParams> {
        self.shared.0.lock().serial.clone()
    }

    fn handle(&self, name: String) -> MockHandle {
        self.shared.0.lock().opens += 1;
        MockHandle {
            name,
            device: self.clone(),
            timeout: Duration::from_millis(2000),
            closed: false,
        }
    }
}

/// Driver opening handles onto one [`MockDevice`].
#[derive(Debug, Clone)]
pub struct MockDriver {
    name: String,
    device: Option<MockDevice>,
    kinds: Option<Vec<AddressKind>>,
    discoverable: Vec<Address>,
}

impl MockDriver {
    /// Serves every address kind with `device`.
    pub fn new(device: MockDevice) -> Self {
        Self {
            name: "mock".to_string(),
            device: Some(device),
            kinds: None,
            discoverable: Vec::new(),
        }
    }

    /// A driver whose `open` always fails.
    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            device: None,
            kinds: None,
            discoverable: Vec::new(),
        }
    }

    /// Report `name` as the driver name.
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Restrict the address kinds this driver accepts.
    pub fn serving(mut self, kinds: &[AddressKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    /// Addresses reported by `search()`.
    pub fn discovering(mut self, addresses: Vec<Address>) -> Self {
        self.discoverable = addresses;
        self
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn works_with(&self, address: &Address) -> bool {
        self.kinds
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&address.kind()))
    }

    fn open(&self, address: &Address) -> InstrumentResult<Box<dyn Handle>> {
        if !self.works_with(address) {
            return Err(InstrumentError::IncompatibleAddress {
                driver: self.name.clone(),
                address: address.to_string(),
            });
        }
        match &self.device {
            Some(device) => Ok(Box::new(device.handle(address.to_string()))),
            None => Err(InstrumentError::Connection(format!(
                "{} has no device at {}",
                self.name, address
            ))),
        }
    }

    fn search(&self) -> InstrumentResult<Vec<Address>> {
        Ok(self.discoverable.clone())
    }
}

/// Handle onto a [`MockDevice`].
pub struct MockHandle {
    name: String,
    device: MockDevice,
    timeout: Duration,
    closed: bool,
}

impl MockHandle {
    fn ensure_open(&self) -> InstrumentResult<()> {
        if self.closed {
            Err(InstrumentError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

impl Handle for MockHandle {
    fn write(&mut self, bytes: &[u8]) -> InstrumentResult<usize> {
        self.ensure_open()?;
        let (lock, cvar) = &*self.device.shared;
        let mut guard = lock.lock();
        let state = &mut *guard;
        let accepted = state
            .accept_limit
            .map_or(bytes.len(), |limit| limit.min(bytes.len()));
        state.writes.push(bytes[..accepted].to_vec());
        state.write_times.push(Instant::now());

        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&bytes[..accepted]),
            None => state.replies.pop_front().into_iter().collect(),
        };
        state
            .pending
            .extend(replies.into_iter().filter(|chunk| !chunk.is_empty()));
        cvar.notify_all();
        Ok(accepted)
    }

    fn read(&mut self, buf: &mut [u8]) -> InstrumentResult<usize> {
        self.ensure_open()?;
        let deadline = Instant::now() + self.timeout;
        let (lock, cvar) = &*self.device.shared;
        let mut state = lock.lock();
        state.reads += 1;
        loop {
            if !state.withhold {
                let native = state.native_framing;
                if let Some(chunk) = state.pending.front_mut() {
                    let n = buf.len().min(chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if native || n == chunk.len() {
                        state.pending.pop_front();
                    } else {
                        chunk.drain(..n);
                    }
                    return Ok(n);
                }
            }
            if cvar.wait_until(&mut state, deadline).timed_out() {
                return Err(InstrumentError::Timeout(self.timeout));
            }
        }
    }

    fn native_framing(&self) -> bool {
        self.device.shared.0.lock().native_framing
    }

    fn set_eoi(&mut self, enabled: bool) -> InstrumentResult<()> {
        self.ensure_open()?;
        self.device.shared.0.lock().eoi = Some(enabled);
        Ok(())
    }

    fn set_eos(&mut self, terminator: &[u8]) -> InstrumentResult<()> {
        self.ensure_open()?;
        self.device.shared.0.lock().eos = Some(terminator.to_vec());
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> InstrumentResult<()> {
        self.ensure_open()?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_serial_params(&mut self, params: &SerialParams) -> InstrumentResult<()> {
        self.ensure_open()?;
        params.validate()?;
        self.device.shared.0.lock().serial = Some(params.clone());
        Ok(())
    }

    fn clear(&mut self) -> InstrumentResult<()> {
        self.ensure_open()?;
        let mut state = self.device.shared.0.lock();
        state.pending.clear();
        state.clears += 1;
        Ok(())
    }

    fn close(&mut self) -> InstrumentResult<()> {
        if self.closed {
            return Err(InstrumentError::AlreadyClosed(self.name.clone()));
        }
        self.closed = true;
        self.device.shared.0.lock().closes += 1;
        Ok(())
    }

    fn transport(&self) -> &str {
        "mock"
    }
}
