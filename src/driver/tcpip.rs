//! Raw TCP/IP socket driver
//!
//! Opens `TCPIP0::<host>::<port>::SOCKET` addresses. Like serial lines, raw
//! sockets have no message framing; reads are buffered so the byte-at-a-time
//! terminator scan in the connection does not cost one syscall per byte.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use super::{Driver, Handle};
use crate::address::Address;
use crate::error::{InstrumentError, InstrumentResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Opens raw TCP sockets.
#[derive(Debug, Clone)]
pub struct TcpIpDriver {
    connect_timeout: Duration,
}

impl Default for TcpIpDriver {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TcpIpDriver {
    /// Driver for raw socket instruments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the TCP connect.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Driver for TcpIpDriver {
    fn name(&self) -> &str {
        "tcpip"
    }

    fn works_with(&self, address: &Address) -> bool {
        address.to_tcpip().is_some()
    }

    fn open(&self, address: &Address) -> InstrumentResult<Box<dyn Handle>> {
        let target = address
            .to_tcpip()
            .ok_or_else(|| InstrumentError::IncompatibleAddress {
                driver: self.name().to_string(),
                address: address.to_string(),
            })?;

        let socket_addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| InstrumentError::Connection(format!("{}: {}", target.host, e)))?
            .next()
            .ok_or_else(|| {
                InstrumentError::Connection(format!("{} did not resolve", target.host))
            })?;

        let stream = TcpStream::connect_timeout(&socket_addr, self.connect_timeout)
            .map_err(|e| InstrumentError::Connection(format!("{socket_addr}: {e}")))?;
        let io = |e: std::io::Error| InstrumentError::Connection(e.to_string());
        stream.set_nodelay(true).map_err(io)?;
        stream.set_read_timeout(Some(DEFAULT_TIMEOUT)).map_err(io)?;
        stream.set_write_timeout(Some(DEFAULT_TIMEOUT)).map_err(io)?;

        let writer = stream.try_clone().map_err(io)?;
        debug!(peer = %socket_addr, "TCP socket opened");

        Ok(Box::new(TcpIpHandle {
            peer: address.to_string(),
            reader: Some(BufReader::new(stream)),
            writer: Some(writer),
            timeout: DEFAULT_TIMEOUT,
        }))
    }

    /// Raw sockets cannot be discovered.
    fn search(&self) -> InstrumentResult<Vec<Address>> {
        Ok(Vec::new())
    }
}

/// Open TCP socket.
pub struct TcpIpHandle {
    peer: String,
    reader: Option<BufReader<TcpStream>>,
    writer: Option<TcpStream>,
    timeout: Duration,
}

impl TcpIpHandle {
    fn closed(&self) -> InstrumentError {
        InstrumentError::Closed(self.peer.clone())
    }
}

impl Handle for TcpIpHandle {
    fn write(&mut self, bytes: &[u8]) -> InstrumentResult<usize> {
        let timeout = self.timeout;
        let closed = self.closed();
        let writer = self.writer.as_mut().ok_or(closed)?;
        let mut written = 0;
        while written < bytes.len() {
            match writer.write(&bytes[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(InstrumentError::from_io(e, timeout)),
            }
        }
        Ok(written)
    }

    fn read(&mut self, buf: &mut [u8]) -> InstrumentResult<usize> {
        let timeout = self.timeout;
        let closed = self.closed();
        let reader = self.reader.as_mut().ok_or(closed)?;
        match reader.read(buf) {
            Ok(0) => Err(InstrumentError::Connection(format!(
                "{} closed the connection",
                self.peer
            ))),
            Ok(n) => Ok(n),
            Err(e) => Err(InstrumentError::from_io(e, timeout)),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> InstrumentResult<()> {
        let closed = self.closed();
        let reader = self.reader.as_ref().ok_or(closed)?;
        let io = |e: std::io::Error| InstrumentError::Connection(e.to_string());
        reader.get_ref().set_read_timeout(Some(timeout)).map_err(io)?;
        reader.get_ref().set_write_timeout(Some(timeout)).map_err(io)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear(&mut self) -> InstrumentResult<()> {
        let closed = self.closed();
        let reader = self.reader.as_mut().ok_or(closed)?;
        let io = |e: std::io::Error| InstrumentError::Connection(e.to_string());

        let buffered = reader.buffer().len();
        reader.consume(buffered);

        // Drain whatever already sits in the socket without waiting for more.
        reader.get_ref().set_nonblocking(true).map_err(io)?;
        let mut scratch = [0u8; 256];
        let drained = loop {
            match reader.get_mut().read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(io(e)),
            }
        };
        reader.get_ref().set_nonblocking(false).map_err(io)?;
        drained
    }

    fn close(&mut self) -> InstrumentResult<()> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| InstrumentError::AlreadyClosed(self.peer.clone()))?;
        self.writer = None;
        let result = reader.get_ref().shutdown(Shutdown::Both);
        debug!(peer = %self.peer, "TCP socket closed");
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(InstrumentError::Connection(e.to_string())),
        }
    }

    fn transport(&self) -> &str {
        "tcpip"
    }
}
