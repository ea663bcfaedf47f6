//! Opened, identified instruments
//!
//! [`Instrument`] is the unit a device driver builds on: it resolves an
//! address through a [`DriverRegistry`], applies the connection settings and
//! runs the identification handshake. Device drivers then compose
//! [`capabilities`] (commanded values backed by read filters) on top of the
//! shared [`Connection`] instead of inheriting from a base driver.
//!
//! Closing an instrument closes its connection, which closes the driver
//! handle. The instrument is unusable afterwards even if a step in that chain
//! reported an error.

pub mod capabilities;

pub use capabilities::{CommandChannel, FilterBacked, Readable, Writable};

use std::sync::Arc;
use tracing::{info, warn};

use crate::address::Address;
use crate::config::{IdentitySettings, IoSettings};
use crate::connection::Connection;
use crate::driver::DriverRegistry;
use crate::error::{InstrumentError, InstrumentResult};

/// A connected instrument whose identity has been confirmed.
#[derive(Debug)]
pub struct Instrument {
    connection: Arc<Connection>,
    identity: String,
}

impl Instrument {
    /// Open `address` with the first suitable driver and identify the device.
    ///
    /// # Errors
    ///
    /// - [`InstrumentError::NoDriver`] if no registered driver could open it
    /// - [`InstrumentError::DeviceAbsent`] if the identity query stayed
    ///   unanswered or garbled after the configured retries
    pub fn open(
        address: &Address,
        registry: &DriverRegistry,
        settings: &IoSettings,
    ) -> InstrumentResult<Self> {
        let connection = Connection::open_with(registry, address, &settings.connection)?;
        Self::from_connection(connection, &settings.identity)
    }

    /// Like [`Instrument::open`], but reject devices whose identity string
    /// fails `accepts`.
    pub fn open_expecting<P>(
        address: &Address,
        registry: &DriverRegistry,
        settings: &IoSettings,
        accepts: P,
    ) -> InstrumentResult<Self>
    where
        P: Fn(&str) -> bool,
    {
        let instrument = Self::open(address, registry, settings)?;
        if accepts(&instrument.identity) {
            return Ok(instrument);
        }
        let identity = instrument.identity.clone();
        if let Err(e) = instrument.close() {
            warn!(address = %address, error = %e, "Failed to close incompatible device");
        }
        Err(InstrumentError::IncompatibleDevice {
            address: address.to_string(),
            identity,
        })
    }

    /// Identify the device on an already open connection.
    ///
    /// The connection is closed if identification fails.
    pub fn from_connection(
        connection: Connection,
        identity: &IdentitySettings,
    ) -> InstrumentResult<Self> {
        match identify(&connection, identity) {
            Ok(id) => {
                info!(address = %connection.address(), identity = %id, "Instrument identified");
                Ok(Self {
                    connection: Arc::new(connection),
                    identity: id,
                })
            }
            Err(e) => {
                if let Err(close_err) = connection.close() {
                    warn!(address = %connection.address(), error = %close_err, "Failed to close unidentified device");
                }
                Err(e)
            }
        }
    }

    /// Address the instrument was opened on.
    pub fn address(&self) -> &Address {
        self.connection.address()
    }

    /// Identification string reported on open, trimmed.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Shared connection, for commands the capabilities do not cover.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// A filtered numeric channel read with `read_command`.
    pub fn channel(&self, name: &str, read_command: &str) -> InstrumentResult<CommandChannel> {
        CommandChannel::new(name, Arc::clone(&self.connection), read_command)
    }

    /// Close the underlying connection.
    pub fn close(&self) -> InstrumentResult<()> {
        self.connection.close()
    }
}

/// Run the identity query, tolerating `settings.retries` empty, garbled or
/// timed-out replies. A blank command skips the handshake.
pub fn identify(connection: &Connection, settings: &IdentitySettings) -> InstrumentResult<String> {
    if settings.command.trim().is_empty() {
        return Ok(String::new());
    }
    let attempts = settings.retries.saturating_add(1);
    for attempt in 1..=attempts {
        let problem = match connection.query(&settings.command) {
            Ok(reply) if is_intelligible(&reply) => return Ok(reply.trim().to_string()),
            Ok(reply) => format!("unintelligible reply {reply:?}"),
            Err(e) if e.is_timeout() => e.to_string(),
            Err(e) => return Err(e),
        };
        warn!(
            address = %connection.address(),
            attempt,
            attempts,
            problem = %problem,
            "Identity query failed"
        );
        if attempt < attempts {
            connection.clear()?;
        }
    }
    Err(InstrumentError::DeviceAbsent(connection.address().to_string()))
}

fn is_intelligible(reply: &str) -> bool {
    let trimmed = reply.trim();
    !trimmed.is_empty()
        && !trimmed
            .chars()
            .any(|c| c == char::REPLACEMENT_CHARACTER || (c.is_control() && c != '\t'))
}
