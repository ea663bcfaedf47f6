//! Capability traits for composed instrument drivers.
//!
//! A device driver exposes each physical quantity (a voltage output, a
//! thermocouple input, a heater range) as a value implementing some subset of
//! [`Readable`], [`Writable`] and [`FilterBacked`]. [`CommandChannel`] is the
//! generic implementation for SCPI-style instruments: a read command, an
//! optional `{value}` set template and an optional `{count}` template that
//! programs hardware averaging.

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{render_template, Connection};
use crate::error::{InstrumentError, InstrumentResult};
use crate::filter::{AMode, FilterChannel};

/// A quantity that can be measured.
pub trait Readable: Send + Sync {
    /// Take one measurement.
    fn read_value(&self) -> InstrumentResult<f64>;
}

/// A quantity that can be commanded.
pub trait Writable: Send + Sync {
    /// Set the quantity to `value`.
    fn write_value(&self, value: f64) -> InstrumentResult<()>;
}

/// A [`Readable`] whose value passes through a read filter.
pub trait FilterBacked: Readable {
    /// Channel the reads go through.
    fn filter(&self) -> &FilterChannel;

    /// Switch averaging mode and window together.
    fn set_averaging(&self, mode: AMode, count: usize) -> InstrumentResult<()> {
        self.filter().configure(mode, count)
    }

    /// Current mode and window.
    fn averaging(&self) -> (AMode, usize) {
        let filter = self.filter();
        (filter.mode(), filter.count())
    }

    /// Drop accumulated samples, e.g. after changing a range.
    fn clear_filter(&self) {
        self.filter().clear();
    }
}

/// Numeric channel driven by command strings on a shared connection.
pub struct CommandChannel {
    name: String,
    connection: Arc<Connection>,
    set_template: Option<String>,
    filter: FilterChannel,
}

impl CommandChannel {
    /// Read-only channel sampled with `read_command`, unfiltered.
    pub fn new(
        name: &str,
        connection: Arc<Connection>,
        read_command: &str,
    ) -> InstrumentResult<Self> {
        Self::build(name, connection, read_command, None)
    }

    /// Channel whose averaging count is also sent to the instrument through
    /// `setup_template`, e.g. `"SENS:AVER:COUN {count}"`.
    pub fn with_hardware_averaging(
        name: &str,
        connection: Arc<Connection>,
        read_command: &str,
        setup_template: &str,
    ) -> InstrumentResult<Self> {
        Self::build(
            name,
            connection,
            read_command,
            Some(setup_template.to_string()),
        )
    }

    fn build(
        name: &str,
        connection: Arc<Connection>,
        read_command: &str,
        setup_template: Option<String>,
    ) -> InstrumentResult<Self> {
        let reader = Arc::clone(&connection);
        let command = read_command.to_string();
        let source = move || reader.query_f64(&command);

        let writer = Arc::clone(&connection);
        let setup = move |count: usize| -> InstrumentResult<()> {
            match &setup_template {
                Some(template) => {
                    let vars = HashMap::from([("count".to_string(), count.to_string())]);
                    writer.write_template(template, &vars)
                }
                None => Ok(()),
            }
        };

        Ok(Self {
            name: name.to_string(),
            connection,
            set_template: None,
            filter: FilterChannel::new(source, setup)?,
        })
    }

    /// Make the channel writable with a `{value}` template, e.g. `"SOUR:VOLT {value}"`.
    pub fn with_setter(mut self, template: &str) -> Self {
        self.set_template = Some(template.to_string());
        self
    }

    /// Channel name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection the channel talks through.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Readable for CommandChannel {
    fn read_value(&self) -> InstrumentResult<f64> {
        self.filter.get_value()
    }
}

impl Writable for CommandChannel {
    fn write_value(&self, value: f64) -> InstrumentResult<()> {
        let template = self.set_template.as_deref().ok_or_else(|| {
            InstrumentError::unsupported(&self.name, "writing a value")
        })?;
        let vars = HashMap::from([("value".to_string(), value.to_string())]);
        self.connection
            .write(&render_template(template, &vars)?)
    }
}

impl FilterBacked for CommandChannel {
    fn filter(&self) -> &FilterChannel {
        &self.filter
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("name", &self.name)
            .field("address", &self.connection.address().to_string())
            .field("filter", &self.filter)
            .finish()
    }
}
