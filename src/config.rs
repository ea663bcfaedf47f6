//! I/O configuration using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults ([`IoSettings::default`])
//! 2. A TOML file
//! 3. Environment variables prefixed with `DAQ_IO_` (nested keys split on `__`)
//!
//! ```text
//! DAQ_IO_CONNECTION__READ_TIMEOUT=5s
//! DAQ_IO_CONNECTION__RETRY__RETRIES=2
//! DAQ_IO_MODBUS__VERIFY_CRC=false
//! ```
//!
//! # Example
//!
//! ```toml
//! [connection]
//! read_timeout = "2s"
//! read_terminator = "\r\n"
//! min_write_interval = "50ms"
//!
//! [connection.retry]
//! retries = 1
//! backoff = "0ms"
//!
//! [modbus]
//! transaction_timeout = "2s"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::driver::SerialParams;
use crate::error_recovery::RetryPolicy;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider failed or a value had the wrong type
    #[error("Configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),
    /// Values parsed but are out of range
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Longest read terminator a connection can watch for.
pub const MAX_TERMINATOR_LEN: usize = 8;

/// Top-level I/O settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSettings {
    /// Per-connection framing, timing and retry settings
    pub connection: ConnectionSettings,
    /// Modbus RTU bus settings
    pub modbus: ModbusSettings,
    /// Identification handshake performed on instrument open
    pub identity: IdentitySettings,
}

/// Settings applied to every [`Connection`](crate::connection::Connection) on open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Upper bound on one blocking read
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Maximum bytes returned by one read
    pub read_buffer_size: usize,
    /// Appended to every written command
    pub write_terminator: String,
    /// Sequence that ends a response on transports without native framing
    pub read_terminator: String,
    /// Minimum spacing between successive writes (zero disables pacing)
    #[serde(with = "humantime_serde")]
    pub min_write_interval: Duration,
    /// Short timeout used while draining stale input
    #[serde(with = "humantime_serde")]
    pub clear_timeout: Duration,
    /// Assert EOI with the last byte of each write (GPIB only)
    pub send_eoi: bool,
    /// Line parameters for serial transports
    pub serial: SerialParams,
    /// Retries for malformed responses
    pub retry: RetryPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(2000),
            read_buffer_size: 1024,
            write_terminator: "\n".to_string(),
            read_terminator: "\n".to_string(),
            min_write_interval: Duration::ZERO,
            clear_timeout: Duration::from_millis(250),
            send_eoi: true,
            serial: SerialParams::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Modbus RTU bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusSettings {
    /// Deadline for one request/response transaction
    #[serde(with = "humantime_serde")]
    pub transaction_timeout: Duration,
    /// Read timeout of the background reader; also the silent interval that ends a partial frame
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Check the CRC of every received frame
    pub verify_crc: bool,
    /// Line parameters of the RTU bus
    pub serial: SerialParams,
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(50),
            verify_crc: true,
            serial: SerialParams::default(),
        }
    }
}

/// Identification handshake settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Query sent right after open; leave empty for devices without one
    pub command: String,
    /// Garbled or empty replies tolerated before the device is declared absent
    pub retries: u32,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            command: "*IDN?".to_string(),
            retries: 1,
        }
    }
}

impl IoSettings {
    /// Load settings from a TOML file and `DAQ_IO_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a provider fails to parse or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(IoSettings::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("DAQ_IO_").split("__")),
        )
    }

    /// Parse settings from TOML text, without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(
            Figment::from(Serialized::defaults(IoSettings::default())).merge(Toml::string(toml)),
        )
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError::Validation` with a descriptive message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;

        if self.modbus.transaction_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "modbus.transaction_timeout must be greater than zero".to_string(),
            ));
        }
        if self.modbus.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "modbus.poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConnectionSettings {
    /// Validate framing and timing values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connection.read_timeout must be greater than zero".to_string(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "connection.read_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.read_terminator.len() > MAX_TERMINATOR_LEN {
            return Err(ConfigError::Validation(format!(
                "connection.read_terminator is {} bytes; at most {} are supported",
                self.read_terminator.len(),
                MAX_TERMINATOR_LEN
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Parity;

    #[test]
    fn test_defaults_validate() {
        let settings = IoSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.connection.read_timeout, Duration::from_secs(2));
        assert_eq!(settings.connection.read_buffer_size, 1024);
        assert_eq!(settings.connection.retry.retries, 1);
        assert_eq!(settings.modbus.transaction_timeout, Duration::from_secs(2));
        assert_eq!(settings.identity.command, "*IDN?");
    }

    #[test]
    fn test_toml_overrides() {
        let settings = IoSettings::from_toml_str(
            r#"
            [connection]
            read_timeout = "500ms"
            read_terminator = "\r\n"
            min_write_interval = "50ms"

            [connection.retry]
            retries = 3
            backoff = "10ms"

            [connection.serial]
            baud_rate = 19200
            parity = "even"

            [modbus]
            verify_crc = false
            "#,
        )
        .unwrap();

        assert_eq!(settings.connection.read_timeout, Duration::from_millis(500));
        assert_eq!(settings.connection.read_terminator, "\r\n");
        assert_eq!(settings.connection.min_write_interval, Duration::from_millis(50));
        assert_eq!(settings.connection.retry.retries, 3);
        assert_eq!(settings.connection.retry.backoff, Duration::from_millis(10));
        assert_eq!(settings.connection.serial.baud_rate, 19200);
        assert_eq!(settings.connection.serial.parity, Parity::Even);
        assert!(!settings.modbus.verify_crc);
        // Untouched sections keep their defaults
        assert_eq!(settings.connection.write_terminator, "\n");
    }

    #[test]
    fn test_rejects_long_terminator() {
        let err = IoSettings::from_toml_str(
            r#"
            [connection]
            read_terminator = "123456789"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_zero_buffer() {
        let err = IoSettings::from_toml_str("[connection]\nread_buffer_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("read_buffer_size"));
    }

    #[test]
    fn test_empty_identity_command_is_accepted() {
        let settings = IoSettings::from_toml_str("[identity]\ncommand = \"\"\n").unwrap();
        assert!(settings.identity.command.is_empty());
        assert_eq!(settings.identity.retries, 1);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "io.toml",
                r#"
                [connection]
                read_buffer_size = 512
                "#,
            )?;
            jail.set_env("DAQ_IO_CONNECTION__READ_BUFFER_SIZE", "2048");
            jail.set_env("DAQ_IO_IDENTITY__COMMAND", "ID?");

            let settings = IoSettings::load_from("io.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.connection.read_buffer_size, 2048);
            assert_eq!(settings.identity.command, "ID?");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        figment::Jail::expect_with(|_jail| {
            let settings = IoSettings::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings, IoSettings::default());
            Ok(())
        });
    }
}
