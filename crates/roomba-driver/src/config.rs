//! Connection parameters, supplied as an immutable snapshot at connect time.

use std::time::Duration;

use roomba_types::{ConnectionKind, RobotModel, RoombaError, RoombaMode};
use serde::{Deserialize, Serialize};

/// Default poll period for the full-sensor query.
pub const DEFAULT_POLLING_INTERVAL_MS: i64 = 200;

/// Fastest poll period a Bluetooth link can sustain.
pub const MIN_WIRELESS_POLLING_INTERVAL_MS: i64 = 50;

pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Serial device path, or `host:port` for a TCP bridge.
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default)]
    pub model: RobotModel,

    #[serde(default)]
    pub connection: ConnectionKind,

    /// Milliseconds between full-sensor queries.  Negative disables polling,
    /// zero selects the default.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: i64,

    /// Mode the driver keeps the robot in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintain_mode: Option<RoombaMode>,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Stop the wheels whenever the link has to be resynchronized.
    #[serde(default)]
    pub stop_on_resync: bool,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    57_600
}
fn default_polling_interval_ms() -> i64 {
    DEFAULT_POLLING_INTERVAL_MS
}
fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}
fn default_buffer_capacity() -> usize {
    roomba_link::DEFAULT_CAPACITY
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            model: RobotModel::default(),
            connection: ConnectionKind::default(),
            polling_interval_ms: default_polling_interval_ms(),
            maintain_mode: None,
            command_timeout_ms: default_command_timeout_ms(),
            stop_on_resync: false,
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl DriverConfig {
    /// Reject combinations the driver cannot run with.
    ///
    /// # Errors
    ///
    /// * [`RoombaError::UnsupportedConnection`] for a Roomba behind the
    ///   Create Bluetooth Adapter Module.
    /// * [`RoombaError::InvalidCommand`] for a zero-sized buffer or a
    ///   maintain mode other than passive, safe or full.
    pub fn validate(&self) -> Result<(), RoombaError> {
        if self.model == RobotModel::Roomba && self.connection == ConnectionKind::BluetoothAdapter {
            return Err(RoombaError::UnsupportedConnection(format!(
                "the {} connection is not available on a {}",
                self.connection, self.model
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(RoombaError::InvalidCommand(
                "buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(mode) = self.maintain_mode
            && !mode.can_be_maintained()
        {
            return Err(RoombaError::InvalidCommand(format!(
                "{mode} mode cannot be maintained"
            )));
        }
        Ok(())
    }

    /// Effective poll period, or `None` when sensor polling is disabled.
    pub fn polling_interval(&self) -> Option<Duration> {
        if self.polling_interval_ms < 0 {
            return None;
        }
        let mut ms = if self.polling_interval_ms == 0 {
            DEFAULT_POLLING_INTERVAL_MS
        } else {
            self.polling_interval_ms
        };
        if self.connection.is_wireless() {
            ms = ms.max(MIN_WIRELESS_POLLING_INTERVAL_MS);
        }
        Some(Duration::from_millis(ms as u64))
    }

    /// Period of the supervision timer; it keeps running when polling is off.
    pub fn tick_interval(&self) -> Duration {
        self.polling_interval()
            .unwrap_or(Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS as u64))
    }

    pub fn command_timeout(&self) -> Duration {
        if self.command_timeout_ms == 0 {
            Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS)
        } else {
            Duration::from_millis(self.command_timeout_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.baud_rate, 57_600);
        assert_eq!(cfg.model, RobotModel::Create);
        assert_eq!(cfg.polling_interval(), Some(Duration::from_millis(200)));
        assert_eq!(cfg.command_timeout(), Duration::from_millis(1000));
        assert_eq!(cfg.buffer_capacity, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg: DriverConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, DriverConfig::default());
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let cfg: DriverConfig = toml::from_str(
            r#"
            model = "roomba"
            connection = "roo_tooth"
            maintain_mode = "safe"
            polling_interval_ms = 20
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model, RobotModel::Roomba);
        assert_eq!(cfg.maintain_mode, Some(RoombaMode::Safe));
        // Wireless links are clamped.
        assert_eq!(cfg.polling_interval(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn negative_interval_disables_polling_but_not_the_timer() {
        let cfg = DriverConfig {
            polling_interval_ms: -1,
            ..DriverConfig::default()
        };
        assert_eq!(cfg.polling_interval(), None);
        assert_eq!(cfg.tick_interval(), Duration::from_millis(200));
    }

    #[test]
    fn wired_interval_is_not_clamped() {
        let cfg = DriverConfig {
            polling_interval_ms: 20,
            ..DriverConfig::default()
        };
        assert_eq!(cfg.polling_interval(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn roomba_over_bluetooth_adapter_is_unsupported() {
        let cfg = DriverConfig {
            model: RobotModel::Roomba,
            connection: ConnectionKind::BluetoothAdapter,
            ..DriverConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(RoombaError::UnsupportedConnection(_))
        ));
    }

    #[test]
    fn zero_buffer_is_invalid() {
        let cfg = DriverConfig {
            buffer_capacity: 0,
            ..DriverConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn off_cannot_be_maintained() {
        let cfg = DriverConfig {
            maintain_mode: Some(RoombaMode::Off),
            ..DriverConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
