//! Operating modes, robot models and connection kinds.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating mode of the Open Interface, as tracked by the driver.
///
/// `Off`, `Passive`, `Safe` and `Full` mirror the robot's own OI modes.
/// `Uninitialized` is the state before anything has been observed and
/// `Shutdown` is entered once the link has been closed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RoombaMode {
    Off,
    #[default]
    Uninitialized,
    Passive,
    Safe,
    Full,
    Shutdown,
}

impl RoombaMode {
    /// Map the OI mode byte reported in telemetry (0..=3) to a mode.
    pub fn from_oi_mode(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Off),
            1 => Some(Self::Passive),
            2 => Some(Self::Safe),
            3 => Some(Self::Full),
            _ => None,
        }
    }

    /// `true` for the modes that accept actuator commands.
    pub fn accepts_motion(self) -> bool {
        matches!(self, Self::Safe | Self::Full)
    }

    /// Only these modes can be held by the maintain-mode supervisor.
    pub fn can_be_maintained(self) -> bool {
        matches!(self, Self::Passive | Self::Safe | Self::Full)
    }
}

impl fmt::Display for RoombaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Uninitialized => "uninitialized",
            Self::Passive => "passive",
            Self::Safe => "safe",
            Self::Full => "full",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for RoombaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "passive" => Ok(Self::Passive),
            "safe" => Ok(Self::Safe),
            "full" => Ok(Self::Full),
            "uninitialized" => Ok(Self::Uninitialized),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Which robot is on the other end of the link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RobotModel {
    /// Roomba vacuum with the SCI/OI serial port.
    Roomba,
    /// iRobot Create.
    #[default]
    Create,
}

impl RobotModel {
    pub fn is_create(self) -> bool {
        matches!(self, Self::Create)
    }
}

impl fmt::Display for RobotModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Roomba => f.write_str("roomba"),
            Self::Create => f.write_str("create"),
        }
    }
}

impl std::str::FromStr for RobotModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "roomba" => Ok(Self::Roomba),
            "create" => Ok(Self::Create),
            other => Err(format!("unknown robot model '{other}'")),
        }
    }
}

/// Physical connection between the host and the robot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Roomba mini-DIN serial cable.
    RoombaSerial,
    /// Create DB-25 / mini-DIN serial cable.
    #[default]
    CreateSerial,
    /// RooTooth Bluetooth dongle.
    RooTooth,
    /// Create Bluetooth Adapter Module (BAM).
    BluetoothAdapter,
}

impl ConnectionKind {
    /// Wireless links cannot sustain the fastest polling rates.
    pub fn is_wireless(self) -> bool {
        matches!(self, Self::RooTooth | Self::BluetoothAdapter)
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoombaSerial => "roomba_serial",
            Self::CreateSerial => "create_serial",
            Self::RooTooth => "roo_tooth",
            Self::BluetoothAdapter => "bluetooth_adapter",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oi_mode_codes_map_to_modes() {
        assert_eq!(RoombaMode::from_oi_mode(0), Some(RoombaMode::Off));
        assert_eq!(RoombaMode::from_oi_mode(1), Some(RoombaMode::Passive));
        assert_eq!(RoombaMode::from_oi_mode(2), Some(RoombaMode::Safe));
        assert_eq!(RoombaMode::from_oi_mode(3), Some(RoombaMode::Full));
        assert_eq!(RoombaMode::from_oi_mode(4), None);
    }

    #[test]
    fn default_mode_is_uninitialized() {
        assert_eq!(RoombaMode::default(), RoombaMode::Uninitialized);
    }

    #[test]
    fn only_safe_and_full_accept_motion() {
        assert!(RoombaMode::Safe.accepts_motion());
        assert!(RoombaMode::Full.accepts_motion());
        assert!(!RoombaMode::Passive.accepts_motion());
        assert!(!RoombaMode::Off.accepts_motion());
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("FULL".parse::<RoombaMode>(), Ok(RoombaMode::Full));
        assert!("turbo".parse::<RoombaMode>().is_err());
    }

    #[test]
    fn wireless_connections() {
        assert!(ConnectionKind::RooTooth.is_wireless());
        assert!(ConnectionKind::BluetoothAdapter.is_wireless());
        assert!(!ConnectionKind::CreateSerial.is_wireless());
        assert!(!ConnectionKind::RoombaSerial.is_wireless());
    }

    #[test]
    fn connection_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionKind::RooTooth).unwrap();
        assert_eq!(json, "\"roo_tooth\"");
    }
}
