//! Change notifications pushed to subscribers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mode::RoombaMode;
use crate::packet::{CliffDetailPacket, PosePacket, PowerPacket, SensorsPacket, TelemetryPacket};

/// The closed set of categories a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SensorCategory {
    BumpsCliffsAndWalls,
    Pose,
    Power,
    CliffDetail,
    Telemetry,
    /// Driver mode or maintain-mode changes.
    Mode,
}

impl SensorCategory {
    pub const ALL: [SensorCategory; 6] = [
        Self::BumpsCliffsAndWalls,
        Self::Pose,
        Self::Power,
        Self::CliffDetail,
        Self::Telemetry,
        Self::Mode,
    ];
}

impl std::str::FromStr for SensorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bumps" | "bumps_cliffs_and_walls" | "sensors" => Ok(Self::BumpsCliffsAndWalls),
            "pose" => Ok(Self::Pose),
            "power" => Ok(Self::Power),
            "cliff_detail" | "cliff" => Ok(Self::CliffDetail),
            "telemetry" => Ok(Self::Telemetry),
            "mode" => Ok(Self::Mode),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "snake_case")]
pub enum NotificationPayload {
    BumpsCliffsAndWalls(SensorsPacket),
    Pose(PosePacket),
    Power(PowerPacket),
    CliffDetail(CliffDetailPacket),
    Telemetry(TelemetryPacket),
    Mode {
        mode: RoombaMode,
        maintain_mode: Option<RoombaMode>,
    },
}

impl NotificationPayload {
    pub fn category(&self) -> SensorCategory {
        match self {
            Self::BumpsCliffsAndWalls(_) => SensorCategory::BumpsCliffsAndWalls,
            Self::Pose(_) => SensorCategory::Pose,
            Self::Power(_) => SensorCategory::Power,
            Self::CliffDetail(_) => SensorCategory::CliffDetail,
            Self::Telemetry(_) => SensorCategory::Telemetry,
            Self::Mode { .. } => SensorCategory::Mode,
        }
    }
}

/// A single delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: NotificationPayload,
}

impl Notification {
    pub fn new(payload: NotificationPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn category(&self) -> SensorCategory {
        self.payload.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_notification_category() {
        let n = Notification::new(NotificationPayload::Mode {
            mode: RoombaMode::Safe,
            maintain_mode: None,
        });
        assert_eq!(n.category(), SensorCategory::Mode);
    }

    #[test]
    fn categories_parse_from_cli_names() {
        assert_eq!("pose".parse::<SensorCategory>(), Ok(SensorCategory::Pose));
        assert_eq!("bumps".parse::<SensorCategory>(), Ok(SensorCategory::BumpsCliffsAndWalls));
        assert!("lidar".parse::<SensorCategory>().is_err());
    }

    #[test]
    fn notification_roundtrip() {
        let n = Notification::new(NotificationPayload::Mode {
            mode: RoombaMode::Full,
            maintain_mode: Some(RoombaMode::Full),
        });
        let json = serde_json::to_string(&n).unwrap();
        let back: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(n, back);
    }
}
