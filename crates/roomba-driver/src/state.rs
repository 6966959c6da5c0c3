//! The driver's view of the robot.
//!
//! [`RobotState`] is written only by the link actor.  Readers get cloned
//! snapshots through a [`tokio::sync::watch`] channel, so a state query never
//! waits on the link.

use chrono::{DateTime, NaiveDateTime, Utc};
use roomba_types::{
    CliffDetailPacket, ConnectionKind, NotificationPayload, PosePacket, PowerPacket, RobotModel,
    RoombaMode, SensorCategory, SensorsPacket, TelemetryPacket,
};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RobotState {
    pub mode: RoombaMode,
    pub maintain_mode: Option<RoombaMode>,
    pub model: RobotModel,
    pub connection: ConnectionKind,
    pub firmware_date: Option<NaiveDateTime>,
    pub sensors: Option<SensorsPacket>,
    pub pose: Option<PosePacket>,
    pub power: Option<PowerPacket>,
    pub cliff_detail: Option<CliffDetailPacket>,
    pub telemetry: Option<TelemetryPacket>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Set once a real mode has been observed.
    pub initialized: bool,
}

impl RobotState {
    pub fn new(model: RobotModel, connection: ConnectionKind) -> Self {
        Self {
            model,
            connection,
            ..Self::default()
        }
    }

    /// Record a mode change.  Returns `true` when the mode actually changed.
    pub fn set_mode(&mut self, mode: RoombaMode) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        match mode {
            RoombaMode::Uninitialized => self.initialized = false,
            RoombaMode::Shutdown => {}
            _ => self.initialized = true,
        }
        true
    }

    /// Replace the stored snapshot for the payload's category.
    pub fn store(&mut self, payload: &NotificationPayload) {
        match payload {
            NotificationPayload::BumpsCliffsAndWalls(p) => self.sensors = Some(p.clone()),
            NotificationPayload::Pose(p) => self.pose = Some(p.clone()),
            NotificationPayload::Power(p) => self.power = Some(p.clone()),
            NotificationPayload::CliffDetail(p) => self.cliff_detail = Some(p.clone()),
            NotificationPayload::Telemetry(p) => self.telemetry = Some(p.clone()),
            NotificationPayload::Mode {
                mode,
                maintain_mode,
            } => {
                self.set_mode(*mode);
                self.maintain_mode = *maintain_mode;
            }
        }
    }

    /// Raw bytes of the stored snapshot for a sensor category.
    pub fn snapshot_bytes(&self, category: SensorCategory) -> Option<&[u8]> {
        match category {
            SensorCategory::BumpsCliffsAndWalls => self.sensors.as_ref().map(|p| &p.raw[..]),
            SensorCategory::Pose => self.pose.as_ref().map(|p| &p.raw[..]),
            SensorCategory::Power => self.power.as_ref().map(|p| &p.raw[..]),
            SensorCategory::CliffDetail => self.cliff_detail.as_ref().map(|p| &p.raw[..]),
            SensorCategory::Telemetry => self.telemetry.as_ref().map(|p| &p.raw[..]),
            SensorCategory::Mode => None,
        }
    }

    /// Mode notification reflecting the current mode and maintain mode.
    pub fn mode_payload(&self) -> NotificationPayload {
        NotificationPayload::Mode {
            mode: self.mode,
            maintain_mode: self.maintain_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uninitialized() {
        let state = RobotState::new(RobotModel::Roomba, ConnectionKind::RoombaSerial);
        assert_eq!(state.mode, RoombaMode::Uninitialized);
        assert!(!state.initialized);
        assert_eq!(state.model, RobotModel::Roomba);
    }

    #[test]
    fn observing_a_mode_initializes() {
        let mut state = RobotState::default();
        assert!(state.set_mode(RoombaMode::Passive));
        assert!(state.initialized);
        assert!(!state.set_mode(RoombaMode::Passive));

        // Shutdown keeps the flag as it was.
        state.set_mode(RoombaMode::Shutdown);
        assert!(state.initialized);
        state.set_mode(RoombaMode::Uninitialized);
        assert!(!state.initialized);
    }

    #[test]
    fn store_replaces_the_snapshot() {
        let mut state = RobotState::default();
        assert!(state.snapshot_bytes(SensorCategory::Pose).is_none());
        let pose = PosePacket::from_bytes(&[0, 0, 0, 10, 0, 0], Utc::now()).unwrap();
        state.store(&NotificationPayload::Pose(pose));
        assert_eq!(
            state.snapshot_bytes(SensorCategory::Pose),
            Some(&[0u8, 0, 0, 10, 0, 0][..])
        );
    }

    #[test]
    fn mode_payload_mirrors_state() {
        let mut state = RobotState::default();
        state.store(&NotificationPayload::Mode {
            mode: RoombaMode::Safe,
            maintain_mode: Some(RoombaMode::Safe),
        });
        assert_eq!(state.mode, RoombaMode::Safe);
        assert_eq!(
            state.mode_payload(),
            NotificationPayload::Mode {
                mode: RoombaMode::Safe,
                maintain_mode: Some(RoombaMode::Safe)
            }
        );
    }

    #[test]
    fn serializes_for_display() {
        let mut state = RobotState::new(RobotModel::Create, ConnectionKind::CreateSerial);
        state.set_mode(RoombaMode::Passive);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["mode"], "passive");
        assert_eq!(json["initialized"], true);
        assert!(json["pose"].is_null());
    }
}
