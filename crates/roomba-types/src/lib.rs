//! `roomba-types` – shared vocabulary for the Roomba / Create driver.
//!
//! | Module | Contents |
//! |---|---|
//! | [`mode`] | [`RoombaMode`], [`RobotModel`], [`ConnectionKind`] |
//! | [`command`] | The [`RoombaCommand`] set, opcodes and sensor packet ids |
//! | [`packet`] | Typed response packets and their validity checks |
//! | [`notification`] | [`SensorCategory`] and subscriber [`Notification`]s |
//! | [`error`] | [`RoombaError`] |

pub mod command;
pub mod error;
pub mod mode;
pub mod notification;
pub mod packet;

pub use command::{
    CommandCode, DRIVE_STRAIGHT_RADIUS, Note, RoombaCommand, SensorPacket, drive_direct_as_drive,
};
pub use error::RoombaError;
pub use mode::{ConnectionKind, RobotModel, RoombaMode};
pub use notification::{Notification, NotificationPayload, SensorCategory};
pub use packet::{
    AllSensorsPacket, CliffDetailPacket, FirmwareDatePacket, Packet, PosePacket, PowerPacket,
    Response, SensorsPacket, TelemetryPacket,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_command() {
        let e = RoombaError::Timeout {
            command: CommandCode::Sensors,
        };
        assert!(e.to_string().contains("Sensors(142)"));

        let e = RoombaError::Precondition {
            required: RoombaMode::Safe,
            details: "Timeout".into(),
        };
        assert!(e.to_string().contains("safe"));
    }

    #[test]
    fn error_roundtrip() {
        let e = RoombaError::Framing {
            command: CommandCode::FirmwareDate,
            details: "bad checksum".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: RoombaError = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
    }
}
