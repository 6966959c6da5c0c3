//! Per-command response decoding with change detection.
//!
//! [`PacketDecoder::decode`] looks at the bytes at the head of the receive
//! buffer and classifies them against the command that is waiting:
//!
//! | Outcome | Meaning |
//! |---|---|
//! | [`DecodeOutcome::Incomplete`] | not enough bytes yet, try again later |
//! | [`DecodeOutcome::Invalid`] | enough bytes, but they fail the structural checks |
//! | [`DecodeOutcome::Decoded`] | a valid packet, with the groups that changed |
//!
//! A group is reported as changed when its raw bytes differ from the
//! snapshot held in [`RobotState`]; identical spans are not republished.

use chrono::{DateTime, NaiveDateTime, Utc};
use roomba_types::packet::find_firmware_packet;
use roomba_types::{
    AllSensorsPacket, CliffDetailPacket, FirmwareDatePacket, NotificationPayload, Packet,
    PosePacket, PowerPacket, RobotModel, RoombaCommand, RoombaMode, SensorPacket, SensorsPacket,
    TelemetryPacket,
};

use crate::mode::{derived_mode, observed_mode};
use crate::state::RobotState;

/// Bytes searched for a firmware-date packet before the span is declared
/// garbage.
pub const FIRMWARE_SEARCH_WINDOW: usize = 3 * FirmwareDatePacket::LEN;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Incomplete,
    Invalid { details: String },
    Decoded(Decoded),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub packet: Packet,
    /// Bytes to drop from the head of the buffer.
    pub consumed: usize,
    /// Mode implied by this response when it differs from the tracked mode.
    pub mode: Option<RoombaMode>,
    /// Groups whose bytes differ from the stored snapshot.
    pub changed: Vec<NotificationPayload>,
    pub firmware_date: Option<NaiveDateTime>,
}

impl Decoded {
    fn new(packet: Packet, consumed: usize) -> Self {
        Self {
            packet,
            consumed,
            mode: None,
            changed: Vec::new(),
            firmware_date: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PacketDecoder {
    model: RobotModel,
}

impl PacketDecoder {
    pub fn new(model: RobotModel) -> Self {
        Self { model }
    }

    /// Mode the robot enters once `cmd` has been written in `prior`.
    pub fn derived_mode(&self, cmd: &RoombaCommand, prior: RoombaMode) -> RoombaMode {
        derived_mode(cmd.code(), prior, self.model)
    }

    /// Decode the response to `cmd` from the head of `bytes`.
    pub fn decode(
        &self,
        cmd: &RoombaCommand,
        bytes: &[u8],
        state: &RobotState,
        timestamp: DateTime<Utc>,
    ) -> DecodeOutcome {
        let expected = cmd.expected_response_bytes();
        if expected == 0 {
            let mut decoded = Decoded::new(Packet::CommandReceived { code: cmd.code() }, 0);
            let mode = self.derived_mode(cmd, state.mode);
            decoded.mode = (mode != state.mode).then_some(mode);
            return DecodeOutcome::Decoded(decoded);
        }

        let outcome = match cmd {
            RoombaCommand::FirmwareDate => decode_firmware(bytes, timestamp),
            RoombaCommand::Sensors { packet } => {
                if bytes.len() < expected {
                    return DecodeOutcome::Incomplete;
                }
                decode_sensors(*packet, &bytes[..expected], state, timestamp)
            }
            other => DecodeOutcome::Invalid {
                details: format!("{} has no response decoder", other.code()),
            },
        };

        match outcome {
            DecodeOutcome::Decoded(mut decoded) => {
                decoded.mode = observed_mode(self.model, state.mode, &decoded.packet);
                DecodeOutcome::Decoded(decoded)
            }
            other => other,
        }
    }
}

fn decode_firmware(bytes: &[u8], timestamp: DateTime<Utc>) -> DecodeOutcome {
    let Some(ix) = find_firmware_packet(bytes) else {
        if bytes.len() >= FIRMWARE_SEARCH_WINDOW {
            return DecodeOutcome::Invalid {
                details: format!("no firmware date in {}", hex(bytes)),
            };
        }
        return DecodeOutcome::Incomplete;
    };
    let Some(packet) = FirmwareDatePacket::from_bytes(&bytes[ix..], timestamp) else {
        return DecodeOutcome::Incomplete;
    };
    let mut decoded = Decoded::new(Packet::FirmwareDate(packet.clone()), ix + FirmwareDatePacket::LEN);
    decoded.firmware_date = packet.firmware_date();
    DecodeOutcome::Decoded(decoded)
}

fn decode_sensors(
    query: SensorPacket,
    bytes: &[u8],
    state: &RobotState,
    timestamp: DateTime<Utc>,
) -> DecodeOutcome {
    let invalid = || DecodeOutcome::Invalid {
        details: format!("{query:?} response failed validation: {}", hex(bytes)),
    };

    let mut changed = Vec::new();
    let packet = match query {
        SensorPacket::BumpsCliffsAndWalls => {
            let Some(p) = SensorsPacket::from_bytes(bytes, timestamp).filter(SensorsPacket::is_valid)
            else {
                return invalid();
            };
            changed_sensors(&p, state, &mut changed);
            Packet::Sensors(p)
        }
        SensorPacket::Pose => {
            let Some(mut p) = PosePacket::from_bytes(bytes, timestamp).filter(PosePacket::is_valid)
            else {
                return invalid();
            };
            p.accumulate(state.pose.as_ref());
            changed_pose(&p, state, &mut changed);
            Packet::Pose(p)
        }
        SensorPacket::Power => {
            let Some(p) = PowerPacket::from_bytes(bytes, timestamp).filter(PowerPacket::is_valid)
            else {
                return invalid();
            };
            changed_power(&p, state, &mut changed);
            Packet::Power(p)
        }
        SensorPacket::CliffDetail => {
            let Some(p) =
                CliffDetailPacket::from_bytes(bytes, timestamp).filter(CliffDetailPacket::is_valid)
            else {
                return invalid();
            };
            changed_cliff(&p, state, &mut changed);
            Packet::CliffDetail(p)
        }
        SensorPacket::Telemetry => {
            let Some(p) =
                TelemetryPacket::from_bytes(bytes, timestamp).filter(TelemetryPacket::is_valid)
            else {
                return invalid();
            };
            changed_telemetry(&p, state, &mut changed);
            Packet::Telemetry(p)
        }
        SensorPacket::AllRoomba | SensorPacket::AllCreate => {
            let Some(mut all) =
                AllSensorsPacket::from_bytes(bytes, timestamp).filter(AllSensorsPacket::is_valid)
            else {
                return invalid();
            };
            if let Some(pose) = all.pose.as_mut() {
                pose.accumulate(state.pose.as_ref());
            }
            if let Some(p) = &all.sensors {
                changed_sensors(p, state, &mut changed);
            }
            if let Some(p) = &all.pose {
                changed_pose(p, state, &mut changed);
            }
            if let Some(p) = &all.power {
                changed_power(p, state, &mut changed);
            }
            if let Some(p) = &all.cliff_detail {
                changed_cliff(p, state, &mut changed);
            }
            if let Some(p) = &all.telemetry {
                changed_telemetry(p, state, &mut changed);
            }
            Packet::All(all)
        }
    };

    let mut decoded = Decoded::new(packet, bytes.len());
    decoded.changed = changed;
    DecodeOutcome::Decoded(decoded)
}

// ── Change detection ────────────────────────────────────────────────────────

fn differs(new: &[u8], old: Option<&[u8]>) -> bool {
    old != Some(new)
}

fn changed_sensors(p: &SensorsPacket, state: &RobotState, out: &mut Vec<NotificationPayload>) {
    if differs(&p.raw, state.sensors.as_ref().map(|s| &s.raw[..])) {
        out.push(NotificationPayload::BumpsCliffsAndWalls(p.clone()));
    }
}

fn changed_pose(p: &PosePacket, state: &RobotState, out: &mut Vec<NotificationPayload>) {
    if differs(&p.raw, state.pose.as_ref().map(|s| &s.raw[..])) {
        out.push(NotificationPayload::Pose(p.clone()));
    }
}

fn changed_power(p: &PowerPacket, state: &RobotState, out: &mut Vec<NotificationPayload>) {
    if differs(&p.raw, state.power.as_ref().map(|s| &s.raw[..])) {
        out.push(NotificationPayload::Power(p.clone()));
    }
}

fn changed_cliff(p: &CliffDetailPacket, state: &RobotState, out: &mut Vec<NotificationPayload>) {
    if differs(&p.raw, state.cliff_detail.as_ref().map(|s| &s.raw[..])) {
        out.push(NotificationPayload::CliffDetail(p.clone()));
    }
}

fn changed_telemetry(p: &TelemetryPacket, state: &RobotState, out: &mut Vec<NotificationPayload>) {
    if differs(&p.raw, state.telemetry.as_ref().map(|s| &s.raw[..])) {
        out.push(NotificationPayload::Telemetry(p.clone()));
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomba_types::{CommandCode, ConnectionKind, SensorCategory};

    fn state() -> RobotState {
        let mut state = RobotState::new(RobotModel::Create, ConnectionKind::CreateSerial);
        state.set_mode(RoombaMode::Passive);
        state
    }

    fn query(packet: SensorPacket) -> RoombaCommand {
        RoombaCommand::Sensors { packet }
    }

    fn decoded(outcome: DecodeOutcome) -> Decoded {
        match outcome {
            DecodeOutcome::Decoded(d) => d,
            other => panic!("expected a decoded packet, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_commands_decode_to_received() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let d = decoded(dec.decode(&RoombaCommand::Full, &[], &state(), Utc::now()));
        assert_eq!(
            d.packet,
            Packet::CommandReceived {
                code: CommandCode::Full
            }
        );
        assert_eq!(d.consumed, 0);
        assert_eq!(d.mode, Some(RoombaMode::Full));
    }

    #[test]
    fn short_span_is_incomplete() {
        let dec = PacketDecoder::new(RobotModel::Create);
        assert_eq!(
            dec.decode(&query(SensorPacket::Power), &[0; 9], &state(), Utc::now()),
            DecodeOutcome::Incomplete
        );
    }

    #[test]
    fn decodes_exactly_the_expected_length() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let mut bytes = vec![0u8; 6];
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        let d = decoded(dec.decode(&query(SensorPacket::Pose), &bytes, &state(), Utc::now()));
        assert_eq!(d.consumed, 6);
        assert!(matches!(d.packet, Packet::Pose(_)));
    }

    #[test]
    fn out_of_range_fields_are_invalid() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let bad = [0xFF; 10];
        assert!(matches!(
            dec.decode(&query(SensorPacket::BumpsCliffsAndWalls), &bad, &state(), Utc::now()),
            DecodeOutcome::Invalid { .. }
        ));
    }

    #[test]
    fn unchanged_groups_are_suppressed() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let mut st = state();
        let bytes = [0u8, 0, 0, 10, 0, 5];
        let first = decoded(dec.decode(&query(SensorPacket::Pose), &bytes, &st, Utc::now()));
        assert_eq!(first.changed.len(), 1);
        for payload in &first.changed {
            st.store(payload);
        }
        let second = decoded(dec.decode(&query(SensorPacket::Pose), &bytes, &st, Utc::now()));
        assert!(second.changed.is_empty());
    }

    #[test]
    fn pose_accumulates_onto_the_stored_pose() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let mut st = state();
        let first = decoded(dec.decode(
            &query(SensorPacket::Pose),
            &[0, 0, 0, 100, 0, 0],
            &st,
            Utc::now(),
        ));
        st.store(&first.changed[0]);
        let second = decoded(dec.decode(
            &query(SensorPacket::Pose),
            &[0, 0, 0, 50, 0, 0],
            &st,
            Utc::now(),
        ));
        let Packet::Pose(pose) = second.packet else {
            panic!("expected pose");
        };
        assert_eq!(pose.distance_total_mm, 150);
    }

    #[test]
    fn aggregate_reports_only_changed_groups() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let mut st = state();
        let mut bytes = vec![0u8; 52];
        bytes[40] = 1; // telemetry: passive
        let first = decoded(dec.decode(&query(SensorPacket::AllCreate), &bytes, &st, Utc::now()));
        assert_eq!(first.changed.len(), 5);
        for payload in &first.changed {
            st.store(payload);
        }

        bytes[0] = 0x01; // right bumper
        let second = decoded(dec.decode(&query(SensorPacket::AllCreate), &bytes, &st, Utc::now()));
        let categories: Vec<_> = second.changed.iter().map(|p| p.category()).collect();
        assert_eq!(categories, vec![SensorCategory::BumpsCliffsAndWalls]);
    }

    #[test]
    fn telemetry_mode_is_reported() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let mut bytes = vec![0u8; 52];
        bytes[40] = 3;
        let d = decoded(dec.decode(&query(SensorPacket::AllCreate), &bytes, &state(), Utc::now()));
        assert_eq!(d.mode, Some(RoombaMode::Full));
    }

    #[test]
    fn firmware_date_is_found_behind_padding() {
        let dec = PacketDecoder::new(RobotModel::Create);
        let mut bytes = vec![0x00, 0x42];
        bytes.extend_from_slice(&FirmwareDatePacket::encode_date(7, 3, 14, 10, 30));
        let d = decoded(dec.decode(&RoombaCommand::FirmwareDate, &bytes, &state(), Utc::now()));
        assert_eq!(d.consumed, 9);
        assert_eq!(
            d.firmware_date.map(|t| t.to_string()),
            Some("2007-03-14 10:30:00".to_string())
        );
    }

    #[test]
    fn firmware_search_gives_up_on_long_garbage() {
        let dec = PacketDecoder::new(RobotModel::Create);
        assert_eq!(
            dec.decode(&RoombaCommand::FirmwareDate, &[0x55; 10], &state(), Utc::now()),
            DecodeOutcome::Incomplete
        );
        assert!(matches!(
            dec.decode(&RoombaCommand::FirmwareDate, &[0x55; 21], &state(), Utc::now()),
            DecodeOutcome::Invalid { .. }
        ));
    }
}
