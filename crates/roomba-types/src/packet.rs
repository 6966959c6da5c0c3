//! Typed sensor and response packets.
//!
//! Each packet keeps the raw bytes it was decoded from.  Change detection
//! compares those bytes, and the accessors read fields out of them on
//! demand.  A packet is only accepted from the link when [`is_valid`]
//! holds for its group.
//!
//! [`is_valid`]: SensorsPacket::is_valid

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{CommandCode, FIRMWARE_DATE_LEN};
use crate::mode::RoombaMode;

fn be_u16(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

fn be_i16(hi: u8, lo: u8) -> i16 {
    i16::from_be_bytes([hi, lo])
}

fn copy_array<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.get(..N)?.try_into().ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet 1: bumps, wheel drops, cliffs and walls
// ─────────────────────────────────────────────────────────────────────────────

/// Bump and wheel-drop bits of byte 0.
pub mod bumps {
    pub const BUMP_RIGHT: u8 = 0x01;
    pub const BUMP_LEFT: u8 = 0x02;
    pub const WHEEL_DROP_RIGHT: u8 = 0x04;
    pub const WHEEL_DROP_LEFT: u8 = 0x08;
    pub const WHEEL_DROP_CASTER: u8 = 0x10;
    pub const ANY_WHEEL_DROP: u8 = WHEEL_DROP_RIGHT | WHEEL_DROP_LEFT | WHEEL_DROP_CASTER;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorsPacket {
    pub raw: [u8; 10],
    pub timestamp: DateTime<Utc>,
}

impl SensorsPacket {
    pub const LEN: usize = 10;

    pub fn from_bytes(bytes: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            raw: copy_array(bytes)?,
            timestamp,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.raw[0] < 0x20 && self.raw[1..=6].iter().all(|b| *b <= 1) && self.raw[7] < 0x20
    }

    pub fn bumps_wheel_drops(&self) -> u8 {
        self.raw[0]
    }

    pub fn bump_left(&self) -> bool {
        self.raw[0] & bumps::BUMP_LEFT != 0
    }

    pub fn bump_right(&self) -> bool {
        self.raw[0] & bumps::BUMP_RIGHT != 0
    }

    /// Any of the three wheel-drop switches is open.
    pub fn wheel_dropped(&self) -> bool {
        self.raw[0] & bumps::ANY_WHEEL_DROP != 0
    }

    pub fn wall(&self) -> bool {
        self.raw[1] == 1
    }

    /// Cliff sensors, left to right.
    pub fn cliffs(&self) -> [bool; 4] {
        [
            self.raw[2] == 1,
            self.raw[3] == 1,
            self.raw[4] == 1,
            self.raw[5] == 1,
        ]
    }

    pub fn virtual_wall(&self) -> bool {
        self.raw[6] == 1
    }

    pub fn motor_overcurrents(&self) -> u8 {
        self.raw[7]
    }

    pub fn dirt_detector(&self) -> (u8, u8) {
        (self.raw[8], self.raw[9])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet 2: pose
// ─────────────────────────────────────────────────────────────────────────────

/// Remote, buttons, and the distance/angle travelled since the last query.
///
/// `distance_total_mm` and `angle_total_deg` accumulate across queries;
/// see [`PosePacket::accumulate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosePacket {
    pub raw: [u8; 6],
    pub distance_total_mm: i64,
    pub angle_total_deg: i64,
    pub timestamp: DateTime<Utc>,
}

impl PosePacket {
    pub const LEN: usize = 6;

    pub fn from_bytes(bytes: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        let raw: [u8; 6] = copy_array(bytes)?;
        let mut pose = Self {
            raw,
            distance_total_mm: 0,
            angle_total_deg: 0,
            timestamp,
        };
        pose.distance_total_mm = i64::from(pose.distance_mm());
        pose.angle_total_deg = i64::from(pose.angle_deg());
        Some(pose)
    }

    pub fn is_valid(&self) -> bool {
        self.raw[1] < 0x10
    }

    pub fn remote_opcode(&self) -> u8 {
        self.raw[0]
    }

    pub fn buttons(&self) -> u8 {
        self.raw[1]
    }

    /// Distance since the previous query.
    pub fn distance_mm(&self) -> i16 {
        be_i16(self.raw[2], self.raw[3])
    }

    /// Angle since the previous query.
    pub fn angle_deg(&self) -> i16 {
        be_i16(self.raw[4], self.raw[5])
    }

    /// Add the running totals of the previously stored pose.
    pub fn accumulate(&mut self, prior: Option<&PosePacket>) {
        if let Some(prior) = prior {
            self.distance_total_mm = prior.distance_total_mm + i64::from(self.distance_mm());
            self.angle_total_deg = prior.angle_total_deg + i64::from(self.angle_deg());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet 3: power
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerPacket {
    pub raw: [u8; 10],
    pub timestamp: DateTime<Utc>,
}

impl PowerPacket {
    pub const LEN: usize = 10;
    const MAX_VOLTAGE_MV: u16 = 21_000;
    const MAX_CHARGING_STATE: u8 = 5;

    pub fn from_bytes(bytes: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            raw: copy_array(bytes)?,
            timestamp,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.charging_state() <= Self::MAX_CHARGING_STATE && self.voltage_mv() <= Self::MAX_VOLTAGE_MV
    }

    /// 0 not charging, 1 reconditioning, 2 full, 3 trickle, 4 waiting, 5 fault.
    pub fn charging_state(&self) -> u8 {
        self.raw[0]
    }

    pub fn voltage_mv(&self) -> u16 {
        be_u16(self.raw[1], self.raw[2])
    }

    pub fn current_ma(&self) -> i16 {
        be_i16(self.raw[3], self.raw[4])
    }

    pub fn temperature_c(&self) -> i8 {
        self.raw[5] as i8
    }

    pub fn charge_mah(&self) -> u16 {
        be_u16(self.raw[6], self.raw[7])
    }

    pub fn capacity_mah(&self) -> u16 {
        be_u16(self.raw[8], self.raw[9])
    }

    /// Remaining charge in percent, `None` when the capacity reads zero.
    pub fn charge_percent(&self) -> Option<u8> {
        let capacity = u32::from(self.capacity_mah());
        if capacity == 0 {
            return None;
        }
        Some((u32::from(self.charge_mah()) * 100 / capacity).min(100) as u8)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet 4: cliff detail (Create)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliffDetailPacket {
    pub raw: [u8; 14],
    pub timestamp: DateTime<Utc>,
}

impl CliffDetailPacket {
    pub const LEN: usize = 14;

    pub fn from_bytes(bytes: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            raw: copy_array(bytes)?,
            timestamp,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.wall_signal() <= 4095
            && self.cliff_signals().iter().all(|s| *s <= 4095)
            && self.cargo_bay_digital_inputs() <= 31
            && self.cargo_bay_analog_signal() <= 1023
            && self.charging_sources() <= 15
    }

    pub fn wall_signal(&self) -> u16 {
        be_u16(self.raw[0], self.raw[1])
    }

    /// Left, front-left, front-right and right cliff signal strengths.
    pub fn cliff_signals(&self) -> [u16; 4] {
        [
            be_u16(self.raw[2], self.raw[3]),
            be_u16(self.raw[4], self.raw[5]),
            be_u16(self.raw[6], self.raw[7]),
            be_u16(self.raw[8], self.raw[9]),
        ]
    }

    pub fn cargo_bay_digital_inputs(&self) -> u8 {
        self.raw[10]
    }

    pub fn cargo_bay_analog_signal(&self) -> u16 {
        be_u16(self.raw[11], self.raw[12])
    }

    pub fn charging_sources(&self) -> u8 {
        self.raw[13]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet 5: telemetry (Create)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    pub raw: [u8; 12],
    pub timestamp: DateTime<Utc>,
}

impl TelemetryPacket {
    pub const LEN: usize = 12;

    pub fn from_bytes(bytes: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            raw: copy_array(bytes)?,
            timestamp,
        })
    }

    pub fn is_valid(&self) -> bool {
        let in_range = |v: i16| (-500..=500).contains(&v);
        self.raw[0] <= 3
            && self.song_number() <= 15
            && self.raw[2] <= 1
            && self.stream_packets() <= 43
            && in_range(self.requested_velocity())
            && in_range(self.requested_right_velocity())
            && in_range(self.requested_left_velocity())
    }

    /// The mode the robot itself reports.
    pub fn oi_mode(&self) -> Option<RoombaMode> {
        RoombaMode::from_oi_mode(self.raw[0])
    }

    pub fn song_number(&self) -> u8 {
        self.raw[1]
    }

    pub fn song_playing(&self) -> bool {
        self.raw[2] == 1
    }

    pub fn stream_packets(&self) -> u8 {
        self.raw[3]
    }

    pub fn requested_velocity(&self) -> i16 {
        be_i16(self.raw[4], self.raw[5])
    }

    pub fn requested_radius(&self) -> i16 {
        be_i16(self.raw[6], self.raw[7])
    }

    pub fn requested_right_velocity(&self) -> i16 {
        be_i16(self.raw[8], self.raw[9])
    }

    pub fn requested_left_velocity(&self) -> i16 {
        be_i16(self.raw[10], self.raw[11])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate and firmware packets
// ─────────────────────────────────────────────────────────────────────────────

/// Response to an `AllRoomba` (packets 1-3) or `AllCreate` (packets 1-5) query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllSensorsPacket {
    pub sensors: Option<SensorsPacket>,
    pub pose: Option<PosePacket>,
    pub power: Option<PowerPacket>,
    pub cliff_detail: Option<CliffDetailPacket>,
    pub telemetry: Option<TelemetryPacket>,
    pub timestamp: DateTime<Utc>,
}

impl AllSensorsPacket {
    /// Split a 26- or 52-byte aggregate into its groups.
    pub fn from_bytes(bytes: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        let roomba_len = SensorsPacket::LEN + PosePacket::LEN + PowerPacket::LEN;
        if bytes.len() < roomba_len {
            return None;
        }
        let (sensors, rest) = bytes.split_at(SensorsPacket::LEN);
        let (pose, rest) = rest.split_at(PosePacket::LEN);
        let (power, rest) = rest.split_at(PowerPacket::LEN);
        let (cliff_detail, telemetry) =
            if rest.len() >= CliffDetailPacket::LEN + TelemetryPacket::LEN {
                let (cliff, telemetry) = rest.split_at(CliffDetailPacket::LEN);
                (
                    CliffDetailPacket::from_bytes(cliff, timestamp),
                    TelemetryPacket::from_bytes(telemetry, timestamp),
                )
            } else {
                (None, None)
            };
        Some(Self {
            sensors: SensorsPacket::from_bytes(sensors, timestamp),
            pose: PosePacket::from_bytes(pose, timestamp),
            power: PowerPacket::from_bytes(power, timestamp),
            cliff_detail,
            telemetry,
            timestamp,
        })
    }

    /// Valid when at least one group is present and every present group is valid.
    pub fn is_valid(&self) -> bool {
        let checks = [
            self.sensors.as_ref().map(SensorsPacket::is_valid),
            self.pose.as_ref().map(PosePacket::is_valid),
            self.power.as_ref().map(PowerPacket::is_valid),
            self.cliff_detail.as_ref().map(CliffDetailPacket::is_valid),
            self.telemetry.as_ref().map(TelemetryPacket::is_valid),
        ];
        checks.iter().any(Option::is_some) && checks.iter().flatten().all(|ok| *ok)
    }
}

/// Firmware build date: `0x12`, year, month, day, hour, minute, XOR checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareDatePacket {
    pub raw: [u8; 7],
    pub timestamp: DateTime<Utc>,
}

impl FirmwareDatePacket {
    pub const LEN: usize = FIRMWARE_DATE_LEN;
    const SENTINEL: u8 = 0x12;

    pub fn from_bytes(bytes: &[u8], timestamp: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            raw: copy_array(bytes)?,
            timestamp,
        })
    }

    pub fn is_valid(&self) -> bool {
        find_firmware_packet(&self.raw) == Some(0)
    }

    pub fn firmware_date(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(
            2000 + i32::from(self.raw[1]),
            u32::from(self.raw[2]),
            u32::from(self.raw[3]),
        )?
        .and_hms_opt(u32::from(self.raw[4]), u32::from(self.raw[5]), 0)
    }

    /// Build a well-formed packet for the given date; used by simulators.
    pub fn encode_date(year: u8, month: u8, day: u8, hour: u8, minute: u8) -> [u8; 7] {
        let checksum = year ^ month ^ day ^ hour ^ minute;
        [Self::SENTINEL, year, month, day, hour, minute, checksum]
    }
}

/// Offset of the first well-formed firmware-date packet within `bytes`.
///
/// The robot may pad this response, so the sentinel byte is searched for
/// and the XOR checksum of the five date bytes must match.
pub fn find_firmware_packet(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < FirmwareDatePacket::LEN {
        return None;
    }
    (0..=bytes.len() - FirmwareDatePacket::LEN).find(|&ix| {
        let window = &bytes[ix..ix + FirmwareDatePacket::LEN];
        window[0] == FirmwareDatePacket::SENTINEL
            && window[1..6].iter().fold(0u8, |acc, b| acc ^ b) == window[6]
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// The decoded payload of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "packet", content = "data", rename_all = "snake_case")]
pub enum Packet {
    /// Acknowledgement for commands the robot does not answer.
    CommandReceived { code: CommandCode },
    Sensors(SensorsPacket),
    Pose(PosePacket),
    Power(PowerPacket),
    CliffDetail(CliffDetailPacket),
    Telemetry(TelemetryPacket),
    All(AllSensorsPacket),
    FirmwareDate(FirmwareDatePacket),
}

/// What a caller gets back for a successfully processed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub packet: Packet,
    /// Driver mode after the command took effect.
    pub mode: RoombaMode,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn received(code: CommandCode, mode: RoombaMode) -> Self {
        Self {
            packet: Packet::CommandReceived { code },
            mode,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn sensors_packet_validity() {
        let ok = SensorsPacket::from_bytes(&[0x03, 0, 1, 0, 0, 0, 0, 0, 12, 40], now()).unwrap();
        assert!(ok.is_valid());
        assert!(ok.bump_left() && ok.bump_right());
        assert!(!ok.wheel_dropped());

        let bad_bumps = SensorsPacket::from_bytes(&[0x20, 0, 0, 0, 0, 0, 0, 0, 0, 0], now()).unwrap();
        assert!(!bad_bumps.is_valid());

        let bad_flag = SensorsPacket::from_bytes(&[0, 2, 0, 0, 0, 0, 0, 0, 0, 0], now()).unwrap();
        assert!(!bad_flag.is_valid());
    }

    #[test]
    fn wheel_drop_bits() {
        for bit in [
            bumps::WHEEL_DROP_RIGHT,
            bumps::WHEEL_DROP_LEFT,
            bumps::WHEEL_DROP_CASTER,
        ] {
            let p = SensorsPacket::from_bytes(&[bit, 0, 0, 0, 0, 0, 0, 0, 0, 0], now()).unwrap();
            assert!(p.wheel_dropped());
        }
    }

    #[test]
    fn short_input_is_rejected() {
        assert!(SensorsPacket::from_bytes(&[0; 9], now()).is_none());
        assert!(PosePacket::from_bytes(&[0; 5], now()).is_none());
    }

    #[test]
    fn pose_decodes_signed_distance_and_angle() {
        let pose = PosePacket::from_bytes(&[0, 0, 0xFF, 0x9C, 0x00, 0x5A], now()).unwrap();
        assert_eq!(pose.distance_mm(), -100);
        assert_eq!(pose.angle_deg(), 90);
        assert!(pose.is_valid());

        let bad = PosePacket::from_bytes(&[0, 0x10, 0, 0, 0, 0], now()).unwrap();
        assert!(!bad.is_valid());
    }

    #[test]
    fn pose_accumulates_prior_totals() {
        let first = PosePacket::from_bytes(&[0, 0, 0, 50, 0, 10], now()).unwrap();
        let mut second = PosePacket::from_bytes(&[0, 0, 0, 25, 0xFF, 0xFB], now()).unwrap();
        second.accumulate(Some(&first));
        assert_eq!(second.distance_total_mm, 75);
        assert_eq!(second.angle_total_deg, 5);
    }

    #[test]
    fn power_packet_fields_and_validity() {
        // charging=2, 16000 mV, -500 mA, 25 C, 2000/2500 mAh
        let raw = [2, 0x3E, 0x80, 0xFE, 0x0C, 25, 0x07, 0xD0, 0x09, 0xC4];
        let p = PowerPacket::from_bytes(&raw, now()).unwrap();
        assert!(p.is_valid());
        assert_eq!(p.voltage_mv(), 16_000);
        assert_eq!(p.current_ma(), -500);
        assert_eq!(p.temperature_c(), 25);
        assert_eq!(p.charge_percent(), Some(80));

        let mut over = raw;
        over[0] = 6;
        assert!(!PowerPacket::from_bytes(&over, now()).unwrap().is_valid());
    }

    #[test]
    fn telemetry_reports_oi_mode() {
        let raw = [3, 0, 0, 0, 0, 100, 0x80, 0x00, 0, 100, 0, 100];
        let t = TelemetryPacket::from_bytes(&raw, now()).unwrap();
        assert!(t.is_valid());
        assert_eq!(t.oi_mode(), Some(RoombaMode::Full));
        assert_eq!(t.requested_velocity(), 100);

        let mut bad = raw;
        bad[0] = 4;
        assert!(!TelemetryPacket::from_bytes(&bad, now()).unwrap().is_valid());
    }

    #[test]
    fn cliff_detail_limits() {
        let mut raw = [0u8; 14];
        raw[10] = 31;
        assert!(CliffDetailPacket::from_bytes(&raw, now()).unwrap().is_valid());
        raw[0] = 0x10; // wall signal 4096
        assert!(!CliffDetailPacket::from_bytes(&raw, now()).unwrap().is_valid());
    }

    #[test]
    fn aggregate_requires_every_present_group_valid() {
        let mut bytes = vec![0u8; 26];
        let all = AllSensorsPacket::from_bytes(&bytes, now()).unwrap();
        assert!(all.is_valid());
        assert!(all.telemetry.is_none());

        bytes[11] = 0x10; // pose buttons out of range
        assert!(!AllSensorsPacket::from_bytes(&bytes, now()).unwrap().is_valid());
    }

    #[test]
    fn create_aggregate_has_five_groups() {
        let all = AllSensorsPacket::from_bytes(&[0u8; 52], now()).unwrap();
        assert!(all.cliff_detail.is_some());
        assert!(all.telemetry.is_some());
        assert!(all.is_valid());
    }

    #[test]
    fn firmware_packet_is_found_after_padding() {
        let packet = FirmwareDatePacket::encode_date(7, 3, 14, 10, 30);
        let mut padded = vec![0x00, 0xAA];
        padded.extend_from_slice(&packet);
        assert_eq!(find_firmware_packet(&padded), Some(2));

        let parsed = FirmwareDatePacket::from_bytes(&packet, now()).unwrap();
        assert!(parsed.is_valid());
        let date = parsed.firmware_date().unwrap();
        assert_eq!(date.to_string(), "2007-03-14 10:30:00");
    }

    #[test]
    fn firmware_packet_with_bad_checksum_is_ignored() {
        let mut packet = FirmwareDatePacket::encode_date(7, 3, 14, 10, 30);
        packet[6] ^= 0xFF;
        assert_eq!(find_firmware_packet(&packet), None);
    }
}
