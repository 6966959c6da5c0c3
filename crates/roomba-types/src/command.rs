//! The Open Interface command set.
//!
//! Every request the driver can send to the robot is a variant of
//! [`RoombaCommand`].  A command knows its opcode, its wire encoding and how
//! many response bytes the robot will send back for it.
//!
//! | Opcode | Command | Response bytes |
//! |---|---|---|
//! | 128 | [`RoombaCommand::Start`] | 0 |
//! | 130 | [`RoombaCommand::Control`] | 0 |
//! | 131 / 132 | [`RoombaCommand::Safe`] / [`RoombaCommand::Full`] | 0 |
//! | 137 | [`RoombaCommand::Drive`] | 0 |
//! | 142 | [`RoombaCommand::Sensors`] | depends on [`SensorPacket`] |
//! | 145 | [`RoombaCommand::DriveDirect`] (Create only) | 0 |
//! | 7 | [`RoombaCommand::Reset`] (Create only) | 0 |
//! | 8 | [`RoombaCommand::FirmwareDate`] | 7 |

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::mode::RobotModel;

/// Radius value that tells the robot to drive straight.
pub const DRIVE_STRAIGHT_RADIUS: i16 = i16::MIN;

/// Distance between the drive wheels, in millimetres.
pub const WHEEL_BASE_MM: i32 = 258;

/// Fastest wheel speed accepted by the OI, in mm/s.
pub const MAX_VELOCITY_MM_S: i16 = 500;

/// Largest turning radius the OI accepts, in millimetres.
pub const MAX_RADIUS_MM: i32 = 2000;

/// Size of the firmware-date response, sentinel and checksum included.
pub const FIRMWARE_DATE_LEN: usize = 7;

/// Opcode byte of every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[repr(u8)]
pub enum CommandCode {
    Reset = 7,
    FirmwareDate = 8,
    Start = 128,
    Baud = 129,
    Control = 130,
    Safe = 131,
    Full = 132,
    Power = 133,
    Spot = 134,
    Clean = 135,
    Max = 136,
    Drive = 137,
    Motors = 138,
    Leds = 139,
    DefineSong = 140,
    PlaySong = 141,
    Sensors = 142,
    ForceSeekingDock = 143,
    DriveDirect = 145,
    DigitalOutputs = 147,
}

impl CommandCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_byte())
    }
}

/// Sensor packet groups that can be requested with [`RoombaCommand::Sensors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SensorPacket {
    /// Packets 1-3 concatenated (26 bytes).
    AllRoomba,
    /// Bumps, wheel drops, cliffs, walls and buttons (10 bytes).
    BumpsCliffsAndWalls,
    /// Distance and angle since the last request (6 bytes).
    Pose,
    /// Charging state and battery readings (10 bytes).
    Power,
    /// Create cliff signal strengths and cargo-bay inputs (14 bytes).
    CliffDetail,
    /// Create OI mode, song and requested velocities (12 bytes).
    Telemetry,
    /// Packets 1-5 concatenated (52 bytes).
    AllCreate,
}

impl SensorPacket {
    pub const ALL: [SensorPacket; 7] = [
        Self::AllRoomba,
        Self::BumpsCliffsAndWalls,
        Self::Pose,
        Self::Power,
        Self::CliffDetail,
        Self::Telemetry,
        Self::AllCreate,
    ];

    /// Packet id sent after the `Sensors` opcode.
    pub fn id(self) -> u8 {
        match self {
            Self::AllRoomba => 0,
            Self::BumpsCliffsAndWalls => 1,
            Self::Pose => 2,
            Self::Power => 3,
            Self::CliffDetail => 4,
            Self::Telemetry => 5,
            Self::AllCreate => 6,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    /// Number of bytes the robot answers with.
    pub fn response_len(self) -> usize {
        match self {
            Self::AllRoomba => 26,
            Self::BumpsCliffsAndWalls => 10,
            Self::Pose => 6,
            Self::Power => 10,
            Self::CliffDetail => 14,
            Self::Telemetry => 12,
            Self::AllCreate => 52,
        }
    }

    /// Packets 4-6 only exist on the Create.
    pub fn create_only(self) -> bool {
        matches!(self, Self::CliffDetail | Self::Telemetry | Self::AllCreate)
    }

    /// The widest query the given model understands; used by the poll timer.
    pub fn full_query(model: RobotModel) -> Self {
        match model {
            RobotModel::Create => Self::AllCreate,
            RobotModel::Roomba => Self::AllRoomba,
        }
    }
}

/// One note of a song: MIDI pitch and duration in 1/64ths of a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Note {
    pub pitch: u8,
    pub duration: u8,
}

/// A request to the robot.
///
/// Serialized adjacently tagged so a command reads as
/// `{"command": "drive", "payload": {"velocity": 200, "radius": -32768}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum RoombaCommand {
    /// Enter passive mode.
    Start,
    /// Change the serial baud rate (code 0..=11).
    Baud { code: u8 },
    /// Enter safe mode from passive.
    Control,
    Safe,
    Full,
    /// Put the robot to sleep.
    Power,
    Spot,
    Clean,
    /// Max clean on the Roomba, demo on the Create.
    Max,
    /// Drive at `velocity` mm/s around `radius` mm.
    Drive { velocity: i16, radius: i16 },
    /// Cleaning motor bit mask.
    Motors { bits: u8 },
    Leds {
        bits: u8,
        power_color: u8,
        power_intensity: u8,
    },
    DefineSong { number: u8, notes: Vec<Note> },
    PlaySong { number: u8 },
    /// Request a sensor packet.
    Sensors { packet: SensorPacket },
    ForceSeekingDock,
    /// Independent wheel velocities in mm/s (Create only).
    DriveDirect { right: i16, left: i16 },
    /// Cargo-bay digital outputs (Create only).
    DigitalOutputs { bits: u8 },
    /// Soft reset (Create only).
    Reset,
    /// Ask for the firmware build date.
    FirmwareDate,
}

impl RoombaCommand {
    /// Stop both wheels.
    pub fn stop() -> Self {
        Self::Drive {
            velocity: 0,
            radius: 0,
        }
    }

    pub fn code(&self) -> CommandCode {
        match self {
            Self::Start => CommandCode::Start,
            Self::Baud { .. } => CommandCode::Baud,
            Self::Control => CommandCode::Control,
            Self::Safe => CommandCode::Safe,
            Self::Full => CommandCode::Full,
            Self::Power => CommandCode::Power,
            Self::Spot => CommandCode::Spot,
            Self::Clean => CommandCode::Clean,
            Self::Max => CommandCode::Max,
            Self::Drive { .. } => CommandCode::Drive,
            Self::Motors { .. } => CommandCode::Motors,
            Self::Leds { .. } => CommandCode::Leds,
            Self::DefineSong { .. } => CommandCode::DefineSong,
            Self::PlaySong { .. } => CommandCode::PlaySong,
            Self::Sensors { .. } => CommandCode::Sensors,
            Self::ForceSeekingDock => CommandCode::ForceSeekingDock,
            Self::DriveDirect { .. } => CommandCode::DriveDirect,
            Self::DigitalOutputs { .. } => CommandCode::DigitalOutputs,
            Self::Reset => CommandCode::Reset,
            Self::FirmwareDate => CommandCode::FirmwareDate,
        }
    }

    /// Serialize to the bytes written on the link.
    ///
    /// Multi-byte values are sent big-endian, high byte first.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.code().as_byte()];
        match self {
            Self::Baud { code } => out.push(*code),
            Self::Drive { velocity, radius } => {
                out.extend_from_slice(&velocity.to_be_bytes());
                out.extend_from_slice(&radius.to_be_bytes());
            }
            Self::Motors { bits } | Self::DigitalOutputs { bits } => out.push(*bits),
            Self::Leds {
                bits,
                power_color,
                power_intensity,
            } => out.extend_from_slice(&[*bits, *power_color, *power_intensity]),
            Self::DefineSong { number, notes } => {
                out.push(*number);
                out.push(notes.len() as u8);
                for note in notes {
                    out.push(note.pitch);
                    out.push(note.duration);
                }
            }
            Self::PlaySong { number } => out.push(*number),
            Self::Sensors { packet } => out.push(packet.id()),
            Self::DriveDirect { right, left } => {
                out.extend_from_slice(&right.to_be_bytes());
                out.extend_from_slice(&left.to_be_bytes());
            }
            Self::Start
            | Self::Control
            | Self::Safe
            | Self::Full
            | Self::Power
            | Self::Spot
            | Self::Clean
            | Self::Max
            | Self::ForceSeekingDock
            | Self::Reset
            | Self::FirmwareDate => {}
        }
        out
    }

    /// How many bytes the robot sends back; 0 for fire-and-forget commands.
    pub fn expected_response_bytes(&self) -> usize {
        match self {
            Self::Sensors { packet } => packet.response_len(),
            Self::FirmwareDate => FIRMWARE_DATE_LEN,
            _ => 0,
        }
    }

    /// Commands the Roomba does not understand.
    pub fn create_only(&self) -> bool {
        match self {
            Self::DriveDirect { .. } | Self::DigitalOutputs { .. } | Self::Reset => true,
            Self::Sensors { packet } => packet.create_only(),
            _ => false,
        }
    }

    /// Drive and DriveDirect are superseded by newer instances of themselves.
    pub fn is_coalescable(&self) -> bool {
        matches!(self, Self::Drive { .. } | Self::DriveDirect { .. })
    }

    /// Check argument ranges before anything is queued.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when an argument is out of range.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Baud { code } if *code > 11 => Err(format!("baud code {code} is not in 0..=11")),
            Self::Drive { velocity, .. } if !velocity_in_range(*velocity) => {
                Err(format!("velocity {velocity} exceeds ±{MAX_VELOCITY_MM_S} mm/s"))
            }
            Self::DriveDirect { right, left }
                if !velocity_in_range(*right) || !velocity_in_range(*left) =>
            {
                Err(format!(
                    "wheel velocities ({right}, {left}) exceed ±{MAX_VELOCITY_MM_S} mm/s"
                ))
            }
            Self::DefineSong { number, .. } | Self::PlaySong { number } if *number > 15 => {
                Err(format!("song number {number} is not in 0..=15"))
            }
            Self::DefineSong { notes, .. } if notes.is_empty() || notes.len() > 16 => {
                Err(format!("a song holds 1..=16 notes, got {}", notes.len()))
            }
            _ => Ok(()),
        }
    }
}

fn velocity_in_range(velocity: i16) -> bool {
    (-MAX_VELOCITY_MM_S..=MAX_VELOCITY_MM_S).contains(&velocity)
}

/// Translate independent wheel speeds into a Roomba `Drive` command.
///
/// The Roomba has no `DriveDirect`, so the pair of wheel speeds is turned
/// into a velocity and a turning radius.  Positive radius turns left.
pub fn drive_direct_as_drive(right: i16, left: i16) -> RoombaCommand {
    let left = f64::from(left) / f64::from(MAX_VELOCITY_MM_S);
    let right = f64::from(right) / f64::from(MAX_VELOCITY_MM_S);
    let (abs_left, abs_right) = (left.abs(), right.abs());

    let mut velocity: i32 = 0;
    let mut radius: i32 = MAX_RADIUS_MM;

    let spin_sign = if right > left { 1 } else { -1 };
    let velocity_sign = if abs_left > abs_right {
        sign(left)
    } else {
        sign(right)
    };

    if abs_left != 0.0 || abs_right != 0.0 {
        if left == 0.0 || right == 0.0 || sign(left) == sign(right) {
            velocity = ((right + left) * 250.0) as i32;
            if abs_left == 0.0 || abs_right == 0.0 {
                radius = spin_sign * WHEEL_BASE_MM;
            } else if right == left {
                radius = STRAIGHT;
            } else {
                let seconds_to_circle = 3.242_123_618_504_666_6 / (abs_right - abs_left).abs();
                let turn = ((abs_left + abs_right) * 125.0 * seconds_to_circle
                    / std::f64::consts::PI) as i32;
                radius = velocity_sign * spin_sign * turn.clamp(1, MAX_RADIUS_MM);
            }
        } else {
            // Wheels turn in opposite directions: spin in place.
            velocity = velocity_sign * ((abs_left + abs_right) * 250.0) as i32;
            radius = if abs_left == abs_right { 1 } else { spin_sign };
        }
    }

    let velocity = velocity.clamp(-i32::from(MAX_VELOCITY_MM_S), i32::from(MAX_VELOCITY_MM_S));
    if !(-MAX_RADIUS_MM..=MAX_RADIUS_MM).contains(&radius) {
        radius = STRAIGHT;
    }

    RoombaCommand::Drive {
        velocity: velocity as i16,
        radius: if radius == STRAIGHT {
            DRIVE_STRAIGHT_RADIUS
        } else {
            radius as i16
        },
    }
}

const STRAIGHT: i32 = 32768;

fn sign(v: f64) -> i32 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}
