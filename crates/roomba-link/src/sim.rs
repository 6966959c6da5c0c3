//! Simulated robot.
//!
//! [`SimulatedRobot`] is a [`SerialTransport`] that behaves like a robot on
//! the far end of the cable: it tracks its own OI mode, integrates drive
//! commands into odometry and answers sensor queries with well-formed
//! packets.  Used by the CLI's simulated link and by driver tests.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use roomba_types::packet::bumps;
use roomba_types::{CommandCode, FirmwareDatePacket, RobotModel, RoombaError, RoombaMode};
use tokio::time::Instant;
use tracing::debug;

use crate::SerialTransport;

const BOOT_BANNER: &[u8] = b"bl-start\r\n2007-03-14-1030-L\r\n";

struct SimState {
    model: RobotModel,
    open: bool,
    mode: RoombaMode,
    velocity: i16,
    radius: i16,
    right_velocity: i16,
    left_velocity: i16,
    wheels_dropped: bool,
    bumped: bool,
    last_pose_query: Instant,
    outbound: Vec<u8>,
    rts: Vec<bool>,
    received: Vec<u8>,
    banner_on_open: bool,
    battery_charge_mah: u16,
}

#[derive(Clone)]
pub struct SimulatedRobot {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRobot {
    /// A robot that is awake but has not been sent `Start` yet.
    pub fn new(model: RobotModel) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                model,
                open: false,
                mode: RoombaMode::Off,
                velocity: 0,
                radius: 0,
                right_velocity: 0,
                left_velocity: 0,
                wheels_dropped: false,
                bumped: false,
                last_pose_query: Instant::now(),
                outbound: Vec::new(),
                rts: Vec::new(),
                received: Vec::new(),
                banner_on_open: false,
                battery_charge_mah: 2400,
            })),
        }
    }

    /// Print the boot banner when the port is opened.
    pub fn with_boot_banner(self) -> Self {
        self.lock().banner_on_open = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mode(&self) -> RoombaMode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: RoombaMode) {
        self.lock().mode = mode;
    }

    /// Lift the robot off the floor.
    pub fn set_wheels_dropped(&self, dropped: bool) {
        let mut state = self.lock();
        state.wheels_dropped = dropped;
        if dropped && state.model.is_create() && state.mode == RoombaMode::Safe {
            state.mode = RoombaMode::Passive;
            state.velocity = 0;
        }
    }

    pub fn set_bumped(&self, bumped: bool) {
        self.lock().bumped = bumped;
    }

    /// Queue raw bytes on the line, as if the robot had sent them unasked.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().outbound.extend_from_slice(bytes);
    }

    /// Current (velocity, radius) of the last accepted drive command.
    pub fn drive(&self) -> (i16, i16) {
        let state = self.lock();
        (state.velocity, state.radius)
    }

    /// Every opcode received, in order.
    pub fn received_opcodes(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    pub fn rts_history(&self) -> Vec<bool> {
        self.lock().rts.clone()
    }
}

impl SimState {
    fn bumps_byte(&self) -> u8 {
        let mut b = 0;
        if self.bumped {
            b |= bumps::BUMP_LEFT | bumps::BUMP_RIGHT;
        }
        if self.wheels_dropped {
            b |= bumps::WHEEL_DROP_LEFT | bumps::WHEEL_DROP_RIGHT;
        }
        b
    }

    fn sensors(&self) -> Vec<u8> {
        vec![self.bumps_byte(), 0, 0, 0, 0, 0, 0, 0, 0, 0]
    }

    fn pose(&mut self) -> Vec<u8> {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_pose_query).as_millis() as i64;
        self.last_pose_query = now;
        let distance = (i64::from(self.velocity) * elapsed_ms / 1000)
            .clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
        let mut out = vec![0, 0];
        out.extend_from_slice(&distance.to_be_bytes());
        out.extend_from_slice(&0i16.to_be_bytes());
        out
    }

    fn power(&mut self) -> Vec<u8> {
        let current: i16 = if self.velocity != 0 { -900 } else { -180 };
        let mut out = vec![0];
        out.extend_from_slice(&15_800u16.to_be_bytes());
        out.extend_from_slice(&current.to_be_bytes());
        out.push(28);
        out.extend_from_slice(&self.battery_charge_mah.to_be_bytes());
        out.extend_from_slice(&2_700u16.to_be_bytes());
        out
    }

    fn cliff_detail(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.extend_from_slice(&0u16.to_be_bytes());
        for _ in 0..4 {
            out.extend_from_slice(&1_200u16.to_be_bytes());
        }
        out.push(0);
        out.extend_from_slice(&0u16.to_be_bytes());
        out.push(0);
        out
    }

    fn telemetry(&self) -> Vec<u8> {
        let oi = match self.mode {
            RoombaMode::Passive => 1,
            RoombaMode::Safe => 2,
            RoombaMode::Full => 3,
            _ => 0,
        };
        let mut out = vec![oi, 0, 0, 0];
        out.extend_from_slice(&self.velocity.to_be_bytes());
        out.extend_from_slice(&self.radius.to_be_bytes());
        out.extend_from_slice(&self.right_velocity.to_be_bytes());
        out.extend_from_slice(&self.left_velocity.to_be_bytes());
        out
    }

    fn sensor_packet(&mut self, id: u8) -> Vec<u8> {
        let create = self.model.is_create();
        match id {
            0 => [self.sensors(), self.pose(), self.power()].concat(),
            1 => self.sensors(),
            2 => self.pose(),
            3 => self.power(),
            4 if create => self.cliff_detail(),
            5 if create => self.telemetry(),
            6 if create => [
                self.sensors(),
                self.pose(),
                self.power(),
                self.cliff_detail(),
                self.telemetry(),
            ]
            .concat(),
            _ => Vec::new(),
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        let Some(&opcode) = frame.first() else {
            return;
        };
        self.received.push(opcode);
        let arg_i16 = |ix: usize| -> i16 {
            match (frame.get(ix), frame.get(ix + 1)) {
                (Some(hi), Some(lo)) => i16::from_be_bytes([*hi, *lo]),
                _ => 0,
            }
        };
        let motion_allowed = self.mode.accepts_motion();

        match opcode {
            op if op == CommandCode::Start.as_byte() => self.mode = RoombaMode::Passive,
            op if op == CommandCode::Control.as_byte() => {
                if self.mode == RoombaMode::Passive {
                    self.mode = RoombaMode::Safe;
                }
            }
            op if op == CommandCode::Safe.as_byte() => {
                if self.mode != RoombaMode::Off {
                    self.mode = RoombaMode::Safe;
                }
            }
            op if op == CommandCode::Full.as_byte() => {
                if self.mode != RoombaMode::Off {
                    self.mode = RoombaMode::Full;
                }
            }
            op if op == CommandCode::Power.as_byte() => {
                self.mode = if self.model.is_create() {
                    RoombaMode::Passive
                } else {
                    RoombaMode::Off
                };
                self.velocity = 0;
            }
            op if op == CommandCode::Spot.as_byte()
                || op == CommandCode::Clean.as_byte()
                || op == CommandCode::Max.as_byte()
                || op == CommandCode::ForceSeekingDock.as_byte() =>
            {
                self.mode = RoombaMode::Passive;
            }
            op if op == CommandCode::Drive.as_byte() && motion_allowed => {
                self.velocity = arg_i16(1);
                self.radius = arg_i16(3);
                self.right_velocity = self.velocity;
                self.left_velocity = self.velocity;
            }
            op if op == CommandCode::DriveDirect.as_byte() && motion_allowed => {
                self.right_velocity = arg_i16(1);
                self.left_velocity = arg_i16(3);
                self.velocity =
                    ((i32::from(self.right_velocity) + i32::from(self.left_velocity)) / 2) as i16;
            }
            op if op == CommandCode::Sensors.as_byte() => {
                let id = frame.get(1).copied().unwrap_or(0);
                let packet = self.sensor_packet(id);
                self.outbound.extend(packet);
            }
            op if op == CommandCode::FirmwareDate.as_byte() => {
                self.outbound
                    .extend_from_slice(&FirmwareDatePacket::encode_date(7, 3, 14, 10, 30));
            }
            op if op == CommandCode::Reset.as_byte() && self.model.is_create() => {
                self.mode = RoombaMode::Off;
                self.velocity = 0;
                self.outbound.extend_from_slice(BOOT_BANNER);
            }
            _ => debug!(opcode, "simulated robot ignored command"),
        }
    }
}

#[async_trait]
impl SerialTransport for SimulatedRobot {
    async fn open(&mut self) -> Result<(), RoombaError> {
        let mut state = self.lock();
        state.open = true;
        if state.banner_on_open {
            state.outbound.extend_from_slice(BOOT_BANNER);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RoombaError> {
        self.lock().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), RoombaError> {
        let mut state = self.lock();
        if !state.open {
            return Err(RoombaError::NotConnected);
        }
        state.handle(bytes);
        Ok(())
    }

    async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, RoombaError> {
        let mut state = self.lock();
        let n = buf.len().min(state.outbound.len());
        buf[..n].copy_from_slice(&state.outbound[..n]);
        state.outbound.drain(..n);
        Ok(n)
    }

    /// A low-high-low pulse wakes a sleeping Roomba.
    async fn set_rts(&mut self, level: bool) -> Result<(), RoombaError> {
        let mut state = self.lock();
        state.rts.push(level);
        let pulse = state.rts.ends_with(&[false, true, false]);
        if pulse && state.mode == RoombaMode::Off && !state.model.is_create() {
            debug!("simulated roomba woke up");
            state.mode = RoombaMode::Passive;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sim:{}", self.lock().model)
    }
}
