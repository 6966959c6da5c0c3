//! Operating-mode state machine.
//!
//! The Open Interface only accepts most commands in particular modes.  This
//! module answers four questions for the scheduler:
//!
//! | Question | Function |
//! |---|---|
//! | Which mode must the robot be in before `cmd`? | [`ModeController::required_mode`] |
//! | Which primitive moves the robot one step towards a mode? | [`ModeController::transition_primitive`] |
//! | Which mode will the robot be in after `cmd`? | [`derived_mode`] |
//! | Has the robot drifted away from the maintained mode for too long? | [`ModeController::check_maintain`] |
//!
//! Telemetry is authoritative: [`observed_mode`] reports when a decoded
//! packet contradicts the tracked mode.

use std::time::Duration;

use roomba_types::{CommandCode, Packet, RobotModel, RoombaCommand, RoombaMode};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::state::RobotState;

/// Shortest time the mode may diverge before the maintain timer corrects it.
pub const MIN_MAINTAIN_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on primitives sent for a single mode change.  Passive to Full
/// takes two; anything longer means the robot is not following.
pub const MAX_TRANSITION_STEPS: usize = 4;

/// Mode the robot will be in after `code` is accepted in `prior`.
pub fn derived_mode(code: CommandCode, prior: RoombaMode, model: RobotModel) -> RoombaMode {
    let create = model.is_create();
    match code {
        CommandCode::Start => RoombaMode::Passive,
        CommandCode::Control if prior == RoombaMode::Passive => RoombaMode::Safe,
        CommandCode::Safe if create || prior == RoombaMode::Full => RoombaMode::Safe,
        CommandCode::Full if create || prior == RoombaMode::Safe => RoombaMode::Full,
        CommandCode::Power | CommandCode::Reset => RoombaMode::Off,
        CommandCode::Spot | CommandCode::Clean | CommandCode::Max | CommandCode::ForceSeekingDock
            if create || prior.accepts_motion() =>
        {
            RoombaMode::Passive
        }
        _ => prior,
    }
}

/// Mode implied by a decoded packet, when it differs from `current`.
///
/// The Create reports its OI mode in telemetry.  A Roomba drops to passive
/// by itself when a wheel leaves the floor in safe or full mode.
pub fn observed_mode(model: RobotModel, current: RoombaMode, packet: &Packet) -> Option<RoombaMode> {
    let (sensors, telemetry) = match packet {
        Packet::Sensors(s) => (Some(s), None),
        Packet::Telemetry(t) => (None, Some(t)),
        Packet::All(all) => (all.sensors.as_ref(), all.telemetry.as_ref()),
        _ => (None, None),
    };

    if let Some(reported) = telemetry.and_then(|t| t.oi_mode()) {
        if reported != current {
            if current.can_be_maintained() || current == RoombaMode::Off {
                warn!(from = %current, to = %reported, "robot changed to an unexpected mode");
            }
            return Some(reported);
        }
        return None;
    }

    if model == RobotModel::Roomba
        && current.accepts_motion()
        && sensors.is_some_and(|s| s.wheel_dropped())
    {
        info!(from = %current, "wheel drop, robot fell back to passive");
        return Some(RoombaMode::Passive);
    }
    None
}

/// Decides which primitives move the robot between modes and supervises
/// the maintained mode.
#[derive(Debug)]
pub struct ModeController {
    model: RobotModel,
    grace: Duration,
    diverged_since: Option<Instant>,
}

impl ModeController {
    /// `tick` is the poll timer period; the grace window is never shorter.
    pub fn new(model: RobotModel, tick: Duration) -> Self {
        Self {
            model,
            grace: tick.max(MIN_MAINTAIN_GRACE),
            diverged_since: None,
        }
    }

    pub fn model(&self) -> RobotModel {
        self.model
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Primitive sent for an explicit mode request.
    pub fn mode_command(&self, mode: RoombaMode) -> Option<RoombaCommand> {
        match mode {
            RoombaMode::Off if self.model.is_create() => Some(RoombaCommand::Reset),
            RoombaMode::Off => Some(RoombaCommand::Power),
            RoombaMode::Passive => Some(RoombaCommand::Start),
            RoombaMode::Safe => Some(RoombaCommand::Safe),
            RoombaMode::Full => Some(RoombaCommand::Full),
            RoombaMode::Uninitialized | RoombaMode::Shutdown => None,
        }
    }

    /// The mode `cmd` needs, or `None` when it may be sent in `current`.
    pub fn required_mode(&self, cmd: &RoombaCommand, current: RoombaMode) -> Option<RoombaMode> {
        use RoombaMode::{Full, Off, Passive, Safe};

        if self.model.is_create() && cmd.code() == CommandCode::Max {
            return (current == Off).then_some(Passive);
        }

        match cmd.code() {
            CommandCode::Reset => None,
            CommandCode::Baud
            | CommandCode::DefineSong
            | CommandCode::FirmwareDate
            | CommandCode::Sensors => (current == Off).then_some(Passive),
            CommandCode::Control | CommandCode::ForceSeekingDock => {
                (current != Passive).then_some(Passive)
            }
            CommandCode::Safe if self.model.is_create() => None,
            CommandCode::Safe => (!current.accepts_motion()).then_some(Full),
            CommandCode::Full
            | CommandCode::Power
            | CommandCode::Spot
            | CommandCode::Clean
            | CommandCode::Max
            | CommandCode::Drive
            | CommandCode::Motors
            | CommandCode::Leds
            | CommandCode::PlaySong
            | CommandCode::DigitalOutputs
            | CommandCode::DriveDirect => (!current.accepts_motion()).then_some(Safe),
            CommandCode::Start => None,
        }
    }

    /// Next primitive on the way from `current` to `target`, or `None` when
    /// nothing (more) can be sent.
    pub fn transition_primitive(
        &self,
        target: RoombaMode,
        current: RoombaMode,
    ) -> Option<RoombaCommand> {
        use RoombaMode::{Full, Off, Passive, Safe, Shutdown};

        // A sleeping robot ignores everything until it is woken up.
        if current == Off && target != Off {
            return None;
        }
        if current == target {
            return None;
        }
        match target {
            Passive | Shutdown => Some(RoombaCommand::Start),
            Safe if current == Full || self.model.is_create() => Some(RoombaCommand::Safe),
            Safe if current == Passive => Some(RoombaCommand::Control),
            Full if current == Passive => Some(RoombaCommand::Control),
            Full if current == Safe => Some(RoombaCommand::Full),
            _ => None,
        }
    }

    /// Only the Roomba can be woken from `Off`, by pulsing RTS.
    pub fn needs_wake_up(&self, target: RoombaMode, current: RoombaMode) -> bool {
        self.model == RobotModel::Roomba && current == RoombaMode::Off && target != RoombaMode::Off
    }

    /// Called on every timer tick.  Returns the mode to restore once the
    /// robot has been away from a maintained safe or full mode for longer
    /// than the grace window.
    pub fn check_maintain(&mut self, state: &RobotState, now: Instant) -> Option<RoombaMode> {
        let target = match state.maintain_mode {
            Some(mode @ (RoombaMode::Safe | RoombaMode::Full)) if state.initialized => mode,
            _ => {
                self.diverged_since = None;
                return None;
            }
        };
        if state.mode == target {
            self.diverged_since = None;
            return None;
        }
        match self.diverged_since {
            None => {
                self.diverged_since = Some(now);
                None
            }
            Some(since) if now.duration_since(since) >= self.grace => {
                self.diverged_since = None;
                info!(from = %state.mode, to = %target, "maintain mode correction");
                Some(target)
            }
            Some(_) => None,
        }
    }

    /// Mode to restore right after a user command, if any.
    pub fn post_command_target(&self, state: &RobotState) -> Option<RoombaMode> {
        let target = state.maintain_mode?;
        (state.initialized && target.can_be_maintained() && state.mode != target).then_some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use roomba_types::{ConnectionKind, SensorsPacket, TelemetryPacket};

    fn create() -> ModeController {
        ModeController::new(RobotModel::Create, Duration::from_millis(200))
    }

    fn roomba() -> ModeController {
        ModeController::new(RobotModel::Roomba, Duration::from_millis(200))
    }

    fn drive() -> RoombaCommand {
        RoombaCommand::Drive {
            velocity: 100,
            radius: 0,
        }
    }

    // ── Derived mode ─────────────────────────────────────────────────────────

    #[test]
    fn start_always_enters_passive() {
        for prior in [RoombaMode::Off, RoombaMode::Safe, RoombaMode::Full] {
            assert_eq!(
                derived_mode(CommandCode::Start, prior, RobotModel::Roomba),
                RoombaMode::Passive
            );
        }
    }

    #[test]
    fn roomba_safe_only_works_from_full() {
        assert_eq!(
            derived_mode(CommandCode::Safe, RoombaMode::Passive, RobotModel::Roomba),
            RoombaMode::Passive
        );
        assert_eq!(
            derived_mode(CommandCode::Safe, RoombaMode::Full, RobotModel::Roomba),
            RoombaMode::Safe
        );
        assert_eq!(
            derived_mode(CommandCode::Safe, RoombaMode::Passive, RobotModel::Create),
            RoombaMode::Safe
        );
    }

    #[test]
    fn control_from_passive_enters_safe() {
        assert_eq!(
            derived_mode(CommandCode::Control, RoombaMode::Passive, RobotModel::Roomba),
            RoombaMode::Safe
        );
        assert_eq!(
            derived_mode(CommandCode::Control, RoombaMode::Full, RobotModel::Roomba),
            RoombaMode::Full
        );
    }

    #[test]
    fn power_and_reset_turn_the_robot_off() {
        assert_eq!(
            derived_mode(CommandCode::Power, RoombaMode::Safe, RobotModel::Roomba),
            RoombaMode::Off
        );
        assert_eq!(
            derived_mode(CommandCode::Reset, RoombaMode::Full, RobotModel::Create),
            RoombaMode::Off
        );
    }

    #[test]
    fn cleaning_modes_fall_back_to_passive() {
        assert_eq!(
            derived_mode(CommandCode::Clean, RoombaMode::Safe, RobotModel::Roomba),
            RoombaMode::Passive
        );
        assert_eq!(
            derived_mode(CommandCode::Spot, RoombaMode::Passive, RobotModel::Roomba),
            RoombaMode::Passive
        );
        assert_eq!(
            derived_mode(CommandCode::Drive, RoombaMode::Safe, RobotModel::Roomba),
            RoombaMode::Safe
        );
    }

    // ── Observed mode ────────────────────────────────────────────────────────

    #[test]
    fn telemetry_overrides_tracked_mode() {
        let raw = [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let telemetry = TelemetryPacket::from_bytes(&raw, Utc::now()).unwrap();
        assert_eq!(
            observed_mode(
                RobotModel::Create,
                RoombaMode::Full,
                &Packet::Telemetry(telemetry.clone())
            ),
            Some(RoombaMode::Passive)
        );
        assert_eq!(
            observed_mode(
                RobotModel::Create,
                RoombaMode::Passive,
                &Packet::Telemetry(telemetry)
            ),
            None
        );
    }

    #[test]
    fn wheel_drop_forces_roomba_into_passive() {
        let sensors = SensorsPacket::from_bytes(&[0x04, 0, 0, 0, 0, 0, 0, 0, 0, 0], Utc::now()).unwrap();
        let packet = Packet::Sensors(sensors);
        assert_eq!(
            observed_mode(RobotModel::Roomba, RoombaMode::Safe, &packet),
            Some(RoombaMode::Passive)
        );
        assert_eq!(observed_mode(RobotModel::Create, RoombaMode::Safe, &packet), None);
        assert_eq!(observed_mode(RobotModel::Roomba, RoombaMode::Passive, &packet), None);
    }

    // ── Preconditions ────────────────────────────────────────────────────────

    #[test]
    fn motion_requires_safe() {
        let ctl = roomba();
        assert_eq!(ctl.required_mode(&drive(), RoombaMode::Passive), Some(RoombaMode::Safe));
        assert_eq!(ctl.required_mode(&drive(), RoombaMode::Full), None);
    }

    #[test]
    fn queries_require_the_robot_awake() {
        let ctl = create();
        let query = RoombaCommand::FirmwareDate;
        assert_eq!(ctl.required_mode(&query, RoombaMode::Off), Some(RoombaMode::Passive));
        assert_eq!(ctl.required_mode(&query, RoombaMode::Uninitialized), None);
    }

    #[test]
    fn roomba_safe_command_requires_full_first() {
        assert_eq!(
            roomba().required_mode(&RoombaCommand::Safe, RoombaMode::Passive),
            Some(RoombaMode::Full)
        );
        assert_eq!(create().required_mode(&RoombaCommand::Safe, RoombaMode::Passive), None);
    }

    #[test]
    fn create_demo_runs_in_any_awake_mode() {
        let ctl = create();
        assert_eq!(ctl.required_mode(&RoombaCommand::Max, RoombaMode::Passive), None);
        assert_eq!(
            ctl.required_mode(&RoombaCommand::Max, RoombaMode::Off),
            Some(RoombaMode::Passive)
        );
        assert_eq!(
            roomba().required_mode(&RoombaCommand::Max, RoombaMode::Passive),
            Some(RoombaMode::Safe)
        );
    }

    #[test]
    fn reset_is_always_allowed() {
        assert_eq!(create().required_mode(&RoombaCommand::Reset, RoombaMode::Off), None);
    }

    // ── Transition primitives ────────────────────────────────────────────────

    #[test]
    fn nothing_can_be_sent_to_a_sleeping_robot() {
        assert_eq!(create().transition_primitive(RoombaMode::Safe, RoombaMode::Off), None);
        assert!(roomba().needs_wake_up(RoombaMode::Passive, RoombaMode::Off));
        assert!(!create().needs_wake_up(RoombaMode::Passive, RoombaMode::Off));
    }

    #[test]
    fn roomba_passive_to_full_takes_two_steps() {
        let ctl = roomba();
        assert_eq!(
            ctl.transition_primitive(RoombaMode::Full, RoombaMode::Passive),
            Some(RoombaCommand::Control)
        );
        assert_eq!(
            ctl.transition_primitive(RoombaMode::Full, RoombaMode::Safe),
            Some(RoombaCommand::Full)
        );
        assert_eq!(ctl.transition_primitive(RoombaMode::Full, RoombaMode::Full), None);
    }

    #[test]
    fn safe_primitive_depends_on_model() {
        assert_eq!(
            roomba().transition_primitive(RoombaMode::Safe, RoombaMode::Passive),
            Some(RoombaCommand::Control)
        );
        assert_eq!(
            create().transition_primitive(RoombaMode::Safe, RoombaMode::Passive),
            Some(RoombaCommand::Safe)
        );
        assert_eq!(
            roomba().transition_primitive(RoombaMode::Safe, RoombaMode::Full),
            Some(RoombaCommand::Safe)
        );
    }

    #[test]
    fn mode_requests_map_to_primitives() {
        assert_eq!(create().mode_command(RoombaMode::Off), Some(RoombaCommand::Reset));
        assert_eq!(roomba().mode_command(RoombaMode::Off), Some(RoombaCommand::Power));
        assert_eq!(create().mode_command(RoombaMode::Passive), Some(RoombaCommand::Start));
        assert_eq!(create().mode_command(RoombaMode::Safe), Some(RoombaCommand::Safe));
        assert_eq!(create().mode_command(RoombaMode::Shutdown), None);
    }

    // ── Maintain mode ────────────────────────────────────────────────────────

    fn maintained(mode: RoombaMode, maintain: RoombaMode) -> RobotState {
        let mut state = RobotState::new(RobotModel::Create, ConnectionKind::CreateSerial);
        state.set_mode(mode);
        state.maintain_mode = Some(maintain);
        state
    }

    #[test]
    fn grace_window_is_at_least_one_second() {
        assert_eq!(create().grace(), Duration::from_secs(1));
        let slow = ModeController::new(RobotModel::Create, Duration::from_secs(3));
        assert_eq!(slow.grace(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn divergence_is_corrected_after_the_grace_window() {
        let mut ctl = create();
        let state = maintained(RoombaMode::Passive, RoombaMode::Full);
        let t0 = Instant::now();
        assert_eq!(ctl.check_maintain(&state, t0), None);
        assert_eq!(ctl.check_maintain(&state, t0 + Duration::from_millis(600)), None);
        assert_eq!(
            ctl.check_maintain(&state, t0 + Duration::from_millis(1000)),
            Some(RoombaMode::Full)
        );
        // The timer restarts after a correction.
        assert_eq!(ctl.check_maintain(&state, t0 + Duration::from_millis(1200)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn self_correcting_divergence_resets_the_timer() {
        let mut ctl = create();
        let t0 = Instant::now();
        assert_eq!(
            ctl.check_maintain(&maintained(RoombaMode::Passive, RoombaMode::Safe), t0),
            None
        );
        assert_eq!(
            ctl.check_maintain(
                &maintained(RoombaMode::Safe, RoombaMode::Safe),
                t0 + Duration::from_millis(500)
            ),
            None
        );
        assert_eq!(
            ctl.check_maintain(
                &maintained(RoombaMode::Passive, RoombaMode::Safe),
                t0 + Duration::from_millis(1100)
            ),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn passive_is_not_supervised_by_the_timer() {
        let mut ctl = create();
        let state = maintained(RoombaMode::Safe, RoombaMode::Passive);
        let t0 = Instant::now();
        assert_eq!(ctl.check_maintain(&state, t0), None);
        assert_eq!(ctl.check_maintain(&state, t0 + Duration::from_secs(5)), None);
        assert_eq!(ctl.post_command_target(&state), Some(RoombaMode::Passive));
    }

    #[test]
    fn post_command_target_requires_initialization() {
        let ctl = create();
        let mut state = RobotState::new(RobotModel::Create, ConnectionKind::CreateSerial);
        state.maintain_mode = Some(RoombaMode::Full);
        assert_eq!(ctl.post_command_target(&state), None);
        state.set_mode(RoombaMode::Passive);
        assert_eq!(ctl.post_command_target(&state), Some(RoombaMode::Full));
    }
}
