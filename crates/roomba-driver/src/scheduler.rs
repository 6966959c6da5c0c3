//! Serial command scheduling.
//!
//! The scheduler task takes commands one at a time from its queue, brings
//! the robot into the mode each one needs, and hands it to the link actor.
//! It also owns the poll timer.
//!
//! | Job | Effect |
//! |-----|--------|
//! | `Issue` | mode precondition, then the command itself, then maintain |
//! | `SetMode` | record the maintain request, then send the mode primitive |
//! | timer tick | maintain-mode supervision, then a full-sensor query |
//!
//! Drive and DriveDirect jobs waiting in the queue are coalesced: only the
//! newest of a run is written, the older ones are acknowledged immediately.

use std::collections::VecDeque;
use std::time::Duration;

use roomba_types::{
    CommandCode, RobotModel, Response, RoombaCommand, RoombaError, RoombaMode, SensorPacket,
    drive_direct_as_drive,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::correlator::ResponseSink;
use crate::link::LinkHandle;
use crate::mode::{MAX_TRANSITION_STEPS, ModeController};
use crate::state::RobotState;

/// Length of each phase of the RTS wake-up pulse.
pub const WAKE_PULSE: Duration = Duration::from_millis(100);

/// A tick closer than this to its slot fires almost immediately instead.
const MIN_TIMER_WAIT: Duration = Duration::from_millis(10);

const REQUEST_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Jobs and the queue
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum JobKind {
    Issue {
        command: RoombaCommand,
        timeout: Option<Duration>,
    },
    SetMode {
        mode: RoombaMode,
        maintain: bool,
    },
}

#[derive(Debug)]
pub struct Job {
    pub kind: JobKind,
    pub reply: Option<ResponseSink>,
}

impl Job {
    fn coalesce_key(&self) -> Option<CommandCode> {
        match &self.kind {
            JobKind::Issue { command, .. } if command.is_coalescable() => Some(command.code()),
            _ => None,
        }
    }

    fn resolve(self, result: Result<Response, RoombaError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

/// FIFO of waiting jobs.
#[derive(Debug, Default)]
pub struct CommandQueue {
    jobs: VecDeque<Job>,
}

impl CommandQueue {
    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Next job to run.
    ///
    /// For a Drive or DriveDirect job, every later job with the same code is
    /// folded in: the older ones are acknowledged with `mode` and the newest
    /// one is returned in place of the first.
    pub fn pop(&mut self, mode: RoombaMode) -> Option<Job> {
        let first = self.jobs.pop_front()?;
        let Some(code) = first.coalesce_key() else {
            return Some(first);
        };

        let mut newest = first;
        let mut kept = VecDeque::with_capacity(self.jobs.len());
        let mut folded = 0usize;
        for job in self.jobs.drain(..) {
            if job.coalesce_key() == Some(code) {
                let older = std::mem::replace(&mut newest, job);
                older.resolve(Ok(Response::received(code, mode)));
                folded += 1;
            } else {
                kept.push_back(job);
            }
        }
        self.jobs = kept;
        if folded > 0 {
            debug!(command = %code, folded, "coalesced motion commands");
        }
        Some(newest)
    }

    /// Fault every waiting job.
    pub fn drain_with(&mut self, err: &RoombaError) {
        for job in self.jobs.drain(..) {
            job.resolve(Err(err.clone()));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Poll timer
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-rate timer whose slots advance from the previous slot, not from
/// the time a tick was handled.
#[derive(Debug)]
pub struct PollTimer {
    interval: Duration,
    scheduled: Option<Instant>,
    fire_at: Option<Instant>,
}

impl PollTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            scheduled: None,
            fire_at: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.fire_at.is_some()
    }

    pub fn start(&mut self, now: Instant) {
        let slot = now + self.interval;
        self.scheduled = Some(slot);
        self.fire_at = Some(slot);
    }

    /// Move to the next slot after a tick was handled at `now`.
    pub fn reschedule(&mut self, now: Instant) {
        let Some(previous) = self.scheduled else {
            return;
        };
        let slot = previous + self.interval;
        self.scheduled = Some(slot);
        let wait = slot.saturating_duration_since(now);
        self.fire_at = Some(if wait < MIN_TIMER_WAIT {
            now + Duration::from_millis(1)
        } else {
            slot
        });
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.fire_at.is_some_and(|at| at <= now)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.fire_at
    }

    pub fn stop(&mut self) {
        self.scheduled = None;
        self.fire_at = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler actor
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SchedulerRequest {
    Issue {
        command: RoombaCommand,
        timeout: Option<Duration>,
        reply: Option<ResponseSink>,
    },
    SetMode {
        mode: RoombaMode,
        maintain: bool,
        reply: Option<ResponseSink>,
    },
    StartPolling,
    Close {
        reply: oneshot::Sender<()>,
    },
}

pub struct CommandScheduler {
    link: LinkHandle,
    state: watch::Receiver<RobotState>,
    modes: ModeController,
    queue: CommandQueue,
    timer: PollTimer,
    poll_query: Option<RoombaCommand>,
}

impl CommandScheduler {
    pub fn new(link: LinkHandle, state: watch::Receiver<RobotState>, config: &DriverConfig) -> Self {
        let poll_query = config.polling_interval().map(|_| RoombaCommand::Sensors {
            packet: SensorPacket::full_query(config.model),
        });
        Self {
            link,
            state,
            modes: ModeController::new(config.model, config.tick_interval()),
            queue: CommandQueue::default(),
            timer: PollTimer::new(config.tick_interval()),
            poll_query,
        }
    }

    pub fn spawn(self) -> (mpsc::Sender<SchedulerRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (tx, task)
    }

    fn model(&self) -> RobotModel {
        self.modes.model()
    }

    fn current_mode(&self) -> RoombaMode {
        self.state.borrow().mode
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerRequest>) {
        debug!(tick = ?self.timer.interval(), "scheduler started");
        loop {
            // Take everything already waiting so motion commands can fold.
            loop {
                match rx.try_recv() {
                    Ok(request) => {
                        if let Some(reply) = self.accept(request) {
                            self.shutdown(reply).await;
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        if self.queue.is_empty() {
                            self.timer.stop();
                            debug!("scheduler stopped");
                            return;
                        }
                        break;
                    }
                }
            }

            if self.timer.is_due(Instant::now()) {
                self.on_tick().await;
                continue;
            }

            if let Some(job) = self.queue.pop(self.current_mode()) {
                self.run_job(job).await;
                continue;
            }

            let deadline = self.timer.deadline();
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => {
                        if let Some(reply) = self.accept(request) {
                            self.shutdown(reply).await;
                            return;
                        }
                    }
                    None => {
                        self.timer.stop();
                        debug!("scheduler stopped");
                        return;
                    }
                },
                _ = wait_until(deadline) => {}
            }
        }
    }

    /// Queue a request.  Returns the reply channel of a close request.
    fn accept(&mut self, request: SchedulerRequest) -> Option<oneshot::Sender<()>> {
        match request {
            SchedulerRequest::Issue {
                command,
                timeout,
                reply,
            } => self.queue.push(Job {
                kind: JobKind::Issue { command, timeout },
                reply,
            }),
            SchedulerRequest::SetMode {
                mode,
                maintain,
                reply,
            } => self.queue.push(Job {
                kind: JobKind::SetMode { mode, maintain },
                reply,
            }),
            SchedulerRequest::StartPolling => {
                if !self.timer.is_running() {
                    self.timer.start(Instant::now());
                    info!(interval = ?self.timer.interval(), polling = self.poll_query.is_some(), "poll timer started");
                }
            }
            SchedulerRequest::Close { reply } => return Some(reply),
        }
        None
    }

    async fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        self.timer.stop();
        self.queue.drain_with(&RoombaError::Closed);
        if let Err(e) = self.link.close().await {
            debug!(error = %e, "link already closed");
        }
        let _ = reply.send(());
        debug!("scheduler stopped");
    }

    async fn run_job(&mut self, job: Job) {
        let Job { kind, reply } = job;
        let result = match kind {
            JobKind::Issue { command, timeout } => {
                self.process_command(command, timeout, true).await
            }
            JobKind::SetMode { mode, maintain } => self.set_mode(mode, maintain).await,
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    async fn set_mode(&mut self, mode: RoombaMode, maintain: bool) -> Result<Response, RoombaError> {
        if maintain && !mode.can_be_maintained() {
            return Err(RoombaError::InvalidCommand(format!(
                "{mode} mode cannot be maintained"
            )));
        }
        let Some(command) = self.modes.mode_command(mode) else {
            return Err(RoombaError::InvalidCommand(format!(
                "{mode} mode cannot be requested"
            )));
        };
        self.link
            .set_maintain_mode(maintain.then_some(mode))
            .await?;
        self.process_command(command, None, true).await
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let state = self.state.borrow().clone();
        match state.mode {
            RoombaMode::Shutdown => {
                self.timer.stop();
                return;
            }
            _ if !state.initialized => {
                self.timer.reschedule(now);
                return;
            }
            _ => {}
        }

        if let Some(target) = self.modes.check_maintain(&state, now)
            && let Err(e) = self.change_to_mode(target).await
        {
            warn!(target = %target, error = %e, "maintain mode correction failed");
        }

        if let Some(query) = self.poll_query.clone()
            && let Err(e) = self.process_command(query, None, false).await
        {
            debug!(error = %e, "sensor poll failed");
        }

        self.timer.reschedule(Instant::now());
    }

    /// Run one command through the mode precondition and the link.
    ///
    /// With `maintain_after`, a maintained mode the command knocked the
    /// robot out of is restored afterwards, whether or not the command
    /// itself succeeded.
    ///
    /// # Errors
    ///
    /// * [`RoombaError::InvalidCommand`] for a Create-only command on a Roomba.
    /// * [`RoombaError::Precondition`] when a primitive on the way to the
    ///   required mode failed.
    /// * Whatever the link resolved the command with.
    #[instrument(skip_all, fields(command = %command.code(), maintain_after = maintain_after))]
    pub async fn process_command(
        &mut self,
        command: RoombaCommand,
        timeout: Option<Duration>,
        maintain_after: bool,
    ) -> Result<Response, RoombaError> {
        let command = match command {
            RoombaCommand::DriveDirect { right, left } if self.model() == RobotModel::Roomba => {
                drive_direct_as_drive(right, left)
            }
            other => other,
        };
        if self.model() == RobotModel::Roomba && command.create_only() {
            return Err(RoombaError::InvalidCommand(format!(
                "{} is only available on the Create",
                command.code()
            )));
        }

        if let Some(required) = self.modes.required_mode(&command, self.current_mode()) {
            debug!(command = %command.code(), required = %required, "mode precondition");
            self.change_to_mode(required)
                .await
                .map_err(|e| RoombaError::Precondition {
                    required,
                    details: e.to_string(),
                })?;
        }

        let result = self.link.atomic(command, timeout).await;

        if maintain_after {
            let state = self.state.borrow().clone();
            if let Some(target) = self.modes.post_command_target(&state)
                && let Err(e) = self.change_to_mode(target).await
            {
                warn!(target = %target, error = %e, "could not restore maintained mode");
            }
        }
        result
    }

    /// Send primitives until the tracked mode is `target` or nothing more
    /// can be sent.  Stopping short is not an error: a sleeping Create, for
    /// one, still answers queries.
    ///
    /// # Errors
    ///
    /// Returns the first failing primitive's error.
    #[instrument(skip_all, fields(target = %target))]
    pub async fn change_to_mode(&mut self, target: RoombaMode) -> Result<(), RoombaError> {
        if self.modes.needs_wake_up(target, self.current_mode()) {
            wake_pulse(&self.link).await;
            self.link.force_mode(RoombaMode::Passive).await?;
        }

        for _ in 0..MAX_TRANSITION_STEPS {
            let Some(primitive) = self.modes.transition_primitive(target, self.current_mode()) else {
                break;
            };
            debug!(target = %target, primitive = %primitive.code(), "mode transition step");
            self.link.atomic(primitive, None).await?;
        }

        let reached = self.current_mode();
        if reached != target {
            debug!(target = %target, reached = %reached, "mode transition stopped short");
        }
        Ok(())
    }
}

/// Pulse RTS low, high, low.  A robot that ignores the pulse is caught later
/// by the telemetry mode check, so failures are only logged.
pub(crate) async fn wake_pulse(link: &LinkHandle) {
    info!("waking the robot");
    for (ix, level) in [false, true, false].into_iter().enumerate() {
        if let Err(e) = link.set_rts(level).await {
            warn!(error = %e, "RTS wake-up pulse failed");
            return;
        }
        if ix < 2 {
            sleep(WAKE_PULSE).await;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomba_types::Packet;

    fn issue(command: RoombaCommand) -> (Job, oneshot::Receiver<Result<Response, RoombaError>>) {
        let (tx, rx) = oneshot::channel();
        let job = Job {
            kind: JobKind::Issue {
                command,
                timeout: None,
            },
            reply: Some(tx),
        };
        (job, rx)
    }

    fn direct(speed: i16) -> RoombaCommand {
        RoombaCommand::DriveDirect {
            right: speed,
            left: speed,
        }
    }

    #[test]
    fn queue_is_fifo_for_ordinary_commands() {
        let mut queue = CommandQueue::default();
        queue.push(issue(RoombaCommand::Start).0);
        queue.push(issue(RoombaCommand::Safe).0);
        let first = queue.pop(RoombaMode::Passive).unwrap();
        assert!(matches!(
            first.kind,
            JobKind::Issue {
                command: RoombaCommand::Start,
                ..
            }
        ));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn only_newest_drive_direct_survives() {
        let mut queue = CommandQueue::default();
        let (a, rx_a) = issue(direct(100));
        let (b, rx_b) = issue(direct(200));
        let (c, _rx_c) = issue(direct(300));
        queue.push(a);
        queue.push(b);
        queue.push(c);

        let job = queue.pop(RoombaMode::Safe).unwrap();
        assert!(matches!(
            job.kind,
            JobKind::Issue {
                command: RoombaCommand::DriveDirect { right: 300, .. },
                ..
            }
        ));
        assert!(queue.is_empty());
        for rx in [rx_a, rx_b] {
            let response = rx.await.unwrap().unwrap();
            assert_eq!(
                response.packet,
                Packet::CommandReceived {
                    code: CommandCode::DriveDirect
                }
            );
            assert_eq!(response.mode, RoombaMode::Safe);
        }
    }

    #[test]
    fn coalescing_keeps_other_commands_in_order() {
        let mut queue = CommandQueue::default();
        queue.push(issue(direct(100)).0);
        queue.push(issue(RoombaCommand::Leds {
            bits: 0x08,
            power_color: 0,
            power_intensity: 255,
        })
        .0);
        queue.push(issue(direct(300)).0);
        queue.push(issue(RoombaCommand::stop()).0);

        let first = queue.pop(RoombaMode::Safe).unwrap();
        assert!(matches!(
            first.kind,
            JobKind::Issue {
                command: RoombaCommand::DriveDirect { right: 300, .. },
                ..
            }
        ));
        // Drive is a different code and is not folded into DriveDirect.
        let codes: Vec<_> = std::iter::from_fn(|| queue.pop(RoombaMode::Safe))
            .map(|job| match job.kind {
                JobKind::Issue { command, .. } => command.code(),
                JobKind::SetMode { .. } => CommandCode::Start,
            })
            .collect();
        assert_eq!(codes, vec![CommandCode::Leds, CommandCode::Drive]);
    }

    #[test]
    fn drain_faults_everything() {
        let mut queue = CommandQueue::default();
        let (job, mut rx) = issue(RoombaCommand::Start);
        queue.push(job);
        queue.drain_with(&RoombaError::Closed);
        assert_eq!(rx.try_recv().unwrap(), Err(RoombaError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_slots_do_not_drift() {
        let interval = Duration::from_millis(200);
        let mut timer = PollTimer::new(interval);
        let t0 = Instant::now();
        timer.start(t0);
        assert_eq!(timer.deadline(), Some(t0 + interval));
        assert!(!timer.is_due(t0));

        // Handling the tick took 30 ms; the next slot is still t0 + 400.
        let handled = t0 + interval + Duration::from_millis(30);
        assert!(timer.is_due(handled));
        timer.reschedule(handled);
        assert_eq!(timer.deadline(), Some(t0 + 2 * interval));
    }

    #[tokio::test(start_paused = true)]
    async fn late_timer_fires_soon() {
        let interval = Duration::from_millis(200);
        let mut timer = PollTimer::new(interval);
        let t0 = Instant::now();
        timer.start(t0);
        let handled = t0 + Duration::from_millis(395);
        timer.reschedule(handled);
        assert_eq!(timer.deadline(), Some(handled + Duration::from_millis(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_fires() {
        let mut timer = PollTimer::new(Duration::from_millis(50));
        timer.start(Instant::now());
        timer.stop();
        assert!(!timer.is_running());
        assert!(!timer.is_due(Instant::now() + Duration::from_secs(10)));
        timer.reschedule(Instant::now());
        assert_eq!(timer.deadline(), None);
    }
}
