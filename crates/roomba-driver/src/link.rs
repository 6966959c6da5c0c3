//! The link actor.
//!
//! Everything mutable about one serial link (transport, receive buffer,
//! pending queue and robot state) lives in [`LinkState`], owned by a single
//! Tokio task.  Other tasks talk to it through a [`LinkHandle`], which sends
//! typed [`LinkRequest`]s over an `mpsc` channel and awaits `oneshot`
//! replies.
//!
//! # Read cadence
//!
//! The actor only reads while responses are outstanding: once 40 ms after a
//! response-expecting command is written, then every 15 ms until the queue
//! drains.  Expired entries are only faulted on a pass that matched nothing,
//! so a late but complete response is never thrown away.

use std::time::Duration;

use chrono::Utc;
use roomba_link::{ByteStreamBuffer, SerialTransport};
use roomba_types::{
    CommandCode, Notification, NotificationPayload, Response, RoombaCommand, RoombaError,
    RoombaMode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, instrument};

use crate::bus::NotificationBus;
use crate::config::DriverConfig;
use crate::correlator::{CommandCorrelator, MatchEvent, PendingEntry, ResponseSink};
use crate::decoder::{Decoded, PacketDecoder};
use crate::state::RobotState;

/// Delay before the first read after a response-expecting command.
pub const INITIAL_RESPONSE_DELAY: Duration = Duration::from_millis(40);

/// Delay between reads while responses are outstanding.
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(15);

const READ_CHUNK: usize = 256;
const REQUEST_CAPACITY: usize = 64;

/// Messages understood by the link actor.
#[derive(Debug)]
pub enum LinkRequest {
    Open {
        reply: oneshot::Sender<Result<(), RoombaError>>,
    },
    /// Write one command and correlate its response.
    Atomic {
        command: RoombaCommand,
        timeout: Option<Duration>,
        reply: Option<ResponseSink>,
    },
    SetMaintainMode {
        mode: Option<RoombaMode>,
        reply: oneshot::Sender<()>,
    },
    /// Overwrite the tracked mode without talking to the robot.
    ForceMode {
        mode: RoombaMode,
        reply: oneshot::Sender<()>,
    },
    SetRts {
        level: bool,
        reply: oneshot::Sender<Result<(), RoombaError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

pub struct LinkState {
    transport: Box<dyn SerialTransport>,
    buffer: ByteStreamBuffer,
    correlator: CommandCorrelator,
    decoder: PacketDecoder,
    robot: RobotState,
    state_tx: watch::Sender<RobotState>,
    bus: NotificationBus,
    stop_on_resync: bool,
    next_read: Option<Instant>,
}

impl LinkState {
    pub fn new(
        transport: Box<dyn SerialTransport>,
        config: &DriverConfig,
        bus: NotificationBus,
    ) -> (Self, watch::Receiver<RobotState>) {
        let mut robot = RobotState::new(config.model, config.connection);
        robot.maintain_mode = config.maintain_mode;
        let (state_tx, state_rx) = watch::channel(robot.clone());
        let link = Self {
            transport,
            buffer: ByteStreamBuffer::new(config.buffer_capacity),
            correlator: CommandCorrelator::new(config.command_timeout()),
            decoder: PacketDecoder::new(config.model),
            robot,
            state_tx,
            bus,
            stop_on_resync: config.stop_on_resync,
            next_read: None,
        };
        (link, state_rx)
    }

    /// Run the actor on its own task.
    pub fn spawn(self) -> (LinkHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (LinkHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<LinkRequest>) {
        debug!(link = %self.transport.describe(), "link actor started");
        loop {
            let read_at = self.next_read;
            tokio::select! {
                request = rx.recv() => match request {
                    Some(LinkRequest::Close { reply }) => {
                        self.close().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    None => {
                        self.close().await;
                        break;
                    }
                },
                _ = wait_until(read_at) => {
                    self.next_read = None;
                    self.data_waiting().await;
                }
            }
        }
        debug!("link actor stopped");
    }

    async fn handle(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Open { reply } => {
                let result = self.transport.open().await;
                match &result {
                    Ok(()) => info!(link = %self.transport.describe(), "link opened"),
                    Err(e) => error!(link = %self.transport.describe(), error = %e, "open failed"),
                }
                let _ = reply.send(result);
            }
            LinkRequest::Atomic {
                command,
                timeout,
                reply,
            } => self.process_atomic(command, timeout, reply).await,
            LinkRequest::SetMaintainMode { mode, reply } => {
                if self.robot.maintain_mode != mode {
                    self.robot.maintain_mode = mode;
                    info!(maintain = ?mode, "maintain mode changed");
                    self.publish(self.robot.mode_payload());
                    self.state_tx.send_replace(self.robot.clone());
                }
                let _ = reply.send(());
            }
            LinkRequest::ForceMode { mode, reply } => {
                self.update_mode(mode);
                let _ = reply.send(());
            }
            LinkRequest::SetRts { level, reply } => {
                let _ = reply.send(self.transport.set_rts(level).await);
            }
            LinkRequest::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
            }
        }
    }

    #[instrument(skip_all, fields(command = %command.code()))]
    async fn process_atomic(
        &mut self,
        command: RoombaCommand,
        timeout: Option<Duration>,
        reply: Option<ResponseSink>,
    ) {
        let code = command.code();
        if !self.transport.is_open() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(RoombaError::NotConnected));
            }
            return;
        }

        let prior = self.robot.mode;
        let new_mode = self.decoder.derived_mode(&command, prior);
        let frame = command.encode();
        if let Err(e) = self.transport.write(&frame).await {
            error!(command = %code, error = %e, "write failed");
            if let Some(reply) = reply {
                let _ = reply.send(Err(e.clone()));
            }
            self.correlator.purge(&e);
            return;
        }
        debug!(command = %code, bytes = frame.len(), "command sent");

        // The acknowledgement must carry the mode the command produced.
        self.update_mode(new_mode);

        let now = Instant::now();
        let mode = self.robot.mode;
        let queued = self.correlator.register(
            command,
            timeout,
            reply,
            |cmd| Response::received(cmd.code(), mode),
            now,
        );
        if queued {
            self.schedule_read(now + INITIAL_RESPONSE_DELAY);
        }
    }

    fn schedule_read(&mut self, at: Instant) {
        self.next_read = Some(match self.next_read {
            Some(existing) if existing < at => existing,
            _ => at,
        });
    }

    async fn data_waiting(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.transport.read_available(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let dropped = self.buffer.feed(&chunk[..n]);
                    if dropped > 0 {
                        debug!(bytes = dropped, "receive buffer dropped bytes");
                    }
                    let skipped = self.buffer.skip_unrequested_text();
                    if skipped > 0 {
                        debug!(bytes = skipped, "skipped unrequested text");
                    }
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "read failed");
                    self.buffer.clear();
                    self.correlator.purge(&e);
                    return;
                }
            }
        }

        let matched = if !self.buffer.is_empty() && !self.correlator.is_empty() {
            self.analyze_buffer().await
        } else {
            false
        };
        if !matched {
            self.correlator.expire(Instant::now());
        }
        if !self.correlator.is_empty() {
            self.schedule_read(Instant::now() + RESPONSE_POLL_INTERVAL);
        }
    }

    /// Match as many buffered responses as possible.  Returns `true` when at
    /// least one command was answered.
    async fn analyze_buffer(&mut self) -> bool {
        let mut matched = false;
        let mut resyncs = Vec::new();
        while let Some(event) =
            self.correlator
                .try_match(&mut self.buffer, &self.decoder, &self.robot, Utc::now())
        {
            match event {
                MatchEvent::Matched { entry, decoded } => {
                    self.apply(entry, decoded);
                    matched = true;
                }
                MatchEvent::Resync { command } => resyncs.push(command),
            }
        }
        for command in resyncs {
            self.resync(command).await;
        }
        matched
    }

    fn apply(&mut self, entry: PendingEntry, decoded: Decoded) {
        let Decoded {
            packet,
            mode,
            changed,
            firmware_date,
            ..
        } = decoded;
        let timestamp = Utc::now();

        if let Some(date) = firmware_date {
            info!(firmware = %date, "firmware date");
            self.robot.firmware_date = Some(date);
        }
        for payload in &changed {
            self.robot.store(payload);
        }
        self.robot.last_updated = Some(timestamp);
        if let Some(mode) = mode {
            self.update_mode(mode);
        } else {
            self.state_tx.send_replace(self.robot.clone());
        }
        for payload in changed {
            self.publish(payload);
        }
        entry.resolve(Ok(Response {
            packet,
            mode: self.robot.mode,
            timestamp,
        }));
    }

    async fn resync(&mut self, failed: RoombaCommand) {
        info!(command = %failed.code(), "resynchronizing link");
        if self.stop_on_resync {
            self.process_atomic(RoombaCommand::stop(), None, None).await;
        }
        if failed.code() != CommandCode::FirmwareDate {
            self.process_atomic(RoombaCommand::FirmwareDate, None, None).await;
        }
    }

    fn update_mode(&mut self, mode: RoombaMode) {
        if self.robot.set_mode(mode) {
            info!(mode = %mode, "mode changed");
            self.publish(self.robot.mode_payload());
        }
        self.state_tx.send_replace(self.robot.clone());
    }

    fn publish(&self, payload: NotificationPayload) {
        self.bus.publish(&Notification::new(payload));
    }

    async fn close(&mut self) {
        self.correlator.purge(&RoombaError::Closed);
        self.buffer.clear();
        self.next_read = None;
        self.update_mode(RoombaMode::Shutdown);
        if let Err(e) = self.transport.close().await {
            error!(error = %e, "closing the link failed");
        }
        info!(link = %self.transport.describe(), "link closed");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable sender side of the link actor.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    tx: mpsc::Sender<LinkRequest>,
}

impl LinkHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LinkRequest,
    ) -> Result<T, RoombaError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RoombaError::Closed)?;
        rx.await.map_err(|_| RoombaError::Closed)
    }

    pub async fn open(&self) -> Result<(), RoombaError> {
        self.request(|reply| LinkRequest::Open { reply }).await?
    }

    /// Write `command` and wait for its response.
    pub async fn atomic(
        &self,
        command: RoombaCommand,
        timeout: Option<Duration>,
    ) -> Result<Response, RoombaError> {
        self.request(|reply| LinkRequest::Atomic {
            command,
            timeout,
            reply: Some(reply),
        })
        .await?
    }

    /// Write `command` without waiting for anything but the enqueue.
    pub async fn send_no_wait(&self, command: RoombaCommand) -> Result<(), RoombaError> {
        self.tx
            .send(LinkRequest::Atomic {
                command,
                timeout: None,
                reply: None,
            })
            .await
            .map_err(|_| RoombaError::Closed)
    }

    pub async fn set_maintain_mode(&self, mode: Option<RoombaMode>) -> Result<(), RoombaError> {
        self.request(|reply| LinkRequest::SetMaintainMode { mode, reply })
            .await
    }

    pub async fn force_mode(&self, mode: RoombaMode) -> Result<(), RoombaError> {
        self.request(|reply| LinkRequest::ForceMode { mode, reply })
            .await
    }

    pub async fn set_rts(&self, level: bool) -> Result<(), RoombaError> {
        self.request(|reply| LinkRequest::SetRts { level, reply })
            .await?
    }

    pub async fn close(&self) -> Result<(), RoombaError> {
        self.request(|reply| LinkRequest::Close { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomba_link::MockTransport;
    use roomba_types::{FirmwareDatePacket, Packet, SensorCategory, SensorPacket};

    struct Harness {
        mock: MockTransport,
        link: LinkHandle,
        state: watch::Receiver<RobotState>,
        bus: NotificationBus,
    }

    async fn harness(config: DriverConfig) -> Harness {
        let mock = MockTransport::new();
        let bus = NotificationBus::default();
        let (state, state_rx) = LinkState::new(Box::new(mock.clone()), &config, bus.clone());
        let (link, _task) = state.spawn();
        link.open().await.unwrap();
        Harness {
            mock,
            link,
            state: state_rx,
            bus,
        }
    }

    fn pose_query() -> RoombaCommand {
        RoombaCommand::Sensors {
            packet: SensorPacket::Pose,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_byte_command_is_acknowledged_with_new_mode() {
        let h = harness(DriverConfig::default()).await;
        let response = h.link.atomic(RoombaCommand::Start, None).await.unwrap();
        assert_eq!(
            response.packet,
            Packet::CommandReceived {
                code: CommandCode::Start
            }
        );
        assert_eq!(response.mode, RoombaMode::Passive);
        assert_eq!(h.state.borrow().mode, RoombaMode::Passive);
        assert_eq!(h.mock.written(), vec![vec![128]]);
    }

    #[tokio::test(start_paused = true)]
    async fn query_is_answered_from_inbound_bytes() {
        let h = harness(DriverConfig::default()).await;
        h.mock.push_inbound(&[0, 0, 0, 42, 0, 0]);
        let response = h.link.atomic(pose_query(), None).await.unwrap();
        let Packet::Pose(pose) = response.packet else {
            panic!("expected pose");
        };
        assert_eq!(pose.distance_mm(), 42);
        assert!(h.state.borrow().pose.is_some());
        assert!(h.state.borrow().last_updated.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_query_times_out() {
        let h = harness(DriverConfig::default()).await;
        let started = Instant::now();
        let err = h
            .link
            .atomic(pose_query(), Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoombaError::Timeout {
                command: CommandCode::Sensors
            }
        );
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn complete_response_after_deadline_is_still_delivered() {
        let h = harness(DriverConfig::default()).await;
        let link = h.link.clone();
        // Reads fall at 40, 55, 70, 85 and 100 ms; the entry expires at 95 ms.
        let pending = tokio::spawn(async move {
            link.atomic(pose_query(), Some(Duration::from_millis(95)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(97)).await;
        h.mock.push_inbound(&[0, 0, 0, 42, 0, 0]);

        let response = pending.await.unwrap().unwrap();
        let Packet::Pose(pose) = response.packet else {
            panic!("expected pose");
        };
        assert_eq!(pose.distance_mm(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn banner_text_is_skipped() {
        let h = harness(DriverConfig::default()).await;
        h.mock.push_inbound(b"bl-start\r\n");
        h.mock.push_inbound(&FirmwareDatePacket::encode_date(7, 3, 14, 10, 30));
        let response = h.link.atomic(RoombaCommand::FirmwareDate, None).await.unwrap();
        assert!(matches!(response.packet, Packet::FirmwareDate(_)));
        assert!(h.state.borrow().firmware_date.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_response_triggers_firmware_probe() {
        let h = harness(DriverConfig {
            stop_on_resync: true,
            ..DriverConfig::default()
        })
        .await;
        h.mock.push_inbound(&[0xFF; 10]);
        let err = h
            .link
            .atomic(
                RoombaCommand::Sensors {
                    packet: SensorPacket::BumpsCliffsAndWalls,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoombaError::Framing { .. }));
        // Query, then the stop and the probe.
        assert_eq!(h.mock.written_opcodes(), vec![142, 137, 8]);

        // The probe is answered and the link is usable again.
        h.mock.push_inbound(&FirmwareDatePacket::encode_date(7, 3, 14, 10, 30));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.state.borrow().firmware_date.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn identical_snapshots_publish_once() {
        let h = harness(DriverConfig::default()).await;
        let mut sub = h.bus.subscribe([SensorCategory::Pose]);
        for _ in 0..2 {
            h.mock.push_inbound(&[0, 0, 0, 7, 0, 0]);
            h.link.atomic(pose_query(), None).await.unwrap();
        }
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_reported() {
        let h = harness(DriverConfig::default()).await;
        h.mock.set_fail_writes(true);
        let err = h.link.atomic(RoombaCommand::Start, None).await.unwrap_err();
        assert!(matches!(err, RoombaError::Transport(_)));
        assert_eq!(h.state.borrow().mode, RoombaMode::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn close_faults_pending_and_shuts_down() {
        let h = harness(DriverConfig::default()).await;
        let link = h.link.clone();
        let pending = tokio::spawn(async move { link.atomic(pose_query(), None).await });
        tokio::task::yield_now().await;
        h.link.close().await.unwrap();
        assert_eq!(pending.await.unwrap(), Err(RoombaError::Closed));
        assert_eq!(h.state.borrow().mode, RoombaMode::Shutdown);
        assert!(!h.mock.is_open());
        assert_eq!(
            h.link.atomic(RoombaCommand::Start, None).await,
            Err(RoombaError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mode_changes_are_published() {
        let h = harness(DriverConfig::default()).await;
        let mut sub = h.bus.subscribe([SensorCategory::Mode]);
        h.link.atomic(RoombaCommand::Start, None).await.unwrap();
        h.link.set_maintain_mode(Some(RoombaMode::Full)).await.unwrap();
        let first = sub.recv().await.unwrap();
        assert_eq!(
            first.payload,
            NotificationPayload::Mode {
                mode: RoombaMode::Passive,
                maintain_mode: None
            }
        );
        let second = sub.recv().await.unwrap();
        assert_eq!(
            second.payload,
            NotificationPayload::Mode {
                mode: RoombaMode::Passive,
                maintain_mode: Some(RoombaMode::Full)
            }
        );
    }
}
