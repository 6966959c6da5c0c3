//! Public entry point.
//!
//! [`RoombaDriver::connect`] opens the link, brings the robot into passive
//! mode (or the configured maintained mode) and starts the poll timer.  The
//! returned handle is cheap to clone; all clones drive the same robot.

use std::sync::Arc;
use std::time::Duration;

use roomba_link::SerialTransport;
use roomba_types::{
    RobotModel, Response, RoombaCommand, RoombaError, RoombaMode, SensorCategory,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::bus::{NotificationBus, SubscriberId, Subscription};
use crate::config::DriverConfig;
use crate::link::{LinkHandle, LinkState};
use crate::scheduler::{CommandScheduler, SchedulerRequest, wake_pulse};
use crate::state::RobotState;

#[derive(Clone)]
pub struct RoombaDriver {
    scheduler: mpsc::Sender<SchedulerRequest>,
    link: LinkHandle,
    state: watch::Receiver<RobotState>,
    bus: NotificationBus,
    config: Arc<DriverConfig>,
}

impl RoombaDriver {
    /// Open `transport` and initialise the robot.
    ///
    /// # Errors
    ///
    /// * [`RoombaError::UnsupportedConnection`] and friends from
    ///   [`DriverConfig::validate`].
    /// * Any transport error while opening the link.
    /// * [`RoombaError::NotConnected`] when the robot never left the
    ///   uninitialised mode.
    pub async fn connect(
        config: DriverConfig,
        transport: Box<dyn SerialTransport>,
    ) -> Result<Self, RoombaError> {
        config.validate()?;

        let bus = NotificationBus::default();
        let (link_state, state) = LinkState::new(transport, &config, bus.clone());
        let (link, _link_task) = link_state.spawn();
        if let Err(e) = link.open().await {
            let _ = link.close().await;
            return Err(e);
        }

        let (scheduler, _scheduler_task) =
            CommandScheduler::new(link.clone(), state.clone(), &config).spawn();
        let driver = Self {
            scheduler,
            link,
            state,
            bus,
            config: Arc::new(config),
        };

        // A Roomba may be asleep and deaf to everything until woken.
        if driver.config.model == RobotModel::Roomba {
            wake_pulse(&driver.link).await;
        }

        match driver.issue(RoombaCommand::FirmwareDate).await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "firmware date query failed"),
        }

        if let Err(e) = driver.set_mode(RoombaMode::Passive, false).await {
            warn!(error = %e, "could not start the open interface");
        }
        if let Some(mode) = driver.config.maintain_mode
            && let Err(e) = driver.set_mode(mode, true).await
        {
            warn!(mode = %mode, error = %e, "could not enter the maintained mode");
        }

        let mode = driver.state.borrow().mode;
        if mode == RoombaMode::Uninitialized {
            driver.close().await;
            return Err(RoombaError::NotConnected);
        }

        driver
            .scheduler
            .send(SchedulerRequest::StartPolling)
            .await
            .map_err(|_| RoombaError::Closed)?;
        info!(model = %driver.config.model, port = %driver.config.port, mode = %mode, "robot connected");
        Ok(driver)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Send `command` and wait for its response.
    ///
    /// # Errors
    ///
    /// [`RoombaError::InvalidCommand`] for out-of-range arguments, otherwise
    /// whatever the command resolved with.
    pub async fn issue(&self, command: RoombaCommand) -> Result<Response, RoombaError> {
        self.issue_with_timeout(command, None).await
    }

    /// Like [`issue`](Self::issue) with a per-command response timeout.
    pub async fn issue_with_timeout(
        &self,
        command: RoombaCommand,
        timeout: Option<Duration>,
    ) -> Result<Response, RoombaError> {
        command.validate().map_err(RoombaError::InvalidCommand)?;
        let (reply, rx) = oneshot::channel();
        self.scheduler
            .send(SchedulerRequest::Issue {
                command,
                timeout,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RoombaError::Closed)?;
        rx.await.map_err(|_| RoombaError::Closed)?
    }

    /// Queue `command` without waiting for it to be sent.
    pub async fn issue_no_wait(&self, command: RoombaCommand) -> Result<(), RoombaError> {
        command.validate().map_err(RoombaError::InvalidCommand)?;
        self.scheduler
            .send(SchedulerRequest::Issue {
                command,
                timeout: None,
                reply: None,
            })
            .await
            .map_err(|_| RoombaError::Closed)
    }

    /// Request `mode`, and keep the robot there when `maintain` is set.
    pub async fn set_mode(&self, mode: RoombaMode, maintain: bool) -> Result<Response, RoombaError> {
        let (reply, rx) = oneshot::channel();
        self.scheduler
            .send(SchedulerRequest::SetMode {
                mode,
                maintain,
                reply: Some(reply),
            })
            .await
            .map_err(|_| RoombaError::Closed)?;
        rx.await.map_err(|_| RoombaError::Closed)?
    }

    /// Snapshot of the robot state.
    pub fn state(&self) -> RobotState {
        self.state.borrow().clone()
    }

    /// Receiver that is notified on every state update.
    pub fn watch_state(&self) -> watch::Receiver<RobotState> {
        self.state.clone()
    }

    pub fn subscribe(&self, categories: impl IntoIterator<Item = SensorCategory>) -> Subscription {
        self.bus.subscribe(categories)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Fault everything pending, stop polling and release the port.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .scheduler
            .send(SchedulerRequest::Close { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        } else {
            let _ = self.link.close().await;
        }
    }
}
