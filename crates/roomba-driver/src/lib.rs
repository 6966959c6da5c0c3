//! `roomba-driver` – command correlation, mode control and scheduling for an
//! iRobot Roomba or Create on a serial link.
//!
//! | Module | Role |
//! |---|---|
//! | [`config`] | [`DriverConfig`], the connect-time settings snapshot |
//! | [`state`] | [`RobotState`], the last known mode and sensor snapshots |
//! | [`decoder`] | [`PacketDecoder`]: bytes to typed packets plus change detection |
//! | [`correlator`] | [`CommandCorrelator`]: pending commands matched FIFO against the buffer |
//! | [`mode`] | [`ModeController`]: preconditions, transitions and maintain mode |
//! | [`link`] | The link actor owning transport, buffer and pending queue |
//! | [`scheduler`] | [`CommandScheduler`]: one command at a time, coalescing, poll timer |
//! | [`bus`] | [`NotificationBus`]: per-subscriber change notifications |
//! | [`driver`] | [`RoombaDriver`], the public handle |
//!
//! # Example
//!
//! ```ignore
//! let sim = roomba_link::SimulatedRobot::new(RobotModel::Create);
//! let driver = RoombaDriver::connect(DriverConfig::default(), Box::new(sim)).await?;
//! driver.issue(RoombaCommand::Drive { velocity: 200, radius: DRIVE_STRAIGHT_RADIUS }).await?;
//! ```

pub mod bus;
pub mod config;
pub mod correlator;
pub mod decoder;
pub mod driver;
pub mod link;
pub mod mode;
pub mod scheduler;
pub mod state;

pub use bus::{NotificationBus, SubscriberId, Subscription};
pub use config::DriverConfig;
pub use correlator::CommandCorrelator;
pub use decoder::PacketDecoder;
pub use driver::RoombaDriver;
pub use link::LinkHandle;
pub use mode::ModeController;
pub use scheduler::CommandScheduler;
pub use state::RobotState;
