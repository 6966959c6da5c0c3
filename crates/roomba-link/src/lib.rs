//! `roomba-link` – the byte-level side of the robot link.
//!
//! - [`ByteStreamBuffer`] – reassembles response frames from arbitrary read chunks.
//! - [`SerialTransport`] – async trait over the physical link, with
//!   [`SerialPortTransport`] and [`TcpTransport`] implementations.
//! - [`SimulatedRobot`] – a transport that plays the robot's part.
//! - [`MockTransport`] – scripted transport for tests.

pub mod buffer;
pub mod mock;
pub mod sim;
pub mod transport;

pub use buffer::{ByteStreamBuffer, DEFAULT_CAPACITY};
pub use mock::MockTransport;
pub use sim::SimulatedRobot;
pub use transport::{SerialPortTransport, SerialTransport, TcpTransport};
