use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandCode;
use crate::mode::RoombaMode;

/// Every fault a command can resolve with.
///
/// Each pending command resolves exactly once, either with a response or
/// with one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoombaError {
    /// The link could not be opened, written or read.
    #[error("Transport Error: {0}")]
    Transport(String),

    /// No valid response arrived before the command expired.
    #[error("Timeout waiting for a response to {command}")]
    Timeout { command: CommandCode },

    /// The bytes at the head of the buffer did not decode as the expected packet.
    #[error("Framing Error on {command}: {details}")]
    Framing { command: CommandCode, details: String },

    /// A later command's response arrived first, so this one was skipped.
    #[error("Response was lost on the buffer for {command}")]
    ResponseLost { command: CommandCode },

    /// The mode change a command depends on did not complete.
    #[error("Unable to enter {required} mode: {details}")]
    Precondition { required: RoombaMode, details: String },

    #[error("Unsupported robot model: {0}")]
    UnsupportedModel(String),

    #[error("Unsupported connection: {0}")]
    UnsupportedConnection(String),

    #[error("Link is not connected")]
    NotConnected,

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The driver has been shut down.
    #[error("Driver closed")]
    Closed,
}

impl From<std::io::Error> for RoombaError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
