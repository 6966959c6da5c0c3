//! FIFO correlation of responses to the commands that produced them.
//!
//! Every command that expects response bytes is queued as a
//! [`PendingEntry`].  The entry resolves exactly once: matched, timed out,
//! lost behind a later match, or faulted during resynchronization.
//!
//! Matching walks the queue from the front.  An entry is only tried once
//! the buffer holds at least its expected response length.  When a later
//! entry matches, every entry ahead of it is faulted with
//! [`RoombaError::ResponseLost`].

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use roomba_link::ByteStreamBuffer;
use roomba_types::{Response, RoombaCommand, RoombaError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::decoder::{DecodeOutcome, Decoded, PacketDecoder};
use crate::state::RobotState;

/// Single-use reply channel of a command.
pub type ResponseSink = oneshot::Sender<Result<Response, RoombaError>>;

#[derive(Debug)]
pub struct PendingEntry {
    pub command: RoombaCommand,
    pub started_at: Instant,
    pub expires_at: Instant,
    sink: Option<ResponseSink>,
}

impl PendingEntry {
    /// Deliver the terminal result.  Internal probes carry no sink.
    pub fn resolve(mut self, result: Result<Response, RoombaError>) {
        if let Some(sink) = self.sink.take() {
            // The caller may have stopped waiting; that is not our fault.
            let _ = sink.send(result);
        }
    }
}

/// Result of one [`CommandCorrelator::try_match`] pass.
#[derive(Debug)]
pub enum MatchEvent {
    /// `entry` received `decoded`; its bytes are already consumed.
    Matched { entry: PendingEntry, decoded: Decoded },
    /// The bytes for `command` failed validation.  Buffer and queue have
    /// been purged.
    Resync { command: RoombaCommand },
}

#[derive(Debug)]
pub struct CommandCorrelator {
    pending: VecDeque<PendingEntry>,
    default_timeout: Duration,
}

impl CommandCorrelator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            default_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Commands still waiting, oldest first.
    pub fn pending_commands(&self) -> impl Iterator<Item = &RoombaCommand> {
        self.pending.iter().map(|e| &e.command)
    }

    /// Queue `command` if it expects a response; otherwise acknowledge it
    /// straight away with `ack`.
    ///
    /// Returns `true` when an entry was queued.
    pub fn register(
        &mut self,
        command: RoombaCommand,
        timeout: Option<Duration>,
        sink: Option<ResponseSink>,
        ack: impl FnOnce(&RoombaCommand) -> Response,
        now: Instant,
    ) -> bool {
        let entry = PendingEntry {
            expires_at: now + timeout.unwrap_or(self.default_timeout),
            started_at: now,
            command,
            sink,
        };
        if entry.command.expected_response_bytes() == 0 {
            let response = ack(&entry.command);
            entry.resolve(Ok(response));
            return false;
        }
        self.pending.push_back(entry);
        true
    }

    /// Try to match the buffered bytes against the pending queue.
    ///
    /// Call repeatedly until it returns `None`; more than one response may
    /// already be buffered.
    pub fn try_match(
        &mut self,
        buffer: &mut ByteStreamBuffer,
        decoder: &PacketDecoder,
        state: &RobotState,
        timestamp: DateTime<Utc>,
    ) -> Option<MatchEvent> {
        for ix in 0..self.pending.len() {
            let command = &self.pending[ix].command;
            if buffer.len() < command.expected_response_bytes() {
                continue;
            }
            match decoder.decode(command, buffer.as_slice(), state, timestamp) {
                DecodeOutcome::Incomplete => continue,
                DecodeOutcome::Decoded(decoded) => {
                    for lost in self.pending.drain(..ix) {
                        warn!(command = %lost.command.code(), "response lost on the buffer");
                        let code = lost.command.code();
                        lost.resolve(Err(RoombaError::ResponseLost { command: code }));
                    }
                    let entry = self.pending.pop_front()?;
                    buffer.consume(decoded.consumed);
                    debug!(
                        command = %entry.command.code(),
                        bytes = decoded.consumed,
                        "response matched"
                    );
                    return Some(MatchEvent::Matched { entry, decoded });
                }
                DecodeOutcome::Invalid { details } => {
                    let command = command.clone();
                    warn!(command = %command.code(), %details, "bad response, purge and resync");
                    buffer.clear();
                    let code = command.code();
                    for (pos, entry) in self.pending.drain(..).enumerate() {
                        let err = if pos < ix {
                            RoombaError::ResponseLost {
                                command: entry.command.code(),
                            }
                        } else {
                            RoombaError::Framing {
                                command: code,
                                details: details.clone(),
                            }
                        };
                        entry.resolve(Err(err));
                    }
                    return Some(MatchEvent::Resync { command });
                }
            }
        }
        None
    }

    /// Fault expired entries at the front of the queue.
    ///
    /// Returns how many entries timed out.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(front) = self.pending.front() {
            if front.expires_at > now {
                break;
            }
            if let Some(entry) = self.pending.pop_front() {
                let code = entry.command.code();
                warn!(
                    command = %code,
                    waited_ms = now.duration_since(entry.started_at).as_millis() as u64,
                    "command timed out"
                );
                entry.resolve(Err(RoombaError::Timeout { command: code }));
                expired += 1;
            }
        }
        expired
    }

    /// Fault every pending entry with `err`.
    pub fn purge(&mut self, err: &RoombaError) {
        for entry in self.pending.drain(..) {
            entry.resolve(Err(err.clone()));
        }
    }
}
