//! In-memory transport for tests.
//!
//! [`MockTransport`] is cheap to clone; every clone shares the same state,
//! so a test can keep one handle while the driver owns another.  Written
//! frames are recorded and inbound bytes are injected with
//! [`MockTransport::push_inbound`] or produced by a responder closure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use roomba_types::RoombaError;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    written: Vec<Vec<u8>>,
    inbound: VecDeque<u8>,
    rts: Vec<bool>,
    responder: Option<Responder>,
    fail_writes: bool,
    fail_open: bool,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every write with the bytes `responder` returns.
    pub fn with_responder(responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
        let mock = Self::new();
        mock.lock().responder = Some(Box::new(responder));
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded frames.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make bytes available to the next read.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes.iter().copied());
    }

    /// Every frame written so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// The first byte of every written frame.
    pub fn written_opcodes(&self) -> Vec<u8> {
        self.lock()
            .written
            .iter()
            .filter_map(|frame| frame.first().copied())
            .collect()
    }

    pub fn clear_written(&self) {
        self.lock().written.clear();
    }

    /// Levels the RTS line was driven to, in order.
    pub fn rts_history(&self) -> Vec<bool> {
        self.lock().rts.clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }
}

#[async_trait]
impl super::SerialTransport for MockTransport {
    async fn open(&mut self) -> Result<(), RoombaError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(RoombaError::Transport("mock port unavailable".into()));
        }
        state.open = true;
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
        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.open {
            return Err(RoombaError::NotConnected);
        }
        if state.fail_writes {
            return Err(RoombaError::Transport("mock write failure".into()));
        }
        state.written.push(bytes.to_vec());
        if let Some(responder) = state.responder.as_mut() {
            let reply = responder(bytes);
            state.inbound.extend(reply);
        }
        Ok(())
    }

    async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, RoombaError> {
        let mut state = self.lock();
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn set_rts(&mut self, level: bool) -> Result<(), RoombaError> {
        self.lock().rts.push(level);
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
