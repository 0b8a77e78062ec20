//! In-memory transport.
//!
//! A `MemoryLink` is the shared "wire": the test side pushes inbound messages
//! and inspects what the channel sent, opened and closed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Connection, Inbound, SendStatus, Transport};
use crate::error::ChannelError;

#[derive(Default)]
struct LinkState {
    opens: usize,
    fail_opens: usize,
    fail_sends: bool,
    stalled: bool,
    /// Written while stalled, not yet delivered. Holds at most one message.
    backlog: Vec<String>,
    sent: Vec<String>,
    inbound: VecDeque<Inbound>,
    close_codes: Vec<u16>,
}

#[derive(Clone, Default)]
pub struct MemoryLink {
    state: Arc<Mutex<LinkState>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        // A panic in another test thread must not cascade.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_inbound(&self, message: Inbound) {
        self.lock().inbound.push_back(message);
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.lock().fail_opens = count;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// A stalled peer stops reading: one message is buffered, the rest are
    /// dropped until the stall ends.
    pub fn stall_writes(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn pending_writes(&self) -> usize {
        self.lock().backlog.len()
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Sent messages that were frames rather than heartbeats.
    pub fn frames_sent(&self) -> usize {
        self.lock()
            .sent
            .iter()
            .filter(|message| message.starts_with("data:image/jpeg;base64,"))
            .count()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.lock().close_codes.clone()
    }
}

pub struct MemoryTransport {
    link: MemoryLink,
}

impl MemoryTransport {
    pub fn new(link: MemoryLink) -> Self {
        Self { link }
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, endpoint: &str) -> Result<Box<dyn Connection>, ChannelError> {
        let mut state = self.link.lock();
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(ChannelError::Connect {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Box::new(MemoryConnection {
            link: self.link.clone(),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    link: MemoryLink,
    closed: bool,
}

impl Connection for MemoryConnection {
    fn send_text(&mut self, text: &str) -> Result<SendStatus, ChannelError> {
        let mut state = self.link.lock();
        if self.closed || state.fail_sends {
            return Err(ChannelError::Transport("broken pipe".to_string()));
        }
        if state.stalled || !state.backlog.is_empty() {
            if !state.backlog.is_empty() {
                return Ok(SendStatus::Dropped);
            }
            state.backlog.push(text.to_string());
            return Ok(SendStatus::Queued);
        }
        state.sent.push(text.to_string());
        Ok(SendStatus::Flushed)
    }

    fn is_writable(&self) -> bool {
        !self.closed && self.link.lock().backlog.is_empty()
    }

    fn try_recv(&mut self) -> Result<Option<Inbound>, ChannelError> {
        if self.closed {
            return Ok(None);
        }
        let mut state = self.link.lock();
        if !state.stalled {
            let flushed: Vec<String> = state.backlog.drain(..).collect();
            state.sent.extend(flushed);
        }
        Ok(state.inbound.pop_front())
    }

    fn close(&mut self, code: u16) {
        if !self.closed {
            self.closed = true;
            self.link.lock().close_codes.push(code);
        }
    }
}
