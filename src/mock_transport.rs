//! Scripted transport for driver and session tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{Connector, Transport, TransportError};

#[derive(Debug, Default)]
pub struct MockState {
    pub replies: VecDeque<Vec<u8>>,
    pub writes: Vec<String>,
    pub timeouts: Vec<Duration>,
    pub opened: usize,
    pub closed: usize,
    /// Every read blocks this long before answering.
    pub read_delay: Duration,
}

/// Replays queued replies in order and records every command written.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, reply: impl AsRef<[u8]>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .replies
            .push_back(reply.as_ref().to_vec());
        self
    }

    pub fn set_read_delay(&self, delay: Duration) -> &Self {
        self.state.lock().unwrap().read_delay = delay;
        self
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn pending_replies(&self) -> usize {
        self.state.lock().unwrap().replies.len()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn next_reply(&self) -> Result<Vec<u8>, TransportError> {
        let delay = self.state.lock().unwrap().read_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.state
            .lock()
            .unwrap()
            .replies
            .pop_front()
            .ok_or(TransportError::Timeout(Duration::ZERO))
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().opened += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }

    fn set_io_timeout(&mut self, timeout: Duration) {
        self.state.lock().unwrap().timeouts.push(timeout);
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.state.lock().unwrap().writes.push(command.to_string());
        Ok(())
    }

    fn read(&mut self) -> Result<String, TransportError> {
        let reply = String::from_utf8(self.next_reply()?)?;
        Ok(reply.trim_end_matches('\n').to_string())
    }

    fn read_raw(&mut self) -> Result<Vec<u8>, TransportError> {
        self.next_reply()
    }
}

/// Hands out clones of one shared [`MockTransport`].
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    pub transport: MockTransport,
}

impl Connector for MockConnector {
    fn connect(&self, _host: &str) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(self.transport.clone()))
    }
}
