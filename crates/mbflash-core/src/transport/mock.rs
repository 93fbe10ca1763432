//! Mock broker transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::traits::{Endpoint, RpcTransport, TransportError};
use crate::protocol::ReplyFrame;

/// One captured call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub endpoint: Endpoint,
    pub payloads: Vec<Vec<u8>>,
}

type QueuedReply = Result<Vec<Vec<u8>>, TransportError>;

/// Mock transport for unit testing orchestration logic.
pub struct MockTransport {
    /// Queued replies, returned in order.
    reply_queue: Arc<Mutex<VecDeque<QueuedReply>>>,
    /// Captured calls.
    call_log: Arc<Mutex<Vec<RecordedCall>>>,
    /// Whether the broker is "reachable".
    connected: Arc<Mutex<bool>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reply_queue: Arc::new(Mutex::new(VecDeque::new())),
            call_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Queue raw reply payloads for the next call.
    pub fn queue_reply(&self, payloads: Vec<Vec<u8>>) {
        lock(&self.reply_queue).push_back(Ok(payloads));
    }

    /// Queue a JSON reply batch, prefixed by `status` when given.
    pub fn queue_frames(&self, status: Option<&str>, frames: &[ReplyFrame]) {
        let mut payloads = Vec::with_capacity(2);
        if let Some(status) = status {
            payloads.push(status.as_bytes().to_vec());
        }
        payloads.push(serde_json::to_vec(frames).unwrap_or_default());
        self.queue_reply(payloads);
    }

    /// Queue a transport failure for the next call.
    pub fn queue_error(&self, error: TransportError) {
        lock(&self.reply_queue).push_back(Err(error));
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<RecordedCall> {
        lock(&self.call_log).clone()
    }

    /// Clear captured calls.
    pub fn clear_calls(&self) {
        lock(&self.call_log).clear();
    }

    /// Simulate the broker going away.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcTransport for MockTransport {
    fn call(
        &self,
        endpoint: &Endpoint,
        request: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        lock(&self.call_log).push(RecordedCall {
            endpoint: endpoint.clone(),
            payloads: request,
        });
        lock(&self.reply_queue)
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout { timeout_ms: 5000 }))
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }
}
