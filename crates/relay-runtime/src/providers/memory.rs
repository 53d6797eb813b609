//! In-memory backend adapter for tests and local development.
//!
//! Models the at-least-once contract of the real backends: received
//! messages move to an in-flight set instead of disappearing, and only
//! an acknowledgment removes them. `requeue_unacked` puts in-flight
//! messages back, simulating a visibility timeout expiring.

use crate::error::RelayError;
use crate::message::{AckToken, QueueHandle, RawMessage, SendReceipt};
use crate::provider::{BackendKind, MemoryConfig};
use crate::retry::{Backoff, RetryPolicy};
use crate::transport::{DecodeFailurePolicy, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(String, Bytes)>,
    in_flight: HashMap<String, Bytes>,
}

/// Stateless handle to the shared store; sessions carry no connection
/// state of their own.
pub struct MemorySession;

/// In-memory transport backed by a shared queue map
#[derive(Clone)]
pub struct MemoryTransport {
    config: MemoryConfig,
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            queues: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Number of messages waiting in a queue, not counting in-flight
    pub fn depth(&self, queue: &QueueHandle) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(queue.path()).map_or(0, |q| q.ready.len())
    }

    /// Number of received-but-unacknowledged messages in a queue
    pub fn in_flight(&self, queue: &QueueHandle) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.get(queue.path()).map_or(0, |q| q.in_flight.len())
    }

    /// Move all in-flight messages back to the front of the queue, as
    /// if their visibility timeout expired
    pub fn requeue_unacked(&self, queue: &QueueHandle) -> usize {
        let mut queues = self.queues.lock().unwrap();
        let Some(state) = queues.get_mut(queue.path()) else {
            return 0;
        };
        let requeued = state.in_flight.len();
        for (token, body) in state.in_flight.drain() {
            state.ready.push_front((token, body));
        }
        requeued
    }

    fn try_receive(&self, queue: &QueueHandle, max_batch: u32) -> Vec<RawMessage> {
        let mut queues = self.queues.lock().unwrap();
        let Some(state) = queues.get_mut(queue.path()) else {
            return Vec::new();
        };

        let mut batch = Vec::new();
        while batch.len() < max_batch.max(1) as usize {
            let Some((token, body)) = state.ready.pop_front() else {
                break;
            };
            state.in_flight.insert(token.clone(), body.clone());
            batch.push(RawMessage::new(
                body,
                AckToken::new(token, BackendKind::Memory),
            ));
        }
        batch
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Session = MemorySession;

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn connect(&self) -> Result<Self::Session, RelayError> {
        Ok(MemorySession)
    }

    async fn send_raw(
        &self,
        _session: &Self::Session,
        queue: &QueueHandle,
        body: Bytes,
    ) -> Result<SendReceipt, RelayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = format!("{}|{}", queue.path(), id);

        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(queue.path().to_string()).or_default();
        if state.ready.len() + state.in_flight.len() >= self.config.max_queue_size {
            return Err(RelayError::Throttled {
                message: format!("queue {} is full", queue.name()),
            });
        }
        state.ready.push_back((token, body));
        Ok(SendReceipt::new(id.to_string()))
    }

    async fn receive(
        &self,
        _session: &Self::Session,
        queue: &QueueHandle,
        max_batch: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, RelayError> {
        let deadline = Instant::now() + wait;
        loop {
            let batch = self.try_receive(queue, max_batch);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            sleep(POLL_INTERVAL.min(wait)).await;
        }
    }

    async fn acknowledge(
        &self,
        _session: &Self::Session,
        message: &RawMessage,
    ) -> Result<(), RelayError> {
        let (path, _) = message.ack.token().split_once('|').ok_or_else(|| {
            RelayError::Validation(crate::error::ValidationError::InvalidFormat {
                field: "ack_token".to_string(),
                message: "expected '{path}|{id}'".to_string(),
            })
        })?;

        let mut queues = self.queues.lock().unwrap();
        if let Some(state) = queues.get_mut(path) {
            // Unknown tokens are ignored; repeated acknowledgment of the
            // same message succeeds
            state.in_flight.remove(message.ack.token());
        }
        Ok(())
    }

    async fn close(&self, _session: Self::Session) {}

    fn should_retry_send(&self, error: &RelayError) -> bool {
        error.is_transient()
    }

    fn send_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(3, Backoff::Constant(Duration::from_millis(1)))
    }

    fn receive_batch(&self) -> u32 {
        self.config.receive_batch
    }

    fn receive_wait(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn on_decode_failure(&self) -> DecodeFailurePolicy {
        self.config.decode_failure
    }

    fn concurrent_dispatch(&self) -> bool {
        self.config.concurrent_dispatch
    }
}
