//! Transport capability implemented by each backend adapter.

use crate::error::RelayError;
use crate::message::{QueueHandle, RawMessage, SendReceipt};
use crate::provider::BackendKind;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// How the listen loop reacts when a received payload fails to decode
///
/// The two backends differ by design: a polling queue can safely leave
/// an unacknowledged message to its own redelivery/dead-letter
/// mechanism, while a streaming broker is reconnected to avoid
/// advancing past an unparseable delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Log, leave the message unacknowledged, continue with the batch
    SkipMessage,
    /// Treat as session-fatal and force a reconnect
    Reconnect,
}

/// Connect, send, receive, acknowledge, and close against one backend
///
/// The generic enqueue and listen operations see backends only through
/// this trait; each adapter also encodes its retry-classification,
/// batch-size, and dispatch policies here rather than being
/// special-cased in the generic algorithms.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Live connection state, exclusively owned by one in-flight
    /// operation at a time
    type Session: Send + Sync;

    fn backend(&self) -> BackendKind;

    /// Establish whatever state the backend needs (socket and auth
    /// handshake, or nothing for stateless backends)
    async fn connect(&self) -> Result<Self::Session, RelayError>;

    /// Transmit one payload and block until the backend confirms
    /// durable receipt
    async fn send_raw(
        &self,
        session: &Self::Session,
        queue: &QueueHandle,
        body: Bytes,
    ) -> Result<SendReceipt, RelayError>;

    /// Block up to `wait` for at least one message; an empty batch on
    /// timeout is not an error
    async fn receive(
        &self,
        session: &Self::Session,
        queue: &QueueHandle,
        max_batch: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, RelayError>;

    /// Mark a message as durably processed; idempotent for tokens that
    /// were already acknowledged
    async fn acknowledge(
        &self,
        session: &Self::Session,
        message: &RawMessage,
    ) -> Result<(), RelayError>;

    /// Release the session; invoked on every exit path of a
    /// connect/use cycle
    async fn close(&self, session: Self::Session);

    /// Classification used by the enqueue retry loop
    fn should_retry_send(&self, error: &RelayError) -> bool;

    /// Default retry policy for sends against this backend
    fn send_retry_policy(&self) -> RetryPolicy;

    /// Messages requested per receive call
    fn receive_batch(&self) -> u32;

    /// How long one receive call blocks waiting for messages
    fn receive_wait(&self) -> Duration;

    fn on_decode_failure(&self) -> DecodeFailurePolicy;

    /// Whether a received batch is dispatched with concurrent callback
    /// invocations (fan-out, join before the next receive)
    fn concurrent_dispatch(&self) -> bool;

    /// Extra pause before reconnecting after a session failure, on top
    /// of the reconnect policy delay
    fn failure_pause(&self) -> Duration {
        Duration::ZERO
    }
}
