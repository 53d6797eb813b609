//! # Relay Runtime
//!
//! Reliable message delivery over interchangeable queue backends: a
//! polling cloud queue (AWS SQS) and a streaming broker (STOMP 1.2),
//! plus an in-memory backend for tests.
//!
//! This library provides:
//! - At-least-once send with confirmation and bounded retry
//! - A self-healing listen loop: receive, decode, dispatch, acknowledge
//! - Explicit acknowledgment after the handler completes
//! - Retry policies with constant or exponential backoff
//! - Typed JSON payloads over a backend-agnostic [`Transport`] trait
//!
//! ## Module Organization
//!
//! - [`error`] - Classified errors for all relay operations
//! - [`message`] - Queue handles, messages, and the payload codec
//! - [`retry`] - Backoff strategies and the generic retry loop
//! - [`transport`] - The backend capability trait
//! - [`enqueue`] - Send-with-confirmation
//! - [`listener`] - The consume-forever loop
//! - [`providers`] - SQS, STOMP, and in-memory adapters

// Module declarations
pub mod enqueue;
pub mod error;
pub mod listener;
pub mod message;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use enqueue::{enqueue, enqueue_with_defaults};
pub use error::{RelayError, SerializationError, ValidationError};
pub use listener::{listen, listen_with_defaults, reconnect_policy_default};
pub use message::{AckToken, Envelope, QueueHandle, RawMessage, SendReceipt};
pub use provider::{BackendKind, MemoryConfig, SqsConfig, StompConfig};
pub use providers::{MemoryTransport, SqsTransport, StompTransport};
pub use retry::{retry, Backoff, RetryPolicy};
pub use transport::{DecodeFailurePolicy, Transport};
