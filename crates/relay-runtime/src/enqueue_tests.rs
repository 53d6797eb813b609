use super::*;
use crate::message::RawMessage;
use crate::provider::BackendKind;
use crate::retry::Backoff;
use crate::transport::DecodeFailurePolicy;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Order {
    id: u64,
    item: String,
}

fn order() -> Order {
    Order {
        id: 42,
        item: "widget".to_string(),
    }
}

fn queue() -> QueueHandle {
    QueueHandle::new("orders", "https://queue.example/orders").unwrap()
}

fn timeout_error() -> RelayError {
    RelayError::Timeout {
        duration: Duration::from_secs(30),
    }
}

/// Backend double whose send outcomes are scripted up front. Once the
/// script is exhausted every further send succeeds.
struct ScriptedBackend {
    script: Mutex<VecDeque<Result<SendReceipt, RelayError>>>,
    policy: RetryPolicy,
    connects: AtomicU32,
    sends: AtomicU32,
    closes: AtomicU32,
    bodies: Mutex<Vec<Bytes>>,
}

impl ScriptedBackend {
    fn new(script: Vec<Result<SendReceipt, RelayError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            policy: RetryPolicy::bounded(
                5,
                Backoff::Exponential {
                    base: Duration::from_millis(100),
                    cap: Some(Duration::from_secs(10)),
                },
            ),
            connects: AtomicU32::new(0),
            sends: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            bodies: Mutex::new(Vec::new()),
        }
    }

    fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Transport for ScriptedBackend {
    type Session = ();

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn connect(&self) -> Result<(), RelayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_raw(
        &self,
        _session: &(),
        _queue: &QueueHandle,
        body: Bytes,
    ) -> Result<SendReceipt, RelayError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SendReceipt::new("msg-1")))
    }

    async fn receive(
        &self,
        _session: &(),
        _queue: &QueueHandle,
        _max_batch: u32,
        _wait: Duration,
    ) -> Result<Vec<RawMessage>, RelayError> {
        Ok(Vec::new())
    }

    async fn acknowledge(&self, _session: &(), _message: &RawMessage) -> Result<(), RelayError> {
        Ok(())
    }

    async fn close(&self, _session: ()) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn should_retry_send(&self, error: &RelayError) -> bool {
        error.is_transient()
    }

    fn send_retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    fn receive_batch(&self) -> u32 {
        1
    }

    fn receive_wait(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn on_decode_failure(&self) -> DecodeFailurePolicy {
        DecodeFailurePolicy::SkipMessage
    }

    fn concurrent_dispatch(&self) -> bool {
        false
    }
}

/// Backend whose connect always fails
struct Unreachable {
    sends: AtomicU32,
}

#[async_trait]
impl Transport for Unreachable {
    type Session = ();

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn connect(&self) -> Result<(), RelayError> {
        Err(RelayError::Connect {
            message: "no route".to_string(),
        })
    }

    async fn send_raw(
        &self,
        _session: &(),
        _queue: &QueueHandle,
        _body: Bytes,
    ) -> Result<SendReceipt, RelayError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(SendReceipt::new("unreachable"))
    }

    async fn receive(
        &self,
        _session: &(),
        _queue: &QueueHandle,
        _max_batch: u32,
        _wait: Duration,
    ) -> Result<Vec<RawMessage>, RelayError> {
        Ok(Vec::new())
    }

    async fn acknowledge(&self, _session: &(), _message: &RawMessage) -> Result<(), RelayError> {
        Ok(())
    }

    async fn close(&self, _session: ()) {}

    fn should_retry_send(&self, error: &RelayError) -> bool {
        error.is_transient()
    }

    fn send_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(3, Backoff::Constant(Duration::from_millis(1)))
    }

    fn receive_batch(&self) -> u32 {
        1
    }

    fn receive_wait(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn on_decode_failure(&self) -> DecodeFailurePolicy {
        DecodeFailurePolicy::SkipMessage
    }

    fn concurrent_dispatch(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn sends_encoded_payload_and_confirms() {
    let backend = ScriptedBackend::new(vec![Ok(SendReceipt::new("m-7"))]);

    let receipt = enqueue_with_defaults(&backend, &queue(), &order())
        .await
        .unwrap();

    assert_eq!(receipt.id(), "m-7");
    assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
    assert_eq!(backend.closes.load(Ordering::SeqCst), 1);

    let bodies = backend.bodies.lock().unwrap();
    let sent: Order = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(sent, order());
}

#[tokio::test(start_paused = true)]
async fn retries_transient_failures_with_exponential_backoff() {
    let backend = ScriptedBackend::new(vec![
        Err(RelayError::Throttled {
            message: "slow down".to_string(),
        }),
        Err(RelayError::Throttled {
            message: "slow down".to_string(),
        }),
    ]);

    let start = tokio::time::Instant::now();
    let receipt = enqueue_with_defaults(&backend, &queue(), &order())
        .await
        .unwrap();

    // Two throttles cost 100ms + 200ms of backoff before the third
    // attempt succeeds
    assert_eq!(receipt.id(), "msg-1");
    assert_eq!(backend.sends.load(Ordering::SeqCst), 3);
    assert_eq!(start.elapsed(), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_exactly_max_attempts() {
    let backend = ScriptedBackend::new(vec![
        Err(timeout_error()),
        Err(timeout_error()),
        Err(timeout_error()),
        Err(timeout_error()),
    ])
    .with_policy(RetryPolicy::bounded(
        3,
        Backoff::Constant(Duration::from_millis(10)),
    ));

    let error = enqueue_with_defaults(&backend, &queue(), &order())
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::Timeout { .. }));
    assert_eq!(backend.sends.load(Ordering::SeqCst), 3);
    assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let backend = ScriptedBackend::new(vec![Err(RelayError::Validation(
        crate::error::ValidationError::Rejected {
            message: "destination refused".to_string(),
        },
    ))]);

    let error = enqueue_with_defaults(&backend, &queue(), &order())
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::Validation(_)));
    assert_eq!(backend.sends.load(Ordering::SeqCst), 1);
    assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_failure_surfaces_without_send_attempts() {
    let backend = Unreachable {
        sends: AtomicU32::new(0),
    };

    let error = enqueue_with_defaults(&backend, &queue(), &order())
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::Connect { .. }));
    assert_eq!(backend.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unencodable_payload_fails_before_connecting() {
    // Tuple keys cannot become JSON object keys
    let mut payload = std::collections::HashMap::new();
    payload.insert((1u32, 2u32), "value");

    let backend = ScriptedBackend::new(Vec::new());
    let error = enqueue_with_defaults(&backend, &queue(), &payload)
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::Decode(_)));
    assert!(!error.is_transient());
    assert_eq!(backend.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn explicit_policy_overrides_backend_default() {
    let backend = ScriptedBackend::new(vec![Err(timeout_error()), Err(timeout_error())]);
    let policy = RetryPolicy::bounded(2, Backoff::Constant(Duration::from_millis(5)));

    let error = enqueue(&backend, &queue(), &order(), &policy)
        .await
        .unwrap_err();

    assert!(matches!(error, RelayError::Timeout { .. }));
    assert_eq!(backend.sends.load(Ordering::SeqCst), 2);
}
