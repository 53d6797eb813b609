//! Connect-receive-dispatch-acknowledge loop with self-healing
//! reconnection.

use crate::error::RelayError;
use crate::message::{decode, QueueHandle, RawMessage};
use crate::retry::RetryPolicy;
use crate::transport::{DecodeFailurePolicy, Transport};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::future::Future;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Consume a queue forever, invoking `handler` for every decoded
/// message and acknowledging after the handler returns.
///
/// State machine: Connecting -> Receiving <-> Dispatching. Any
/// transport error or handler failure is session-fatal: the session is
/// closed and the loop reconnects after the policy delay (plus the
/// backend's failure pause). Errors are never surfaced to the caller;
/// the loop only stops when its owning task is cancelled, and the
/// session is released even then because cancellation can only land on
/// an await point inside one scoped connect/use cycle.
///
/// A message may be redelivered after a crash-induced reconnect even
/// if the handler completed, so handlers are expected to be idempotent.
pub async fn listen<B, T, F, Fut>(
    backend: &B,
    queue: &QueueHandle,
    reconnect: &RetryPolicy,
    handler: F,
) -> Infallible
where
    B: Transport,
    T: DeserializeOwned + Send,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let mut connect_attempt: u32 = 1;
    loop {
        let session = match backend.connect().await {
            Ok(session) => session,
            Err(error) => {
                warn!(queue = %queue, backend = %backend.backend(), %error, "connect failed");
                sleep(reconnect.delay_for(connect_attempt)).await;
                connect_attempt = connect_attempt.saturating_add(1);
                continue;
            }
        };
        connect_attempt = 1;
        debug!(queue = %queue, backend = %backend.backend(), "session established");

        let error = run_session(backend, &session, queue, &handler).await;
        backend.close(session).await;
        warn!(queue = %queue, backend = %backend.backend(), %error, "session ended, reconnecting");

        sleep(reconnect.delay_for(1) + backend.failure_pause()).await;
    }
}

/// [`listen`] with the default reconnection policy: unbounded attempts,
/// constant one second delay
pub async fn listen_with_defaults<B, T, F, Fut>(
    backend: &B,
    queue: &QueueHandle,
    handler: F,
) -> Infallible
where
    B: Transport,
    T: DeserializeOwned + Send,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    listen(backend, queue, &reconnect_policy_default(), handler).await
}

/// Default reconnection policy shared by both backends
pub fn reconnect_policy_default() -> RetryPolicy {
    RetryPolicy::unbounded(crate::retry::Backoff::Constant(
        std::time::Duration::from_secs(1),
    ))
}

/// Receive and dispatch until something session-fatal happens,
/// returning the failure that forces the reconnect.
async fn run_session<B, T, F, Fut>(
    backend: &B,
    session: &B::Session,
    queue: &QueueHandle,
    handler: &F,
) -> anyhow::Error
where
    B: Transport,
    T: DeserializeOwned + Send,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    loop {
        let batch = match backend
            .receive(session, queue, backend.receive_batch(), backend.receive_wait())
            .await
        {
            Ok(batch) => batch,
            Err(error) => return error.into(),
        };

        if backend.concurrent_dispatch() {
            // Fan out the whole batch, join before the next receive.
            // Processing order within a batch is forfeited.
            let outcomes = join_all(
                batch
                    .into_iter()
                    .map(|message| dispatch(backend, session, queue, handler, message)),
            )
            .await;
            for outcome in outcomes {
                if let Err(error) = outcome {
                    return error;
                }
            }
        } else {
            for message in batch {
                if let Err(error) = dispatch(backend, session, queue, handler, message).await {
                    return error;
                }
            }
        }
    }
}

/// Decode one message, invoke the handler, acknowledge on success.
///
/// Decode failures follow the backend's policy; handler failures and
/// acknowledge failures are session-fatal. The acknowledgment is only
/// sent after the handler returns Ok.
async fn dispatch<B, T, F, Fut>(
    backend: &B,
    session: &B::Session,
    queue: &QueueHandle,
    handler: &F,
    message: RawMessage,
) -> anyhow::Result<()>
where
    B: Transport,
    T: DeserializeOwned + Send,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let payload: T = match decode(&message.body) {
        Ok(payload) => payload,
        Err(error) => match backend.on_decode_failure() {
            DecodeFailurePolicy::SkipMessage => {
                warn!(queue = %queue, %error, "undecodable message left for redelivery");
                return Ok(());
            }
            DecodeFailurePolicy::Reconnect => {
                return Err(RelayError::from(error).into());
            }
        },
    };

    handler(payload).await?;
    backend.acknowledge(session, &message).await?;
    Ok(())
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
