//! Send-with-confirmation under bounded retry.

use crate::error::RelayError;
use crate::message::{encode, QueueHandle, SendReceipt};
use crate::retry::{retry, RetryPolicy};
use crate::transport::Transport;
use serde::Serialize;
use tracing::{debug, warn};

/// Send one payload and block until the backend confirms receipt,
/// retrying transient failures per the policy.
///
/// Connect failures are surfaced immediately rather than retried;
/// only `send_raw` runs under the retry loop, classified by the
/// backend's `should_retry_send`. The session is closed on every exit
/// path. On success exactly one message is durably enqueued; on
/// failure the caller cannot assume the message was not delivered.
pub async fn enqueue<B, T>(
    backend: &B,
    queue: &QueueHandle,
    payload: &T,
    policy: &RetryPolicy,
) -> Result<SendReceipt, RelayError>
where
    B: Transport,
    T: Serialize + ?Sized,
{
    let body = encode(payload)?;

    let session = backend.connect().await?;
    let result = retry(
        policy,
        || backend.send_raw(&session, queue, body.clone()),
        |error| backend.should_retry_send(error),
    )
    .await;
    backend.close(session).await;

    match &result {
        Ok(receipt) => {
            debug!(queue = %queue, backend = %backend.backend(), receipt = receipt.id(), "message enqueued");
        }
        Err(error) => {
            warn!(queue = %queue, backend = %backend.backend(), %error, "enqueue failed");
        }
    }

    result
}

/// [`enqueue`] with the backend's default send retry policy
pub async fn enqueue_with_defaults<B, T>(
    backend: &B,
    queue: &QueueHandle,
    payload: &T,
) -> Result<SendReceipt, RelayError>
where
    B: Transport,
    T: Serialize + ?Sized,
{
    enqueue(backend, queue, payload, &backend.send_retry_policy()).await
}

#[cfg(test)]
#[path = "enqueue_tests.rs"]
mod tests;
