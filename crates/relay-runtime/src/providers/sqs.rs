//! Polling backend adapter: AWS SQS over its HTTP REST API.
//!
//! Uses direct HTTP calls with manual AWS Signature V4 signing instead
//! of the AWS SDK, which keeps the request/response handling
//! transparent and lets unit tests exercise the parsing and
//! classification logic without real infrastructure.
//!
//! Backend policy: long-poll receive up to 20s with batches of up to
//! 10 messages, concurrent batch dispatch, sends retried on timeout
//! and throttling only, acknowledge = DeleteMessage per receipt, and
//! decode failures left unacknowledged for SQS's own redelivery and
//! dead-letter handling.

use crate::error::{RelayError, ValidationError};
use crate::message::{AckToken, QueueHandle, RawMessage, SendReceipt};
use crate::provider::{BackendKind, SqsConfig};
use crate::retry::{Backoff, RetryPolicy};
use crate::transport::{DecodeFailurePolicy, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API_VERSION: &str = "2012-11-05";

// ============================================================================
// Error Classification
// ============================================================================

/// SQS-specific failures, classified before mapping to [`RelayError`]
#[derive(Debug, thiserror::Error)]
enum SqsError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("service error {code}: {message}")]
    Service { code: String, message: String },
}

impl SqsError {
    fn into_relay_error(self) -> RelayError {
        match self {
            Self::Authentication(message) | Self::Network(message) => {
                RelayError::Connect { message }
            }
            Self::Timeout(duration) => RelayError::Timeout { duration },
            Self::Throttled(message) => RelayError::Throttled { message },
            Self::Rejected(message) => {
                RelayError::Validation(ValidationError::Rejected { message })
            }
            Self::InvalidReceipt(receipt) => RelayError::Backend {
                backend: BackendKind::Sqs.as_str().to_string(),
                code: "ReceiptHandleIsInvalid".to_string(),
                message: receipt,
            },
            Self::Service { code, message } => RelayError::Backend {
                backend: BackendKind::Sqs.as_str().to_string(),
                code,
                message,
            },
        }
    }
}

// ============================================================================
// AWS Signature V4
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Request signer implementing the AWS Signature V4 process for the
/// `sqs` service: canonical request, string to sign, derived signing
/// key, Authorization header.
#[derive(Clone)]
struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
}

impl SigV4Signer {
    fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
        }
    }

    /// Produce the Authorization, x-amz-date, and host headers for a
    /// request with the given query parameters and body.
    fn sign(
        &self,
        method: &str,
        host: &str,
        query: &HashMap<String, String>,
        body: &str,
        now: &DateTime<Utc>,
    ) -> HashMap<String, String> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut query_pairs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        query_pairs.sort();

        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n/\n{}\n{}\n{}\n{}",
            method,
            query_pairs.join("&"),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!("{}/{}/sqs/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = self.signature(&string_to_sign, &date_stamp);
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), authorization);
        headers.insert("x-amz-date".to_string(), amz_date);
        headers.insert("host".to_string(), host.to_string());
        headers
    }

    /// Four-level HMAC chain: date, region, service, "aws4_request"
    fn signature(&self, string_to_sign: &str, date_stamp: &str) -> String {
        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"sqs");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ============================================================================
// Transport
// ============================================================================

/// Polling transport over the AWS SQS REST API
pub struct SqsTransport {
    http: HttpClient,
    signer: Option<SigV4Signer>,
    endpoint: String,
}

/// Stateless session marker; the underlying HTTP client carries no
/// per-session affinity and may be used from many tasks concurrently
pub struct SqsSession;

impl SqsTransport {
    /// Build a transport for the configured region.
    ///
    /// Fails when the region is empty or the HTTP client cannot be
    /// constructed. Missing credentials are reported at connect time.
    pub fn new(config: SqsConfig) -> Result<Self, RelayError> {
        if config.region.is_empty() {
            return Err(RelayError::Validation(ValidationError::Required {
                field: "region".to_string(),
            }));
        }

        let signer = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key), Some(secret_key)) => Some(SigV4Signer::new(
                access_key.clone(),
                secret_key.clone(),
                config.region.clone(),
            )),
            _ => None,
        };

        let endpoint = format!("https://sqs.{}.amazonaws.com", config.region);
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Connect {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            signer,
            endpoint,
        })
    }

    async fn request(&self, params: &HashMap<String, String>) -> Result<String, SqsError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SqsError::Authentication("no credentials configured".to_string()))?;

        let host = self
            .endpoint
            .strip_prefix("https://")
            .unwrap_or(&self.endpoint);
        let headers = signer.sign("POST", host, params, "", &Utc::now());

        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        let url = format!("{}/?{}", self.endpoint, query.join("&"));

        let mut request = self.http.post(&url);
        for (key, value) in headers {
            request = request.header(&key, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SqsError::Timeout(REQUEST_TIMEOUT)
            } else if e.is_connect() {
                SqsError::Network(format!("connection failed: {}", e))
            } else {
                SqsError::Network(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SqsError::Network(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_error_response(&body, status.as_u16()));
        }
        Ok(body)
    }
}

impl fmt::Debug for SqsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[async_trait]
impl Transport for SqsTransport {
    type Session = SqsSession;

    fn backend(&self) -> BackendKind {
        BackendKind::Sqs
    }

    async fn connect(&self) -> Result<Self::Session, RelayError> {
        // Stateless backend: nothing to establish, but refuse to hand
        // out sessions that could never authenticate.
        if self.signer.is_none() {
            return Err(RelayError::Connect {
                message: "no credentials configured".to_string(),
            });
        }
        Ok(SqsSession)
    }

    async fn send_raw(
        &self,
        _session: &Self::Session,
        queue: &QueueHandle,
        body: Bytes,
    ) -> Result<SendReceipt, RelayError> {
        let text = String::from_utf8(body.to_vec()).map_err(|_| {
            RelayError::Decode(crate::error::SerializationError::InvalidUtf8)
        })?;

        let mut params = HashMap::new();
        params.insert("Action".to_string(), "SendMessage".to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());
        params.insert("QueueUrl".to_string(), queue.path().to_string());
        params.insert("MessageBody".to_string(), text);

        // The SendMessage response itself is the delivery confirmation
        let response = self
            .request(&params)
            .await
            .map_err(SqsError::into_relay_error)?;

        let message_id = parse_text_element(&response, "MessageId")
            .ok_or_else(|| RelayError::Backend {
                backend: BackendKind::Sqs.as_str().to_string(),
                code: "MalformedResponse".to_string(),
                message: "MessageId not found in SendMessage response".to_string(),
            })?;
        Ok(SendReceipt::new(message_id))
    }

    async fn receive(
        &self,
        _session: &Self::Session,
        queue: &QueueHandle,
        max_batch: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, RelayError> {
        let mut params = HashMap::new();
        params.insert("Action".to_string(), "ReceiveMessage".to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());
        params.insert("QueueUrl".to_string(), queue.path().to_string());
        params.insert(
            "MaxNumberOfMessages".to_string(),
            max_batch.clamp(1, 10).to_string(),
        );
        params.insert(
            "WaitTimeSeconds".to_string(),
            wait.as_secs().clamp(0, 20).to_string(),
        );

        let response = self
            .request(&params)
            .await
            .map_err(SqsError::into_relay_error)?;

        parse_receive_response(&response, queue).map_err(SqsError::into_relay_error)
    }

    async fn acknowledge(
        &self,
        _session: &Self::Session,
        message: &RawMessage,
    ) -> Result<(), RelayError> {
        let (queue_url, receipt) =
            message
                .ack
                .token()
                .split_once('|')
                .ok_or_else(|| RelayError::Backend {
                    backend: BackendKind::Sqs.as_str().to_string(),
                    code: "MalformedAckToken".to_string(),
                    message: message.ack.token().to_string(),
                })?;

        let mut params = HashMap::new();
        params.insert("Action".to_string(), "DeleteMessage".to_string());
        params.insert("Version".to_string(), API_VERSION.to_string());
        params.insert("QueueUrl".to_string(), queue_url.to_string());
        params.insert("ReceiptHandle".to_string(), receipt.to_string());

        match self.request(&params).await {
            Ok(_) => Ok(()),
            // Already-deleted receipts are a no-op, keeping
            // acknowledgment idempotent
            Err(SqsError::InvalidReceipt(_)) => Ok(()),
            Err(error) => Err(error.into_relay_error()),
        }
    }

    async fn close(&self, _session: Self::Session) {
        // Nothing held per session
    }

    fn should_retry_send(&self, error: &RelayError) -> bool {
        matches!(
            error,
            RelayError::Timeout { .. } | RelayError::Throttled { .. }
        )
    }

    fn send_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            5,
            Backoff::Exponential {
                base: Duration::from_millis(100),
                cap: Some(Duration::from_secs(10)),
            },
        )
    }

    fn receive_batch(&self) -> u32 {
        10
    }

    fn receive_wait(&self) -> Duration {
        Duration::from_secs(20)
    }

    fn on_decode_failure(&self) -> DecodeFailurePolicy {
        DecodeFailurePolicy::SkipMessage
    }

    fn concurrent_dispatch(&self) -> bool {
        true
    }

    fn failure_pause(&self) -> Duration {
        // Avoids hot-looping the poll cycle against a misbehaving queue
        Duration::from_secs(5)
    }
}

// ============================================================================
// XML Response Parsing
// ============================================================================

/// Extract the text content of the first `element` in the XML document
fn parse_text_element(xml: &str, element: &str) -> Option<String> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == element.as_bytes() => inside = true,
            Ok(Event::Text(e)) if inside => {
                return e.unescape().ok().map(|s| s.into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Parse a ReceiveMessage response into raw messages, encoding the
/// queue URL into each ack token so acknowledge needs no extra state
fn parse_receive_response(xml: &str, queue: &QueueHandle) -> Result<Vec<RawMessage>, SqsError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut in_message = false;
    let mut in_body = false;
    let mut in_receipt = false;
    let mut body: Option<String> = None;
    let mut receipt: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Message" => {
                    in_message = true;
                    body = None;
                    receipt = None;
                }
                b"Body" if in_message => in_body = true,
                b"ReceiptHandle" if in_message => in_receipt = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.unescape().ok().map(|s| s.into_owned());
                if in_body {
                    body = text;
                    in_body = false;
                } else if in_receipt {
                    receipt = text;
                    in_receipt = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Message" => {
                in_message = false;
                if let (Some(body), Some(receipt)) = (body.take(), receipt.take()) {
                    let token = format!("{}|{}", queue.path(), receipt);
                    messages.push(RawMessage::new(
                        Bytes::from(body),
                        AckToken::new(token, BackendKind::Sqs),
                    ));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SqsError::Service {
                    code: "MalformedResponse".to_string(),
                    message: format!("XML parsing error: {}", e),
                })
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

/// Classify an error response by its SQS error code
fn classify_error_response(xml: &str, status: u16) -> SqsError {
    let code = parse_text_element(xml, "Code").unwrap_or_else(|| "Unknown".to_string());
    let message = parse_text_element(xml, "Message").unwrap_or_else(|| "unknown error".to_string());

    match code.as_str() {
        "Throttling" | "ThrottlingException" | "RequestThrottled" => {
            SqsError::Throttled(format!("{}: {}", code, message))
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch"
        | "AccessDenied" => SqsError::Authentication(format!("{}: {}", code, message)),
        "InvalidParameterValue" | "MessageRejected" => {
            SqsError::Rejected(format!("{}: {}", code, message))
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => SqsError::InvalidReceipt(message),
        _ if status == 401 || status == 403 => {
            SqsError::Authentication(format!("{}: {}", code, message))
        }
        _ => SqsError::Service { code, message },
    }
}
