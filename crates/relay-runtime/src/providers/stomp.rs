//! Streaming backend adapter: STOMP 1.2 over TCP with optional TLS.
//!
//! A session is one authenticated broker connection. Sends request a
//! broker receipt and wait for it before the send counts as confirmed
//! (unlike SQS, where the API response is the confirmation); receives
//! subscribe in `client-individual` ack mode and read one MESSAGE at a
//! time, acknowledging each with an explicit ACK frame after the
//! handler returns.
//!
//! Backend policy: single-message receive with a short read timeout,
//! strictly sequential dispatch, decode failure forces a reconnect,
//! and every transport failure is considered retryable for sends
//! because a duplicate delivery is cheaper than a lost message here.

use crate::error::RelayError;
use crate::message::{AckToken, QueueHandle, RawMessage, SendReceipt};
use crate::provider::{BackendKind, StompConfig};
use crate::retry::{Backoff, RetryPolicy};
use crate::transport::{DecodeFailurePolicy, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

#[cfg(test)]
#[path = "stomp_tests.rs"]
mod tests;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const RECEIPT_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Frame Codec
// ============================================================================

/// One STOMP frame: command, headers, body
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    command: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Frame {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Human-readable failure detail from an ERROR frame
    fn error_detail(&self) -> String {
        self.header("message")
            .map(str::to_string)
            .or_else(|| String::from_utf8(self.body.clone()).ok())
            .unwrap_or_else(|| "broker error".to_string())
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            out.extend_from_slice(escape_header(name).as_bytes());
            out.push(b':');
            out.extend_from_slice(escape_header(value).as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

/// STOMP 1.2 header escaping: backslash, newline, carriage return, colon
fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

// ============================================================================
// Connection
// ============================================================================

trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// One broker connection with its subscription and receipt state
struct StompConn {
    stream: BufStream<Box<dyn RawStream>>,
    subscribed: bool,
    next_receipt: u64,
}

impl StompConn {
    fn new(stream: Box<dyn RawStream>) -> Self {
        Self {
            stream: BufStream::new(stream),
            subscribed: false,
            next_receipt: 0,
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.stream.write_all(&frame.encode()).await?;
        self.stream.flush().await
    }

    /// Wait up to `wait` for the first byte of a frame, consuming any
    /// heartbeat newlines in front of it. Returns false on timeout.
    ///
    /// `read_frame` is not cancellation safe (a cancelled read drops
    /// bytes already pulled off the socket), so the read timeout is
    /// applied here, before any frame byte is consumed; once a frame
    /// has started it is always read to completion.
    async fn await_frame(&mut self, wait: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let skip = {
                let buf = match timeout(remaining, self.stream.fill_buf()).await {
                    Err(_) => return Ok(false),
                    Ok(result) => result?,
                };
                if buf.is_empty() {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                buf.iter()
                    .take_while(|b| **b == b'\n' || **b == b'\r')
                    .count()
            };
            if skip == 0 {
                return Ok(true);
            }
            self.stream.consume(skip);
        }
    }

    async fn read_frame(&mut self) -> io::Result<Frame> {
        // Heartbeats are bare newlines between frames
        let command = loop {
            let line = self.read_line().await?;
            if !line.is_empty() {
                break line;
            }
        };

        let mut headers = Vec::new();
        let mut content_length: Option<usize> = None;
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "malformed STOMP header line")
            })?;
            let name = unescape_header(name);
            let value = unescape_header(value);
            if name == "content-length" {
                content_length = value.parse().ok();
            }
            headers.push((name, value));
        }

        let body = match content_length {
            Some(length) => {
                let mut body = vec![0u8; length];
                self.stream.read_exact(&mut body).await?;
                let mut terminator = [0u8; 1];
                self.stream.read_exact(&mut terminator).await?;
                if terminator[0] != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "missing STOMP frame terminator",
                    ));
                }
                body
            }
            None => {
                let mut body = Vec::new();
                self.stream.read_until(0, &mut body).await?;
                if body.pop() != Some(0) {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                body
            }
        };

        Ok(Frame {
            command,
            headers,
            body,
        })
    }

    async fn read_line(&mut self) -> io::Result<String> {
        let mut line = Vec::new();
        self.stream.read_until(b'\n', &mut line).await?;
        if line.pop() != Some(b'\n') {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 STOMP line"))
    }
}

/// Live broker session, exclusively owned by one in-flight operation.
///
/// The internal mutex serializes that operation's own receive and
/// acknowledge calls on the single socket; it is never contended
/// across tasks.
pub struct StompSession {
    conn: Mutex<StompConn>,
}

impl std::fmt::Debug for StompSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StompSession").finish_non_exhaustive()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Streaming transport over a STOMP 1.2 broker connection
pub struct StompTransport {
    config: StompConfig,
    tls: Option<TlsConnector>,
}

impl StompTransport {
    /// Build a transport; for TLS configurations this loads the
    /// platform root certificates once up front.
    pub fn new(config: StompConfig) -> Result<Self, RelayError> {
        if config.host.is_empty() {
            return Err(RelayError::Validation(
                crate::error::ValidationError::Required {
                    field: "host".to_string(),
                },
            ));
        }

        let tls = if config.use_tls {
            Some(build_tls_connector()?)
        } else {
            None
        };

        Ok(Self { config, tls })
    }

    fn connect_error(message: impl Into<String>) -> RelayError {
        RelayError::Connect {
            message: message.into(),
        }
    }

    fn io_error(error: io::Error) -> RelayError {
        RelayError::Connect {
            message: format!("broker connection failed: {}", error),
        }
    }

    fn broker_error(frame: &Frame) -> RelayError {
        RelayError::Backend {
            backend: BackendKind::Stomp.as_str().to_string(),
            code: "ERROR".to_string(),
            message: frame.error_detail(),
        }
    }
}

fn build_tls_connector() -> Result<TlsConnector, RelayError> {
    let mut roots = rustls::RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        // Individual unloadable certificates are skipped; an empty
        // store is an error below
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err(RelayError::Connect {
            message: "no usable platform root certificates".to_string(),
        });
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::Connect {
            message: format!("TLS configuration failed: {}", e),
        })?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

#[async_trait]
impl Transport for StompTransport {
    type Session = StompSession;

    fn backend(&self) -> BackendKind {
        BackendKind::Stomp
    }

    async fn connect(&self) -> Result<Self::Session, RelayError> {
        let address = (self.config.host.as_str(), self.config.port);
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| Self::connect_error("broker connect timed out"))?
            .map_err(|e| Self::connect_error(format!("TCP connect failed: {}", e)))?;

        let stream: Box<dyn RawStream> = match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.config.host.clone())
                    .map_err(|e| Self::connect_error(format!("invalid TLS host name: {}", e)))?;
                let tls = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| Self::connect_error(format!("TLS handshake failed: {}", e)))?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };

        let mut conn = StompConn::new(stream);

        let mut frame = Frame::new("CONNECT")
            .with_header("accept-version", "1.2")
            .with_header("host", &self.config.host);
        if let Some(login) = &self.config.login {
            frame = frame.with_header("login", login);
        }
        if let Some(passcode) = &self.config.passcode {
            frame = frame.with_header("passcode", passcode);
        }
        conn.write_frame(&frame).await.map_err(Self::io_error)?;

        let reply = timeout(HANDSHAKE_TIMEOUT, conn.read_frame())
            .await
            .map_err(|_| Self::connect_error("broker handshake timed out"))?
            .map_err(Self::io_error)?;

        match reply.command.as_str() {
            "CONNECTED" => Ok(StompSession {
                conn: Mutex::new(conn),
            }),
            "ERROR" => Err(Self::connect_error(reply.error_detail())),
            other => Err(Self::connect_error(format!(
                "unexpected handshake frame: {}",
                other
            ))),
        }
    }

    async fn send_raw(
        &self,
        session: &Self::Session,
        queue: &QueueHandle,
        body: Bytes,
    ) -> Result<SendReceipt, RelayError> {
        let mut conn = session.conn.lock().await;

        conn.next_receipt += 1;
        let receipt_id = format!("r-{}", conn.next_receipt);

        let frame = Frame::new("SEND")
            .with_header("destination", queue.path())
            .with_header("receipt", &receipt_id)
            .with_header("content-type", "application/json")
            .with_header("content-length", &body.len().to_string())
            .with_body(body.to_vec());
        conn.write_frame(&frame).await.map_err(Self::io_error)?;

        // The send only counts once the broker confirms with a RECEIPT
        let deadline = Instant::now() + RECEIPT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match conn.await_frame(remaining).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(RelayError::Timeout {
                        duration: RECEIPT_TIMEOUT,
                    })
                }
                Err(error) => return Err(Self::io_error(error)),
            }
            let frame = conn.read_frame().await.map_err(Self::io_error)?;
            match frame.command.as_str() {
                "RECEIPT" if frame.header("receipt-id") == Some(receipt_id.as_str()) => {
                    return Ok(SendReceipt::new(receipt_id));
                }
                // Stale receipt for an earlier send whose wait already
                // timed out; keep waiting for ours
                "RECEIPT" => continue,
                "ERROR" => return Err(Self::broker_error(&frame)),
                _ => continue,
            }
        }
    }

    async fn receive(
        &self,
        session: &Self::Session,
        queue: &QueueHandle,
        _max_batch: u32,
        wait: Duration,
    ) -> Result<Vec<RawMessage>, RelayError> {
        let mut conn = session.conn.lock().await;

        if !conn.subscribed {
            let frame = Frame::new("SUBSCRIBE")
                .with_header("id", "0")
                .with_header("destination", queue.path())
                .with_header("ack", "client-individual");
            conn.write_frame(&frame).await.map_err(Self::io_error)?;
            conn.subscribed = true;
        }

        match conn.await_frame(wait).await {
            Ok(true) => {}
            // No delivery within the request-local timeout; the listen
            // loop simply receives again
            Ok(false) => return Ok(Vec::new()),
            Err(error) => return Err(Self::io_error(error)),
        }
        let frame = conn.read_frame().await.map_err(Self::io_error)?;

        match frame.command.as_str() {
            "MESSAGE" => {
                let ack_id = frame
                    .header("ack")
                    .or_else(|| frame.header("message-id"))
                    .ok_or_else(|| RelayError::Backend {
                        backend: BackendKind::Stomp.as_str().to_string(),
                        code: "MissingAckHeader".to_string(),
                        message: "MESSAGE frame carries no ack id".to_string(),
                    })?
                    .to_string();
                Ok(vec![RawMessage::new(
                    Bytes::from(frame.body),
                    AckToken::new(ack_id, BackendKind::Stomp),
                )])
            }
            "ERROR" => Err(Self::broker_error(&frame)),
            // A subscribed session expects only MESSAGE and ERROR;
            // anything else means the stream is desynchronized and the
            // session must be rebuilt
            other => Err(RelayError::Backend {
                backend: BackendKind::Stomp.as_str().to_string(),
                code: "UnexpectedFrame".to_string(),
                message: format!("unexpected {} frame on subscription", other),
            }),
        }
    }

    async fn acknowledge(
        &self,
        session: &Self::Session,
        message: &RawMessage,
    ) -> Result<(), RelayError> {
        let mut conn = session.conn.lock().await;
        let frame = Frame::new("ACK").with_header("id", message.ack.token());
        // Fire-and-forget; the broker ignores unknown ack ids, which
        // keeps repeated acknowledgment harmless
        conn.write_frame(&frame).await.map_err(Self::io_error)
    }

    async fn close(&self, session: Self::Session) {
        let mut conn = session.conn.into_inner();
        let frame = Frame::new("DISCONNECT");
        let _ = conn.write_frame(&frame).await;
    }

    fn should_retry_send(&self, error: &RelayError) -> bool {
        // Message loss is costlier than a duplicate on this backend, so
        // every transport failure is worth another attempt
        !matches!(
            error,
            RelayError::Validation(_) | RelayError::Decode(_)
        )
    }

    fn send_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            5,
            Backoff::Exponential {
                base: Duration::from_millis(50),
                cap: Some(Duration::from_secs(10)),
            },
        )
    }

    fn receive_batch(&self) -> u32 {
        1
    }

    fn receive_wait(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn on_decode_failure(&self) -> DecodeFailurePolicy {
        DecodeFailurePolicy::Reconnect
    }

    fn concurrent_dispatch(&self) -> bool {
        false
    }
}
