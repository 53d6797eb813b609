//! Message types and the JSON payload codec.

use crate::error::{SerializationError, ValidationError};
use crate::provider::BackendKind;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A destination queue: a name for diagnostics plus a backend-specific
/// path (SQS queue URL or STOMP destination)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    name: String,
    path: String,
}

impl QueueHandle {
    /// Create a queue handle with validation
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let path = path.into();

        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_name".to_string(),
            });
        }
        if path.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_path".to_string(),
            });
        }
        // The ack token encodes the path with a '|' separator
        if path.contains('|') {
            return Err(ValidationError::InvalidFormat {
                field: "queue_path".to_string(),
                message: "must not contain '|'".to_string(),
            });
        }

        Ok(Self { name, path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Opaque token required to acknowledge a received message
///
/// For SQS this is `"{queue_url}|{receipt_handle}"`; for STOMP it is
/// the broker-assigned `ack` header of the MESSAGE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken {
    token: String,
    backend: BackendKind,
}

impl AckToken {
    pub fn new(token: String, backend: BackendKind) -> Self {
        Self { token, backend }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

/// An opaque payload received from a backend, with the token needed to
/// acknowledge it
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: Bytes,
    pub ack: AckToken,
}

impl RawMessage {
    pub fn new(body: Bytes, ack: AckToken) -> Self {
        Self { body, ack }
    }
}

/// A successfully decoded message, retaining its acknowledgment token
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub ack: AckToken,
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Decode a raw message into a typed envelope
    pub fn open(raw: &RawMessage) -> Result<Self, SerializationError> {
        Ok(Self {
            payload: decode(&raw.body)?,
            ack: raw.ack.clone(),
        })
    }
}

/// Backend confirmation that a sent message was durably accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    id: String,
}

impl SendReceipt {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Backend-assigned identifier (SQS MessageId or STOMP receipt id)
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Serialize a payload to its JSON wire form
///
/// Never fails for well-typed payloads; a serializer error is still
/// reported as a value rather than a panic.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes, SerializationError> {
    let body = serde_json::to_vec(payload)?;
    Ok(Bytes::from(body))
}

/// Deserialize a payload from its JSON wire form
pub fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, SerializationError> {
    std::str::from_utf8(body).map_err(|_| SerializationError::InvalidUtf8)?;
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
