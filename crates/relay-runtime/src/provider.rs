//! Backend identification and configuration types.

use serde::{Deserialize, Serialize};

/// Enumeration of supported queue backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Polling-style cloud queue (AWS SQS REST API)
    Sqs,
    /// Streaming broker queue (STOMP 1.2)
    Stomp,
    /// In-process queue for tests and development
    Memory,
}

impl BackendKind {
    /// Name used in diagnostics and error classification
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqs => "sqs",
            Self::Stomp => "stomp",
            Self::Memory => "memory",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// AWS SQS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// STOMP broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StompConfig {
    pub host: String,
    pub port: u16,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub use_tls: bool,
}

/// In-memory backend configuration
///
/// The behavior knobs let tests exercise both listen-loop policies
/// against the same in-process queue.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub max_queue_size: usize,
    pub receive_batch: u32,
    pub concurrent_dispatch: bool,
    pub decode_failure: crate::transport::DecodeFailurePolicy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10000,
            receive_batch: 10,
            concurrent_dispatch: true,
            decode_failure: crate::transport::DecodeFailurePolicy::SkipMessage,
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
