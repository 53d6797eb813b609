//! Backend adapters implementing [`Transport`](crate::transport::Transport).

pub mod memory;
pub mod sqs;
pub mod stomp;

pub use memory::MemoryTransport;
pub use sqs::SqsTransport;
pub use stomp::StompTransport;
