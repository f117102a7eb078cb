//! In-process backend: a broker that lives inside the test process.
//!
//! Supports both settlement models (per-message and cumulative) so the
//! cross-backend acknowledgment contract is testable without a server.

mod broker;
mod queue;

pub use broker::{AckMode, MemoryBroker};
pub use queue::{MemoryBrokerClient, MemoryPub, MemorySub};
