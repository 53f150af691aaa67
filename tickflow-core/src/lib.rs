//! tickflow-core: an in-process stream processing engine for market data.
//!
//! Ticks enter through the [`broker::MessageBroker`], flow through a
//! user-built dag of processing units driven by the work-stealing
//! [`executor::DagExecutor`], and leave as synchronized or derived events.
//! All hot-path structures are pre-sized; the steady state allocates nothing
//! and takes no locks.

pub mod arena;
pub mod broker;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod node;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod sync;
pub mod units;

mod error_manager;

#[cfg(test)]
mod tests;

use tickflow_types::message::{Message, TypeTag};

use crate::errors::ExecutionError;
use crate::node::PortHandle;

pub use tickflow_types::ids;

/// Sends a unit's emissions toward downstream subscribers.
///
/// `send` buffers into pre-sized scratch and never blocks; delivery failures
/// are counted, not surfaced, because `process` only reports unit-level
/// status. `send_blob` parks oversized payloads in the emitting node's arena
/// and forwards an arena-handle message instead.
pub trait OutputChannelForwarder {
    fn send(&mut self, message: Message, port: PortHandle);

    fn send_blob(
        &mut self,
        kind: TypeTag,
        timestamp_ns: u64,
        bytes: &[u8],
        port: PortHandle,
    ) -> Result<(), ExecutionError>;
}
