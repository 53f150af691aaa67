//! Shared value types for the tickflow engine: identifiers, the wire-level
//! message layout, market payloads and the configuration model.
//!
//! Commonly used third-party crates are re-exported so downstream crates pick
//! up a single version of each.

pub mod config;
pub mod ids;
pub mod market;
pub mod message;

// Re-exports.
pub use ahash;
pub use bytemuck;
pub use log;
pub use parking_lot;
pub use serde;
pub use thiserror;
