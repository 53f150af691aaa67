//! Bounded lock-free queues backing subscriptions and the executor's ready
//! set. Both variants fix their capacity at construction, round it up to a
//! power of two, and fail a full push instead of blocking.

pub mod mpmc;
pub mod spsc;
