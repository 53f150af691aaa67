//! Engine configuration model.
//!
//! Every recognized option has a default; unknown keys are rejected during
//! deserialization so configuration typos fail loudly at startup.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue_capacity must be a power of two, got {0}")]
    QueueCapacityNotPowerOfTwo(usize),
    #[error("{key} must be between 1 and {max}, got {value}")]
    FanLimitOutOfRange {
        key: &'static str,
        max: usize,
        value: usize,
    },
    #[error("node_pool_capacity must be non-zero")]
    EmptyNodePool,
    #[error("max_streams must be between 1 and {max}, got {value}")]
    TooManyStreams { max: usize, value: usize },
}

/// Widest fan-in/fan-out the inline node topology can record.
pub const MAX_NODE_LINKS: usize = 8;

/// Most streams one synchronizer instance will track.
pub const MAX_SYNC_STREAMS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Dispatch a node whenever any input delivers.
    #[default]
    Streaming,
    /// Dispatch only when every input has delivered since the last run.
    BarrierSynchronous,
    /// Barrier semantics plus a minimum spacing between dispatches.
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderMode {
    /// The stream named at configuration time leads.
    FixedLeader,
    /// The stream with the highest recent tick count leads.
    #[default]
    HighestRate,
    /// The stream whose latest timestamp trails wall clock the least leads.
    LowestLag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStrategy {
    /// Repeat the follower's last observed tick.
    #[default]
    OldTick,
    /// Linear projection from the follower's last two ticks.
    Linear,
    /// Catmull-Rom style cubic projection.
    Cubic,
    /// Hold the last tick without advancing its timestamp.
    Hold,
    /// Drop the follower's slot for this event (see [`DropPolicy`]).
    Drop,
}

/// What a `Drop` fill does to the synchronized event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Suppress the event entirely.
    #[default]
    Suppress,
    /// Emit the event with a NaN-priced sentinel in the gapped slot.
    Sentinel,
}

/// Clock the `Rate` execution mode paces against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateClock {
    #[default]
    WallClock,
    MessageTime,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Max concurrently live nodes across all dags.
    pub node_pool_capacity: usize,
    /// Per-subscription queue depth. Power of two.
    pub queue_capacity: usize,
    pub max_fan_in: usize,
    pub max_fan_out: usize,
    /// Scheduler workers. Zero means one per available core.
    pub worker_count: usize,
    /// Bit mask of NUMA nodes workers may be pinned to. Zero disables
    /// pinning.
    pub numa_nodes: u64,
    pub execution_mode: ExecutionMode,
    pub leader_mode: LeaderMode,
    pub fill_strategy: FillStrategy,
    /// Default producer blocking policy for new subscriptions.
    pub block_on_full: bool,
    /// Follower lag beyond which a gap fill is requested.
    pub max_lag_ns: u64,
    /// Sliding window for `HighestRate` leader election.
    pub buffer_window_ns: u64,
    /// Emit one synchronized event per this many leader ticks.
    pub sync_frequency: u64,
    pub drop_policy: DropPolicy,
    pub rate_clock: RateClock,
    /// Minimum spacing between dispatches of one node in `Rate` mode.
    pub rate_interval_ns: u64,
    /// Transient failures tolerated per node before it is poisoned.
    pub max_transient_retries: u32,
    /// Engine-wide budget of poisoned-node failures; crossing it cancels
    /// the dag that spent the last credit. `None` means unlimited.
    pub error_threshold: Option<u32>,
    pub max_streams: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_pool_capacity: 100_000,
            queue_capacity: 1024,
            max_fan_in: MAX_NODE_LINKS,
            max_fan_out: MAX_NODE_LINKS,
            worker_count: 0,
            numa_nodes: 0,
            execution_mode: ExecutionMode::default(),
            leader_mode: LeaderMode::default(),
            fill_strategy: FillStrategy::default(),
            block_on_full: false,
            max_lag_ns: 10_000_000,
            buffer_window_ns: 1_000_000_000,
            sync_frequency: 1,
            drop_policy: DropPolicy::default(),
            rate_clock: RateClock::default(),
            rate_interval_ns: 1_000_000,
            max_transient_retries: 3,
            error_threshold: None,
            max_streams: MAX_SYNC_STREAMS,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_pool_capacity == 0 {
            return Err(ConfigError::EmptyNodePool);
        }
        if !self.queue_capacity.is_power_of_two() {
            return Err(ConfigError::QueueCapacityNotPowerOfTwo(self.queue_capacity));
        }
        for (key, value) in [
            ("max_fan_in", self.max_fan_in),
            ("max_fan_out", self.max_fan_out),
        ] {
            if value == 0 || value > MAX_NODE_LINKS {
                return Err(ConfigError::FanLimitOutOfRange {
                    key,
                    max: MAX_NODE_LINKS,
                    value,
                });
            }
        }
        if self.max_streams == 0 || self.max_streams > MAX_SYNC_STREAMS {
            return Err(ConfigError::TooManyStreams {
                max: MAX_SYNC_STREAMS,
                value: self.max_streams,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_queue() {
        let config = EngineConfig {
            queue_capacity: 1000,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::QueueCapacityNotPowerOfTwo(1000))
        );
    }

    #[test]
    fn rejects_fan_in_beyond_inline_width() {
        let config = EngineConfig {
            max_fan_in: MAX_NODE_LINKS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
