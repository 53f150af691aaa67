use tickflow_types::config::ConfigError;
use tickflow_types::ids::{DagId, NodeId, StreamId, SubscriptionId};
use tickflow_types::message::PayloadTooLarge;
use tickflow_types::thiserror;
use tickflow_types::thiserror::Error;

use crate::node::PortHandle;

#[derive(Error, Debug, PartialEq)]
pub enum ExecutionError {
    #[error("Node pool exhausted")]
    PoolExhausted,
    #[error("Subscription queue is full")]
    QueueFull,
    #[error("Publish would block on a blocking subscription")]
    WouldBlock,
    #[error("Publish deadline expired")]
    Timeout,
    #[error("Unknown or stale node handle: {0}")]
    UnknownNode(NodeId),
    #[error("Unknown or stale dag handle: {0}")]
    UnknownDag(DagId),
    #[error("Unknown stream handle: {0}")]
    UnknownStream(StreamId),
    #[error("Unknown subscription handle: {0}")]
    UnknownSubscription(SubscriptionId),
    #[error("Adding edge {from} -> {to} closes a cycle")]
    CycleDetected { from: NodeId, to: NodeId },
    #[error("Fan-in limit reached on node {0}")]
    FanInExceeded(NodeId),
    #[error("Fan-out limit reached on node {0}")]
    FanOutExceeded(NodeId),
    #[error("Dag {0} is finalized; topology changes are forbidden")]
    ForbiddenWhileFinalized(DagId),
    #[error("Dag {0} is not in a valid lifecycle state for this operation")]
    NotFinalized(DagId),
    #[error(
        "Schema mismatch connecting {src} port {src_port} to {dst} port {dst_port}"
    )]
    SchemaMismatch {
        src: NodeId,
        src_port: PortHandle,
        dst: NodeId,
        dst_port: PortHandle,
    },
    #[error("Invalid port {port} on node {node}")]
    InvalidPort { node: NodeId, port: PortHandle },
    #[error(transparent)]
    PayloadOverflow(#[from] PayloadTooLarge),
    #[error("Node {0} is poisoned")]
    Poisoned(NodeId),
    #[error("Dag {0} is cancelled")]
    Cancelled(DagId),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Cannot spawn worker thread: {0}")]
    CannotSpawnWorkerThread(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ExecutionError {
    fn from(error: std::io::Error) -> Self {
        ExecutionError::CannotSpawnWorkerThread(error.to_string())
    }
}
