//! The engine's stable surface: one `Runtime` handle owning the node pool,
//! broker, dag registry and executor. There is no hidden global state; tests
//! build a fresh runtime per scenario and production builds one per process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tickflow_types::ahash::RandomState;
use tickflow_types::config::EngineConfig;
use tickflow_types::ids::{DagId, MessageSeq, NodeId, SessionId, StreamId, SubscriptionId};
use tickflow_types::log::debug;
use tickflow_types::message::Message;
use tickflow_types::parking_lot::RwLock;

use crate::broker::{MessageBroker, PublishOutcome, Topic};
use crate::dag::{DagManager, DagState, RunState};
use crate::errors::ExecutionError;
use crate::executor::{DagExecutor, ExecutorOptions, StopMode};
use crate::node::{PortHandle, UnitMetrics};
use crate::pool::NodePool;
use crate::sync::SyncConfig;
use crate::units::UnitSpec;

pub struct Runtime {
    config: EngineConfig,
    pool: Arc<NodePool>,
    broker: Arc<MessageBroker>,
    dags: Arc<DagManager>,
    executor: DagExecutor,
    next_session: AtomicU32,
    stream_seqs: RwLock<HashMap<StreamId, Arc<AtomicU64>, RandomState>>,
}

impl Runtime {
    /// Builds the runtime and spawns its worker pool.
    pub fn initialize(config: EngineConfig) -> Result<Runtime, ExecutionError> {
        config.validate()?;
        let pool = Arc::new(NodePool::with_capacity(config.node_pool_capacity));
        let broker = Arc::new(MessageBroker::new(
            config.queue_capacity,
            config.block_on_full,
        ));
        let dags = Arc::new(DagManager::new(
            Arc::clone(&pool),
            Arc::clone(&broker),
            config.max_fan_in,
            config.max_fan_out,
        ));
        let executor = DagExecutor::new(
            Arc::clone(&dags),
            Arc::clone(&broker),
            ExecutorOptions::from_config(&config),
        )?;
        debug!(
            "runtime {} up: pool={} queue={}",
            Runtime::version(),
            config.node_pool_capacity,
            config.queue_capacity
        );
        Ok(Runtime {
            config,
            pool,
            broker,
            dags,
            executor,
            next_session: AtomicU32::new(1),
            stream_seqs: RwLock::new(HashMap::default()),
        })
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn live_nodes(&self) -> usize {
        self.pool.live()
    }

    /// Opens an independent tenant context. Sessions share nothing: each dag
    /// belongs to exactly one session and node ranges are disjoint.
    pub fn create_session(&self) -> SessionId {
        SessionId::from_parts(self.next_session.fetch_add(1, Ordering::Relaxed), 1)
    }

    pub fn create_dag(&self, session: SessionId) -> DagId {
        self.dags.create_dag(session)
    }

    pub fn add_node(&self, dag: DagId, spec: UnitSpec) -> Result<NodeId, ExecutionError> {
        self.dags.add_node(dag, spec)
    }

    pub fn connect(
        &self,
        dag: DagId,
        src: NodeId,
        src_port: PortHandle,
        dst: NodeId,
        dst_port: PortHandle,
    ) -> Result<SubscriptionId, ExecutionError> {
        self.dags.connect(dag, src, src_port, dst, dst_port)
    }

    pub fn finalize(&self, dag: DagId) -> Result<(), ExecutionError> {
        self.dags.finalize(dag)
    }

    pub fn start(&self, dag: DagId) -> Result<(), ExecutionError> {
        self.executor.start(dag)
    }

    pub fn stop(&self, dag: DagId, mode: StopMode) -> Result<(), ExecutionError> {
        self.executor.stop(dag, mode)
    }

    pub fn destroy(&self, dag: DagId) -> Result<(), ExecutionError> {
        self.dags.destroy(dag)
    }

    pub fn dag_state(&self, dag: DagId) -> Result<DagState, ExecutionError> {
        Ok(self.dags.entry(dag)?.state())
    }

    /// Registers an external ingestion stream and its sequence counter.
    pub fn create_stream(&self) -> StreamId {
        let id = self.dags.create_stream();
        self.stream_seqs
            .write()
            .insert(id, Arc::new(AtomicU64::new(0)));
        id
    }

    /// Attaches a delivery channel from `topic` to a node input. Input
    /// wiring freezes when the owning dag starts, so this must happen
    /// before `start`.
    pub fn subscribe(
        &self,
        topic: Topic,
        node: NodeId,
        port: PortHandle,
    ) -> Result<SubscriptionId, ExecutionError> {
        let record = self.pool.get(node)?;
        if record.runtime.poisoned.load(Ordering::Acquire) {
            return Err(ExecutionError::Poisoned(node));
        }
        let entry = self.dags.entry(record.dag)?;
        if entry.state() == DagState::Running {
            return Err(ExecutionError::ForbiddenWhileFinalized(record.dag));
        }
        Ok(self.broker.subscribe(topic, node, port))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ExecutionError> {
        self.broker.unsubscribe(id)
    }

    /// Publishes one message into a stream topic, stamping the per-stream
    /// sequence. Blocking subscriptions may make this spin; see
    /// [`publish_deadline`](Self::publish_deadline) for a bounded wait.
    pub fn publish(
        &self,
        stream: StreamId,
        message: Message,
    ) -> Result<PublishOutcome, ExecutionError> {
        self.publish_deadline(stream, message, None)
    }

    pub fn publish_deadline(
        &self,
        stream: StreamId,
        mut message: Message,
        deadline: Option<Instant>,
    ) -> Result<PublishOutcome, ExecutionError> {
        let seq = self
            .stream_seqs
            .read()
            .get(&stream)
            .cloned()
            .ok_or(ExecutionError::UnknownStream(stream))?;
        message.stamp(0, MessageSeq(seq.fetch_add(1, Ordering::Relaxed)));
        self.executor
            .publish(Topic::stream(stream), &message, deadline)
    }

    pub fn unit_metrics(&self, node: NodeId) -> Result<UnitMetrics, ExecutionError> {
        self.dags.unit_metrics(node)
    }

    pub fn node_stats(&self, node: NodeId) -> Result<crate::pool::NodeStats, ExecutionError> {
        Ok(self.pool.get(node)?.stats())
    }

    /// Opaque unit-state snapshot; the engine neither reads nor rewrites it.
    pub fn snapshot_node(&self, node: NodeId) -> Result<Option<Vec<u8>>, ExecutionError> {
        self.dags.snapshot_node(node)
    }

    pub fn restore_node(&self, node: NodeId, snapshot: &[u8]) -> Result<(), ExecutionError> {
        self.dags.restore_node(node, snapshot)
    }

    pub fn run_state(&self, dag: DagId) -> Result<crate::dag::RunState, ExecutionError> {
        Ok(self.dags.entry(dag)?.run_state())
    }

    /// Starts a fluent synchronizer profile for `dag`, seeded from the
    /// engine configuration.
    pub fn sync_profile(&self, dag: DagId) -> StreamProfileBuilder<'_> {
        StreamProfileBuilder {
            runtime: self,
            dag,
            streams: Vec::new(),
            config: SyncConfig::from_engine(&self.config),
        }
    }

    /// Drains every running dag (cancel-stops the ones a fatal failure
    /// already cancelled), then stops the workers.
    pub fn shutdown(self) -> Result<(), ExecutionError> {
        for entry in self.dags.entries() {
            if entry.state() == DagState::Running {
                let mode = if entry.run_state() == RunState::Cancelled {
                    StopMode::Cancel
                } else {
                    StopMode::Drain
                };
                self.executor.stop(entry.id, mode)?;
            }
        }
        self.executor.shutdown();
        Ok(())
    }
}

/// Result of attaching a synchronizer profile: the synchronizer node and the
/// per-stream input subscriptions, in stream slot order.
#[derive(Debug)]
pub struct SyncProfile {
    pub node: NodeId,
    pub inputs: Vec<(StreamId, SubscriptionId)>,
}

/// Fluent configuration of a synchronizer node over a set of streams, in the
/// spirit of a session profile: declare streams, pick the leader policy and
/// fill, then attach.
pub struct StreamProfileBuilder<'a> {
    runtime: &'a Runtime,
    dag: DagId,
    streams: Vec<StreamId>,
    config: SyncConfig,
}

impl<'a> StreamProfileBuilder<'a> {
    /// Adds one stream; its slot (and input port) is the call order.
    pub fn stream(mut self, stream: StreamId) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn leader_mode(mut self, mode: tickflow_types::config::LeaderMode) -> Self {
        self.config.leader_mode = mode;
        self
    }

    /// Leads with the `slot`-th declared stream under `FixedLeader`.
    pub fn fixed_leader(mut self, slot: u16) -> Self {
        self.config.leader_mode = tickflow_types::config::LeaderMode::FixedLeader;
        self.config.fixed_leader = slot;
        self
    }

    pub fn fill_strategy(mut self, strategy: tickflow_types::config::FillStrategy) -> Self {
        self.config.fill_strategy = strategy;
        self
    }

    pub fn drop_policy(mut self, policy: tickflow_types::config::DropPolicy) -> Self {
        self.config.drop_policy = policy;
        self
    }

    pub fn max_lag_ns(mut self, max_lag_ns: u64) -> Self {
        self.config.max_lag_ns = max_lag_ns;
        self
    }

    pub fn sync_frequency(mut self, frequency: u64) -> Self {
        self.config.sync_frequency = frequency.max(1);
        self
    }

    /// Creates the synchronizer node and subscribes it to every declared
    /// stream.
    pub fn attach(self) -> Result<SyncProfile, ExecutionError> {
        let mut config = self.config;
        config.max_streams = config.max_streams.max(self.streams.len());
        let node = self
            .runtime
            .add_node(self.dag, UnitSpec::Synchronizer(config))?;
        let mut inputs = Vec::with_capacity(self.streams.len());
        for (slot, stream) in self.streams.into_iter().enumerate() {
            let subscription =
                self.runtime
                    .subscribe(Topic::stream(stream), node, slot as PortHandle)?;
            inputs.push((stream, subscription));
        }
        Ok(SyncProfile { node, inputs })
    }
}
