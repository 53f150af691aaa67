//! Dag construction, validation and lifecycle.
//!
//! A dag is built single-threaded (`create_dag`, `add_node`, `connect`),
//! frozen by `finalize` (cycle check plus cached topological order) and torn
//! down by `destroy`, which returns its nodes to the pool with bumped
//! generations. Topology is immutable from `finalize` on; only the atomic
//! runtime counters inside node records change while a dag runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use tickflow_types::ahash::RandomState;
use tickflow_types::ids::{DagId, NodeId, SessionId, StreamId, SubscriptionId};
use tickflow_types::log::debug;
use tickflow_types::parking_lot::RwLock;

use crate::broker::{MessageBroker, Topic};
use crate::errors::ExecutionError;
use crate::node::{schema_tag, NumaHint, PortHandle, ProcessingUnit, UnitMetrics};
use crate::pool::NodePool;
use crate::units::{UnitBehavior, UnitSpec};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DagState {
    Building,
    Finalized,
    Running,
    Drained,
    Destroyed,
}

impl DagState {
    const fn as_tag(self) -> u8 {
        match self {
            DagState::Building => 0,
            DagState::Finalized => 1,
            DagState::Running => 2,
            DagState::Drained => 3,
            DagState::Destroyed => 4,
        }
    }

    const fn from_tag(tag: u8) -> DagState {
        match tag {
            0 => DagState::Building,
            1 => DagState::Finalized,
            2 => DagState::Running,
            3 => DagState::Drained,
            _ => DagState::Destroyed,
        }
    }
}

/// Cooperative cancellation state polled by workers between dispatches.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
    Idle,
    Running,
    /// Source priming stops; in-flight work finishes.
    Draining,
    /// Pending messages are dropped and workers skip the dag's nodes.
    Cancelled,
}

impl RunState {
    const fn as_tag(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Running => 1,
            RunState::Draining => 2,
            RunState::Cancelled => 3,
        }
    }

    const fn from_tag(tag: u8) -> RunState {
        match tag {
            0 => RunState::Idle,
            1 => RunState::Running,
            2 => RunState::Draining,
            _ => RunState::Cancelled,
        }
    }
}

/// Frozen at finalize: deterministic topological order and the source set.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub topo: Vec<NodeId>,
    pub sources: Vec<NodeId>,
}

#[derive(Debug)]
pub struct DagEntry {
    pub id: DagId,
    pub session: SessionId,
    state: AtomicU8,
    run_state: AtomicU8,
    nodes: RwLock<Vec<NodeId>>,
    plan: RwLock<Option<Arc<ExecutionPlan>>>,
}

impl DagEntry {
    pub fn state(&self) -> DagState {
        DagState::from_tag(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: DagState) {
        self.state.store(state.as_tag(), Ordering::Release);
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_tag(self.run_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        self.run_state.store(state.as_tag(), Ordering::Release);
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.read().clone()
    }

    pub fn plan(&self) -> Option<Arc<ExecutionPlan>> {
        self.plan.read().clone()
    }
}

/// Behavior storage parallel to the node pool: the unit of node `i` lives in
/// cell `i`.
struct UnitCell(std::cell::UnsafeCell<Option<UnitBehavior>>);

// A cell is written by the builder while its node is exclusively owned, and
// taken back at destroy; in between, the executor's in-flight guard serializes
// mutable access.
unsafe impl Sync for UnitCell {}

pub(crate) struct UnitSlab {
    cells: Box<[UnitCell]>,
}

impl UnitSlab {
    fn with_capacity(capacity: usize) -> UnitSlab {
        UnitSlab {
            cells: (0..capacity)
                .map(|_| UnitCell(std::cell::UnsafeCell::new(None)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    fn install(&self, index: u32, behavior: UnitBehavior) {
        // Exclusive: the node slot was just allocated to the builder.
        unsafe { *self.cells[index as usize].0.get() = Some(behavior) };
    }

    fn take(&self, index: u32) -> Option<UnitBehavior> {
        unsafe { (*self.cells[index as usize].0.get()).take() }
    }

    /// Shared read of a unit. Sound while the node is not mid-dispatch
    /// (builder-time schema checks, post-stop metrics).
    pub(crate) fn peek(&self, index: u32) -> Option<&UnitBehavior> {
        unsafe { (*self.cells[index as usize].0.get()).as_ref() }
    }

    /// Exclusive access for dispatch.
    ///
    /// # Safety
    ///
    /// The caller must hold the node's `in_flight` guard.
    pub(crate) unsafe fn get_mut(&self, index: u32) -> Option<&mut UnitBehavior> {
        (*self.cells[index as usize].0.get()).as_mut()
    }
}

pub struct DagManager {
    pool: Arc<NodePool>,
    pub(crate) units: UnitSlab,
    broker: Arc<MessageBroker>,
    dags: RwLock<HashMap<DagId, Arc<DagEntry>, RandomState>>,
    next_dag: AtomicU32,
    next_stream: AtomicU32,
    max_fan_in: usize,
    max_fan_out: usize,
}

impl DagManager {
    pub fn new(
        pool: Arc<NodePool>,
        broker: Arc<MessageBroker>,
        max_fan_in: usize,
        max_fan_out: usize,
    ) -> DagManager {
        let capacity = pool.capacity();
        DagManager {
            pool,
            units: UnitSlab::with_capacity(capacity),
            broker,
            dags: RwLock::new(HashMap::default()),
            next_dag: AtomicU32::new(1),
            next_stream: AtomicU32::new(1),
            max_fan_in,
            max_fan_out,
        }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Reserves a dag slot in `Building` state.
    pub fn create_dag(&self, session: SessionId) -> DagId {
        let index = self.next_dag.fetch_add(1, Ordering::Relaxed);
        let id = DagId::from_parts(index, 1);
        let entry = Arc::new(DagEntry {
            id,
            session,
            state: AtomicU8::new(DagState::Building.as_tag()),
            run_state: AtomicU8::new(RunState::Idle.as_tag()),
            nodes: RwLock::new(Vec::new()),
            plan: RwLock::new(None),
        });
        self.dags.write().insert(id, entry);
        id
    }

    /// Mints a handle for an external ingestion stream.
    pub fn create_stream(&self) -> StreamId {
        StreamId::from_parts(self.next_stream.fetch_add(1, Ordering::Relaxed), 1)
    }

    pub fn entry(&self, dag: DagId) -> Result<Arc<DagEntry>, ExecutionError> {
        self.dags
            .read()
            .get(&dag)
            .cloned()
            .ok_or(ExecutionError::UnknownDag(dag))
    }

    pub fn entries(&self) -> Vec<Arc<DagEntry>> {
        self.dags.read().values().cloned().collect()
    }

    fn building_entry(&self, dag: DagId) -> Result<Arc<DagEntry>, ExecutionError> {
        let entry = self.entry(dag)?;
        if entry.state() != DagState::Building {
            return Err(ExecutionError::ForbiddenWhileFinalized(dag));
        }
        Ok(entry)
    }

    pub fn add_node(&self, dag: DagId, spec: UnitSpec) -> Result<NodeId, ExecutionError> {
        let entry = self.building_entry(dag)?;
        let kind = spec.kind();
        let id = self.pool.allocate(dag, kind, 0)?;
        self.pool.get_mut(id)?.unit = id.index();

        let mut behavior = spec.build();
        behavior.on_attach(id, dag, NumaHint::Any);
        self.units.install(id.index(), behavior);

        entry.nodes.write().push(id);
        Ok(id)
    }

    /// Records the edge and attaches the delivery subscription.
    pub fn connect(
        &self,
        dag: DagId,
        src: NodeId,
        src_port: PortHandle,
        dst: NodeId,
        dst_port: PortHandle,
    ) -> Result<SubscriptionId, ExecutionError> {
        self.building_entry(dag)?;
        let src_record = self.pool.get(src)?;
        let dst_record = self.pool.get(dst)?;
        if src_record.dag != dag {
            return Err(ExecutionError::UnknownNode(src));
        }
        if dst_record.dag != dag {
            return Err(ExecutionError::UnknownNode(dst));
        }

        let src_unit = self
            .units
            .peek(src.index())
            .ok_or(ExecutionError::UnknownNode(src))?;
        let dst_unit = self
            .units
            .peek(dst.index())
            .ok_or(ExecutionError::UnknownNode(dst))?;
        let out_tag = schema_tag(src_unit.output_schema(), src_port)
            .ok_or(ExecutionError::InvalidPort {
                node: src,
                port: src_port,
            })?;
        let in_tag = schema_tag(dst_unit.input_schema(), dst_port)
            .ok_or(ExecutionError::InvalidPort {
                node: dst,
                port: dst_port,
            })?;
        if !out_tag.accepts(in_tag) {
            return Err(ExecutionError::SchemaMismatch {
                src,
                src_port,
                dst,
                dst_port,
            });
        }

        if src_record.out_count as usize >= self.max_fan_out {
            return Err(ExecutionError::FanOutExceeded(src));
        }
        if dst_record.in_count as usize >= self.max_fan_in {
            return Err(ExecutionError::FanInExceeded(dst));
        }

        {
            let record = self.pool.get_mut(src)?;
            let slot = record.out_count as usize;
            record.outputs[slot] = dst;
            record.out_count += 1;
        }
        {
            let record = self.pool.get_mut(dst)?;
            let slot = record.in_count as usize;
            record.inputs[slot] = src;
            record.in_count += 1;
        }

        Ok(self
            .broker
            .subscribe(Topic::node(src, src_port), dst, dst_port))
    }

    /// Validates acyclicity and freezes the execution plan.
    pub fn finalize(&self, dag: DagId) -> Result<(), ExecutionError> {
        let entry = self.building_entry(dag)?;
        let mut nodes = entry.nodes.read().clone();
        nodes.sort();

        self.check_acyclic(&nodes)?;
        let plan = self.topological_plan(&nodes)?;
        debug!(
            "finalized {dag}: {} nodes, {} sources",
            plan.topo.len(),
            plan.sources.len()
        );

        *entry.plan.write() = Some(Arc::new(plan));
        entry.set_state(DagState::Finalized);
        Ok(())
    }

    /// Releases every node back to the pool. A second destroy of the same
    /// handle fails with `UnknownDag`.
    pub fn destroy(&self, dag: DagId) -> Result<(), ExecutionError> {
        let entry = self.entry(dag)?;
        if entry.state() == DagState::Running {
            // Stop first; a fatal-cancelled dag is reported as such.
            return Err(if entry.run_state() == RunState::Cancelled {
                ExecutionError::Cancelled(dag)
            } else {
                ExecutionError::NotFinalized(dag)
            });
        }
        self.dags.write().remove(&dag);

        for id in entry.nodes.read().iter() {
            for subscription in self.broker.subscriptions_for_node(*id) {
                let _ = self.broker.unsubscribe(subscription.id);
            }
            if let Some(mut behavior) = self.units.take(id.index()) {
                behavior.on_detach();
            }
            self.pool.release(*id)?;
        }
        self.broker.sweep();
        entry.set_state(DagState::Destroyed);
        Ok(())
    }

    pub fn unit_metrics(&self, node: NodeId) -> Result<UnitMetrics, ExecutionError> {
        self.pool.get(node)?;
        self.units
            .peek(node.index())
            .map(|unit| unit.metrics())
            .ok_or(ExecutionError::UnknownNode(node))
    }

    /// Opaque unit-state snapshot, passed through untouched. Valid while the
    /// node is not mid-dispatch. A poisoned unit's state is mid-failure and
    /// is not snapshotted.
    pub fn snapshot_node(&self, node: NodeId) -> Result<Option<Vec<u8>>, ExecutionError> {
        let record = self.pool.get(node)?;
        if record.runtime.poisoned.load(Ordering::Acquire) {
            return Err(ExecutionError::Poisoned(node));
        }
        self.units
            .peek(node.index())
            .map(|unit| unit.snapshot())
            .ok_or(ExecutionError::UnknownNode(node))
    }

    /// Hands a previously taken snapshot back to the unit. Only valid while
    /// the owning dag is still `Building`.
    pub fn restore_node(&self, node: NodeId, snapshot: &[u8]) -> Result<(), ExecutionError> {
        let record = self.pool.get(node)?;
        self.building_entry(record.dag)?;
        // Exclusive: the dag is Building, so nothing dispatches this unit.
        match unsafe { self.units.get_mut(node.index()) } {
            Some(unit) => {
                unit.restore(snapshot);
                Ok(())
            }
            None => Err(ExecutionError::UnknownNode(node)),
        }
    }

    /// Iterative white/grey/black DFS over the dag's own nodes. Roots are
    /// visited in ascending id order and the first back edge found is
    /// reported, so the error is deterministic.
    fn check_acyclic(&self, nodes: &[NodeId]) -> Result<(), ExecutionError> {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;

        let position: HashMap<NodeId, usize, RandomState> = nodes
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect();
        let mut colors = vec![WHITE; nodes.len()];
        // Explicit stack bounded by the node count; no recursion.
        let mut stack: Vec<(usize, usize)> = Vec::with_capacity(nodes.len());

        for root in 0..nodes.len() {
            if colors[root] != WHITE {
                continue;
            }
            colors[root] = GREY;
            stack.push((root, 0));

            while let Some((current, child_index)) = stack.pop() {
                let record = self.pool.get(nodes[current])?;
                let outputs = record.output_ids();
                if child_index < outputs.len() {
                    stack.push((current, child_index + 1));
                    let child = outputs[child_index];
                    let Some(&child_position) = position.get(&child) else {
                        // Edge into another dag's node; unreachable by
                        // construction.
                        continue;
                    };
                    match colors[child_position] {
                        GREY => {
                            return Err(ExecutionError::CycleDetected {
                                from: nodes[current],
                                to: child,
                            });
                        }
                        WHITE => {
                            colors[child_position] = GREY;
                            stack.push((child_position, 0));
                        }
                        _ => {}
                    }
                } else {
                    colors[current] = BLACK;
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm with an ascending-id tie break among zero-in-degree
    /// nodes, making scheduler fairness reproducible.
    fn topological_plan(&self, nodes: &[NodeId]) -> Result<ExecutionPlan, ExecutionError> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let position: HashMap<NodeId, usize, RandomState> = nodes
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect();

        let mut in_degree = vec![0u32; nodes.len()];
        for id in nodes {
            in_degree[position[id]] = self.pool.get(*id)?.fan_in();
        }

        let mut heap: BinaryHeap<Reverse<NodeId>> = nodes
            .iter()
            .filter(|id| in_degree[position[*id]] == 0)
            .map(|id| Reverse(*id))
            .collect();
        let sources: Vec<NodeId> = {
            let mut sources: Vec<NodeId> = heap.iter().map(|entry| entry.0).collect();
            sources.sort();
            sources
        };

        let mut topo = Vec::with_capacity(nodes.len());
        while let Some(Reverse(id)) = heap.pop() {
            topo.push(id);
            for child in self.pool.get(id)?.output_ids() {
                let child_position = position[child];
                in_degree[child_position] -= 1;
                if in_degree[child_position] == 0 {
                    heap.push(Reverse(*child));
                }
            }
        }

        if topo.len() != nodes.len() {
            // finalize checked acyclicity already.
            return Err(ExecutionError::Internal(
                "topological order incomplete on an acyclic dag".to_string(),
            ));
        }
        Ok(ExecutionPlan { topo, sources })
    }
}
