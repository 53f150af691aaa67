//! Readiness-driven work-stealing executor.
//!
//! Nodes become ready according to the execution mode and are pushed onto a
//! global slot-sequence queue; workers prefer their own Chase-Lev deque,
//! then the global queue, then stealing from a victim. An idle worker parks
//! on its event counter until a delivery wakes it.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::deque::{Stealer, Worker as WorkerDeque};
use crossbeam::sync::{Parker, Unparker};
use crossbeam::utils::Backoff;
use metrics::counter;
use tickflow_types::ahash::RandomState;
use tickflow_types::config::{EngineConfig, ExecutionMode, RateClock};
use tickflow_types::ids::{DagId, NodeId};
use tickflow_types::log::{debug, warn};
use tickflow_types::message::Message;
use tickflow_types::parking_lot::{Mutex, RwLock};

use crate::arena::PayloadArena;
use crate::broker::{MessageBroker, PublishOutcome, Subscription, Topic};
use crate::dag::{DagManager, DagState, RunState};
use crate::error_manager::ErrorManager;
use crate::errors::ExecutionError;
use crate::pool::NodePool;
use crate::queue::mpmc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    /// Stop priming sources, let in-flight work finish, keep results.
    Drain,
    /// Drop pending messages and wake parked workers.
    Cancel,
}

#[derive(Clone, Debug)]
pub struct ExecutorOptions {
    pub worker_count: usize,
    pub execution_mode: ExecutionMode,
    pub rate_clock: RateClock,
    pub rate_interval_ns: u64,
    pub max_transient_retries: u32,
    /// Engine-wide poisoning budget; crossing it cancels the failing dag.
    pub error_threshold: Option<u32>,
    /// Core placement mask; zero disables pinning.
    pub numa_nodes: u64,
    pub ready_capacity: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            worker_count: 0,
            execution_mode: ExecutionMode::Streaming,
            rate_clock: RateClock::WallClock,
            rate_interval_ns: 1_000_000,
            max_transient_retries: 3,
            error_threshold: None,
            numa_nodes: 0,
            ready_capacity: 64 * 1024,
        }
    }
}

impl ExecutorOptions {
    pub fn from_config(config: &EngineConfig) -> ExecutorOptions {
        ExecutorOptions {
            worker_count: config.worker_count,
            execution_mode: config.execution_mode,
            rate_clock: config.rate_clock,
            rate_interval_ns: config.rate_interval_ns,
            max_transient_retries: config.max_transient_retries,
            error_threshold: config.error_threshold,
            numa_nodes: config.numa_nodes,
            ready_capacity: 64 * 1024,
        }
    }

    fn resolved_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        thread::available_parallelism().map_or(1, |n| n.get())
    }
}

/// Nanoseconds since executor-process start; a monotonic stand-in for wall
/// clock that avoids a syscall per read.
pub(crate) fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

type InputMap = HashMap<NodeId, Arc<[Arc<Subscription>]>, RandomState>;

/// State shared between the executor handle and its workers.
pub(crate) struct Shared {
    pub pool: Arc<NodePool>,
    pub dags: Arc<DagManager>,
    pub broker: Arc<MessageBroker>,
    pub options: ExecutorOptions,
    /// Global ready queue.
    pub injector: mpmc::Queue<NodeId>,
    /// Per-node input subscriptions, frozen at `start`.
    pub inputs: RwLock<InputMap>,
    /// Lazily created per-node payload arenas, indexed by pool slot.
    arenas: Box<[OnceLock<Arc<PayloadArena>>]>,
    /// Nodes deferred by `Rate` pacing, keyed by due time.
    pub rate_deferred: Mutex<std::collections::BinaryHeap<std::cmp::Reverse<(u64, NodeId)>>>,
    stealers: RwLock<Vec<Stealer<NodeId>>>,
    unparkers: Vec<Unparker>,
    next_unpark: AtomicUsize,
    pub sleepers: AtomicUsize,
    pub shutdown: AtomicBool,
    pub errors: ErrorManager,
}

impl Shared {
    /// Arms a node onto the ready queue unless it is already queued.
    pub fn schedule(&self, id: NodeId) {
        let Ok(record) = self.pool.get(id) else {
            return;
        };
        if record
            .runtime
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if self.injector.push(id).is_err() {
            // Ready queue saturated; the node stays marked and the owning
            // worker re-arms it when it next runs.
            record.runtime.scheduled.store(false, Ordering::Release);
            counter!("tickflow_executor_ready_overflow", 1);
            return;
        }
        self.unpark_one();
    }

    /// Readiness propagation for one delivered message.
    pub fn on_delivery(&self, subscription: &Subscription) {
        let Ok(record) = self.pool.get(subscription.node) else {
            return;
        };
        match self.options.execution_mode {
            ExecutionMode::Streaming => self.schedule(subscription.node),
            ExecutionMode::BarrierSynchronous | ExecutionMode::Rate => {
                if record.fan_in() == 0 {
                    self.schedule(subscription.node);
                    return;
                }
                let Some(subscriptions) = self.input_subscriptions(subscription.node) else {
                    return;
                };
                // A wave can be completed by two producers concurrently; the
                // fence keeps at least one post-push check from reading the
                // other's queue as still empty.
                std::sync::atomic::fence(Ordering::SeqCst);
                let missing = subscriptions
                    .iter()
                    .filter(|s| s.queue_len() == 0)
                    .count() as u32;
                record
                    .runtime
                    .pending_inputs
                    .store(missing, Ordering::Release);
                if missing == 0 {
                    self.schedule(subscription.node);
                }
            }
        }
    }

    pub fn arena(&self, slot: u32) -> Option<&Arc<PayloadArena>> {
        self.arenas.get(slot as usize)?.get()
    }

    pub fn arena_or_init(&self, slot: u32) -> &Arc<PayloadArena> {
        self.arenas[slot as usize].get_or_init(|| Arc::new(PayloadArena::new()))
    }

    pub fn input_subscriptions(&self, id: NodeId) -> Option<Arc<[Arc<Subscription>]>> {
        self.inputs.read().get(&id).cloned()
    }

    pub fn stealers(&self) -> Vec<Stealer<NodeId>> {
        self.stealers.read().clone()
    }

    fn unpark_one(&self) {
        if self.sleepers.load(Ordering::Acquire) == 0 {
            return;
        }
        let index = self.next_unpark.fetch_add(1, Ordering::Relaxed);
        if let Some(unparker) = self.unparkers.get(index % self.unparkers.len()) {
            unparker.unpark();
        }
    }

    pub fn wake_all(&self) {
        for unparker in &self.unparkers {
            unparker.unpark();
        }
    }

    /// Moves rate-deferred nodes whose due time has passed back to ready.
    pub fn pump_rate_deferred(&self) {
        if self.options.execution_mode != ExecutionMode::Rate {
            return;
        }
        let now = now_ns();
        let mut deferred = self.rate_deferred.lock();
        while let Some(std::cmp::Reverse((due, id))) = deferred.peek().copied() {
            if due > now {
                break;
            }
            deferred.pop();
            let Ok(record) = self.pool.get(id) else {
                continue;
            };
            record.runtime.scheduled.store(false, Ordering::Release);
            self.schedule(id);
        }
    }

    pub fn defer_until(&self, id: NodeId, due_ns: u64) {
        self.rate_deferred
            .lock()
            .push(std::cmp::Reverse((due_ns, id)));
    }
}

pub struct DagExecutor {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl DagExecutor {
    pub fn new(
        dags: Arc<DagManager>,
        broker: Arc<MessageBroker>,
        options: ExecutorOptions,
    ) -> Result<DagExecutor, ExecutionError> {
        let worker_count = options.resolved_worker_count();
        let pool = Arc::clone(dags.pool());
        let capacity = pool.capacity();

        let mut parkers = Vec::with_capacity(worker_count);
        let mut unparkers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            parkers.push(parker);
        }

        let mut deques = Vec::with_capacity(worker_count);
        let mut stealers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let deque = WorkerDeque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let shared = Arc::new(Shared {
            pool,
            dags,
            broker,
            injector: mpmc::Queue::with_capacity(options.ready_capacity),
            inputs: RwLock::new(HashMap::default()),
            arenas: (0..capacity)
                .map(|_| OnceLock::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            rate_deferred: Mutex::new(std::collections::BinaryHeap::new()),
            stealers: RwLock::new(stealers),
            unparkers,
            next_unpark: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            errors: match options.error_threshold {
                Some(threshold) => ErrorManager::new_threshold(threshold),
                None => ErrorManager::new_unlimited(),
            },
            options,
        });

        let pinning = worker::core_assignments(shared.options.numa_nodes, worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for (index, (deque, parker)) in deques.into_iter().zip(parkers).enumerate() {
            let shared = Arc::clone(&shared);
            let core = pinning.get(index).copied().flatten();
            handles.push(
                thread::Builder::new()
                    .name(format!("tickflow-worker-{index}"))
                    .spawn(move || worker::worker_loop(shared, deque, parker, index, core))?,
            );
        }

        Ok(DagExecutor { shared, handles })
    }

    /// Primes source nodes and opens the dag for dispatch.
    pub fn start(&self, dag: DagId) -> Result<(), ExecutionError> {
        let entry = self.shared.dags.entry(dag)?;
        if entry.run_state() == RunState::Cancelled {
            return Err(ExecutionError::Cancelled(dag));
        }
        if entry.state() != DagState::Finalized {
            return Err(ExecutionError::NotFinalized(dag));
        }
        let plan = entry
            .plan()
            .ok_or_else(|| ExecutionError::Internal(format!("finalized dag {dag} has no plan")))?;

        // Freeze per-node input wiring and arm pending counters.
        {
            let mut inputs = self.shared.inputs.write();
            for id in &plan.topo {
                let subscriptions: Arc<[Arc<Subscription>]> =
                    self.shared.broker.subscriptions_for_node(*id).into();
                let record = self.shared.pool.get(*id)?;
                // Every input is empty at start, so every input is missing.
                // The gauge only gates barrier modes.
                let missing = match self.shared.options.execution_mode {
                    ExecutionMode::Streaming => 0,
                    _ => subscriptions.len() as u32,
                };
                record
                    .runtime
                    .pending_inputs
                    .store(missing, Ordering::Release);
                inputs.insert(*id, subscriptions);
            }
        }

        entry.set_state(DagState::Running);
        entry.set_run_state(RunState::Running);
        debug!("starting {dag} with {} sources", plan.sources.len());
        for source in &plan.sources {
            self.shared.schedule(*source);
        }
        Ok(())
    }

    /// Publishes an external message, arming readiness for each delivery.
    /// Blocking subscriptions are retried with a cooperative backoff until
    /// `deadline`, if any.
    pub fn publish(
        &self,
        topic: Topic,
        message: &Message,
        deadline: Option<Instant>,
    ) -> Result<PublishOutcome, ExecutionError> {
        let backoff = Backoff::new();
        loop {
            let attempt = self.shared.broker.try_publish_with(topic, message, &mut |s| {
                self.shared.on_delivery(s)
            });
            match attempt {
                Err(ExecutionError::WouldBlock) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(ExecutionError::Timeout);
                        }
                    }
                    backoff.snooze();
                }
                other => return other,
            }
        }
    }

    pub fn stop(&self, dag: DagId, mode: StopMode) -> Result<(), ExecutionError> {
        let entry = self.shared.dags.entry(dag)?;
        if entry.state() != DagState::Running {
            return Err(ExecutionError::NotFinalized(dag));
        }
        match mode {
            StopMode::Drain => {
                // A cancelled dag has already dropped work; it cannot be
                // drained, only cancel-stopped.
                if entry.run_state() == RunState::Cancelled {
                    return Err(ExecutionError::Cancelled(dag));
                }
                entry.set_run_state(RunState::Draining);
                self.wait_quiesced(dag)?;
                entry.set_run_state(RunState::Idle);
            }
            StopMode::Cancel => {
                entry.set_run_state(RunState::Cancelled);
                self.shared.wake_all();
                // Queues are single-consumer; wait out in-flight dispatches
                // before draining them from this thread.
                self.wait_no_in_flight(dag)?;
                self.drop_pending(dag)?;
            }
        }
        entry.set_state(DagState::Drained);
        Ok(())
    }

    fn wait_no_in_flight(&self, dag: DagId) -> Result<(), ExecutionError> {
        let entry = self.shared.dags.entry(dag)?;
        let plan = entry
            .plan()
            .ok_or_else(|| ExecutionError::Internal(format!("running dag {dag} has no plan")))?;
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let busy = plan.topo.iter().any(|id| {
                self.shared
                    .pool
                    .get(*id)
                    .map(|record| record.runtime.in_flight.load(Ordering::Acquire))
                    .unwrap_or(false)
            });
            if !busy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ExecutionError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Waits until none of the dag's nodes is queued, in flight, or holding
    /// undelivered input.
    fn wait_quiesced(&self, dag: DagId) -> Result<(), ExecutionError> {
        let entry = self.shared.dags.entry(dag)?;
        let plan = entry
            .plan()
            .ok_or_else(|| ExecutionError::Internal(format!("running dag {dag} has no plan")))?;

        let deadline = Instant::now() + Duration::from_secs(30);
        let mut clean_passes = 0;
        while clean_passes < 3 {
            if Instant::now() >= deadline {
                return Err(ExecutionError::Timeout);
            }
            let mut busy = false;
            for id in &plan.topo {
                let record = self.shared.pool.get(*id)?;
                if record.runtime.in_flight.load(Ordering::Acquire)
                    || record.runtime.scheduled.load(Ordering::Acquire)
                {
                    busy = true;
                    break;
                }
                if !record.runtime.poisoned.load(Ordering::Acquire) {
                    if let Some(subscriptions) = self.shared.input_subscriptions(*id) {
                        if subscriptions.iter().any(|s| s.queue_len() > 0) {
                            busy = true;
                            break;
                        }
                    }
                }
            }
            if busy {
                clean_passes = 0;
                thread::sleep(Duration::from_millis(1));
            } else {
                clean_passes += 1;
            }
        }
        Ok(())
    }

    fn drop_pending(&self, dag: DagId) -> Result<(), ExecutionError> {
        let entry = self.shared.dags.entry(dag)?;
        let plan = entry
            .plan()
            .ok_or_else(|| ExecutionError::Internal(format!("running dag {dag} has no plan")))?;
        let mut dropped = 0u64;
        for id in &plan.topo {
            let record = self.shared.pool.get(*id)?;
            // Single-consumer queues: skip a node a worker is draining.
            if record
                .runtime
                .in_flight
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let mut node_dropped = 0u64;
            if let Some(subscriptions) = self.shared.input_subscriptions(*id) {
                for subscription in subscriptions.iter() {
                    while subscription.pop().is_some() {
                        node_dropped += 1;
                    }
                }
            }
            record.runtime.dropped.fetch_add(node_dropped, Ordering::Relaxed);
            record.runtime.in_flight.store(false, Ordering::Release);
            dropped += node_dropped;
        }
        if dropped > 0 {
            warn!("cancelled {dag}: dropped {dropped} pending messages");
        }
        Ok(())
    }

    /// Stops every worker and joins them.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for DagExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
