//! Worker loop: pop, steal, dispatch, propagate readiness.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::deque::{Steal, Stealer, Worker as WorkerDeque};
use crossbeam::sync::Parker;
use crossbeam::utils::Backoff;
use metrics::counter;
use tickflow_types::config::{ExecutionMode, RateClock};
use tickflow_types::ids::{MessageSeq, NodeId};
use tickflow_types::log::warn;
use tickflow_types::message::{ArenaHandle, Message, TypeTag};

use crate::broker::Topic;
use crate::dag::RunState;
use crate::errors::ExecutionError;
use crate::node::{BlobResolver, Inputs, PortHandle, ProcessingUnit, UnitStatus};
use crate::pool::NodeRecord;
use crate::OutputChannelForwarder;

use super::{now_ns, Shared};

/// Maps the placement mask to concrete core assignments, round-robin over
/// the allowed cores. Bit `b` of the mask admits core id `b`.
pub(crate) fn core_assignments(
    mask: u64,
    worker_count: usize,
) -> Vec<Option<core_affinity::CoreId>> {
    if mask == 0 {
        return vec![None; worker_count];
    }
    let allowed: Vec<_> = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .filter(|core| core.id < 64 && mask & (1 << core.id) != 0)
        .collect();
    if allowed.is_empty() {
        warn!("numa mask {mask:#x} matches no cores; running unpinned");
        return vec![None; worker_count];
    }
    (0..worker_count)
        .map(|index| Some(allowed[index % allowed.len()]))
        .collect()
}

struct DispatchScratch {
    messages: Vec<Message>,
}

pub(crate) fn worker_loop(
    shared: Arc<Shared>,
    local: WorkerDeque<NodeId>,
    parker: Parker,
    index: usize,
    core: Option<core_affinity::CoreId>,
) {
    if let Some(core) = core {
        core_affinity::set_for_current(core);
    }
    let stealers = shared.stealers();
    let mut scratch = DispatchScratch {
        messages: Vec::with_capacity(4096),
    };

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared.pump_rate_deferred();

        let next = local
            .pop()
            .or_else(|| shared.injector.pop())
            .or_else(|| steal(&stealers, index));
        match next {
            Some(id) => run_node(&shared, id, &mut scratch),
            None => park(&shared, &parker),
        }
    }
}

fn steal(stealers: &[Stealer<NodeId>], self_index: usize) -> Option<NodeId> {
    for (victim, stealer) in stealers.iter().enumerate() {
        if victim == self_index {
            continue;
        }
        loop {
            match stealer.steal() {
                Steal::Success(id) => {
                    counter!("tickflow_executor_steals", 1);
                    return Some(id);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

fn park(shared: &Shared, parker: &Parker) {
    shared.sleepers.fetch_add(1, Ordering::SeqCst);
    if shared.injector.is_empty() && !shared.shutdown.load(Ordering::Acquire) {
        parker.park_timeout(Duration::from_millis(1));
    }
    shared.sleepers.fetch_sub(1, Ordering::SeqCst);
}

fn run_node(shared: &Shared, id: NodeId, scratch: &mut DispatchScratch) {
    let Ok(record) = shared.pool.get(id) else {
        return;
    };
    record.runtime.scheduled.store(false, Ordering::Release);
    let Ok(entry) = shared.dags.entry(record.dag) else {
        return;
    };
    match entry.run_state() {
        RunState::Cancelled => {
            drop_inputs(shared, record, id);
            return;
        }
        RunState::Idle => return,
        RunState::Running | RunState::Draining => {}
    }
    if record.runtime.poisoned.load(Ordering::Acquire) {
        drop_inputs(shared, record, id);
        return;
    }
    let Some(subscriptions) = shared.input_subscriptions(id) else {
        return;
    };

    let mode = shared.options.execution_mode;
    let barrier = mode != ExecutionMode::Streaming && record.fan_in() > 0;

    if mode == ExecutionMode::Rate {
        let last = record.runtime.last_dispatch_ns.load(Ordering::Acquire);
        let interval = shared.options.rate_interval_ns;
        let now = match shared.options.rate_clock {
            RateClock::WallClock => now_ns(),
            // Message-time pacing compares against the newest queued input.
            RateClock::MessageTime => subscriptions
                .iter()
                .filter_map(|s| s.peek().map(|m| m.timestamp_ns))
                .max()
                .unwrap_or_else(now_ns),
        };
        if last != 0 && now < last.saturating_add(interval) {
            let remaining = last + interval - now;
            shared.defer_until(id, now_ns().saturating_add(remaining));
            return;
        }
    }

    // Barrier dispatch requires one message from every input.
    if barrier && subscriptions.iter().any(|s| s.queue_len() == 0) {
        return;
    }

    if record
        .runtime
        .in_flight
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        // Another worker is mid-dispatch. Keep the wakeup alive by
        // recirculating the token; touching the scheduled flag here could
        // strand it.
        let _ = shared.injector.push(id);
        return;
    }

    scratch.messages.clear();
    if barrier {
        for subscription in subscriptions.iter() {
            if let Some(message) = subscription.pop() {
                scratch.messages.push(message);
            }
        }
    } else {
        for subscription in subscriptions.iter() {
            while let Some(message) = subscription.pop() {
                scratch.messages.push(message);
            }
        }
    }

    // Spurious wakeup of a non-source node: nothing to do.
    if scratch.messages.is_empty() && record.fan_in() > 0 {
        record.runtime.in_flight.store(false, Ordering::Release);
        return;
    }

    let dispatch_stamp = match shared.options.rate_clock {
        RateClock::WallClock => now_ns(),
        RateClock::MessageTime => scratch
            .messages
            .iter()
            .map(|m| m.timestamp_ns)
            .max()
            .unwrap_or_else(now_ns),
    };

    let resolver = ArenaResolver { shared };
    let mut forwarder = BrokerForwarder {
        shared,
        record,
        undeliverable: 0,
    };
    // Safety: this worker holds the in-flight guard.
    let status = match unsafe { shared.dags.units.get_mut(record.unit) } {
        Some(unit) => unit.process(&Inputs::new(&scratch.messages, &resolver), &mut forwarder),
        None => {
            record.runtime.in_flight.store(false, Ordering::Release);
            return;
        }
    };
    if forwarder.undeliverable > 0 {
        record
            .runtime
            .dropped
            .fetch_add(forwarder.undeliverable, Ordering::Relaxed);
    }

    record.runtime.dispatches.fetch_add(1, Ordering::Relaxed);
    record
        .runtime
        .last_dispatch_ns
        .store(dispatch_stamp, Ordering::Release);
    counter!("tickflow_executor_dispatches", 1);

    let mut requeue_transient = false;
    match status {
        UnitStatus::Ok => {
            record.runtime.retries.store(0, Ordering::Relaxed);
        }
        UnitStatus::Transient => {
            let retries = record.runtime.retries.fetch_add(1, Ordering::Relaxed) + 1;
            if retries <= shared.options.max_transient_retries {
                requeue_transient = true;
            } else {
                poison(shared, record, id, "transient retries exhausted");
            }
        }
        UnitStatus::Permanent => poison(shared, record, id, "permanent failure"),
        UnitStatus::Fatal => {
            record.runtime.errors.fetch_add(1, Ordering::Relaxed);
            warn!("{id} reported fatal; cancelling {}", record.dag);
            entry.set_run_state(RunState::Cancelled);
            shared.wake_all();
        }
    }

    record.runtime.in_flight.store(false, Ordering::Release);

    if requeue_transient {
        // One paced retry; further failures count toward the poison bound.
        Backoff::new().snooze();
        shared.schedule(id);
        return;
    }

    // Re-arm when input is already waiting (or arrived mid-dispatch). The
    // swap consumes any wakeup that raced the dispatch.
    let backlog = if barrier {
        let missing = subscriptions.iter().filter(|s| s.queue_len() == 0).count() as u32;
        record
            .runtime
            .pending_inputs
            .store(missing, Ordering::Release);
        missing == 0
    } else {
        subscriptions.iter().any(|s| s.queue_len() > 0)
    };
    let raced_wakeup = record.runtime.scheduled.swap(false, Ordering::AcqRel);
    if backlog || raced_wakeup {
        shared.schedule(id);
    }
}

fn poison(shared: &Shared, record: &NodeRecord, id: NodeId, what: &str) {
    record.runtime.poisoned.store(true, Ordering::Release);
    record.runtime.errors.fetch_add(1, Ordering::Relaxed);
    counter!("tickflow_executor_poisoned", 1);
    if shared.errors.report(id, what) {
        warn!("error threshold reached; cancelling {}", record.dag);
        if let Ok(entry) = shared.dags.entry(record.dag) {
            entry.set_run_state(RunState::Cancelled);
            shared.wake_all();
        }
    }
}

/// Counts and discards the inputs of a poisoned or cancelled node, so its
/// downstream starves deterministically instead of seeing partial waves.
/// Takes the in-flight guard: queues are single-consumer.
fn drop_inputs(shared: &Shared, record: &NodeRecord, id: NodeId) {
    let Some(subscriptions) = shared.input_subscriptions(id) else {
        return;
    };
    if record
        .runtime
        .in_flight
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    let mut dropped = 0u64;
    for subscription in subscriptions.iter() {
        while subscription.pop().is_some() {
            dropped += 1;
        }
    }
    if dropped > 0 {
        record.runtime.dropped.fetch_add(dropped, Ordering::Relaxed);
    }
    record.runtime.in_flight.store(false, Ordering::Release);
}

struct ArenaResolver<'a> {
    shared: &'a Shared,
}

impl BlobResolver for ArenaResolver<'_> {
    fn resolve(&self, source: u64, handle: ArenaHandle, dst: &mut [u8]) -> Option<usize> {
        let source = NodeId::from_u64(source);
        let arena = self.shared.arena(source.index())?;
        arena.read(handle, dst)
    }
}

/// Publishes a unit's emissions directly through the broker, stamping
/// source and sequence. Delivery failures never surface into the unit; they
/// are counted on the emitting node.
struct BrokerForwarder<'a> {
    shared: &'a Shared,
    record: &'a NodeRecord,
    undeliverable: u64,
}

impl OutputChannelForwarder for BrokerForwarder<'_> {
    fn send(&mut self, mut message: Message, port: PortHandle) {
        let seq = self.record.runtime.seq.fetch_add(1, Ordering::Relaxed);
        message.stamp(self.record.id.as_u64(), MessageSeq(seq));

        let shared = self.shared;
        let topic = Topic::node(self.record.id, port);
        match shared.broker.try_publish_with(topic, &message, &mut |subscription| {
            shared.on_delivery(subscription)
        }) {
            Ok(outcome) => {
                self.undeliverable += outcome.dropped as u64;
            }
            Err(_) => {
                // A full blocking subscription cannot be waited on from
                // inside a dispatch; treat it as back-pressure loss.
                self.undeliverable += 1;
            }
        }
    }

    fn send_blob(
        &mut self,
        kind: TypeTag,
        timestamp_ns: u64,
        bytes: &[u8],
        port: PortHandle,
    ) -> Result<(), ExecutionError> {
        let arena = self.shared.arena_or_init(self.record.id.index());
        let handle = arena.put(bytes)?;
        self.send(Message::with_arena(kind, timestamp_ns, handle), port);
        Ok(())
    }
}
