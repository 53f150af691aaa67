//! Fixed-capacity slab of node records.
//!
//! Records are allocated by atomic bump until the watermark reaches
//! capacity, after which freed slots are recycled through a tagged Treiber
//! free list. Every slot carries a generation counter that is bumped on
//! release, so a `NodeId` held across a release no longer resolves.
//!
//! Ownership of a slot moves through three phases: free (reachable only from
//! the free list), building (exclusively owned by the single-threaded dag
//! builder, which may take `&mut` access), and finalized (shared; topology
//! fields are read-only and only the atomic runtime counters change).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use tickflow_types::ids::{DagId, NodeId};

use crate::errors::ExecutionError;
use crate::node::UnitKind;

pub use tickflow_types::config::MAX_NODE_LINKS;

/// Atomic runtime state of one node. Reset on allocation, mutated by the
/// executor, read by metrics.
#[repr(C)]
#[derive(Debug)]
pub struct NodeRuntime {
    /// Inputs still lacking a queued message in barrier modes; refreshed on
    /// every delivery and dispatch, zero when a wave is ready.
    pub pending_inputs: AtomicU32,
    /// Consecutive transient failures.
    pub retries: AtomicU32,
    /// Guards single concurrent execution.
    pub in_flight: AtomicBool,
    /// Set when the node sits on the ready queue or must be re-armed.
    pub scheduled: AtomicBool,
    /// Set once the unit reports a permanent failure.
    pub poisoned: AtomicBool,
    _pad: u8,
    pub dispatches: AtomicU64,
    pub errors: AtomicU64,
    /// Messages discarded because the node was poisoned or cancelled.
    pub dropped: AtomicU64,
    pub last_dispatch_ns: AtomicU64,
    /// Sequence stamped onto the node's emissions.
    pub seq: AtomicU64,
}

impl NodeRuntime {
    fn reset(&mut self) {
        *self.pending_inputs.get_mut() = 0;
        *self.retries.get_mut() = 0;
        *self.in_flight.get_mut() = false;
        *self.scheduled.get_mut() = false;
        *self.poisoned.get_mut() = false;
        *self.dispatches.get_mut() = 0;
        *self.errors.get_mut() = 0;
        *self.dropped.get_mut() = 0;
        *self.last_dispatch_ns.get_mut() = 0;
        *self.seq.get_mut() = 0;
    }
}

/// One node record: identity, inline topology and runtime counters, exactly
/// four cache lines.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct NodeRecord {
    pub id: NodeId,
    pub dag: DagId,
    pub kind_tag: u8,
    pub in_count: u8,
    pub out_count: u8,
    _pad: u8,
    /// Behavior slot in the unit slab; mirrors the node's pool index.
    pub unit: u32,
    pub inputs: [NodeId; MAX_NODE_LINKS],
    pub outputs: [NodeId; MAX_NODE_LINKS],
    pub runtime: NodeRuntime,
    _reserved: [u8; 48],
}

const _: () = assert!(std::mem::size_of::<NodeRecord>() == 256);
const _: () = assert!(std::mem::align_of::<NodeRecord>() == 64);

impl NodeRecord {
    fn empty() -> NodeRecord {
        NodeRecord {
            id: NodeId::NIL,
            dag: DagId::NIL,
            kind_tag: 0,
            in_count: 0,
            out_count: 0,
            _pad: 0,
            unit: 0,
            inputs: [NodeId::NIL; MAX_NODE_LINKS],
            outputs: [NodeId::NIL; MAX_NODE_LINKS],
            runtime: NodeRuntime {
                pending_inputs: AtomicU32::new(0),
                retries: AtomicU32::new(0),
                in_flight: AtomicBool::new(false),
                scheduled: AtomicBool::new(false),
                poisoned: AtomicBool::new(false),
                _pad: 0,
                dispatches: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                last_dispatch_ns: AtomicU64::new(0),
                seq: AtomicU64::new(0),
            },
            _reserved: [0; 48],
        }
    }

    pub fn kind(&self) -> UnitKind {
        UnitKind::from_tag(self.kind_tag)
    }

    pub fn fan_in(&self) -> u32 {
        self.in_count as u32
    }

    pub fn fan_out(&self) -> u32 {
        self.out_count as u32
    }

    pub fn input_ids(&self) -> &[NodeId] {
        &self.inputs[..self.in_count as usize]
    }

    pub fn output_ids(&self) -> &[NodeId] {
        &self.outputs[..self.out_count as usize]
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            dispatches: self.runtime.dispatches.load(Ordering::Relaxed),
            errors: self.runtime.errors.load(Ordering::Relaxed),
            dropped: self.runtime.dropped.load(Ordering::Relaxed),
            poisoned: self.runtime.poisoned.load(Ordering::Acquire),
            pending_inputs: self.runtime.pending_inputs.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a node's runtime counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub dispatches: u64,
    pub errors: u64,
    pub dropped: u64,
    pub poisoned: bool,
    pub pending_inputs: u32,
}

#[repr(transparent)]
struct SlotCell(UnsafeCell<NodeRecord>);

// Concurrent access is mediated by the ownership phases described in the
// module docs plus the atomics inside NodeRecord.
unsafe impl Sync for SlotCell {}

pub struct NodePool {
    slots: Box<[SlotCell]>,
    /// Current generation per slot; a handle resolves only while its
    /// generation matches. Starts at 1: generation 0 is the NIL sentinel.
    generations: Box<[AtomicU32]>,
    watermark: CachePadded<AtomicU32>,
    /// `(tag << 32) | (index + 1)`; zero means empty. The tag defeats ABA.
    free_head: CachePadded<AtomicU64>,
    free_next: Box<[AtomicU32]>,
    live: AtomicU32,
}

impl NodePool {
    pub fn with_capacity(capacity: usize) -> NodePool {
        assert!(capacity > 0 && capacity <= u32::MAX as usize);
        NodePool {
            slots: (0..capacity)
                .map(|_| SlotCell(UnsafeCell::new(NodeRecord::empty())))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            generations: (0..capacity)
                .map(|_| AtomicU32::new(1))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            watermark: CachePadded::new(AtomicU32::new(0)),
            free_head: CachePadded::new(AtomicU64::new(0)),
            free_next: (0..capacity)
                .map(|_| AtomicU32::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            live: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed) as usize
    }

    /// Claims a slot and stamps its identity. The caller (the dag builder)
    /// holds exclusive ownership until the dag is finalized.
    pub fn allocate(
        &self,
        dag: DagId,
        kind: UnitKind,
        unit: u32,
    ) -> Result<NodeId, ExecutionError> {
        let index = match self.pop_free() {
            Some(index) => index,
            None => self.bump()?,
        };
        let generation = self.generations[index as usize].load(Ordering::Acquire);
        let id = NodeId::from_parts(index, generation);

        // Exclusive: the slot was just removed from free/unused space.
        let record = unsafe { &mut *self.slots[index as usize].0.get() };
        record.id = id;
        record.dag = dag;
        record.kind_tag = kind.as_tag();
        record.in_count = 0;
        record.out_count = 0;
        record.unit = unit;
        record.inputs = [NodeId::NIL; MAX_NODE_LINKS];
        record.outputs = [NodeId::NIL; MAX_NODE_LINKS];
        record.runtime.reset();

        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Resolves a handle to its record, rejecting stale generations.
    pub fn get(&self, id: NodeId) -> Result<&NodeRecord, ExecutionError> {
        let index = id.index() as usize;
        if index >= self.slots.len()
            || self.generations[index].load(Ordering::Acquire) != id.generation()
        {
            return Err(ExecutionError::UnknownNode(id));
        }
        Ok(unsafe { &*self.slots[index].0.get() })
    }

    /// Mutable access to a record's topology.
    ///
    /// Only the dag builder may call this, and only while the owning dag is
    /// still `Building` (single-threaded exclusive ownership).
    pub(crate) fn get_mut(&self, id: NodeId) -> Result<&mut NodeRecord, ExecutionError> {
        let index = id.index() as usize;
        if index >= self.slots.len()
            || self.generations[index].load(Ordering::Acquire) != id.generation()
        {
            return Err(ExecutionError::UnknownNode(id));
        }
        Ok(unsafe { &mut *self.slots[index].0.get() })
    }

    /// Returns a slot to the pool. The generation bump invalidates every
    /// outstanding handle before the slot becomes reusable.
    pub fn release(&self, id: NodeId) -> Result<(), ExecutionError> {
        let index = id.index() as usize;
        if index >= self.slots.len() {
            return Err(ExecutionError::UnknownNode(id));
        }
        let generation = &self.generations[index];
        if generation
            .compare_exchange(
                id.generation(),
                id.generation().wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ExecutionError::UnknownNode(id));
        }
        self.push_free(id.index());
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn bump(&self) -> Result<u32, ExecutionError> {
        let mut watermark = self.watermark.load(Ordering::Relaxed);
        loop {
            if watermark as usize >= self.slots.len() {
                return Err(ExecutionError::PoolExhausted);
            }
            match self.watermark.compare_exchange_weak(
                watermark,
                watermark + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(watermark),
                Err(current) => watermark = current,
            }
        }
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let slot_plus_one = head as u32;
            if slot_plus_one == 0 {
                return None;
            }
            let index = slot_plus_one - 1;
            let next = self.free_next[index as usize].load(Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let replacement = (tag << 32) | next as u64;
            match self.free_head.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(current) => head = current,
            }
        }
    }

    fn push_free(&self, index: u32) {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            self.free_next[index as usize].store(head as u32, Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let replacement = (tag << 32) | (index + 1) as u64;
            match self.free_head.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> NodePool {
        NodePool::with_capacity(4)
    }

    #[test]
    fn record_is_four_cache_lines() {
        assert_eq!(std::mem::size_of::<NodeRecord>(), 256);
        assert_eq!(std::mem::align_of::<NodeRecord>(), 64);
    }

    #[test]
    fn exhaustion_then_reuse() {
        let pool = pool();
        let dag = DagId::from_parts(0, 1);
        let ids: Vec<_> = (0..4)
            .map(|_| pool.allocate(dag, UnitKind::Tick, 0).unwrap())
            .collect();
        assert_eq!(
            pool.allocate(dag, UnitKind::Tick, 0),
            Err(ExecutionError::PoolExhausted)
        );

        pool.release(ids[1]).unwrap();
        let reused = pool.allocate(dag, UnitKind::Batch, 1).unwrap();
        assert_eq!(reused.index(), ids[1].index());
        assert_ne!(reused.generation(), ids[1].generation());
    }

    #[test]
    fn stale_handle_is_rejected() {
        let pool = pool();
        let dag = DagId::from_parts(0, 1);
        let id = pool.allocate(dag, UnitKind::Tick, 0).unwrap();
        pool.release(id).unwrap();
        assert_eq!(pool.get(id).unwrap_err(), ExecutionError::UnknownNode(id));
        assert_eq!(
            pool.release(id).unwrap_err(),
            ExecutionError::UnknownNode(id)
        );
    }

    #[test]
    fn reused_slot_resets_runtime_state() {
        let pool = pool();
        let dag = DagId::from_parts(0, 1);
        let id = pool.allocate(dag, UnitKind::Tick, 0).unwrap();
        pool.get(id)
            .unwrap()
            .runtime
            .dispatches
            .fetch_add(5, Ordering::Relaxed);
        pool.release(id).unwrap();

        let id = pool.allocate(dag, UnitKind::Tick, 0).unwrap();
        assert_eq!(
            pool.get(id).unwrap().runtime.dispatches.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn live_tracks_allocations() {
        let pool = pool();
        let dag = DagId::from_parts(0, 1);
        let a = pool.allocate(dag, UnitKind::Tick, 0).unwrap();
        let b = pool.allocate(dag, UnitKind::Tick, 0).unwrap();
        assert_eq!(pool.live(), 2);
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!(pool.live(), 0);
    }
}
