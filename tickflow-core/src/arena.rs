//! Per-node payload arena for messages whose payload exceeds the inline
//! window.
//!
//! The arena is a small ring of fixed slots owned by the producing node. A
//! write claims the next slot, bumps its generation to odd while the bytes
//! land, then to even to publish. Readers copy out and re-check the
//! generation afterward; a mismatch means the producer has moved on and the
//! copy is discarded. Contents are only guaranteed until the owning node's
//! next emission reuses the slot, so consumers copy during `process`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use tickflow_types::message::ArenaHandle;

use crate::errors::ExecutionError;

/// Bytes per arena slot. Large enough for a synchronized event over the
/// maximum stream count (header plus 64 ticks).
pub const ARENA_SLOT_BYTES: usize = 4096;

/// Slots per node. Writes rotate; a slot survives this many emissions
/// before reuse, which is the slack a lagging consumer gets.
pub const ARENA_SLOTS: usize = 64;

struct ArenaSlot {
    /// Odd while a write is in flight, even when stable.
    generation: AtomicU32,
    len: AtomicU32,
    bytes: UnsafeCell<[u8; ARENA_SLOT_BYTES]>,
}

pub struct PayloadArena {
    slots: Box<[ArenaSlot]>,
    cursor: AtomicU32,
}

// Writes are serialized by the owning node's in-flight guard; readers only
// copy and validate generations.
unsafe impl Sync for PayloadArena {}
unsafe impl Send for PayloadArena {}

impl Default for PayloadArena {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadArena {
    pub fn new() -> PayloadArena {
        PayloadArena {
            slots: (0..ARENA_SLOTS)
                .map(|_| ArenaSlot {
                    generation: AtomicU32::new(0),
                    len: AtomicU32::new(0),
                    bytes: UnsafeCell::new([0; ARENA_SLOT_BYTES]),
                })
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            cursor: AtomicU32::new(0),
        }
    }

    /// Parks `bytes` in the next slot and returns a generation-stamped
    /// handle. Only the owning node's executing unit may call this.
    pub fn put(&self, bytes: &[u8]) -> Result<ArenaHandle, ExecutionError> {
        if bytes.len() > ARENA_SLOT_BYTES {
            return Err(ExecutionError::Internal(format!(
                "arena payload of {} bytes exceeds the {ARENA_SLOT_BYTES}-byte slot",
                bytes.len()
            )));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % self.slots.len();
        let slot = &self.slots[index];

        // Odd generation marks the write window.
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(generation % 2 == 1);
        unsafe {
            (&mut *slot.bytes.get())[..bytes.len()].copy_from_slice(bytes);
        }
        slot.len.store(bytes.len() as u32, Ordering::Relaxed);
        let published = generation + 1;
        slot.generation.store(published, Ordering::Release);

        Ok(ArenaHandle {
            slot: index as u32,
            generation: published,
        })
    }

    /// Copies the referenced payload into `dst`. Returns the copied length,
    /// or `None` if the slot was recycled or `dst` is too small.
    pub fn read(&self, handle: ArenaHandle, dst: &mut [u8]) -> Option<usize> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return None;
        }
        let len = slot.len.load(Ordering::Relaxed) as usize;
        if len > dst.len() {
            return None;
        }
        unsafe {
            dst[..len].copy_from_slice(&(&*slot.bytes.get())[..len]);
        }
        // A concurrent rewrite would have bumped the generation mid-copy.
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return None;
        }
        Some(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let arena = PayloadArena::new();
        let handle = arena.put(b"follower gap fill").unwrap();
        let mut buffer = [0u8; 64];
        let len = arena.read(handle, &mut buffer).unwrap();
        assert_eq!(&buffer[..len], b"follower gap fill");
    }

    #[test]
    fn recycled_slot_invalidates_handle() {
        let arena = PayloadArena::new();
        let handle = arena.put(b"first").unwrap();
        // One full rotation recycles the slot.
        for _ in 0..ARENA_SLOTS {
            arena.put(b"later").unwrap();
        }
        let mut buffer = [0u8; 16];
        assert_eq!(arena.read(handle, &mut buffer), None);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let arena = PayloadArena::new();
        let oversized = vec![0u8; ARENA_SLOT_BYTES + 1];
        assert!(arena.put(&oversized).is_err());
    }

    #[test]
    fn undersized_destination_is_refused() {
        let arena = PayloadArena::new();
        let handle = arena.put(&[7u8; 32]).unwrap();
        let mut buffer = [0u8; 8];
        assert_eq!(arena.read(handle, &mut buffer), None);
    }
}
