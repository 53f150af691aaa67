//! Single-producer single-consumer ring.
//!
//! Head and tail are unbounded u64 sequence counters on separate cache
//! lines; a slot index is `sequence & mask`. Each side keeps a cached copy
//! of the other's counter and only re-reads the shared atomic when the cache
//! says the ring looks full (producer) or empty (consumer).
//!
//! Ordering protocol: the producer publishes slot writes with a release
//! store of `head` and the consumer observes them with an acquire load; the
//! consumer publishes consumption with a release store of `tail` which the
//! producer acquires before reusing a slot. Loads of a side's own counter
//! are relaxed since each counter has a single writer.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

pub struct Ring<T> {
    head: CachePadded<AtomicU64>,
    /// Producer-local cache of `tail`; written only on the producer side.
    cached_tail: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    /// Consumer-local cache of `head`; written only on the consumer side.
    cached_head: CachePadded<AtomicU64>,
    mask: u64,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Capacity is rounded up to the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Ring<T> {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let capacity = capacity.next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ring {
            head: CachePadded::new(AtomicU64::new(0)),
            cached_tail: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            cached_head: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            buffer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Observed occupancy. Exact only when called from one of the two sides.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `value`, or hands it back if the ring is full.
    ///
    /// Caller contract: at most one thread pushes at a time.
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = self.cached_tail.load(Ordering::Relaxed);
        if head - tail >= self.mask + 1 {
            tail = self.tail.load(Ordering::Acquire);
            self.cached_tail.store(tail, Ordering::Relaxed);
            if head - tail >= self.mask + 1 {
                return Err(value);
            }
        }
        let slot = &self.buffer[(head & self.mask) as usize];
        unsafe { (*slot.get()).write(value) };
        self.head.store(head + 1, Ordering::Release);
        Ok(())
    }

    /// Copies out the oldest element without consuming it.
    ///
    /// Caller contract: same as `pop` (consumer side only).
    pub fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        let tail = self.tail.load(Ordering::Relaxed);
        let mut head = self.cached_head.load(Ordering::Relaxed);
        if head == tail {
            head = self.head.load(Ordering::Acquire);
            self.cached_head.store(head, Ordering::Relaxed);
            if head == tail {
                return None;
            }
        }
        let slot = &self.buffer[(tail & self.mask) as usize];
        Some(unsafe { (*slot.get()).assume_init_read() })
    }

    /// Removes the oldest element.
    ///
    /// Caller contract: at most one thread pops at a time.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let mut head = self.cached_head.load(Ordering::Relaxed);
        if head == tail {
            head = self.head.load(Ordering::Acquire);
            self.cached_head.store(head, Ordering::Relaxed);
            if head == tail {
                return None;
            }
        }
        let slot = &self.buffer[(tail & self.mask) as usize];
        let value = unsafe { (*slot.get()).assume_init_read() };
        self.tail.store(tail + 1, Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = self.tail.load(Ordering::Relaxed);
        while tail < head {
            let slot = &self.buffer[(tail & self.mask) as usize];
            unsafe { (*slot.get()).assume_init_drop() };
            tail += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_fails_when_full() {
        let ring = Ring::with_capacity(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.push(99), Err(99));
        assert_eq!(ring.pop(), Some(0));
        ring.push(99).unwrap();
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let ring: Ring<u32> = Ring::with_capacity(2);
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let ring: Ring<u8> = Ring::with_capacity(6);
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn preserves_fifo_across_threads() {
        let ring = Arc::new(Ring::with_capacity(64));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0u64..10_000 {
                    loop {
                        if ring.push(i).is_ok() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        };
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(value) = ring.pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn drops_undrained_elements() {
        let ring = Ring::with_capacity(8);
        let value = Arc::new(());
        for _ in 0..5 {
            ring.push(Arc::clone(&value)).unwrap();
        }
        drop(ring);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
