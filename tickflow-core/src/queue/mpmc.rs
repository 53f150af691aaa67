//! Bounded multi-producer multi-consumer queue, slot-sequence variant.
//!
//! Every slot carries its own sequence counter. A producer claims a slot by
//! CAS on the enqueue position, writes the value, then publishes by storing
//! `sequence = position + 1`; consumers mirror the dance on the dequeue
//! position and re-arm the slot one lap ahead. FIFO holds per producer and
//! per consumer; globally, a successful pop happens-after the push that
//! stored its value.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct Queue<T> {
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
    mask: u64,
    buffer: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Capacity is rounded up to the next power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Queue<T> {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let capacity = capacity.next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Queue {
            enqueue_pos: CachePadded::new(AtomicU64::new(0)),
            dequeue_pos: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            buffer,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    pub fn len(&self) -> usize {
        let enqueue = self.enqueue_pos.load(Ordering::Relaxed);
        let dequeue = self.dequeue_pos.load(Ordering::Relaxed);
        enqueue.saturating_sub(dequeue) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let lag = sequence as i64 - pos as i64;
            if lag == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                // Slot still holds an unconsumed value a full lap behind.
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let lag = sequence as i64 - (pos + 1) as i64;
            if lag == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_fails_when_full() {
        let queue = Queue::with_capacity(4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.push(99), Err(99));
        assert_eq!(queue.pop(), Some(0));
        queue.push(99).unwrap();
    }

    #[test]
    fn fifo_per_single_producer() {
        let queue = Queue::with_capacity(8);
        for i in 0..8 {
            queue.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn no_element_is_lost_or_duplicated_under_contention() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 5_000;

        let queue = Arc::new(Queue::with_capacity(1024));
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = p * PER_PRODUCER + i;
                    loop {
                        match queue.push(value) {
                            Ok(()) => break,
                            Err(back) => {
                                value = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let popped = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut consumers = Vec::new();
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while popped.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                    match queue.pop() {
                        Some(value) => {
                            seen.push(value);
                            popped.fetch_add(1, Ordering::Relaxed);
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        let mut all = HashSet::new();
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(all.insert(value), "value popped twice: {value}");
            }
        }
        assert_eq!(all.len(), (PRODUCERS * PER_PRODUCER) as usize);
    }
}
