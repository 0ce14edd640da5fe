//! Fixed-capacity frame ring: single-producer/single-consumer, non-blocking
//! acquire on the hot path, with a blocking variant exposing a timeout for
//! tests and slower callers.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const FREE: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;
const READING: u8 = 3;

struct Slot<T> {
    state: AtomicU8,
    value: Mutex<T>,
}

/// Default image ring capacity.
pub const IMAGE_RING_CAPACITY: usize = 4;

pub struct FrameRing<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<T> FrameRing<T> {
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        assert!(capacity > 0, "frame ring capacity must be > 0");
        let slots = (0..capacity)
            .map(|_| Slot {
                state: AtomicU8::new(FREE),
                value: Mutex::new(init()),
            })
            .collect();
        Self {
            slots,
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a slot index the caller may exclusively write, or `None` if
    /// the ring is full. Never blocks.
    pub fn producer_try_acquire(&self) -> Option<usize> {
        let idx = self.head.load(Ordering::Acquire) % self.capacity;
        let slot = &self.slots[idx];
        if slot
            .state
            .compare_exchange(FREE, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.head.fetch_add(1, Ordering::AcqRel);
            Some(idx)
        } else {
            None
        }
    }

    /// Blocking variant with a timeout, for callers that can tolerate
    /// waiting (the hot path always uses `producer_try_acquire`).
    pub fn producer_acquire(&self, timeout: Duration) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(idx) = self.producer_try_acquire() {
                return Some(idx);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// Writes into the acquired slot. Caller must hold a slot returned by
    /// `producer_try_acquire`/`producer_acquire` that has not yet been
    /// released.
    pub fn write(&self, idx: usize, f: impl FnOnce(&mut T)) {
        debug_assert_eq!(self.slots[idx].state.load(Ordering::Acquire), WRITING);
        let mut guard = self.slots[idx].value.lock();
        f(&mut guard);
    }

    /// Publishes a written slot as consumable.
    pub fn producer_release(&self, idx: usize) {
        let prev = self.slots[idx].state.swap(READY, Ordering::AcqRel);
        debug_assert_eq!(prev, WRITING);
    }

    /// Returns a slot index the consumer may exclusively read, or `None` if
    /// nothing is ready yet. Slots are consumed in the order they were
    /// released, because the consumer only ever inspects the slot at its
    /// own advancing `tail` index.
    pub fn consumer_try_acquire(&self) -> Option<usize> {
        let idx = self.tail.load(Ordering::Acquire) % self.capacity;
        let slot = &self.slots[idx];
        if slot
            .state
            .compare_exchange(READY, READING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.tail.fetch_add(1, Ordering::AcqRel);
            Some(idx)
        } else {
            None
        }
    }

    pub fn consumer_acquire(&self, timeout: Duration) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(idx) = self.consumer_try_acquire() {
                return Some(idx);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    pub fn read(&self, idx: usize, f: impl FnOnce(&T)) {
        debug_assert_eq!(self.slots[idx].state.load(Ordering::Acquire), READING);
        let guard = self.slots[idx].value.lock();
        f(&guard);
    }

    pub fn consumer_release(&self, idx: usize) {
        let prev = self.slots[idx].state.swap(FREE, Ordering::AcqRel);
        debug_assert_eq!(prev, READING);
    }
}
