//! A bounded, lock-free, multi-producer multi-consumer queue.

use crate::error::Full;
use crate::sync::{fence, AtomicUsize, Backoff, Ordering};

use crossbeam::utils::CachePadded;

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;

/// Note: capacities are rounded up to the next power of two.
pub const MAX_CAPACITY: usize = 1 << (usize::BITS - 2);

/// A fixed-capacity ring of slots.
///
/// Positions are stored as a lap number in the high bits and a slot index
/// in the low bits. Each slot carries a stamp telling producers and
/// consumers which lap it is on, so a position can be claimed with a single
/// compare-and-swap. Unlike [`crate::Queue`], pushing fails when every slot
/// holds an unread value.
pub struct Queue<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot<T>]>,
    // the increment between two laps, always larger than the slot count
    one_lap: usize,
}

struct Slot<T> {
    // equal to the tail while free for that write,
    // the tail plus one once that write is readable
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates a queue holding at least `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or larger than [`MAX_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            panic!("capacity must be non-zero");
        }

        if capacity > MAX_CAPACITY {
            panic!("exceeded maximum queue capacity of {}", MAX_CAPACITY);
        }

        let capacity = capacity.next_power_of_two();
        tracing::debug!(capacity, "creating bounded queue");

        Queue {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            // lap 0, every slot free for its first write
            slots: (0..capacity)
                .map(|index| Slot {
                    stamp: AtomicUsize::new(index),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                })
                .collect(),
            one_lap: (capacity + 1).next_power_of_two(),
        }
    }

    /// The position after `position`, wrapping into the next lap at the
    /// end of the ring.
    fn next(&self, position: usize) -> usize {
        let index = position & (self.one_lap - 1);
        let lap = position & !(self.one_lap - 1);

        if index + 1 < self.slots.len() {
            position + 1
        } else {
            lap.wrapping_add(self.one_lap)
        }
    }

    /// Pushes a value, handing it back if the queue is full.
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        let backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let slot = unsafe { self.slots.get_unchecked(tail & (self.one_lap - 1)) };
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == tail {
                // the slot is free on this lap, try to claim it
                match self.tail.compare_exchange_weak(
                    tail,
                    self.next(tail),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => unsafe {
                        slot.value.get().write(MaybeUninit::new(value));
                        slot.stamp.store(tail + 1, Ordering::Release);
                        return Ok(());
                    },
                    Err(current) => {
                        tail = current;
                        backoff.spin();
                    }
                }
            } else if stamp.wrapping_add(self.one_lap) == tail + 1 {
                // the slot still holds a value from the previous lap
                fence(Ordering::SeqCst);
                let head = self.head.load(Ordering::Relaxed);

                if head.wrapping_add(self.one_lap) == tail {
                    return Err(Full(value));
                }

                backoff.spin();
                tail = self.tail.load(Ordering::Relaxed);
            } else {
                // another producer got here first
                backoff.snooze();
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops a value, if one is ready.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            let slot = unsafe { self.slots.get_unchecked(head & (self.one_lap - 1)) };
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == head + 1 {
                match self.head.compare_exchange_weak(
                    head,
                    self.next(head),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => unsafe {
                        let value = slot.value.get().read().assume_init();
                        // free the slot for the next lap
                        slot.stamp
                            .store(head.wrapping_add(self.one_lap), Ordering::Release);
                        return Some(value);
                    },
                    Err(current) => {
                        head = current;
                        backoff.spin();
                    }
                }
            } else if stamp == head {
                // nothing has been written here yet
                fence(Ordering::SeqCst);
                let tail = self.tail.load(Ordering::Relaxed);

                if tail == head {
                    return None;
                }

                // a producer claimed the slot and is still writing
                backoff.spin();
                head = self.head.load(Ordering::Relaxed);
            } else {
                backoff.snooze();
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let head = self.head.load(Ordering::SeqCst);

            // make sure we have consistent values to work with
            if self.tail.load(Ordering::SeqCst) == tail {
                let head_index = head & (self.one_lap - 1);
                let tail_index = tail & (self.one_lap - 1);

                break if head_index < tail_index {
                    tail_index - head_index
                } else if head_index > tail_index {
                    self.capacity() - head_index + tail_index
                } else if tail == head {
                    0
                } else {
                    self.capacity()
                };
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        tail == head
    }

    pub fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::SeqCst);
        let head = self.head.load(Ordering::SeqCst);
        head.wrapping_add(self.one_lap) == tail
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        while let Some(value) = self.pop() {
            drop(value);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(Queue::<u8>::new(1).capacity(), 1);
        assert_eq!(Queue::<u8>::new(5).capacity(), 8);
        assert_eq!(Queue::<u8>::new(1024).capacity(), 1024);
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn zero_capacity() {
        Queue::<u8>::new(0);
    }

    #[test]
    fn full_queue_hands_the_value_back() {
        let queue = Queue::new(4);

        for i in 0..4 {
            assert!(queue.push(i).is_ok());
        }

        assert!(queue.is_full());
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.push(4), Err(Full(4)));

        assert_eq!(queue.pop(), Some(0));
        assert!(queue.push(4).is_ok());

        for i in 1..5 {
            assert_eq!(queue.pop(), Some(i));
        }

        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn single_slot_rejects_a_second_value() {
        let queue = Queue::new(1);

        assert!(queue.push(1).is_ok());
        assert!(queue.is_full());
        assert_eq!(queue.push(2), Err(Full(2)));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());

        // the slot is reusable on the next lap
        assert!(queue.push(3).is_ok());
        assert_eq!(queue.push(4), Err(Full(4)));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn wraps_around_many_laps() {
        let queue = Queue::new(2);

        for i in 0..1000 {
            queue.push(i).unwrap();
            queue.push(i + 1).unwrap();
            assert_eq!(queue.pop(), Some(i));
            assert_eq!(queue.pop(), Some(i + 1));
        }

        assert!(queue.is_empty());
    }

    #[test]
    fn drop_releases_remaining_values() {
        let value = Arc::new(());
        let queue = Queue::new(8);

        for _ in 0..5 {
            queue.push(value.clone()).unwrap();
        }

        drop(queue.pop());
        assert_eq!(Arc::strong_count(&value), 5);

        drop(queue);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        const THREADS: usize = 4;
        const MESSAGES: usize = 10_000;

        let queue = Queue::new(64);
        let mut seen = vec![0u8; THREADS * MESSAGES];

        crossbeam::scope(|scope| {
            for t in 0..THREADS {
                let queue = &queue;
                scope.spawn(move |_| {
                    for i in 0..MESSAGES {
                        let mut value = t * MESSAGES + i;
                        while let Err(Full(v)) = queue.push(value) {
                            value = v;
                            thread::yield_now();
                        }
                    }
                });
            }

            let consumers: Vec<_> = (0..THREADS)
                .map(|_| {
                    let queue = &queue;
                    scope.spawn(move |_| {
                        let mut got = Vec::with_capacity(MESSAGES);
                        while got.len() < MESSAGES {
                            match queue.pop() {
                                Some(value) => got.push(value),
                                None => thread::yield_now(),
                            }
                        }
                        got
                    })
                })
                .collect();

            for consumer in consumers {
                for value in consumer.join().unwrap() {
                    seen[value] += 1;
                }
            }
        })
        .unwrap();

        assert!(seen.iter().all(|&count| count == 1));
        assert_eq!(queue.pop(), None);
    }
}
