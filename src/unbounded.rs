use crate::segment::{self, Payload, Segment, Slot};
use crate::sync::{AtomicBool, AtomicPtr, AtomicUsize, Backoff, Ordering};

use crossbeam::utils::CachePadded;

use std::cmp;
use std::fmt;
use std::marker::PhantomData;

/// The number of slots allocated per growth step by [`Queue::new`].
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// An unbounded, lock-free, multi-producer multi-consumer queue.
///
/// Every push and pop reserves a position with a single fetch-and-add.
/// Storage grows one chunk at a time when a producer's position falls past
/// the end, and chunks are freed once every position in them has been
/// drained.
///
/// [`pop`](Queue::pop) never waits for a producer that has not started yet.
/// A consumer that outruns production hands its position over to a later
/// read instead, so `None` means "nothing retrievable right now", and no
/// value is lost by it. Values pushed by a single thread and drained by a
/// single consumer come out in the order they were pushed. There is no
/// ordering across producers, and a redirected value may come out after
/// values pushed later than it.
pub struct Queue<T> {
    // the newest segment, whose range is the published capacity
    segment: CachePadded<AtomicPtr<Segment<T>>>,
    capacity: CachePadded<AtomicUsize>,
    write: CachePadded<AtomicUsize>,
    read: CachePadded<AtomicUsize>,
    // set while one thread allocates the next segment
    growing: CachePadded<AtomicBool>,
    chunk_size: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Creates an empty queue growing by [`DEFAULT_CHUNK_SIZE`] slots.
    pub fn new() -> Queue<T> {
        Queue::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Creates an empty queue growing by `chunk_size` slots at a time.
    ///
    /// The chunk size is a tuning knob, not a limit: larger chunks mean
    /// fewer allocations, smaller ones less memory held by a drained queue.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(chunk_size: usize) -> Queue<T> {
        if chunk_size == 0 {
            panic!("chunk size must be non-zero");
        }

        tracing::debug!(chunk_size, "creating unbounded queue");

        Queue {
            segment: CachePadded::new(AtomicPtr::new(Segment::first(chunk_size))),
            capacity: CachePadded::new(AtomicUsize::new(chunk_size)),
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            growing: CachePadded::new(AtomicBool::new(false)),
            chunk_size,
            _marker: PhantomData,
        }
    }

    /// Pushes a value onto the queue.
    ///
    /// Never fails. Allocates a new chunk when the queue has to grow; an
    /// allocation failure aborts like any other failed `Box` allocation.
    pub fn push(&self, value: T) {
        // acquire a position in the queue
        let position = self.write.fetch_add(1, Ordering::Relaxed);

        unsafe {
            let (_, slot) = self.slot_for_write(position);
            slot.publish(Payload::Value(value));
        }
    }

    /// Pops a value off the queue, if one is currently retrievable.
    ///
    /// Never blocks. Waits only for a producer that has already reserved
    /// the position being read to finish publishing it.
    pub fn pop(&self) -> Option<T> {
        let position = self.read.fetch_add(1, Ordering::Relaxed);
        unsafe { self.pop_from(position) }
    }

    /// # Safety
    ///
    /// `position` must have been reserved for reading by the caller.
    unsafe fn pop_from(&self, mut position: usize) -> Option<T> {
        loop {
            // we outran the producers
            if position >= self.write.load(Ordering::Relaxed) {
                self.abandon(position);
                return None;
            }

            match self.resolve(position) {
                Some(value) => return Some(value),
                // the position was dead, take a fresh one
                None => position = self.read.fetch_add(1, Ordering::Relaxed),
            }
        }
    }

    /// The number of slots allocated per growth step.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The number of positions currently addressable without growing.
    ///
    /// This counts every position ever allocated, including drained ones,
    /// and is not a bound on how many values the queue can hold.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Reads the position reserved by a consumer, following redirects.
    ///
    /// Returns `None` if the chain ends in a dead slot.
    ///
    /// # Safety
    ///
    /// `position` must have been reserved for reading by the caller (or
    /// handed over through a redirect), and reserved for writing by someone.
    unsafe fn resolve(&self, mut position: usize) -> Option<T> {
        loop {
            let (segment, slot) = self.slot_for_read(position);
            let payload = slot.take();
            Segment::release(segment);

            match payload {
                Payload::Value(value) => return Some(value),
                Payload::Redirect(target) => position = target,
                Payload::Dead => return None,
                Payload::Empty => unreachable!("took an unpublished slot"),
            }
        }
    }

    /// Hands over a read position that no producer has reserved yet.
    ///
    /// We can't simply give the position back: another consumer may
    /// already be contending for it. Instead we reserve a write position
    /// and leave a marker there for whoever reads it.
    ///
    /// # Safety
    ///
    /// `position` must have been reserved for reading by the caller.
    unsafe fn abandon(&self, position: usize) {
        loop {
            let reserved = self.write.fetch_add(1, Ordering::Relaxed);
            let (segment, slot) = self.slot_for_write(reserved);

            match reserved.cmp(&position) {
                // no producer will ever get here, let its reader move on
                cmp::Ordering::Less => slot.publish(Payload::Dead),
                // we hold both sides of this slot
                cmp::Ordering::Equal => return Segment::release(segment),
                // whoever reads `reserved` picks up our position instead
                cmp::Ordering::Greater => return slot.publish(Payload::Redirect(position)),
            }
        }
    }

    unsafe fn slot_for_write(&self, position: usize) -> (*mut Segment<T>, &Slot<T>) {
        self.grow_to(position);

        let segment = self.segment.load(Ordering::Acquire);
        Segment::get_for_write(segment, position)
    }

    unsafe fn slot_for_read(&self, position: usize) -> (*mut Segment<T>, &Slot<T>) {
        // the writer of this position may still be growing the queue
        let backoff = Backoff::new();
        while position >= self.capacity.load(Ordering::Acquire) {
            backoff.snooze();
        }

        let segment = self.segment.load(Ordering::Acquire);
        match Segment::get_for_read(segment, position) {
            Some(found) => found,
            None => segment::broken_chain(position),
        }
    }

    /// Grows the queue until `position` is addressable.
    fn grow_to(&self, position: usize) {
        let backoff = Backoff::new();

        while position >= self.capacity.load(Ordering::Acquire) {
            // someone else is growing, wait for them
            if self.growing.swap(true, Ordering::Acquire) {
                backoff.snooze();
                continue;
            }

            // the capacity may have changed before we won the election
            let capacity = self.capacity.load(Ordering::Acquire);
            if position >= capacity {
                unsafe { self.grow(capacity) };
            }

            self.growing.store(false, Ordering::Release);
        }
    }

    /// # Safety
    ///
    /// The caller must have won the grow election.
    unsafe fn grow(&self, capacity: usize) {
        let current = self.segment.load(Ordering::Acquire);
        let next = Segment::extend(current);
        debug_assert_eq!((&*next).addressable_range(), capacity + self.chunk_size);

        // publish the segment before the capacity that makes it reachable
        self.segment.store(next, Ordering::Release);
        self.capacity
            .store(capacity + self.chunk_size, Ordering::Release);

        tracing::trace!(capacity = capacity + self.chunk_size, "grew queue");

        // we no longer point at the old segment
        Segment::release(current);
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Queue<T> {
        Queue::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("chunk_size", &self.chunk_size)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // values still in the queue are dropped with their segments
        unsafe { Segment::free_chain(self.segment.load(Ordering::Relaxed)) }
    }
}
