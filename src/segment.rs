use crate::sync::{AtomicPtr, AtomicU8, AtomicUsize, Backoff, Ordering};

use std::cell::UnsafeCell;
use std::ptr;

/// What a slot holds once its writer is done with it.
pub(crate) enum Payload<T> {
    Empty,
    Value(T),
    // the real answer for this read lives at an earlier position
    Redirect(usize),
    // the reservation is unusable, the reader takes a fresh one
    Dead,
}

impl<T> Payload<T> {
    fn state(&self) -> u8 {
        match self {
            Payload::Empty => Slot::EMPTY,
            Payload::Value(_) => Slot::READY,
            Payload::Redirect(_) => Slot::RETRY,
            Payload::Dead => Slot::DEAD,
        }
    }
}

pub(crate) struct Slot<T> {
    payload: UnsafeCell<Payload<T>>,
    state: AtomicU8,
}

impl Slot<()> {
    const EMPTY: u8 = 0;
    const READY: u8 = 1;
    const RETRY: u8 = 2;
    const DEAD: u8 = 3;
}

impl<T> Slot<T> {
    fn new() -> Slot<T> {
        Slot {
            payload: UnsafeCell::new(Payload::Empty),
            state: AtomicU8::new(Slot::EMPTY),
        }
    }

    /// Stores `payload` and makes it visible to the reader of this slot.
    ///
    /// # Safety
    ///
    /// The caller must hold the write reservation for this slot's position.
    pub(crate) unsafe fn publish(&self, payload: Payload<T>) {
        let state = payload.state();
        debug_assert_ne!(state, Slot::EMPTY);
        debug_assert_eq!(self.state.load(Ordering::Relaxed), Slot::EMPTY);

        self.payload.get().write(payload);
        self.state.store(state, Ordering::Release);
    }

    /// Waits for the writer to publish, then moves the payload out.
    ///
    /// The wait is bounded: a reader only gets here once the position has
    /// been reserved for writing, and publishing never blocks.
    ///
    /// # Safety
    ///
    /// The caller must be the one party resolving this slot's position.
    pub(crate) unsafe fn take(&self) -> Payload<T> {
        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) == Slot::EMPTY {
            backoff.snooze();
        }

        ptr::replace(self.payload.get(), Payload::Empty)
    }
}

/// A chunk of slots, chained to the segment it extends.
///
/// A segment owns positions `start..start + slots.len()` and can address
/// every position below that through its `older` chain.
///
/// `refs` counts one unit per slot (released by whoever resolves the slot),
/// one for the queue's pointer to the newest segment, and for extensions one
/// for the link held by the older segment. Reclamation therefore runs from
/// older to newer segments: the freed segments are always a prefix of the
/// chain, and every live one is reachable from the newest through `older`.
pub(crate) struct Segment<T> {
    slots: Box<[Slot<T>]>,
    start: usize,
    older: AtomicPtr<Segment<T>>,
    newer: AtomicPtr<Segment<T>>,
    refs: AtomicUsize,
}

impl<T> Segment<T> {
    /// Allocates the segment a queue starts with.
    pub(crate) fn first(chunk_size: usize) -> *mut Segment<T> {
        Segment::alloc(chunk_size, 0, ptr::null_mut(), chunk_size + 1)
    }

    /// Allocates a segment extending `older` by one chunk and links the two.
    ///
    /// # Safety
    ///
    /// `older` must be the newest segment of a live chain, and the caller
    /// must have won the grow election.
    pub(crate) unsafe fn extend(older: *mut Segment<T>) -> *mut Segment<T> {
        let older_ref = &*older;
        let chunk_size = older_ref.slots.len();

        let segment = Segment::alloc(
            chunk_size,
            older_ref.addressable_range(),
            older,
            chunk_size + 2,
        );
        older_ref.newer.store(segment, Ordering::Release);
        segment
    }

    fn alloc(
        chunk_size: usize,
        start: usize,
        older: *mut Segment<T>,
        refs: usize,
    ) -> *mut Segment<T> {
        let slots = (0..chunk_size).map(|_| Slot::new()).collect();

        Box::into_raw(Box::new(Segment {
            slots,
            start,
            older: AtomicPtr::new(older),
            newer: AtomicPtr::new(ptr::null_mut()),
            refs: AtomicUsize::new(refs),
        }))
    }

    /// One past the highest position this segment can address.
    pub(crate) fn addressable_range(&self) -> usize {
        self.start + self.slots.len()
    }

    /// Resolves the slot of a position reserved for writing, along with the
    /// segment owning it.
    ///
    /// # Safety
    ///
    /// `segment` must have been loaded after a capacity covering `position`
    /// was observed, and `position` must not have been resolved yet.
    pub(crate) unsafe fn get_for_write<'a>(
        segment: *mut Segment<T>,
        position: usize,
    ) -> (*mut Segment<T>, &'a Slot<T>) {
        match Segment::locate(segment, position) {
            Some(found) => found,
            None => broken_chain(position),
        }
    }

    /// Like [`get_for_write`](Segment::get_for_write), but reports a chain
    /// that was already reclaimed below `segment` instead of failing.
    ///
    /// # Safety
    ///
    /// Same as `get_for_write`.
    pub(crate) unsafe fn get_for_read<'a>(
        segment: *mut Segment<T>,
        position: usize,
    ) -> Option<(*mut Segment<T>, &'a Slot<T>)> {
        Segment::locate(segment, position)
    }

    unsafe fn locate<'a>(
        mut segment: *mut Segment<T>,
        position: usize,
    ) -> Option<(*mut Segment<T>, &'a Slot<T>)> {
        loop {
            let current = &*segment;

            if position >= current.start {
                return current
                    .slots
                    .get(position - current.start)
                    .map(|slot| (segment, slot));
            }

            // the position lives in an older segment
            segment = current.older.load(Ordering::Acquire);
            if segment.is_null() {
                return None;
            }
        }
    }

    /// Drops one unit of `segment`, reclaiming it and any newer segments
    /// it was keeping alive once their counts reach zero.
    ///
    /// # Safety
    ///
    /// The caller must own the unit it releases, and must not touch
    /// `segment` afterwards.
    pub(crate) unsafe fn release(mut segment: *mut Segment<T>) {
        loop {
            let current = &*segment;
            if current.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }

            let newer = current.newer.load(Ordering::Acquire);
            if let Some(newer) = newer.as_ref() {
                newer.older.store(ptr::null_mut(), Ordering::Release);
            }

            tracing::trace!(start = current.start, "reclaiming drained segment");
            drop(Box::from_raw(segment));

            // release the link unit we held on the newer segment
            if newer.is_null() {
                return;
            }
            segment = newer;
        }
    }

    /// Frees `newest` and every segment still reachable from it.
    ///
    /// # Safety
    ///
    /// No other thread may access the chain.
    pub(crate) unsafe fn free_chain(newest: *mut Segment<T>) {
        let mut segment = newest;
        while !segment.is_null() {
            let older = (&*segment).older.load(Ordering::Relaxed);
            drop(Box::from_raw(segment));
            segment = older;
        }
    }

    #[cfg(test)]
    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn older(&self) -> *mut Segment<T> {
        self.older.load(Ordering::Relaxed)
    }
}

#[cold]
pub(crate) fn broken_chain(position: usize) -> ! {
    tracing::error!(position, "segment chain reclaimed under a live position");
    panic!("segment chain reclaimed under live position {}", position);
}
