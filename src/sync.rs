//! Atomics shared by the queues, with optional loom support.

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

/// Spin/yield helper for the queues' bounded waits.
///
/// Spinning only helps when another core can make progress in the
/// meantime, so on a single-core machine every wait yields instead.
#[derive(Default)]
pub(crate) struct Backoff {
    #[cfg(not(feature = "loom"))]
    inner: crossbeam::utils::Backoff,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff::default()
    }

    /// Back off in a lock-free retry loop.
    #[cfg(not(feature = "loom"))]
    pub(crate) fn spin(&self) {
        if should_spin() {
            self.inner.spin();
        } else {
            std::thread::yield_now();
        }
    }

    /// Back off while waiting on another thread.
    #[cfg(not(feature = "loom"))]
    pub(crate) fn snooze(&self) {
        if should_spin() {
            self.inner.snooze();
        } else {
            std::thread::yield_now();
        }
    }

    // loom has to be told about every wait or it never schedules
    // the thread we are waiting on
    #[cfg(feature = "loom")]
    pub(crate) fn spin(&self) {
        loom::thread::yield_now();
    }

    #[cfg(feature = "loom")]
    pub(crate) fn snooze(&self) {
        loom::thread::yield_now();
    }
}

#[cfg(not(feature = "loom"))]
fn should_spin() -> bool {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NUM_CPUS: AtomicUsize = AtomicUsize::new(0);

    let mut cpus = NUM_CPUS.load(Ordering::Relaxed);
    if cpus == 0 {
        cpus = num_cpus::get().max(1);
        NUM_CPUS.store(cpus, Ordering::Relaxed);
    }

    cpus > 1
}
