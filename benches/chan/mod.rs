//! Harness shared by the benches.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Barrier,
    thread,
};

// parks the consumer while the queue is empty
pub struct Chan<T> {
    thread: thread::Thread,
    unparked: AtomicBool,
    inner: T,
}

impl<T> Chan<T> {
    pub fn new(inner: T) -> Self {
        Self {
            thread: thread::current(),
            unparked: AtomicBool::new(false),
            inner,
        }
    }

    pub fn send(&self, f: impl FnOnce(&T)) {
        f(&self.inner);

        if !self.unparked.swap(true, Ordering::Release) {
            self.thread.unpark();
        }
    }

    pub fn recv<V>(&self, f: impl Fn(&T) -> Option<V>) -> V {
        loop {
            if let Some(value) = f(&self.inner) {
                break value;
            }

            while !self.unparked.swap(false, Ordering::Acquire) {
                thread::park();
            }
        }
    }
}

/// Leaves two cores for the consumer and the bench driver.
pub fn producers() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}

/// `threads` producers push `per_thread` values each into `queue`, drained
/// by the calling thread, which parks whenever `pop` comes back empty.
pub fn fan_in<Q: Sync>(
    queue: Q,
    threads: usize,
    per_thread: usize,
    push: impl Fn(&Q, usize) + Sync,
    pop: impl Fn(&Q) -> Option<usize>,
) {
    let barrier = Barrier::new(threads + 1);
    let chan = Chan::new(queue);

    crossbeam::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|_| {
                barrier.wait();
                for i in 0..per_thread {
                    chan.send(|queue| push(queue, i));
                }
            });
        }

        barrier.wait();
        for _ in 0..threads * per_thread {
            chan.recv(&pop);
        }
    })
    .unwrap();
}

/// `threads` producer/consumer pairs share `queue`; consumers spin until
/// they have taken `per_thread` values each.
pub fn pairs<Q: Sync>(
    queue: Q,
    threads: usize,
    per_thread: usize,
    push: impl Fn(&Q, usize) + Sync,
    pop: impl Fn(&Q) -> Option<usize> + Sync,
) {
    crossbeam::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|_| {
                for i in 0..per_thread {
                    push(&queue, i);
                }
            });

            scope.spawn(|_| {
                let mut received = 0;
                while received < per_thread {
                    if pop(&queue).is_some() {
                        received += 1;
                    }
                }
            });
        }
    })
    .unwrap();
}
