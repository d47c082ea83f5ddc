//! Task farm for the parallel phases of the collector.
//!
//! The farm offers exactly two operations: [`TaskFarm::submit`] and
//! [`TaskFarm::wait_for_completion`]. The queue is bounded; when it is
//! saturated (or the farm has no worker threads at all) a submitted task
//! runs inline on the submitting thread, so submission can never deadlock
//! and never allocates unboundedly.
//!
//! Tasks may submit further tasks; the completion barrier counts both.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue slots per worker thread. Beyond this backlog the submitting thread
/// pitches in instead of queueing more.
const QUEUE_SLOTS_PER_WORKER: usize = 64;

struct FarmCore {
    queue: ArrayQueue<Task>,
    /// Tasks queued or running. The barrier waits for this to hit zero.
    pending: AtomicUsize,
    shutdown: Mutex<bool>,
    work_ready: Condvar,
    all_done: Condvar,
    workers: usize,
}

impl FarmCore {
    fn submit(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.workers == 0 {
            task();
            self.finish_one();
            return;
        }
        match self.queue.push(task) {
            Ok(()) => {
                // Take and release the lock so a worker between its empty
                // check and its wait cannot miss the notification.
                drop(self.shutdown.lock());
                self.work_ready.notify_one();
            }
            Err(task) => {
                // Saturated: run on the submitting thread.
                task();
                self.finish_one();
            }
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            drop(self.shutdown.lock());
            self.all_done.notify_all();
        }
    }

    fn wait_for_completion(&self) {
        let mut shutdown = self.shutdown.lock();
        while self.pending.load(Ordering::SeqCst) != 0 {
            self.all_done.wait(&mut shutdown);
        }
    }

    fn worker_loop(&self) {
        loop {
            if let Some(task) = self.queue.pop() {
                task();
                self.finish_one();
                continue;
            }
            let mut shutdown = self.shutdown.lock();
            if *shutdown {
                return;
            }
            if self.queue.is_empty() {
                self.work_ready.wait(&mut shutdown);
                if *shutdown {
                    return;
                }
            }
        }
    }
}

/// A pool of worker threads draining a bounded task queue.
pub struct TaskFarm {
    core: Arc<FarmCore>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskFarm {
    /// Creates a farm with `threads` worker threads.
    ///
    /// With `threads == 0` every submitted task runs inline on the
    /// submitting thread, which makes phase ordering deterministic; useful
    /// for tests and single-core fallback.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let core = Arc::new(FarmCore {
            queue: ArrayQueue::new(threads.max(1) * QUEUE_SLOTS_PER_WORKER),
            pending: AtomicUsize::new(0),
            shutdown: Mutex::new(false),
            work_ready: Condvar::new(),
            all_done: Condvar::new(),
            workers: threads,
        });
        let workers = (0..threads)
            .map(|i| {
                let core = Arc::clone(&core);
                thread::Builder::new()
                    .name(format!("gc-share-{i}"))
                    .spawn(move || core.worker_loop())
                    .expect("failed to spawn farm worker")
            })
            .collect();
        Self { core, workers }
    }

    /// Number of worker threads matching the machine's parallelism.
    #[must_use]
    pub fn default_threads() -> usize {
        thread::available_parallelism().map_or(1, NonZeroUsize::get)
    }

    /// Number of worker threads in this farm.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.core.workers
    }

    /// Enqueues a task, or runs it inline when the queue is saturated.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.core.submit(Box::new(f));
    }

    /// Blocks until every submitted task (including tasks submitted by
    /// tasks) has finished.
    pub fn wait_for_completion(&self) {
        self.core.wait_for_completion();
    }

    /// A cloneable handle for submitting from inside tasks.
    #[must_use]
    pub fn handle(&self) -> FarmHandle {
        FarmHandle {
            core: Arc::clone(&self.core),
        }
    }
}

impl Drop for TaskFarm {
    fn drop(&mut self) {
        {
            let mut shutdown = self.core.shutdown.lock();
            *shutdown = true;
        }
        self.core.work_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Submission handle usable from inside running tasks.
#[derive(Clone)]
pub struct FarmHandle {
    core: Arc<FarmCore>,
}

impl FarmHandle {
    /// Enqueues a task, or runs it inline when the queue is saturated.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.core.submit(Box::new(f));
    }
}

/// A borrowed reference smuggled into a `'static` task closure.
///
/// The farm only accepts `'static` tasks, but phase tasks operate on state
/// the driver merely borrows. The driver guarantees the borrow outlives the
/// task by always calling [`TaskFarm::wait_for_completion`] before the
/// borrow ends; every dereference site restates that argument.
pub(crate) struct SendRef<T>(*const T);

// SAFETY: the wrapped reference is to Sync state (asserted by the bound on
// `new`), and validity across the farm is the submitting phase's contract.
unsafe impl<T> Send for SendRef<T> {}

impl<T: Sync> SendRef<T> {
    pub(crate) fn new(r: &T) -> Self {
        Self(r)
    }

    /// # Safety
    ///
    /// The referent must still be live; see the type-level contract.
    pub(crate) unsafe fn get(&self) -> &T {
        unsafe { &*self.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_inline_when_no_workers() {
        let farm = TaskFarm::new(0);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        farm.submit(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        // No barrier needed: the task ran on this thread during submit.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        farm.wait_for_completion();
    }

    #[test]
    fn test_barrier_counts_all_tasks() {
        let farm = TaskFarm::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = Arc::clone(&count);
            farm.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        farm.wait_for_completion();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_nested_submission() {
        let farm = TaskFarm::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        let handle = farm.handle();
        for _ in 0..8 {
            let count = Arc::clone(&count);
            let handle = handle.clone();
            farm.submit(move || {
                for _ in 0..16 {
                    let count = Arc::clone(&count);
                    handle.submit(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    });
                }
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        farm.wait_for_completion();
        assert_eq!(count.load(Ordering::SeqCst), 8 + 8 * 16);
    }

    #[test]
    fn test_saturation_falls_back_to_inline() {
        let farm = TaskFarm::new(1);
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            farm.submit(move || {
                thread::sleep(Duration::from_millis(50));
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Far more tasks than the queue holds; the excess must run inline
        // on this thread rather than blocking.
        let total = QUEUE_SLOTS_PER_WORKER * 4;
        for _ in 0..total {
            let count = Arc::clone(&count);
            farm.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        farm.wait_for_completion();
        assert_eq!(count.load(Ordering::SeqCst), total + 1);
    }

    #[test]
    fn test_wait_on_idle_farm_returns() {
        let farm = TaskFarm::new(2);
        farm.wait_for_completion();
        farm.wait_for_completion();
    }
}
