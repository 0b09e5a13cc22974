//! Fixed-size worker pool over a FIFO task queue.
//!
//! One mutex and one condition variable guard the queue, the terminate flag
//! and the count of workers currently running a task. [`ThreadPool::wait_all`]
//! waits for task *completion*, not dispatch: workers signal the condition
//! variable after a task finishes, so an empty queue alone is not enough to
//! wake a waiter.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use tiledb_common::Status;

type Task = Box<dyn FnOnce() -> Status + Send + 'static>;

struct Job {
    task: Task,
    /// `None` for fire-and-forget submissions.
    result: Option<Sender<Status>>,
}

struct PoolInner {
    queue: VecDeque<Job>,
    should_terminate: bool,
    /// Workers currently executing a task (popped but not yet finished).
    active: usize,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    queue_cv: Condvar,
}

/// A handle resolving to the status a task returned.
#[must_use]
pub struct TaskResult {
    receiver: Receiver<Status>,
}

impl TaskResult {
    /// Block until the task finishes and return its status. A task that
    /// panicked resolves to an error status.
    pub fn wait(self) -> Status {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Status::vfs_error("task dropped before producing a result"))
    }
}

/// A pool of `n >= 1` worker threads consuming a FIFO queue of tasks.
///
/// Dropping the pool drains the queue, waits for running tasks, then signals
/// termination and joins every worker. No task outlives the pool.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        // A pool always has at least one worker.
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            inner: Mutex::new(PoolInner {
                queue: VecDeque::new(),
                should_terminate: false,
                active: 0,
            }),
            queue_cv: Condvar::new(),
        });
        let threads = (0..num_threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker(shared))
            })
            .collect();
        Self { shared, threads }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Submit a task whose outcome nobody waits for. A failure or panic is
    /// recorded to the diagnostic log and otherwise swallowed.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Job {
            task: Box::new(move || {
                task();
                Status::ok()
            }),
            result: None,
        });
    }

    /// Submit a task and get a [`TaskResult`] resolving to its status.
    pub fn enqueue_with_result<F>(&self, task: F) -> TaskResult
    where
        F: FnOnce() -> Status + Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        self.push(Job {
            task: Box::new(task),
            result: Some(sender),
        });
        TaskResult { receiver }
    }

    fn push(&self, job: Job) {
        let mut inner = self.shared.inner.lock();
        inner.queue.push_back(job);
        self.shared.queue_cv.notify_one();
    }

    /// Block until the queue is empty and no worker holds a task.
    pub fn wait_all(&self) {
        let mut inner = self.shared.inner.lock();
        while !inner.queue.is_empty() || inner.active > 0 {
            self.shared.queue_cv.wait(&mut inner);
        }
    }

    /// Wait for every handle; `true` iff all of them resolved to ok.
    pub fn wait_all_ok(results: Vec<TaskResult>) -> bool {
        let mut all_ok = true;
        for result in results {
            all_ok &= result.wait().is_ok();
        }
        all_ok
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.wait_all();
        {
            let mut inner = self.shared.inner.lock();
            inner.should_terminate = true;
            self.shared.queue_cv.notify_all();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut inner = shared.inner.lock();
            while !inner.should_terminate && inner.queue.is_empty() {
                shared.queue_cv.wait(&mut inner);
            }
            if inner.should_terminate {
                break;
            }
            let job = match inner.queue.pop_front() {
                Some(job) => job,
                None => continue,
            };
            inner.active += 1;
            job
        };

        // A task must never unwind past the worker.
        let status = match catch_unwind(AssertUnwindSafe(job.task)) {
            Ok(status) => status,
            Err(_) => Status::vfs_error("task panicked"),
        };

        match job.result {
            Some(sender) => {
                // The receiver may have been dropped; that is not our problem.
                let _ = sender.send(status);
            }
            None => {
                if !status.is_ok() {
                    tracing::error!(status = %status, "fire-and-forget task failed");
                }
            }
        }

        {
            let mut inner = shared.inner.lock();
            inner.active -= 1;
            shared.queue_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_empty_wait() {
        let pool = ThreadPool::default();
        pool.wait_all();
    }

    #[test]
    fn test_single_worker() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_multiple_workers_repeated() {
        let pool = ThreadPool::new(4);
        assert_eq!(pool.num_threads(), 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for round in 1..=10 {
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.enqueue(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            pool.wait_all();
            assert_eq!(counter.load(Ordering::SeqCst), 100 * round);
        }
    }

    #[test]
    fn test_drop_without_wait() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(4);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.enqueue(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            // The destructor drains the queue before terminating.
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_enqueue_with_result() {
        let pool = ThreadPool::new(2);
        let ok = pool.enqueue_with_result(|| Status::ok());
        let err = pool.enqueue_with_result(|| Status::vfs_error("deliberate"));
        assert!(ok.wait().is_ok());
        let status = err.wait();
        assert!(!status.is_ok());
        assert_eq!(status.message(), Some("deliberate"));
    }

    #[test]
    fn test_wait_all_ok() {
        let pool = ThreadPool::new(2);
        let all_ok: Vec<_> = (0..8)
            .map(|_| pool.enqueue_with_result(|| Status::ok()))
            .collect();
        assert!(ThreadPool::wait_all_ok(all_ok));

        let mixed: Vec<_> = (0..8)
            .map(|i| {
                pool.enqueue_with_result(move || {
                    if i == 3 {
                        Status::vfs_error("shard failed")
                    } else {
                        Status::ok()
                    }
                })
            })
            .collect();
        assert!(!ThreadPool::wait_all_ok(mixed));
    }

    #[test]
    fn test_panic_is_contained() {
        let pool = ThreadPool::new(1);
        let result = pool.enqueue_with_result(|| panic!("boom"));
        let status = result.wait();
        assert!(!status.is_ok());
        // The worker survives and keeps serving tasks.
        let after = pool.enqueue_with_result(|| Status::ok());
        assert!(after.wait().is_ok());
    }

    #[test]
    fn test_wait_all_reflects_completion_not_dispatch() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                std::thread::sleep(Duration::from_millis(50));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
