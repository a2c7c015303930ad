//! Fixed worker pool with a bounded task queue.
//!
//! Built for fire-and-forget work the caller must never wait on;
//! in this system, the asynchronous deauthorize request. A full queue
//! refuses the task and the caller drops it: the portal ages sessions out
//! on its own, so a lost deauthorize is harmless.
//!
//! Worker panics are caught and logged; a failed task must not take a
//! worker down with it.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    shutdown: AtomicBool,
    max_queue: usize,
}

/// Fixed-size worker pool bounded by a maximum queue length.
pub struct BoundedExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BoundedExecutor {
    /// Create a pool of `workers` threads with a queue bound of `max_queue`.
    pub fn new(workers: usize, max_queue: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            max_queue,
        });

        let handles = (0..workers.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("executor-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn executor worker")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Submit a task.
    ///
    /// Returns `false` when the queue is full or the executor is shutting
    /// down; the task is dropped and the caller decides what to do.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock().expect("lock poisoned");
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            if queue.len() >= self.shared.max_queue {
                return false;
            }
            queue.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        true
    }

    /// Number of queued (not yet started) tasks.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().expect("lock poisoned").len()
    }

    /// Stop accepting tasks, drain the queue, and join all workers.
    ///
    /// Idempotent; later calls return immediately.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.available.notify_all();

        let mut workers = self.workers.lock().expect("lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!("Executor shut down");
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().expect("lock poisoned");
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared.available.wait(queue).expect("lock poisoned");
            }
        };

        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(error = %message, "Executor task failed");
        }
    }
}
