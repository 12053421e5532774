//! Worker pool for parallel task execution.
//!
//! A fixed number of worker threads pull tasks from a shared FIFO queue,
//! execute them, and check for cancellation before starting each one.

use crate::queue::TaskQueue;
use crate::CancellationToken;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default number of worker threads
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Work item executed on a worker thread.
///
/// The job receives its cancellation token and should check
/// `token.is_cancelled()` between expensive steps.
pub type Job = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;

struct Task {
    token: CancellationToken,
    job: Job,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Fixed thread count; defaults to [`DEFAULT_WORKER_COUNT`]
    pub num_workers: usize,

    /// Maximum time a worker will wait for a task before checking shutdown.
    /// Default: 100ms.
    pub poll_interval: Duration,

    /// Prefix for worker thread names; the worker index is appended.
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_COUNT)
    }
}

impl WorkerPoolConfig {
    /// `num_workers` threads with the default poll interval and thread name.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            poll_interval: Duration::from_millis(100),
            thread_name: "image-loader-worker".to_string(),
        }
    }

    /// How long an idle worker waits before rechecking for shutdown.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Snapshot of worker pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Number of worker threads
    pub workers: usize,
    /// Tasks waiting in the queue
    pub queued: usize,
    /// Tasks currently executing
    pub active: usize,
    /// Tasks that ran to completion
    pub completed: u64,
    /// Tasks dropped because they were cancelled before starting
    pub skipped: u64,
}

struct Shared {
    queue: TaskQueue<Task>,
    shutdown: AtomicBool,
    active: AtomicUsize,
    completed: AtomicU64,
    skipped: AtomicU64,
}

/// Worker pool for parallel task execution.
///
/// # Example
///
/// ```
/// use image_loader_scheduler::{CancellationToken, WorkerPool, WorkerPoolConfig};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
/// let (tx, rx) = mpsc::channel();
///
/// pool.submit(CancellationToken::new(), Box::new(move |token| {
///     if !token.is_cancelled() {
///         tx.send(42).unwrap();
///     }
/// }));
///
/// assert_eq!(rx.recv().unwrap(), 42);
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl WorkerPool {
    /// Spawn every worker thread up front.
    ///
    /// # Errors
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: TaskQueue::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });
        let mut workers = Vec::with_capacity(config.num_workers);

        for id in 0..config.num_workers {
            let worker_shared = Arc::clone(&shared);
            let poll_interval = config.poll_interval;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, id))
                .spawn(move || run(worker_shared, poll_interval));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Stop whatever already started before reporting
                    shared.shutdown.store(true, Ordering::Release);
                    shared.queue.wake_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        tracing::debug!(workers = config.num_workers, "worker pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            num_workers: config.num_workers,
        })
    }

    /// Queue a job for execution.
    ///
    /// Returns `false` if the pool is shutting down; the job is dropped.
    pub fn submit(&self, token: CancellationToken, job: Job) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.shared.queue.push(Task { token, job });
        true
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            workers: self.num_workers,
            queued: self.shared.queue.len(),
            active: self.shared.active.load(Ordering::Acquire),
            completed: self.shared.completed.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
        }
    }

    /// Stop the pool and join its threads.
    ///
    /// Queued tasks that have not started are dropped. Running tasks finish
    /// and this method blocks until every worker has exited. Calling it
    /// again is a no-op.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let dropped = self.shared.queue.drain().len();
        self.shared.queue.wake_all();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "dropped queued tasks on shutdown");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal only; joining here could block a thread that owns the pool
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue.wake_all();
    }
}

/// Main worker loop.
///
/// Workers pull tasks from the queue, skip the ones cancelled while queued,
/// and run the rest. A panicking task is logged and does not take the
/// worker down with it.
fn run(shared: Arc<Shared>, poll_interval: Duration) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let Some(task) = shared.queue.pop_timeout(poll_interval) else {
            continue;
        };

        if task.token.is_cancelled() {
            // Drop first so `skipped` only counts fully discarded tasks
            drop(task);
            shared.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        shared.active.fetch_add(1, Ordering::AcqRel);
        let Task { token, job } = task;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&token)));
        shared.active.fetch_sub(1, Ordering::AcqRel);

        match outcome {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                tracing::error!("worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, DEFAULT_WORKER_COUNT);
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new(2)
            .with_poll_interval(Duration::from_millis(50))
            .with_thread_name("decode");
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.thread_name, "decode");
    }

    #[test]
    fn test_runs_submitted_jobs() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let executed = Arc::clone(&executed);
            assert!(pool.submit(
                CancellationToken::new(),
                Box::new(move |_| {
                    executed.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }

        assert!(wait_until(|| executed.load(Ordering::SeqCst) == 5));
        assert!(wait_until(|| pool.stats().completed == 5));
        pool.shutdown();
    }

    #[test]
    fn test_worker_pool_runs_in_parallel() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
        let (tx, rx) = mpsc::channel();
        let barrier = Arc::new(std::sync::Barrier::new(2));

        for _ in 0..2 {
            let tx = tx.clone();
            let barrier = Arc::clone(&barrier);
            pool.submit(
                CancellationToken::new(),
                Box::new(move |_| {
                    // Deadlocks unless both jobs run at the same time
                    barrier.wait();
                    tx.send(()).unwrap();
                }),
            );
        }

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        pool.shutdown();
    }

    #[test]
    fn test_worker_pool_skips_cancelled_tasks() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(1)).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker
        pool.submit(
            CancellationToken::new(),
            Box::new(move |_| {
                let _ = gate_rx.recv();
            }),
        );

        let token = CancellationToken::new();
        let ran_clone = Arc::clone(&ran);
        let captured = Arc::new(());
        let held = Arc::clone(&captured);
        pool.submit(
            token.clone(),
            Box::new(move |_| {
                let _held = held;
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        token.cancel();
        gate_tx.send(()).unwrap();

        assert!(wait_until(|| pool.stats().skipped == 1));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        // The skipped job was dropped before it was counted
        assert_eq!(Arc::strong_count(&captured), 1);
        pool.shutdown();
    }

    #[test]
    fn test_worker_survives_panicking_task() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(1)).unwrap();
        let (tx, rx) = mpsc::channel();

        pool.submit(CancellationToken::new(), Box::new(|_| panic!("boom")));
        pool.submit(
            CancellationToken::new(),
            Box::new(move |_| {
                tx.send("still alive").unwrap();
            }),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still alive");
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
        assert_eq!(pool.num_workers(), 2);
        assert!(!pool.is_shutting_down());

        pool.shutdown();
        assert!(pool.is_shutting_down());
        assert!(!pool.submit(CancellationToken::new(), Box::new(|_| {})));

        // Second shutdown is a no-op
        pool.shutdown();
    }
}
