//! Image Loader Scheduler Library
//!
//! Fixed-size worker pool, keyed cancellation registry and a serial
//! delivery context.
//!
//! Decode work runs on [`WorkerPool`] threads and checks its
//! [`CancellationToken`] between steps. The [`CancellationRegistry`] tracks
//! in-flight tasks by key so they can be cancelled by key. Results are
//! posted to a [`Dispatcher`] so every delivery runs on one context.
//!
//! # Example
//!
//! ```
//! use image_loader_scheduler::{
//!     CancellationRegistry, Dispatcher, ManualDispatcher, WorkerPool, WorkerPoolConfig,
//! };
//! use std::sync::{mpsc, Arc};
//!
//! let pool = WorkerPool::new(WorkerPoolConfig::new(2)).unwrap();
//! let registry = Arc::new(CancellationRegistry::new());
//! let dispatcher = Arc::new(ManualDispatcher::new());
//! let (done_tx, done_rx) = mpsc::channel();
//!
//! let (id, token) = registry.register("thumb-1".to_string());
//! let worker_registry = Arc::clone(&registry);
//! let worker_dispatcher = Arc::clone(&dispatcher);
//! pool.submit(token, Box::new(move |token| {
//!     if token.is_cancelled() {
//!         return;
//!     }
//!     worker_registry.unregister(&"thumb-1".to_string(), id);
//!     worker_dispatcher.dispatch(Box::new(move || done_tx.send(()).unwrap()));
//! }));
//!
//! // Wait for the worker, then pump deliveries on this thread
//! while dispatcher.pending() == 0 {
//!     std::thread::yield_now();
//! }
//! dispatcher.run_pending();
//! done_rx.recv().unwrap();
//! pool.shutdown();
//! ```

mod cancel;
mod delivery;
mod queue;
mod worker;

// Re-export public API
pub use cancel::{CancellationRegistry, CancellationToken, TaskId};
pub use delivery::{Delivery, DeliveryThread, Dispatcher, ManualDispatcher};
pub use queue::TaskQueue;
pub use worker::{Job, WorkerPool, WorkerPoolConfig, WorkerPoolStats, DEFAULT_WORKER_COUNT};
