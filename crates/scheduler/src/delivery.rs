//! Delivery context for completed work.
//!
//! Results produced on worker threads are handed to a single serial
//! context before they reach callers, so deliveries never run
//! concurrently with each other and arrive in the order they were posted.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

/// Callback posted to the delivery context
pub type Delivery = Box<dyn FnOnce() + Send + 'static>;

/// A serial execution context for deliveries
pub trait Dispatcher: Send + Sync {
    /// Post a delivery; it runs later on the context's thread, after every
    /// delivery posted before it
    fn dispatch(&self, delivery: Delivery);
}

/// Dispatcher backed by one dedicated thread
///
/// # Example
///
/// ```
/// use image_loader_scheduler::{DeliveryThread, Dispatcher};
/// use std::sync::mpsc;
///
/// let delivery = DeliveryThread::spawn().unwrap();
/// let (tx, rx) = mpsc::channel();
/// delivery.dispatch(Box::new(move || tx.send("done").unwrap()));
/// assert_eq!(rx.recv().unwrap(), "done");
/// delivery.shutdown();
/// ```
pub struct DeliveryThread {
    sender: Mutex<Option<Sender<Delivery>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryThread {
    /// Start the delivery thread.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn() -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Delivery>();
        let thread = thread::Builder::new()
            .name("image-loader-delivery".to_string())
            .spawn(move || {
                for delivery in receiver {
                    delivery();
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop accepting deliveries, run the ones already posted and join the
    /// thread. Calling it again is a no-op.
    pub fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Shutting down from a delivery; the loop exits on its own
                return;
            }
            if handle.join().is_err() {
                tracing::error!("delivery thread panicked");
            }
        }
    }
}

impl Dispatcher for DeliveryThread {
    fn dispatch(&self, delivery: Delivery) {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(delivery).is_err() {
                    tracing::warn!("delivery thread is gone, dropping delivery");
                }
            }
            None => tracing::debug!("delivery after shutdown dropped"),
        }
    }
}

impl Drop for DeliveryThread {
    fn drop(&mut self) {
        // Closing the channel ends the thread once the backlog is drained
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

/// Dispatcher pumped by the host
///
/// Deliveries accumulate until the host calls [`run_pending`] from its own
/// main loop. Useful when results must land on a thread the host owns, and
/// for deterministic tests.
///
/// [`run_pending`]: ManualDispatcher::run_pending
#[derive(Default)]
pub struct ManualDispatcher {
    pending: Mutex<VecDeque<Delivery>>,
}

impl ManualDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every delivery posted so far, in order, on the calling thread
    ///
    /// Deliveries posted while running are left for the next call.
    /// Returns the number executed.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Delivery> = self.pending.lock().unwrap().drain(..).collect();
        let count = batch.len();
        for delivery in batch {
            delivery();
        }
        count
    }

    /// Number of deliveries waiting to run
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Dispatcher for ManualDispatcher {
    fn dispatch(&self, delivery: Delivery) {
        self.pending.lock().unwrap().push_back(delivery);
    }
}
