//! Cancellation token system for tasks
//!
//! Provides cancellation tokens that allow running tasks to be cancelled
//! cooperatively, and a registry that tracks the in-flight tasks for each
//! key so they can be cancelled by key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

/// Unique identifier for a registered task
pub type TaskId = u64;

/// Shared cancel flag for a single request
///
/// Loaders poll [`is_cancelled`](Self::is_cancelled) between the fetch and
/// decode steps. Clones share one flag.
///
/// # Example
///
/// ```
/// use image_loader_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let loader_token = token.clone();
///
/// token.cancel();
/// assert!(loader_token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the flag; idempotent
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of in-flight tasks grouped by key
///
/// Several tasks may share a key (identical requests are not merged), so
/// each registration gets its own [`TaskId`] and token. Cancelling a key
/// cancels every task registered under it.
///
/// # Example
///
/// ```
/// use image_loader_scheduler::CancellationRegistry;
///
/// let registry: CancellationRegistry<String> = CancellationRegistry::new();
///
/// let (id, token) = registry.register("photo.png".to_string());
/// assert_eq!(registry.cancel(&"photo.png".to_string()), 1);
/// assert!(token.is_cancelled());
///
/// // Unregistering after cancellation is a no-op
/// assert!(!registry.unregister(&"photo.png".to_string(), id));
/// ```
pub struct CancellationRegistry<K> {
    tokens: Mutex<HashMap<K, Vec<(TaskId, CancellationToken)>>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash + Clone> CancellationRegistry<K> {
    /// Create a new empty cancellation registry
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a task under `key` and return its id and token
    pub fn register(&self, key: K) -> (TaskId, CancellationToken) {
        let token = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut tokens = self.tokens.lock().unwrap();
        tokens.entry(key).or_default().push((id, token.clone()));
        (id, token)
    }

    /// Remove one task (called when it reaches a terminal state)
    ///
    /// Returns `true` if the task was still registered.
    pub fn unregister(&self, key: &K, id: TaskId) -> bool {
        let mut tokens = self.tokens.lock().unwrap();
        let Some(tasks) = tokens.get_mut(key) else {
            return false;
        };
        let before = tasks.len();
        tasks.retain(|(task_id, _)| *task_id != id);
        let removed = tasks.len() != before;
        if tasks.is_empty() {
            tokens.remove(key);
        }
        removed
    }

    /// Cancel and remove every task registered under `key`
    ///
    /// Returns the number of tasks cancelled; an unknown key is a no-op.
    pub fn cancel(&self, key: &K) -> usize {
        let removed = self.tokens.lock().unwrap().remove(key);
        match removed {
            Some(tasks) => {
                for (_, token) in &tasks {
                    token.cancel();
                }
                tasks.len()
            }
            None => 0,
        }
    }

    /// Cancel and remove a single task
    pub fn cancel_task(&self, key: &K, id: TaskId) -> bool {
        let token = {
            let mut tokens = self.tokens.lock().unwrap();
            let Some(tasks) = tokens.get_mut(key) else {
                return false;
            };
            let Some(pos) = tasks.iter().position(|(task_id, _)| *task_id == id) else {
                return false;
            };
            let (_, token) = tasks.remove(pos);
            if tasks.is_empty() {
                tokens.remove(key);
            }
            token
        };
        token.cancel();
        true
    }

    /// Cancel and remove all registered tasks
    ///
    /// Returns the number of tasks cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tokens.lock().unwrap().drain().collect();
        let mut count = 0;
        for (_, tasks) in drained {
            for (_, token) in tasks {
                token.cancel();
                count += 1;
            }
        }
        count
    }

    /// Whether any task is registered under `key`
    pub fn contains(&self, key: &K) -> bool {
        self.tokens.lock().unwrap().contains_key(key)
    }

    /// Whether a specific task is still registered
    pub fn is_registered(&self, key: &K, id: TaskId) -> bool {
        self.tokens
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|tasks| tasks.iter().any(|(task_id, _)| *task_id == id))
    }

    /// Number of registered tasks across all keys
    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().unwrap().is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for CancellationRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_basic() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancellation_token_clone() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();
        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_cancellation_token_idempotent() {
        let token = CancellationToken::default();

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_registry_basic() {
        let registry = CancellationRegistry::new();

        let (_, token) = registry.register("a");
        assert!(!token.is_cancelled());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&"a"));

        assert_eq!(registry.cancel(&"a"), 1);
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_cancel_not_found() {
        let registry: CancellationRegistry<&str> = CancellationRegistry::new();
        assert_eq!(registry.cancel(&"missing"), 0);
    }

    #[test]
    fn test_registry_same_key_tracks_each_task() {
        let registry = CancellationRegistry::new();

        let (first, token1) = registry.register("k");
        let (second, token2) = registry.register("k");
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(&"k", first));
        assert!(registry.contains(&"k"));
        assert!(registry.is_registered(&"k", second));
        assert!(!registry.is_registered(&"k", first));

        assert_eq!(registry.cancel(&"k"), 1);
        assert!(!token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_registry_cancel_task() {
        let registry = CancellationRegistry::new();

        let (first, token1) = registry.register("k");
        let (_, token2) = registry.register("k");

        assert!(registry.cancel_task(&"k", first));
        assert!(token1.is_cancelled());
        assert!(!token2.is_cancelled());
        assert!(!registry.cancel_task(&"k", first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_cancel_all() {
        let registry = CancellationRegistry::new();

        let (_, token1) = registry.register(1);
        let (_, token2) = registry.register(2);
        let (_, token3) = registry.register(2);

        assert_eq!(registry.cancel_all(), 3);
        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
        assert!(token3.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_unregister() {
        let registry = CancellationRegistry::new();

        let (id, _) = registry.register(1);
        assert!(registry.unregister(&1, id));
        assert_eq!(registry.len(), 0);
        assert!(!registry.contains(&1));

        assert!(!registry.unregister(&1, id));
    }
}
