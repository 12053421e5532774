//! Host-side collaborators: render targets and cancellation scopes

use image_loader_cache::PooledBuffer;
use std::sync::{Arc, Mutex, Weak};

/// Identifier of a placeholder or error indicator known to the host
pub type IndicatorId = u32;

/// Displays delivered images
///
/// All calls except the placeholder happen on the engine's delivery context.
/// The engine never reads from a target.
pub trait RenderTarget: Send + Sync {
    fn set_image(&self, image: Arc<PooledBuffer>);
    fn set_placeholder(&self, id: IndicatorId);
    fn set_error(&self, id: IndicatorId);
}

/// Observer fired when a scope ends
pub type ScopeObserver = Box<dyn FnOnce() + Send + 'static>;

/// Subscription returned by [`CancellationScope::on_end`]
///
/// Dropping it unsubscribes the observer if it has not run yet.
#[must_use = "dropping the registration unsubscribes the observer"]
pub struct ScopeRegistration {
    unsubscribe: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl ScopeRegistration {
    /// Registration that runs `unsubscribe` when dropped
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Registration with nothing to undo
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }
}

impl Drop for ScopeRegistration {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for ScopeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistration")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A lifetime the host controls, such as a screen or a view
///
/// The engine only subscribes; it never ends a scope itself.
pub trait CancellationScope: Send + Sync {
    /// Register `observer` to run once when the scope ends
    ///
    /// If the scope has already ended the observer runs immediately.
    /// Dropping the returned registration before the scope ends removes
    /// the observer.
    fn on_end(&self, observer: ScopeObserver) -> ScopeRegistration;
}

/// Ready-made scope the host ends explicitly
#[derive(Default)]
pub struct LifecycleScope {
    state: Arc<Mutex<ScopeState>>,
}

#[derive(Default)]
struct ScopeState {
    ended: bool,
    next_id: u64,
    observers: Vec<(u64, ScopeObserver)>,
}

impl LifecycleScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// End the scope and fire every registered observer
    ///
    /// Ending an already-ended scope does nothing.
    pub fn end(&self) {
        let observers = {
            let mut state = self.state.lock().unwrap();
            if state.ended {
                return;
            }
            state.ended = true;
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            observer();
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }

    /// Number of observers waiting for the scope to end
    pub fn observer_count(&self) -> usize {
        self.state.lock().unwrap().observers.len()
    }
}

impl CancellationScope for LifecycleScope {
    fn on_end(&self, observer: ScopeObserver) -> ScopeRegistration {
        let mut state = self.state.lock().unwrap();
        if state.ended {
            drop(state);
            observer();
            return ScopeRegistration::noop();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.observers.push((id, observer));

        let weak: Weak<Mutex<ScopeState>> = Arc::downgrade(&self.state);
        ScopeRegistration::new(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            // Take the observer out so it drops outside the lock
            let removed = {
                let mut state = state.lock().unwrap();
                state
                    .observers
                    .iter()
                    .position(|(observer_id, _)| *observer_id == id)
                    .map(|pos| state.observers.remove(pos))
            };
            drop(removed);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scope_fires_observers_once() {
        let scope = LifecycleScope::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let mut registrations = Vec::new();
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            registrations.push(scope.on_end(Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })));
        }
        assert_eq!(scope.observer_count(), 3);

        scope.end();
        scope.end();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(scope.is_ended());
        assert_eq!(scope.observer_count(), 0);
    }

    #[test]
    fn test_observer_after_end_runs_immediately() {
        let scope = LifecycleScope::new();
        scope.end();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let registration = scope.on_end(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scope.observer_count(), 0);
        drop(registration);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_removes_observer() {
        let scope = LifecycleScope::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let kept_fired = Arc::clone(&fired);
        let kept = scope.on_end(Box::new(move || {
            kept_fired.fetch_add(1, Ordering::SeqCst);
        }));
        let dropped_fired = Arc::clone(&fired);
        let dropped = scope.on_end(Box::new(move || {
            dropped_fired.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(scope.observer_count(), 2);

        drop(dropped);
        assert_eq!(scope.observer_count(), 1);

        scope.end();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(kept);
        assert_eq!(scope.observer_count(), 0);
    }

    #[test]
    fn test_registration_outlives_scope() {
        let scope = LifecycleScope::new();
        let registration = scope.on_end(Box::new(|| {}));
        drop(scope);
        drop(registration);
    }
}
