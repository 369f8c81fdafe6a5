//! Synchronous multicast events and scoped teardown.
//!
//! [`Emitter`] fans a value out to every listener on the caller's stack, in
//! subscription order. Listeners are held by [`Subscription`] handles that
//! unsubscribe when dropped. [`DisposableStore`] collects handles and cleanup
//! callbacks and releases them exactly once, newest first.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct EmitterInner<T> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
}

/// Single-producer, multi-listener event source.
pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. It stays registered until the returned handle is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));

        let weak: Weak<EmitterInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.write().retain(|(lid, _)| *lid != id);
            }
        })
    }

    /// Deliver `value` to every current listener.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe or
    /// unsubscribe (including themselves) while being called.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                warn!("Event listener panicked; continuing with remaining listeners");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

/// Handle for a registered listener or any other releasable resource.
#[must_use = "dropping the subscription releases it immediately"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn dispose(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.release.is_some())
            .finish()
    }
}

/// Owns a set of subscriptions and releases them together.
#[derive(Default)]
pub struct DisposableStore {
    disposed: AtomicBool,
    items: Mutex<Vec<Subscription>>,
}

impl DisposableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `sub`. If the store is already disposed, `sub` is released at once.
    pub fn add(&self, sub: Subscription) {
        if self.disposed.load(Ordering::SeqCst) {
            sub.dispose();
            return;
        }
        self.items.lock().push(sub);
    }

    pub fn add_fn(&self, release: impl FnOnce() + Send + Sync + 'static) {
        self.add(Subscription::new(release));
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything, newest first. Subsequent calls are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let items = std::mem::take(&mut *self.items.lock());
        for sub in items.into_iter().rev() {
            sub.dispose();
        }
    }
}

impl Drop for DisposableStore {
    fn drop(&mut self) {
        self.dispose();
    }
}
