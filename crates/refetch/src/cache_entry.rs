use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::source::{AsyncSource, FetchResult, WeakSource};

/// The cache slot of a single key.
///
/// An entry is in one of three states: empty, pending (a computation is in flight), or holding a
/// value that may or may not have expired yet. A pending computation registered through
/// [`set_pending`](Self::set_pending) promotes the entry to the value state by itself once it
/// completes successfully. A failed computation returns the entry to the empty state.
///
/// Cloning an entry creates another handle to the same slot.
pub struct CacheEntry<V> {
    ttl: Option<Duration>,
    state: Arc<Mutex<EntryState<V>>>,
}

struct Pending<V> {
    id: u64,
    source: WeakSource<V>,
}

struct EntryState<V> {
    value: Option<V>,
    pending: Option<Pending<V>>,
    expires_at: Option<Instant>,
    /// Bumped for every registered computation.
    generation: u64,
}

impl<V> EntryState<V> {
    fn store(&mut self, value: V, ttl: Option<Duration>) {
        self.value = Some(value);
        self.pending = None;
        self.expires_at = ttl.map(|ttl| Instant::now() + ttl);
    }
}

fn lock<V>(state: &Mutex<EntryState<V>>) -> MutexGuard<'_, EntryState<V>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: Clone> CacheEntry<V> {
    /// Creates an empty entry.
    ///
    /// A `ttl` of `None` or zero disables value caching: [`is_valid`](Self::is_valid) is never
    /// true, while pending computations are still tracked.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
            state: Arc::new(Mutex::new(EntryState {
                value: None,
                pending: None,
                expires_at: None,
                generation: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, EntryState<V>> {
        lock(&self.state)
    }

    /// The configured time to live.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn has_value(&self) -> bool {
        self.state().value.is_some()
    }

    /// Whether a computation is registered and still has attachers.
    pub fn has_pending(&self) -> bool {
        self.pending().is_some()
    }

    /// Whether the entry holds a value that has not expired yet.
    pub fn is_valid(&self) -> bool {
        let state = self.state();
        state.value.is_some()
            && state
                .expires_at
                .is_some_and(|expires_at| expires_at > Instant::now())
    }

    /// The last stored value, regardless of expiry.
    pub fn value(&self) -> Option<V> {
        self.state().value.clone()
    }

    /// Attaches to the pending computation, if any.
    pub fn pending(&self) -> Option<AsyncSource<V>> {
        let state = self.state();
        state.pending.as_ref()?.source.upgrade()
    }

    /// Stores `value`, dropping any pending computation and restarting the expiry window.
    pub fn set(&self, value: V) {
        self.state().store(value, self.ttl);
    }

    /// Registers a new computation for this entry.
    ///
    /// Clears the current value. The returned source resolves to the result of `computation`,
    /// storing a successful value via [`set`](Self::set) before it is delivered to any attacher.
    ///
    /// The entry only keeps a weak reference to the computation: once every attachment is
    /// dropped, the computation is cancelled and the entry is no longer pending.
    pub fn set_pending<F>(&self, computation: F) -> AsyncSource<V>
    where
        F: Future<Output = FetchResult<V>> + Send + 'static,
        V: Send + Sync + 'static,
    {
        let id = {
            let mut state = self.state();
            state.value = None;
            state.generation += 1;
            state.generation
        };

        let ttl = self.ttl;
        let slot: Weak<Mutex<EntryState<V>>> = Arc::downgrade(&self.state);
        let source = AsyncSource::new(async move {
            let result = computation.await;
            if let Some(state) = slot.upgrade() {
                let mut state = lock(&state);
                match &result {
                    Ok(value) => state.store(value.clone(), ttl),
                    Err(_) => {
                        if state.pending.as_ref().is_some_and(|p| p.id == id) {
                            state.pending = None;
                        }
                    }
                }
            }
            result
        });

        self.state().pending = source.downgrade().map(|source| Pending { id, source });
        source
    }
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            state: Arc::clone(&self.state),
        }
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("CacheEntry")
            .field("ttl", &self.ttl)
            .field("has_value", &state.value.is_some())
            .field("pending", &state.pending.as_ref().map(|p| p.id))
            .field("expires_at", &state.expires_at)
            .finish()
    }
}
