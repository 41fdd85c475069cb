//! The current client and the observers that track it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Callback invoked with each newly bound client.
pub type Observer<C> = Box<dyn Fn(&Arc<C>) + Send + Sync>;

/// Holds the bound client and fans out replacements.
///
/// Observers run while the observer list is locked, so a subscribe racing a
/// publish is either replayed the old client before being told of the new
/// one, or only ever sees the new one. It never sees both at once and never
/// misses a replacement.
pub(crate) struct Binding<C> {
    current: RwLock<Option<Arc<C>>>,
    observers: Mutex<Vec<Observer<C>>>,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one observer. A panic is logged and contained so the remaining
/// observers and the caller keep going.
fn notify<C>(observer: &Observer<C>, client: &Arc<C>) {
    if catch_unwind(AssertUnwindSafe(|| observer(client))).is_err() {
        tracing::error!("Client observer panicked; continuing");
    }
}

impl<C> Binding<C> {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            observers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Option<Arc<C>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of clients published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Register `observer`, replaying the current client first if one is bound.
    pub fn subscribe(&self, observer: Observer<C>) {
        let mut observers = lock(&self.observers);
        if let Some(client) = self.current() {
            notify(&observer, &client);
        }
        observers.push(observer);
    }

    /// Make `client` current and notify every observer. Returns its generation.
    pub fn publish(&self, client: Arc<C>) -> u64 {
        let observers = lock(&self.observers);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&client));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        for observer in observers.iter() {
            notify(observer, &client);
        }
        generation
    }

    /// Unbind and return the current client.
    pub fn take(&self) -> Option<Arc<C>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }
}
