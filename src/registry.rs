//! Subscriber registry: which callbacks observe which event kinds.
//!
//! Registration is append-only for the lifetime of the registry. Lookups
//! return a snapshot so that a dispatch in flight is never affected by a
//! concurrent registration.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    error::Result,
    events::{Event, EventKind},
};

/// A subscriber callback.
///
/// Callbacks run on the dispatcher task and must not block. Returning an
/// error skips the remaining callbacks for the same event.
pub type Callback = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Thread-safe table of subscriber callbacks, keyed by event kind.
///
/// Cloning a registry yields a handle to the same table.
#[derive(Clone, Default)]
pub struct Registry {
    table: Arc<Mutex<HashMap<EventKind, Vec<Callback>>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `callback` to the subscribers of `kind`.
    ///
    /// Callbacks for the same kind are invoked in the order they were
    /// subscribed.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let mut table = self.lock();
        let callbacks = table.entry(kind).or_default();
        callbacks.push(Arc::new(callback));
        debug!("subscribed to {kind} ({} subscribers)", callbacks.len());
    }

    /// Returns a snapshot of the subscribers of `kind`.
    #[must_use]
    pub fn snapshot(&self, kind: EventKind) -> Vec<Callback> {
        self.lock().get(&kind).cloned().unwrap_or_default()
    }

    /// Returns the number of subscribers of `kind`.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    // Callbacks never run under the lock, so a poisoned table is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Callback>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.lock();
        let mut map = f.debug_map();
        for (kind, callbacks) in table.iter() {
            map.entry(kind, &callbacks.len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, sync::atomic::Ordering, thread};

    use super::*;

    #[test]
    fn snapshot_keeps_registration_order() {
        let registry = Registry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            registry.subscribe(EventKind::SongChange, move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        let event = Event::new(EventKind::SongChange);
        for callback in registry.snapshot(EventKind::SongChange) {
            callback(&event).unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert!(registry.snapshot(EventKind::Next).is_empty());
    }

    #[test]
    fn snapshot_is_unaffected_by_later_registration() {
        let registry = Registry::new();
        registry.subscribe(EventKind::SongChange, |_| Ok(()));

        let snapshot = registry.snapshot(EventKind::SongChange);
        registry.subscribe(EventKind::SongChange, |_| Ok(()));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.count(EventKind::SongChange), 2);
    }

    #[test]
    fn concurrent_registration_loses_nothing() {
        let registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let calls = Arc::clone(&calls);
                        registry.subscribe(EventKind::SongChange, move |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let event = Event::new(EventKind::SongChange);
        for callback in registry.snapshot(EventKind::SongChange) {
            callback(&event).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 200);
    }
}
