// Per-component error status registry

//! Health status registry
//!
//! Components report their error state under a key; watchers are notified
//! when a key transitions into or out of the error state. The registry is an
//! explicit instance constructed by the embedding application and passed by
//! reference to whoever reports into it, so its lifetime is tied to
//! application startup and shutdown rather than hidden process globals.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Callback invoked with the key and its new error state on transitions.
pub type HealthCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// Per-key error state with change-notification watchers.
#[derive(Default)]
pub struct HealthRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    errors: HashMap<String, Option<String>>,
    watchers: HashMap<u64, HealthCallback>,
    next_watcher: u64,
}

impl HealthRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the error state for `key`. Watchers run when the key
    /// transitions into or out of the error state, each on its own task;
    /// the initial report of a healthy key stays silent, and an unchanged
    /// error state only updates the stored message.
    ///
    /// Callbacks are dispatched on the current tokio runtime.
    pub fn set_health(&self, key: &str, err: Option<String>) {
        let callbacks: Vec<HealthCallback> = {
            let mut inner = self.inner.lock();
            let old = inner.errors.get(key).cloned();
            match old {
                None if err.is_none() => {
                    // Initial happy path.
                    inner.errors.insert(key.to_string(), None);
                    return;
                }
                Some(old) if old.is_some() == err.is_some() => {
                    // No change in overall error status, but the exact
                    // message might have changed, so note it.
                    if err.is_some() {
                        inner.errors.insert(key.to_string(), err);
                    }
                    return;
                }
                _ => {}
            }
            inner.errors.insert(key.to_string(), err.clone());
            inner.watchers.values().cloned().collect()
        };

        for callback in callbacks {
            let key = key.to_string();
            let err = err.clone();
            tokio::spawn(async move { callback(&key, err.as_deref()) });
        }
    }

    /// Current error for `key`, or `None` when healthy or unreported.
    pub fn health(&self, key: &str) -> Option<String> {
        self.inner.lock().errors.get(key).cloned().flatten()
    }

    /// Register `callback` to run on error-state transitions. Dropping (or
    /// explicitly unregistering) the returned handle removes it.
    pub fn register_watcher(self: &Arc<Self>, callback: HealthCallback) -> WatcherHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_watcher;
        inner.next_watcher += 1;
        inner.watchers.insert(id, callback);
        WatcherHandle {
            registry: Arc::downgrade(self),
            id,
        }
    }
}

/// Removes its watcher from the registry when dropped.
pub struct WatcherHandle {
    registry: Weak<HealthRegistry>,
    id: u64,
}

impl WatcherHandle {
    /// Remove the watcher now.
    pub fn unregister(self) {}
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.inner.lock().watchers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Event = (String, Option<String>);

    fn watched(registry: &Arc<HealthRegistry>) -> (WatcherHandle, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = registry.register_watcher(Arc::new(move |key, err| {
            let _ = tx.send((key.to_string(), err.map(str::to_string)));
        }));
        (handle, rx)
    }

    #[tokio::test]
    async fn test_initial_healthy_report_is_silent() {
        let registry = HealthRegistry::new();
        let (_handle, mut rx) = watched(&registry);

        registry.set_health("router", None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.health("router"), None);
    }

    #[tokio::test]
    async fn test_initial_error_report_fires() {
        let registry = HealthRegistry::new();
        let (_handle, mut rx) = watched(&registry);

        registry.set_health("dns", Some("dns set failed".into()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event, ("dns".to_string(), Some("dns set failed".to_string())));
    }

    #[tokio::test]
    async fn test_transition_semantics() {
        let registry = HealthRegistry::new();
        let (_handle, mut rx) = watched(&registry);

        registry.set_health("router", None);
        registry.set_health("router", Some("boom".into()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event, ("router".to_string(), Some("boom".to_string())));

        // Staying in the error state is silent but updates the message.
        registry.set_health("router", Some("boom again".into()));
        assert_eq!(registry.health("router"), Some("boom again".to_string()));

        registry.set_health("router", None);
        let event = rx.recv().await.unwrap();
        assert_eq!(event, ("router".to_string(), None));
        assert_eq!(registry.health("router"), None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_stops_callbacks() {
        let registry = HealthRegistry::new();
        let (handle, mut rx) = watched(&registry);

        handle.unregister();
        registry.set_health("router", Some("boom".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        // The state itself is still recorded.
        assert_eq!(registry.health("router"), Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_watchers_are_independent() {
        let registry = HealthRegistry::new();
        let (_h1, mut rx1) = watched(&registry);
        let (_h2, mut rx2) = watched(&registry);

        registry.set_health("router", Some("boom".into()));
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn test_unknown_key_is_healthy() {
        let registry = HealthRegistry::default();
        assert_eq!(registry.health("missing"), None);
    }
}
