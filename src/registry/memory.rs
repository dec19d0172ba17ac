//! In-memory registry, for tests and single-process wiring.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use triple_rpc_core::{Code, Endpoint, ServiceKey, Status, TripleError};

use super::{Lease, NotifyListener, Registry, Subscription};

#[derive(Default)]
pub struct MemoryRegistry {
    next_id: AtomicU64,
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    /// canonical key -> authority -> endpoint
    providers: HashMap<String, BTreeMap<String, Endpoint>>,
    /// lease id -> (canonical key, authority)
    leases: HashMap<u64, (String, String)>,
    /// canonical key -> live listeners; the vector is the per-key refcount
    subscribers: HashMap<String, Vec<(u64, NotifyListener)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot + listeners are collected under the lock, delivery happens
    /// outside it so a listener may call back into the registry.
    fn notify(&self, canonical: &str) {
        let (snapshot, listeners) = {
            let inner = self.inner.lock().unwrap();
            let snapshot: Vec<Endpoint> = inner
                .providers
                .get(canonical)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default();
            let listeners: Vec<NotifyListener> = inner
                .subscribers
                .get(canonical)
                .map(|v| v.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default();
            (snapshot, listeners)
        };
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Drop every address of a key at once, simulating registry-side churn
    /// in tests.
    pub fn clear(&self, key: &ServiceKey) {
        let canonical = key.canonical();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.providers.remove(&canonical);
            inner.leases.retain(|_, (k, _)| k != &canonical);
        }
        self.notify(&canonical);
    }
}

impl Registry for MemoryRegistry {
    fn register(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<Lease, TripleError> {
        let canonical = key.canonical();
        let id = self.next_id();
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .providers
                .entry(canonical.clone())
                .or_default()
                .insert(endpoint.authority(), endpoint.clone());
            inner.leases.insert(id, (canonical.clone(), endpoint.authority()));
        }
        debug!("registered {} for {}", endpoint, canonical);
        self.notify(&canonical);
        Ok(Lease { id, key: key.clone(), endpoint: endpoint.clone() })
    }

    fn unregister(&self, lease: Lease) -> Result<(), TripleError> {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            match inner.leases.remove(&lease.id) {
                None => None,
                Some((canonical, authority)) => {
                    if let Some(providers) = inner.providers.get_mut(&canonical) {
                        providers.remove(&authority);
                        if providers.is_empty() {
                            inner.providers.remove(&canonical);
                        }
                    }
                    Some(canonical)
                }
            }
        };
        match removed {
            Some(canonical) => {
                self.notify(&canonical);
                Ok(())
            }
            None => Err(TripleError::Status(Status::new(Code::NotFound, "unknown lease"))),
        }
    }

    fn subscribe(
        &self, key: &ServiceKey, listener: NotifyListener,
    ) -> Result<Subscription, TripleError> {
        let canonical = key.canonical();
        let id = self.next_id();
        let snapshot: Vec<Endpoint> = {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.entry(canonical.clone()).or_default().push((id, listener.clone()));
            inner.providers.get(&canonical).map(|m| m.values().cloned().collect()).unwrap_or_default()
        };
        // initial snapshot before returning
        listener(&snapshot);
        Ok(Subscription { id, key: key.clone() })
    }

    fn unsubscribe(&self, subscription: Subscription) -> Result<(), TripleError> {
        let canonical = subscription.key.canonical();
        let mut inner = self.inner.lock().unwrap();
        if let Some(listeners) = inner.subscribers.get_mut(&canonical) {
            listeners.retain(|(id, _)| *id != subscription.id);
            if listeners.is_empty() {
                inner.subscribers.remove(&canonical);
            }
        }
        Ok(())
    }
}
