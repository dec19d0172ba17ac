//! The client-side endpoint directory and its selection policies.
//!
//! The directory subscribes to a registry for one service key and publishes
//! immutable snapshots of the filtered address list through an [ArcSwap];
//! selection reads a snapshot without locking the updater. The total weight
//! for CPU-weighted selection is recomputed once per snapshot.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use triple_rpc_core::{Endpoint, LoadBalance, ServiceKey, TripleError};

use crate::registry::{NotifyListener, Registry, Subscription};

/// One process-wide PRNG for every directory, seeded once from the
/// monotonic clock: a reading against a process-local anchor, spread into a
/// u64 through the per-process hasher.
fn process_rng() -> &'static Mutex<SmallRng> {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    static RNG: OnceLock<Mutex<SmallRng>> = OnceLock::new();
    RNG.get_or_init(|| {
        let anchor = *ANCHOR.get_or_init(Instant::now);
        let mut hasher = RandomState::new().build_hasher();
        anchor.elapsed().hash(&mut hasher);
        Mutex::new(SmallRng::seed_from_u64(hasher.finish()))
    })
}

struct Snapshot {
    generation: u64,
    endpoints: Vec<Endpoint>,
    total_weight: u64,
}

impl Snapshot {
    fn empty() -> Self {
        Self { generation: 0, endpoints: Vec::new(), total_weight: 0 }
    }

    fn build(generation: u64, endpoints: Vec<Endpoint>) -> Self {
        let total_weight = endpoints.iter().map(|e| e.weight()).sum();
        Self { generation, endpoints, total_weight }
    }
}

/// The last list that was non-empty, kept for stale serving, and the moment
/// the registry went empty.
struct StaleList {
    endpoints: Vec<Endpoint>,
    total_weight: u64,
    emptied_at: Option<Instant>,
}

struct DirectoryInner {
    key: ServiceKey,
    policy: LoadBalance,
    stale_grace: Duration,
    snapshot: ArcSwap<Snapshot>,
    stale: Mutex<StaleList>,
}

/// A living, ordered view of the providers of one service key.
pub struct Directory {
    inner: Arc<DirectoryInner>,
    registry: Arc<dyn Registry>,
    subscription: Mutex<Option<Subscription>>,
}

impl Directory {
    pub fn new(
        registry: Arc<dyn Registry>, key: ServiceKey, policy: LoadBalance, stale_grace: Duration,
    ) -> Result<Self, TripleError> {
        let inner = Arc::new(DirectoryInner {
            key: key.clone(),
            policy,
            stale_grace,
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
            stale: Mutex::new(StaleList {
                endpoints: Vec::new(),
                total_weight: 0,
                emptied_at: None,
            }),
        });
        let weak: Weak<DirectoryInner> = Arc::downgrade(&inner);
        let listener: NotifyListener = Arc::new(move |endpoints: &[Endpoint]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_snapshot(endpoints);
            }
        });
        let subscription = registry.subscribe(&key, listener)?;
        Ok(Self { inner, registry, subscription: Mutex::new(Some(subscription)) })
    }

    /// Pick an endpoint for a new call.
    ///
    /// An empty current list falls back to the last non-empty list while the
    /// grace window is open; past it the error surfaces as `Unavailable`.
    pub fn select(&self) -> Result<Endpoint, TripleError> {
        let snapshot = self.inner.snapshot.load_full();
        if !snapshot.endpoints.is_empty() {
            return Ok(self.pick(&snapshot.endpoints, snapshot.total_weight));
        }
        {
            let stale = self.inner.stale.lock().unwrap();
            if !stale.endpoints.is_empty() && !self.inner.stale_grace.is_zero() {
                if let Some(emptied_at) = stale.emptied_at {
                    if emptied_at.elapsed() <= self.inner.stale_grace {
                        debug!("{} serving stale address list", self.inner.key);
                        return Ok(self.pick(&stale.endpoints, stale.total_weight));
                    }
                }
            }
        }
        Err(TripleError::NoAvailableProvider(self.inner.key.canonical()))
    }

    fn pick(&self, endpoints: &[Endpoint], total_weight: u64) -> Endpoint {
        if endpoints.len() == 1 {
            return endpoints[0].clone();
        }
        let mut rng = process_rng().lock().unwrap();
        match self.inner.policy {
            LoadBalance::Random => endpoints[rng.gen_range(0..endpoints.len())].clone(),
            LoadBalance::Cpu => {
                let mut ticket = rng.gen_range(0..total_weight.max(1));
                for endpoint in endpoints {
                    let weight = endpoint.weight();
                    if ticket < weight {
                        return endpoint.clone();
                    }
                    ticket -= weight;
                }
                // ticket exhausted by rounding, fall back to the tail
                endpoints[endpoints.len() - 1].clone()
            }
        }
    }

    /// Endpoints visible to selection right now (current or stale list).
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let snapshot = self.inner.snapshot.load_full();
        if !snapshot.endpoints.is_empty() {
            return snapshot.endpoints.clone();
        }
        let stale = self.inner.stale.lock().unwrap();
        match stale.emptied_at {
            Some(at) if at.elapsed() <= self.inner.stale_grace => stale.endpoints.clone(),
            _ => Vec::new(),
        }
    }

    #[inline]
    pub fn key(&self) -> &ServiceKey {
        &self.inner.key
    }
}

impl Drop for Directory {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.lock().unwrap().take() {
            let _ = self.registry.unsubscribe(subscription);
        }
    }
}

impl DirectoryInner {
    fn on_snapshot(&self, endpoints: &[Endpoint]) {
        let mut filtered: Vec<Endpoint> =
            endpoints.iter().filter(|e| self.key.matches(e)).cloned().collect();
        // stable order keeps ties deterministic within a generation
        filtered.sort_by(|a, b| a.authority().cmp(&b.authority()));

        let generation = self.snapshot.load().generation + 1;
        let next = Snapshot::build(generation, filtered);
        debug!(
            "{} snapshot generation {}: {} endpoints",
            self.key,
            generation,
            next.endpoints.len()
        );
        {
            let mut stale = self.stale.lock().unwrap();
            if next.endpoints.is_empty() {
                if stale.emptied_at.is_none() {
                    stale.emptied_at = Some(Instant::now());
                }
            } else {
                stale.endpoints = next.endpoints.clone();
                stale.total_weight = next.total_weight;
                stale.emptied_at = None;
            }
        }
        self.snapshot.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use std::collections::HashSet;

    fn key() -> ServiceKey {
        ServiceKey::new("com.example.Echo")
    }

    fn endpoint(host: &str, cpu: Option<u8>) -> Endpoint {
        let e = Endpoint::new(host, 20880);
        match cpu {
            Some(c) => e.with_meta("cpu", c.to_string()),
            None => e,
        }
    }

    #[test]
    fn test_selection_follows_churn() {
        let registry = Arc::new(MemoryRegistry::new());
        let lease_a = registry.register(&key(), &endpoint("10.0.0.1", None)).unwrap();
        let _lease_b = registry.register(&key(), &endpoint("10.0.0.2", None)).unwrap();

        let directory = Directory::new(
            registry.clone(),
            key(),
            LoadBalance::Random,
            Duration::from_secs(30),
        )
        .unwrap();

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(directory.select().unwrap().host);
        }
        assert_eq!(seen.len(), 2);

        // B only after A disappears
        registry.unregister(lease_a).unwrap();
        for _ in 0..50 {
            assert_eq!(directory.select().unwrap().host, "10.0.0.2");
        }
    }

    #[test]
    fn test_group_filter() {
        let registry = Arc::new(MemoryRegistry::new());
        let blue = key().with_group("blue");
        registry
            .register(&blue, &endpoint("10.0.0.1", None).with_meta("group", "blue"))
            .unwrap();
        // same subscription key but wrong group metadata, filtered before
        // selection
        registry
            .register(&blue, &endpoint("10.0.0.2", None).with_meta("group", "green"))
            .unwrap();
        let directory = Directory::new(
            registry.clone(),
            blue,
            LoadBalance::Random,
            Duration::from_secs(30),
        )
        .unwrap();
        for _ in 0..50 {
            assert_eq!(directory.select().unwrap().host, "10.0.0.1");
        }
    }

    #[test]
    fn test_stale_serving_and_grace_expiry() {
        let registry = Arc::new(MemoryRegistry::new());
        let lease = registry.register(&key(), &endpoint("10.0.0.1", None)).unwrap();
        let directory = Directory::new(
            registry.clone(),
            key(),
            LoadBalance::Random,
            Duration::from_millis(50),
        )
        .unwrap();
        assert_eq!(directory.select().unwrap().host, "10.0.0.1");

        registry.unregister(lease).unwrap();
        // inside the grace window the last non-empty list keeps serving
        assert_eq!(directory.select().unwrap().host, "10.0.0.1");

        std::thread::sleep(Duration::from_millis(80));
        assert!(matches!(directory.select(), Err(TripleError::NoAvailableProvider(_))));
    }

    #[test]
    fn test_grace_zero_disables_stale_serving() {
        let registry = Arc::new(MemoryRegistry::new());
        let lease = registry.register(&key(), &endpoint("10.0.0.1", None)).unwrap();
        let directory =
            Directory::new(registry.clone(), key(), LoadBalance::Random, Duration::ZERO).unwrap();
        registry.unregister(lease).unwrap();
        assert!(directory.select().is_err());
    }

    #[test]
    fn test_recovery_resets_grace() {
        let registry = Arc::new(MemoryRegistry::new());
        let lease = registry.register(&key(), &endpoint("10.0.0.1", None)).unwrap();
        let directory = Directory::new(
            registry.clone(),
            key(),
            LoadBalance::Random,
            Duration::from_millis(40),
        )
        .unwrap();
        registry.unregister(lease).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(directory.select().is_err());

        // a provider coming back makes the list live again
        registry.register(&key(), &endpoint("10.0.0.9", None)).unwrap();
        assert_eq!(directory.select().unwrap().host, "10.0.0.9");
    }

    #[test]
    fn test_cpu_weighted_prefers_idle() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register(&key(), &endpoint("busy", Some(99))).unwrap();
        registry.register(&key(), &endpoint("idle", Some(1))).unwrap();
        let directory = Directory::new(
            registry.clone(),
            key(),
            LoadBalance::Cpu,
            Duration::from_secs(30),
        )
        .unwrap();
        let mut idle = 0;
        for _ in 0..500 {
            if directory.select().unwrap().host == "idle" {
                idle += 1;
            }
        }
        // weights 99 vs 1, expect a landslide
        assert!(idle > 400, "idle selected only {} of 500", idle);
    }

    #[test]
    fn test_never_selects_removed_endpoint() {
        let registry = Arc::new(MemoryRegistry::new());
        let lease_a = registry.register(&key(), &endpoint("10.0.0.1", None)).unwrap();
        registry.register(&key(), &endpoint("10.0.0.2", None)).unwrap();
        let directory = Directory::new(
            registry.clone(),
            key(),
            LoadBalance::Random,
            Duration::from_secs(30),
        )
        .unwrap();
        registry.unregister(lease_a).unwrap();
        for _ in 0..100 {
            assert_ne!(directory.select().unwrap().host, "10.0.0.1");
        }
    }
}
