//! The pluggable registry abstraction.
//!
//! A registry maps a [ServiceKey] to the live set of provider endpoints.
//! Providers hold a [Lease] per registration; consumers subscribe and are
//! notified with the *full* current address set on every change (snapshots,
//! not deltas). Implementations share the underlying watch resources per
//! key, so subscriptions are refcounted.

mod memory;
pub use memory::MemoryRegistry;

use std::sync::Arc;

use triple_rpc_core::{Endpoint, ServiceKey, TripleError};

/// Invoked with the full current address set on every change.
pub type NotifyListener = Arc<dyn Fn(&[Endpoint]) + Send + Sync>;

/// Handle for one registered provider address. Opaque to users; registry
/// implementations fill the fields.
pub struct Lease {
    pub id: u64,
    pub key: ServiceKey,
    pub endpoint: Endpoint,
}

/// Handle for one active subscription.
pub struct Subscription {
    pub id: u64,
    pub key: ServiceKey,
}

pub trait Registry: Send + Sync + 'static {
    /// Publish an endpoint under a service key. The address stays visible
    /// until the lease is dropped via [Registry::unregister] or the backing
    /// session dies.
    fn register(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<Lease, TripleError>;

    fn unregister(&self, lease: Lease) -> Result<(), TripleError>;

    /// Subscribe to the address set of a service key. The listener is called
    /// with the current snapshot before this returns, then on every change.
    fn subscribe(
        &self, key: &ServiceKey, listener: NotifyListener,
    ) -> Result<Subscription, TripleError>;

    fn unsubscribe(&self, subscription: Subscription) -> Result<(), TripleError>;
}
