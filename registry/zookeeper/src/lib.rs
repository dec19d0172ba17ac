//! Zookeeper backend for the triple-rpc registry abstraction.
//!
//! Provider addresses live under `/dubbo/<interface>/providers` as ephemeral
//! znodes named by the percent-encoded provider URL. Consumers watch the
//! children of that path; every watch fire triggers a refetch and a full
//! snapshot delivery. When the session is re-established the backend
//! re-creates every local lease and re-arms every watch, then pushes fresh
//! snapshots.
//!
//! Watches fire on the client's event thread; the actual refetch runs on a
//! dedicated refresh thread so the event thread is never blocked on RPCs.

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use triple_rpc::registry::{Lease, NotifyListener, Registry, Subscription};
use triple_rpc_core::{Endpoint, RpcUrl, ServiceKey, TripleError};
use zookeeper::{Acl, CreateMode, WatchedEvent, ZkError, ZkState, ZooKeeper};

pub const DEFAULT_ROOT: &str = "/dubbo";
const SESSION_TIMEOUT: Duration = Duration::from_secs(15);

struct LeaseEntry {
    key: ServiceKey,
    endpoint: Endpoint,
    path: String,
}

struct SubEntry {
    interface: String,
    listener: NotifyListener,
}

struct ZkInner {
    zk: ZooKeeper,
    root: String,
    next_id: AtomicU64,
    leases: Mutex<HashMap<u64, LeaseEntry>>,
    /// subscription id -> entry; several keys may share one interface watch
    subscribers: Mutex<HashMap<u64, SubEntry>>,
    /// interfaces with an armed children watch
    watched: Mutex<HashMap<String, bool>>,
    refresh_tx: Sender<String>,
}

/// Registry backed by a Zookeeper ensemble.
///
/// `hosts` may name several peers (`h1:2181,h2:2181,h3:2181`); the string is
/// forwarded verbatim to the client.
pub struct ZookeeperRegistry {
    inner: Arc<ZkInner>,
}

impl ZookeeperRegistry {
    pub fn connect(hosts: &str) -> Result<Self, TripleError> {
        Self::connect_with_root(hosts, DEFAULT_ROOT)
    }

    /// Build from a `zookeeper://host-list/?..` reference.
    pub fn from_url(url: &str) -> Result<Self, TripleError> {
        let parsed = RpcUrl::parse(url)?;
        if parsed.scheme != "zookeeper" {
            return Err(TripleError::InvalidUrl(format!(
                "expected a zookeeper:// reference, got {:?}",
                parsed.scheme
            )));
        }
        Self::connect(&parsed.host_list)
    }

    pub fn connect_with_root(hosts: &str, root: &str) -> Result<Self, TripleError> {
        let zk = ZooKeeper::connect(hosts, SESSION_TIMEOUT, |event: WatchedEvent| {
            trace!("zookeeper session event: {:?}", event);
        })
        .map_err(|e| TripleError::Transport(format!("zookeeper connect {}: {:?}", hosts, e)))?;

        let (refresh_tx, refresh_rx) = channel::<String>();
        let inner = Arc::new(ZkInner {
            zk,
            root: root.trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(0),
            leases: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashMap::new()),
            refresh_tx,
        });

        // refresh worker: refetch + notify away from the client event thread
        let weak: Weak<ZkInner> = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("triple-zk-refresh".to_string())
            .spawn(move || {
                while let Ok(interface) = refresh_rx.recv() {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.refresh(&interface);
                }
                trace!("zookeeper refresh worker exit");
            })
            .map_err(|e| TripleError::Transport(format!("spawn refresh worker: {}", e)))?;

        // session recovery: on every (re)connect, restore ephemerals and
        // re-arm watches
        let weak = Arc::downgrade(&inner);
        inner.zk.add_listener(move |state: ZkState| {
            debug!("zookeeper state: {:?}", state);
            if matches!(state, ZkState::Connected) {
                if let Some(inner) = weak.upgrade() {
                    inner.recover();
                }
            }
        });

        Ok(Self { inner })
    }
}

impl Registry for ZookeeperRegistry {
    fn register(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<Lease, TripleError> {
        let inner = &self.inner;
        let path = inner.provider_path(&key.interface, endpoint);
        inner.ensure_providers_dir(&key.interface)?;
        inner.create_ephemeral(&path)?;
        info!("registered {} at {}", endpoint, path);

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        inner.leases.lock().unwrap().insert(
            id,
            LeaseEntry { key: key.clone(), endpoint: endpoint.clone(), path },
        );
        Ok(Lease { id, key: key.clone(), endpoint: endpoint.clone() })
    }

    fn unregister(&self, lease: Lease) -> Result<(), TripleError> {
        let entry = self.inner.leases.lock().unwrap().remove(&lease.id);
        let Some(entry) = entry else {
            return Err(TripleError::IllegalState("unknown lease"));
        };
        match self.inner.zk.delete(&entry.path, None) {
            Ok(()) | Err(ZkError::NoNode) => Ok(()),
            Err(e) => Err(zk_error("delete", e)),
        }
    }

    fn subscribe(
        &self, key: &ServiceKey, listener: NotifyListener,
    ) -> Result<Subscription, TripleError> {
        let inner = &self.inner;
        inner.ensure_providers_dir(&key.interface)?;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        inner.subscribers.lock().unwrap().insert(
            id,
            SubEntry { interface: key.interface.clone(), listener: listener.clone() },
        );
        // initial snapshot, arming the watch as a side effect
        let endpoints = inner.fetch_with_watch(&key.interface)?;
        listener(&endpoints);
        Ok(Subscription { id, key: key.clone() })
    }

    fn unsubscribe(&self, subscription: Subscription) -> Result<(), TripleError> {
        self.inner.subscribers.lock().unwrap().remove(&subscription.id);
        // the znode watch cannot be cancelled; it is dropped on next fire
        // when no subscriber of the interface is left
        Ok(())
    }
}

impl ZkInner {
    fn providers_dir(&self, interface: &str) -> String {
        format!("{}/{}/providers", self.root, interface)
    }

    fn provider_path(&self, interface: &str, endpoint: &Endpoint) -> String {
        let encoded = utf8_percent_encode(&endpoint.to_url(), NON_ALPHANUMERIC).to_string();
        format!("{}/{}", self.providers_dir(interface), encoded)
    }

    fn ensure_providers_dir(&self, interface: &str) -> Result<(), TripleError> {
        let mut path = String::new();
        let dir = self.providers_dir(interface);
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(segment);
            match self.zk.create(
                &path,
                Vec::new(),
                Acl::open_unsafe().clone(),
                CreateMode::Persistent,
            ) {
                Ok(_) | Err(ZkError::NodeExists) => {}
                Err(e) => return Err(zk_error("create", e)),
            }
        }
        Ok(())
    }

    fn create_ephemeral(&self, path: &str) -> Result<(), TripleError> {
        match self.zk.create(path, Vec::new(), Acl::open_unsafe().clone(), CreateMode::Ephemeral) {
            // NodeExists happens on session recovery with the old node not
            // yet expired; the content is the node name itself
            Ok(_) | Err(ZkError::NodeExists) => Ok(()),
            Err(e) => Err(zk_error("create", e)),
        }
    }

    /// getChildren with a fresh watch; decode child names into endpoints.
    fn fetch_with_watch(&self, interface: &str) -> Result<Vec<Endpoint>, TripleError> {
        let dir = self.providers_dir(interface);
        let tx = self.refresh_tx.clone();
        let watched_interface = interface.to_string();
        let children = self
            .zk
            .get_children_w(&dir, move |event: WatchedEvent| {
                trace!("providers watch fired: {:?}", event);
                let _ = tx.send(watched_interface.clone());
            })
            .map_err(|e| zk_error("get_children", e))?;
        self.watched.lock().unwrap().insert(interface.to_string(), true);

        let mut endpoints = Vec::with_capacity(children.len());
        for child in children {
            let decoded = percent_decode_str(&child).decode_utf8_lossy().into_owned();
            match Endpoint::from_url(&decoded) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => warn!("skipping malformed provider node {:?}: {}", child, e),
            }
        }
        Ok(endpoints)
    }

    fn interface_listeners(&self, interface: &str) -> Vec<NotifyListener> {
        self.subscribers
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.interface == interface)
            .map(|entry| entry.listener.clone())
            .collect()
    }

    /// Watch fired: refetch, re-arm, deliver snapshots.
    fn refresh(&self, interface: &str) {
        let listeners = self.interface_listeners(interface);
        if listeners.is_empty() {
            // last subscriber left; let the watch lapse
            self.watched.lock().unwrap().remove(interface);
            return;
        }
        match self.fetch_with_watch(interface) {
            Ok(endpoints) => {
                debug!("{}: {} providers", interface, endpoints.len());
                for listener in listeners {
                    listener(&endpoints);
                }
            }
            Err(e) => warn!("refresh of {} failed: {}", interface, e),
        }
    }

    /// Session re-established: re-create every local lease, re-arm every
    /// watch, push snapshots.
    fn recover(&self) {
        let leases: Vec<(String, String)> = self
            .leases
            .lock()
            .unwrap()
            .values()
            .map(|entry| (entry.key.interface.clone(), entry.path.clone()))
            .collect();
        for (interface, path) in leases {
            if let Err(e) = self
                .ensure_providers_dir(&interface)
                .and_then(|_| self.create_ephemeral(&path))
            {
                warn!("re-registering {} failed: {}", path, e);
            }
        }
        let interfaces: Vec<String> =
            self.watched.lock().unwrap().keys().cloned().collect();
        for interface in interfaces {
            let _ = self.refresh_tx.send(interface);
        }
    }
}

fn zk_error(op: &str, e: ZkError) -> TripleError {
    TripleError::Transport(format!("zookeeper {}: {:?}", op, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_path_encoding() {
        let endpoint = Endpoint::new("10.0.0.3", 20880)
            .with_meta("group", "g1")
            .with_meta("version", "1.0")
            .with_meta("cpu", "17");
        let url = endpoint.to_url();
        let encoded = utf8_percent_encode(&url, NON_ALPHANUMERIC).to_string();
        assert!(encoded.starts_with("tri%3A%2F%2F10%2E0%2E0%2E3%3A20880"));
        // decode round trip
        let decoded = percent_decode_str(&encoded).decode_utf8_lossy().into_owned();
        assert_eq!(decoded, url);
        assert_eq!(Endpoint::from_url(&decoded).unwrap(), endpoint);
    }

    #[test]
    fn test_from_url_rejects_other_schemes() {
        assert!(ZookeeperRegistry::from_url("tri://127.0.0.1:2181").is_err());
    }
}
