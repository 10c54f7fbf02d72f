//! Node registry: at most one connection per address, plus the balancer
//! that picks one for each call.
//!
//! Topology changes go through [`RegistryGuard`], which holds the registry
//! lock for its whole lifetime. A discovery cycle applies its diff through
//! a single guard, so callers picking a connection never see a registry
//! mid-update. Removed connections are handed back to the caller and
//! closed after the guard is dropped: the registry lock is never held
//! while a connection lock is taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use prost::Message;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ydb_core::{Context, Endpoint, Error, TransportError, sort_endpoints};

use crate::conn::{Conn, ConnConfig};
use crate::proto::OperationResponse;
use crate::repeater::Repeater;
use crate::stream::ConnStream;
use crate::transport::{Outbound, Transport};

pub struct Cluster<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Cluster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Handle that does not keep the cluster alive. Background tasks hold this.
pub struct WeakCluster<T: Transport> {
    shared: Weak<Shared<T>>,
}

impl<T: Transport> Clone for WeakCluster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> WeakCluster<T> {
    pub fn upgrade(&self) -> Option<Cluster<T>> {
        self.shared.upgrade().map(|shared| Cluster { shared })
    }
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    conn_config: Arc<ConnConfig>,
    registry: Mutex<Registry<T>>,
    explorer: Mutex<Option<Repeater>>,
    next_id: AtomicU64,
}

struct Registry<T: Transport> {
    entries: HashMap<String, Entry<T>>,
    closed: bool,
}

struct Entry<T: Transport> {
    conn: Arc<Conn<T>>,
    endpoint: Endpoint,
}

impl<T: Transport> Shared<T> {
    fn new_conn(&self, endpoint: Endpoint) -> Arc<Conn<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(Conn::new(
            id,
            endpoint,
            self.transport.clone(),
            self.conn_config.clone(),
        ))
    }
}

impl<T: Transport> Cluster<T> {
    pub fn new(transport: Arc<T>, conn_config: Arc<ConnConfig>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                conn_config,
                registry: Mutex::new(Registry {
                    entries: HashMap::new(),
                    closed: false,
                }),
                explorer: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakCluster<T> {
        WeakCluster {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// A connection sharing this cluster's transport and settings but not
    /// tracked by the registry. The caller owns and closes it.
    pub fn detached(&self, endpoint: Endpoint) -> Arc<Conn<T>> {
        self.shared.new_conn(endpoint)
    }

    /// Take the registry lock for a batch of changes.
    pub fn lock(&self) -> RegistryGuard<'_, T> {
        RegistryGuard {
            shared: &self.shared,
            registry: self.shared.registry.lock().expect("registry lock"),
        }
    }

    /// Insert under a lock of its own. Prefer [`Cluster::lock`] for more
    /// than one change.
    pub fn insert(&self, endpoint: Endpoint) -> Option<Arc<Conn<T>>> {
        self.lock().insert(endpoint)
    }

    pub fn update(&self, endpoint: Endpoint) -> bool {
        self.lock().update(endpoint)
    }

    /// Remove and close the connection for `address`.
    pub fn remove(&self, address: &str) -> bool {
        let removed = self.lock().remove(address);
        match removed {
            Some(conn) => {
                close_logged(&conn);
                true
            }
            None => false,
        }
    }

    pub fn get_conn(&self, address: &str) -> Option<Arc<Conn<T>>> {
        self.lock().get(address)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.lock().endpoints()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }

    // ── Explorer ───────────────────────────────────────────────

    /// Attach the topology refresher. The cluster stops it on close.
    pub fn set_explorer(&self, repeater: Repeater) {
        let previous = self
            .shared
            .explorer
            .lock()
            .expect("explorer lock")
            .replace(repeater);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    /// Ask the refresher for an out-of-cycle discovery.
    pub fn force_discovery(&self) {
        if let Some(explorer) = self.shared.explorer.lock().expect("explorer lock").as_ref() {
            explorer.force();
        }
    }

    // ── Balancer ───────────────────────────────────────────────

    /// Pick a connection: a random usable local-DC node, else any usable
    /// node, else a banned one.
    pub fn get(&self) -> Result<Arc<Conn<T>>, Error> {
        let snapshot: Vec<(Arc<Conn<T>>, bool)> = {
            let guard = self.lock();
            if guard.is_closed() {
                return Err(TransportError::unavailable("cluster is closed").into());
            }
            guard
                .registry
                .entries
                .values()
                .map(|e| (e.conn.clone(), e.endpoint.is_local_dc()))
                .collect()
        };

        let mut local = Vec::new();
        let mut usable = Vec::new();
        let mut banned = Vec::new();
        for (conn, local_dc) in snapshot {
            let state = conn.state();
            if state.is_usable() {
                if local_dc {
                    local.push(conn.clone());
                }
                usable.push(conn);
            } else if !state.is_terminal() {
                banned.push(conn);
            }
        }

        let mut rng = rand::thread_rng();
        [local, usable, banned]
            .iter()
            .find_map(|tier| tier.choose(&mut rng).cloned())
            .ok_or_else(|| TransportError::unavailable("no endpoints available").into())
    }

    /// Unary call on a balancer-picked node. A call that pessimizes its
    /// node also forces a discovery.
    pub async fn invoke<Req, Res>(
        &self,
        ctx: &Context,
        method: &str,
        request: Req,
    ) -> Result<Res, Error>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static + OperationResponse,
    {
        let conn = self.get()?;
        let result = conn.invoke(ctx, method, request).await;
        if let Err(e) = &result {
            if e.must_pessimize() {
                self.force_discovery();
            }
        }
        result
    }

    pub async fn new_stream<Req, Res>(
        &self,
        ctx: &Context,
        method: &str,
        outbound: Outbound<Req>,
    ) -> Result<ConnStream<Res>, Error>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        let conn = self.get()?;
        let result = conn.new_stream(ctx, method, outbound).await;
        if let Err(e) = &result {
            if e.must_pessimize() {
                self.force_discovery();
            }
        }
        result
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Park every connection whose idle deadline has passed. Returns how
    /// many channels were released.
    pub fn park_idle(&self, now: Instant) -> usize {
        let conns: Vec<Arc<Conn<T>>> = {
            let guard = self.lock();
            guard.registry.entries.values().map(|e| e.conn.clone()).collect()
        };
        let parked = conns
            .iter()
            .filter(|conn| conn.idle_deadline().is_some_and(|at| at <= now))
            .filter(|conn| conn.park())
            .count();
        if parked > 0 {
            debug!(parked, "parked idle connections");
        }
        parked
    }

    /// Stop the refresher and close every connection. Idempotent.
    pub async fn close(&self) {
        let explorer = self.shared.explorer.lock().expect("explorer lock").take();
        if let Some(explorer) = explorer {
            explorer.shutdown().await;
        }

        let conns: Vec<Arc<Conn<T>>> = {
            let mut guard = self.lock();
            if guard.registry.closed {
                return;
            }
            guard.registry.closed = true;
            guard.registry.entries.drain().map(|(_, e)| e.conn).collect()
        };
        for conn in &conns {
            close_logged(conn);
        }
        info!(connections = conns.len(), "cluster closed");
    }
}

fn close_logged<T: Transport>(conn: &Conn<T>) {
    if let Err(e) = conn.close() {
        warn!(address = %conn.endpoint().address(), error = %e, "failed to close connection");
    }
}

/// Exclusive access to the registry for a batch of topology changes.
pub struct RegistryGuard<'a, T: Transport> {
    shared: &'a Arc<Shared<T>>,
    registry: MutexGuard<'a, Registry<T>>,
}

impl<T: Transport> RegistryGuard<'_, T> {
    pub fn is_closed(&self) -> bool {
        self.registry.closed
    }

    /// Add a connection for `endpoint`. An existing entry for the same
    /// address is updated in place instead. Returns `None` once the cluster
    /// is closed.
    pub fn insert(&mut self, endpoint: Endpoint) -> Option<Arc<Conn<T>>> {
        if self.registry.closed {
            return None;
        }
        let address = endpoint.address().to_string();
        if let Some(entry) = self.registry.entries.get_mut(&address) {
            entry.endpoint = endpoint;
            return Some(entry.conn.clone());
        }

        let conn = self.shared.new_conn(endpoint.clone());
        let weak = Arc::downgrade(self.shared);
        let id = conn.id();
        conn.on_close(move |endpoint| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let mut registry = shared.registry.lock().expect("registry lock");
            let owned = registry
                .entries
                .get(endpoint.address())
                .is_some_and(|e| e.conn.id() == id);
            if owned {
                registry.entries.remove(endpoint.address());
            }
        });

        debug!(address = %address, id, "endpoint inserted");
        self.registry.entries.insert(
            address,
            Entry {
                conn: conn.clone(),
                endpoint,
            },
        );
        Some(conn)
    }

    /// Refresh the stored metadata (load factor, services, location).
    pub fn update(&mut self, endpoint: Endpoint) -> bool {
        match self.registry.entries.get_mut(endpoint.address()) {
            Some(entry) => {
                entry.endpoint = endpoint;
                true
            }
            None => false,
        }
    }

    /// Unlink the connection for `address` and hand it back. The caller
    /// closes it after dropping the guard.
    #[must_use = "the removed connection must be closed"]
    pub fn remove(&mut self, address: &str) -> Option<Arc<Conn<T>>> {
        let entry = self.registry.entries.remove(address)?;
        debug!(address, "endpoint removed");
        Some(entry.conn)
    }

    pub fn get(&self, address: &str) -> Option<Arc<Conn<T>>> {
        self.registry.entries.get(address).map(|e| e.conn.clone())
    }

    pub fn len(&self) -> usize {
        self.registry.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.entries.is_empty()
    }

    /// Current endpoints, sorted by address.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .registry
            .entries
            .values()
            .map(|e| e.endpoint.clone())
            .collect();
        sort_endpoints(&mut endpoints);
        endpoints
    }
}
