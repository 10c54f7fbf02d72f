//! Discovery client and the topology refresher built on it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use ydb_core::{Context, Endpoint, Error, Observer, Observers, sort_endpoints};

use crate::conn::Conn;
use crate::diff::{Change, diff_endpoints};
use crate::proto::{
    self, EndpointInfo, ListEndpointsRequest, ListEndpointsResponse, ListEndpointsResult,
    WhoAmIRequest, WhoAmIResponse, WhoAmIResult,
};
use crate::registry::{Cluster, WeakCluster};
use crate::repeater::Repeater;
use crate::retry::{RetryConfig, retry};
use crate::transport::Transport;

/// One discovery answer: the nodes plus the caller's own location.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiscoverySnapshot {
    pub endpoints: Vec<Endpoint>,
    pub self_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAmI {
    pub user: String,
    pub groups: Vec<String>,
}

pub struct DiscoveryClient<T: Transport> {
    conn: Arc<Conn<T>>,
    database: String,
    secure: bool,
    observers: Observers,
}

impl<T: Transport> DiscoveryClient<T> {
    pub fn new(
        conn: Arc<Conn<T>>,
        database: impl Into<String>,
        secure: bool,
        observers: Observers,
    ) -> Self {
        Self {
            conn,
            database: database.into(),
            secure,
            observers,
        }
    }

    /// Connection to the control-plane endpoint.
    pub fn conn(&self) -> &Arc<Conn<T>> {
        &self.conn
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// List the cluster's nodes.
    ///
    /// Only nodes whose TLS flag matches ours are kept; a node is local-DC
    /// when its location equals the reported self location. Zero nodes is
    /// a valid, empty answer.
    pub async fn snapshot(&self, ctx: &Context) -> Result<DiscoverySnapshot, Error> {
        let result = self.list_endpoints(ctx).await;
        let (self_location, endpoints, err) = match &result {
            Ok(s) => (s.self_location.as_str(), s.endpoints.as_slice(), None),
            Err(e) => ("", &[][..], Some(e)),
        };
        self.observers.on_discover(
            self.conn.endpoint().address(),
            &self.database,
            self_location,
            endpoints,
            err,
        );
        result
    }

    async fn list_endpoints(&self, ctx: &Context) -> Result<DiscoverySnapshot, Error> {
        let request = ListEndpointsRequest {
            database: self.database.clone(),
            service: Vec::new(),
        };
        let response: ListEndpointsResponse = self
            .conn
            .invoke(ctx, proto::LIST_ENDPOINTS, request)
            .await?;
        let result: ListEndpointsResult = match &response.operation {
            Some(op) => op.decode_result("list endpoints result")?,
            None => ListEndpointsResult::default(),
        };

        let self_location = result.self_location;
        let endpoints = result
            .endpoints
            .iter()
            .filter(|info| info.ssl == self.secure)
            .map(|info| to_endpoint(info, &self_location))
            .collect();
        Ok(DiscoverySnapshot {
            endpoints,
            self_location,
        })
    }

    pub async fn discover(&self, ctx: &Context) -> Result<Vec<Endpoint>, Error> {
        Ok(self.snapshot(ctx).await?.endpoints)
    }

    /// Identity the server sees for this client.
    pub async fn who_am_i(&self, ctx: &Context) -> Result<WhoAmI, Error> {
        let response: WhoAmIResponse = self
            .conn
            .invoke(ctx, proto::WHO_AM_I, WhoAmIRequest::default())
            .await?;
        let result: WhoAmIResult = match &response.operation {
            Some(op) => op.decode_result("who am i result")?,
            None => WhoAmIResult::default(),
        };
        Ok(WhoAmI {
            user: result.user,
            groups: result.groups,
        })
    }
}

fn to_endpoint(info: &EndpointInfo, self_location: &str) -> Endpoint {
    Endpoint::new(join_host_port(&info.address, info.port))
        .with_node_id(info.node_id)
        .with_location(info.location.clone())
        .with_load_factor(info.load_factor)
        .with_local_dc(info.location == self_location)
        .with_services(info.service.iter().cloned())
}

fn join_host_port(host: &str, port: u32) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

// ── Topology refresher ─────────────────────────────────────────

/// Populate `cluster` and keep it current.
///
/// A zero `interval` disables discovery: only the client's own endpoint is
/// registered. Otherwise the first discovery runs through the retry
/// executor, its nodes are inserted as one batch, and a `"discovery"`
/// repeater is attached to the cluster to refresh every `interval`.
pub async fn start<T: Transport>(
    ctx: &Context,
    client: Arc<DiscoveryClient<T>>,
    cluster: &Cluster<T>,
    interval: Duration,
    retry_config: &RetryConfig,
    observers: Observers,
) -> Result<(), Error> {
    if interval.is_zero() {
        cluster.insert(client.conn().endpoint().clone());
        info!(address = %client.conn().endpoint().address(), "discovery disabled, using single endpoint");
        return Ok(());
    }

    let mut endpoints = retry(ctx, retry_config, true, |ctx| {
        let client = client.clone();
        async move { client.discover(&ctx).await }
    })
    .await?;
    if endpoints.is_empty() {
        warn!(address = %client.conn().endpoint().address(), "discovery returned no endpoints, using the bootstrap endpoint");
        endpoints.push(client.conn().endpoint().clone());
    }
    sort_endpoints(&mut endpoints);

    {
        let mut guard = cluster.lock();
        for endpoint in &endpoints {
            guard.insert(endpoint.clone());
        }
    }
    info!(endpoints = endpoints.len(), "initial discovery done");

    let weak = cluster.downgrade();
    let repeater = Repeater::spawn("discovery", interval, observers, move |ctx| {
        let client = client.clone();
        let weak = weak.clone();
        async move { refresh(&ctx, &client, &weak).await }
    });
    cluster.set_explorer(repeater);
    Ok(())
}

/// One refresh cycle: discover, diff against the registry, apply.
async fn refresh<T: Transport>(
    ctx: &Context,
    client: &DiscoveryClient<T>,
    cluster: &WeakCluster<T>,
) -> Result<(), Error> {
    let mut next = client.discover(ctx).await?;
    if next.is_empty() {
        debug!("discovery returned no endpoints, keeping current topology");
        return Ok(());
    }
    sort_endpoints(&mut next);

    let Some(cluster) = cluster.upgrade() else {
        return Ok(());
    };

    let (added, updated, removed) = {
        let mut guard = cluster.lock();
        if guard.is_closed() {
            return Ok(());
        }
        let curr = guard.endpoints();
        let (mut added, mut updated, mut removed) = (0, 0, Vec::new());
        for change in diff_endpoints(&curr, &next) {
            match change {
                Change::Equal { next, .. } => {
                    guard.update(next.clone());
                    updated += 1;
                }
                Change::Added { next } => {
                    guard.insert(next.clone());
                    added += 1;
                }
                Change::Removed { curr } => {
                    if let Some(conn) = guard.remove(curr.address()) {
                        removed.push(conn);
                    }
                }
            }
        }
        (added, updated, removed)
    };

    for conn in &removed {
        if let Err(e) = conn.close() {
            warn!(address = %conn.endpoint().address(), error = %e, "failed to close removed connection");
        }
    }
    if added > 0 || !removed.is_empty() {
        info!(added, removed = removed.len(), updated, "topology changed");
    } else {
        debug!(updated, "topology unchanged");
    }
    Ok(())
}
