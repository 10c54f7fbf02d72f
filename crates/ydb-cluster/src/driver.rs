//! Driver: the owner object tying configuration, transport, registry,
//! discovery and retries together.
//!
//! A driver may derive children with overridden options ([`Driver::with`]).
//! Each driver numbers its children with its own counter and keeps them in
//! a registry; closing a driver closes its children first, and a closed
//! child unregisters itself from its parent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use prost::Message;
use tokio::time::Instant;
use tracing::{info, warn};

use ydb_core::{Config, ConfigOption, Context, Endpoint, Error};

use crate::conn::{Conn, ConnConfig};
use crate::discovery::{self, DiscoveryClient, WhoAmI};
use crate::proto::OperationResponse;
use crate::registry::Cluster;
use crate::repeater::Repeater;
use crate::retry::{RetryConfig, retry};
use crate::stream::ConnStream;
use crate::transport::{GrpcTransport, Outbound, Transport};

pub struct Driver<T: Transport = GrpcTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Driver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    id: u64,
    config: Config,
    transport: Arc<T>,
    cluster: Cluster<T>,
    bootstrap: Arc<Conn<T>>,
    discovery: Arc<DiscoveryClient<T>>,
    retry: RetryConfig,
    reaper: Mutex<Option<Repeater>>,
    parent: Option<Weak<Inner<T>>>,
    children: Mutex<HashMap<u64, Driver<T>>>,
    next_child_id: AtomicU64,
    closed: AtomicBool,
}

impl Driver<GrpcTransport> {
    /// Open over gRPC, with TLS when the config asks for it.
    pub async fn connect(ctx: &Context, config: Config) -> Result<Self, Error> {
        let transport = if config.secure() {
            GrpcTransport::secure()
        } else {
            GrpcTransport::new()
        };
        Self::open(ctx, config, transport).await
    }
}

impl<T: Transport> Driver<T> {
    /// Validate `config`, run the initial discovery and start the
    /// background refresher and idle reaper.
    pub async fn open(ctx: &Context, config: Config, transport: T) -> Result<Self, Error> {
        Self::open_with(ctx, config, Arc::new(transport), None, 0).await
    }

    async fn open_with(
        ctx: &Context,
        config: Config,
        transport: Arc<T>,
        parent: Option<Weak<Inner<T>>>,
        id: u64,
    ) -> Result<Self, Error> {
        config.validate()?;

        let conn_config = Arc::new(ConnConfig::from_config(&config));
        let cluster = Cluster::new(transport.clone(), conn_config);
        let bootstrap = cluster.detached(Endpoint::new(config.endpoint()));
        let discovery = Arc::new(DiscoveryClient::new(
            bootstrap.clone(),
            config.database(),
            config.secure(),
            config.observers().clone(),
        ));
        let retry = RetryConfig::default().with_max_retries(config.max_retries());

        if let Err(e) = discovery::start(
            ctx,
            discovery.clone(),
            &cluster,
            config.discovery_interval(),
            &retry,
            config.observers().clone(),
        )
        .await
        {
            warn!(endpoint = %config.endpoint(), database = %config.database(), error = %e, "driver open failed");
            cluster.close().await;
            let _ = bootstrap.close();
            return Err(e);
        }

        let reaper = spawn_reaper(&cluster, &config);

        info!(
            id,
            endpoint = %config.endpoint(),
            database = %config.database(),
            secure = config.secure(),
            nodes = cluster.len(),
            "driver opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                transport,
                cluster,
                bootstrap,
                discovery,
                retry,
                reaper: Mutex::new(reaper),
                parent,
                children: Mutex::new(HashMap::new()),
                next_child_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Zero for a root driver, the parent-assigned id for a child.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cluster(&self) -> &Cluster<T> {
        &self.inner.cluster
    }

    pub fn discovery(&self) -> &DiscoveryClient<T> {
        &self.inner.discovery
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Ids of the live children, sorted.
    pub fn child_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .inner
            .children
            .lock()
            .expect("children lock")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Derive a child driver: this driver's configuration with `options`
    /// applied on top, sharing the transport.
    pub async fn with(
        &self,
        ctx: &Context,
        options: impl IntoIterator<Item = ConfigOption>,
    ) -> Result<Driver<T>, Error> {
        if self.is_closed() {
            return Err(Error::Config("driver is closed".into()));
        }
        let id = self.inner.next_child_id.fetch_add(1, Ordering::Relaxed) + 1;
        let config = self.inner.config.clone().with_options(options);
        let child = Self::open_with(
            ctx,
            config,
            self.inner.transport.clone(),
            Some(Arc::downgrade(&self.inner)),
            id,
        )
        .await?;

        // `close` flips the flag before draining, so checking it under the
        // children lock means the child is either drained or refused here.
        let registered = {
            let mut children = self.inner.children.lock().expect("children lock");
            if self.is_closed() {
                false
            } else {
                children.insert(id, child.clone());
                true
            }
        };
        if !registered {
            if let Err(e) = child.close().await {
                warn!(id, error = %e, "failed to close orphaned child driver");
            }
            return Err(Error::Config("driver is closed".into()));
        }
        Ok(child)
    }

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
        self.inner.cluster.invoke(ctx, method, request).await
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
        self.inner.cluster.new_stream(ctx, method, outbound).await
    }

    /// Run `op` under this driver's retry policy.
    pub async fn retry<R, F, Fut>(&self, ctx: &Context, idempotent: bool, op: F) -> Result<R, Error>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<R, Error>>,
    {
        retry(ctx, &self.inner.retry, idempotent, op).await
    }

    pub async fn who_am_i(&self, ctx: &Context) -> Result<WhoAmI, Error> {
        self.inner.discovery.who_am_i(ctx).await
    }

    /// Close children, stop background tasks and close every connection.
    /// Idempotent.
    pub fn close(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }

            let children: Vec<Driver<T>> = self
                .inner
                .children
                .lock()
                .expect("children lock")
                .drain()
                .map(|(_, child)| child)
                .collect();
            for child in children {
                if let Err(e) = child.close().await {
                    warn!(id = child.id(), error = %e, "failed to close child driver");
                }
            }

            let reaper = self.inner.reaper.lock().expect("reaper lock").take();
            if let Some(reaper) = reaper {
                reaper.shutdown().await;
            }
            self.inner.cluster.close().await;
            let result = self.inner.bootstrap.close().map_err(Error::from);

            if let Some(parent) = self.inner.parent.as_ref().and_then(Weak::upgrade) {
                parent
                    .children
                    .lock()
                    .expect("children lock")
                    .remove(&self.inner.id);
            }
            info!(id = self.inner.id, "driver closed");
            result
        })
    }
}

/// Idle reaper: parks connections unused for longer than the TTL.
fn spawn_reaper<T: Transport>(cluster: &Cluster<T>, config: &Config) -> Option<Repeater> {
    let ttl = config.connection_ttl();
    if ttl.is_zero() {
        return None;
    }
    let weak = cluster.downgrade();
    Some(Repeater::spawn(
        "idle-reaper",
        ttl,
        config.observers().clone(),
        move |_ctx| {
            if let Some(cluster) = weak.upgrade() {
                cluster.park_idle(Instant::now());
            }
            std::future::ready(Ok::<(), Error>(()))
        },
    ))
}

impl<T: Transport> std::fmt::Debug for Driver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.config.endpoint())
            .field("database", &self.inner.config.database())
            .field("closed", &self.is_closed())
            .finish()
    }
}
