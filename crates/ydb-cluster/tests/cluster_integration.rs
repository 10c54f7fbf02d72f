//! Driver integration tests.
//!
//! Runs a full driver against an in-process fleet: a transport whose
//! channels answer discovery from a mutable node list and echo the serving
//! node's address back from WhoAmI.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use prost::Message;

use ydb_cluster::proto::{
    self, EndpointInfo, ListEndpointsRequest, ListEndpointsResponse, ListEndpointsResult,
    Operation, WhoAmIRequest, WhoAmIResponse, WhoAmIResult,
};
use ydb_cluster::transport::{MessageStream, Outbound, TARGET_SCHEME};
use ydb_cluster::{Channel, ChannelState, Driver, Transport};
use ydb_core::{Config, ConfigOption, ConnState, Context, StatusCode, TransportError};

// ── Fleet ──────────────────────────────────────────────────────

#[derive(Default)]
struct FleetState {
    nodes: Vec<String>,
    failing: HashSet<String>,
    overloaded: usize,
    dials: HashMap<String, usize>,
    databases: Vec<String>,
    list_calls: usize,
}

#[derive(Clone, Default)]
struct Fleet {
    state: Arc<Mutex<FleetState>>,
}

impl Fleet {
    fn with_nodes(nodes: &[&str]) -> Self {
        let fleet = Fleet::default();
        fleet.set_nodes(nodes);
        fleet
    }

    fn set_nodes(&self, nodes: &[&str]) {
        self.state.lock().unwrap().nodes = nodes.iter().map(|n| n.to_string()).collect();
    }

    fn fail(&self, address: &str) {
        self.state.lock().unwrap().failing.insert(address.to_string());
    }

    fn overload(&self, times: usize) {
        self.state.lock().unwrap().overloaded = times;
    }

    fn dials(&self, address: &str) -> usize {
        self.state.lock().unwrap().dials.get(address).copied().unwrap_or(0)
    }

    fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    fn databases(&self) -> Vec<String> {
        self.state.lock().unwrap().databases.clone()
    }
}

impl Transport for Fleet {
    type Channel = FleetChannel;

    async fn dial(&self, target: &str) -> Result<FleetChannel, TransportError> {
        let address = target.strip_prefix(TARGET_SCHEME).unwrap_or(target).to_string();
        *self
            .state
            .lock()
            .unwrap()
            .dials
            .entry(address.clone())
            .or_default() += 1;
        Ok(FleetChannel {
            address,
            fleet: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct FleetChannel {
    address: String,
    fleet: Fleet,
    closed: Arc<AtomicBool>,
}

/// Hand a message across the generic `Channel` boundary.
fn reencode<A: Message, B: Message + Default>(message: &A) -> Result<B, tonic::Status> {
    B::decode(message.encode_to_vec().as_slice())
        .map_err(|e| tonic::Status::internal(e.to_string()))
}

impl FleetChannel {
    fn list_endpoints(&self, request: ListEndpointsRequest) -> ListEndpointsResponse {
        let mut state = self.fleet.state.lock().unwrap();
        state.list_calls += 1;
        state.databases.push(request.database);
        let endpoints = state
            .nodes
            .iter()
            .map(|node| {
                let (host, port) = node.rsplit_once(':').unwrap();
                EndpointInfo {
                    address: host.to_string(),
                    port: port.parse().unwrap(),
                    location: "vla".into(),
                    ..EndpointInfo::default()
                }
            })
            .collect();
        let result = ListEndpointsResult {
            endpoints,
            self_location: "vla".into(),
        };
        ListEndpointsResponse {
            operation: Some(Operation::success("", &result)),
        }
    }

    fn who_am_i(&self) -> Result<WhoAmIResponse, tonic::Status> {
        let mut state = self.fleet.state.lock().unwrap();
        if state.failing.contains(&self.address) {
            return Err(tonic::Status::unavailable("node is down"));
        }
        if state.overloaded > 0 {
            state.overloaded -= 1;
            return Ok(WhoAmIResponse {
                operation: Some(Operation {
                    ready: true,
                    status: StatusCode::Overloaded.code(),
                    ..Operation::default()
                }),
            });
        }
        let result = WhoAmIResult {
            user: self.address.clone(),
            groups: vec![],
        };
        Ok(WhoAmIResponse {
            operation: Some(Operation::success("", &result)),
        })
    }
}

impl Channel for FleetChannel {
    fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::SeqCst) {
            ChannelState::Shutdown
        } else {
            ChannelState::Ready
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke<Req, Res>(&self, method: &str, request: Req) -> Result<Res, tonic::Status>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        match method {
            proto::LIST_ENDPOINTS => {
                let request: ListEndpointsRequest = reencode(&request)?;
                reencode(&self.list_endpoints(request))
            }
            proto::WHO_AM_I => reencode(&self.who_am_i()?),
            _ => Err(tonic::Status::unimplemented(method.to_string())),
        }
    }

    async fn new_stream<Req, Res>(
        &self,
        _method: &str,
        _outbound: Outbound<Req>,
        _max_recv_message_size: usize,
    ) -> Result<MessageStream<Res>, tonic::Status>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        let items: Vec<Result<Res, tonic::Status>> = (0..3)
            .map(|i| {
                reencode(&WhoAmIResult {
                    user: format!("{}#{i}", self.address),
                    groups: vec![],
                })
            })
            .collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

// ── Helpers ────────────────────────────────────────────────────

fn config() -> Config {
    Config::new("grpc://seed:2135", "/local").with_discovery_interval(Duration::from_secs(60))
}

async fn open(fleet: &Fleet, config: Config) -> Driver<Fleet> {
    Driver::open(&Context::background(), config, fleet.clone())
        .await
        .unwrap()
}

async fn whoami(driver: &Driver<Fleet>) -> Result<WhoAmIResponse, ydb_core::Error> {
    driver
        .invoke(&Context::background(), proto::WHO_AM_I, WhoAmIRequest::default())
        .await
}

fn addresses(driver: &Driver<Fleet>) -> Vec<String> {
    driver
        .cluster()
        .endpoints()
        .iter()
        .map(|e| e.address().to_string())
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn open_discovers_and_routes_calls() {
    let fleet = Fleet::with_nodes(&["a:2136", "b:2136"]);
    let driver = open(&fleet, config()).await;

    assert_eq!(addresses(&driver), vec!["a:2136", "b:2136"]);
    assert!(driver.cluster().endpoints().iter().all(|e| e.is_local_dc()));

    let response = whoami(&driver).await.unwrap();
    let result: WhoAmIResult = response
        .operation
        .unwrap()
        .decode_result("WhoAmIResult")
        .unwrap();
    assert!(["a:2136", "b:2136"].contains(&result.user.as_str()));

    let me = driver.who_am_i(&Context::background()).await.unwrap();
    assert_eq!(me.user, "seed:2135");
    driver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn refresh_follows_topology() {
    let fleet = Fleet::with_nodes(&["a:2136", "b:2136"]);
    let driver = open(&fleet, config()).await;
    let b = driver.cluster().get_conn("b:2136").unwrap();
    let a = driver.cluster().get_conn("a:2136").unwrap();

    fleet.set_nodes(&["b:2136", "c:2136"]);
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(addresses(&driver), vec!["b:2136", "c:2136"]);
    assert_eq!(driver.cluster().get_conn("b:2136").unwrap().id(), b.id());
    assert_eq!(a.state(), ConnState::Destroyed);

    // An empty listing keeps what we have.
    fleet.set_nodes(&[]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(addresses(&driver), vec!["b:2136", "c:2136"]);
    driver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_node_is_banned_and_forces_discovery() {
    let fleet = Fleet::with_nodes(&["a:2136"]);
    fleet.fail("a:2136");
    let driver = open(&fleet, config()).await;
    assert_eq!(fleet.list_calls(), 1);

    let err = whoami(&driver).await.unwrap_err();
    assert!(err.must_pessimize());
    assert_eq!(
        driver.cluster().get_conn("a:2136").unwrap().state(),
        ConnState::Banned
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fleet.list_calls(), 2);

    // Banned nodes are still served when nothing better exists.
    assert_eq!(driver.cluster().get().unwrap().endpoint().address(), "a:2136");
    driver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retry_rides_out_overload() {
    let fleet = Fleet::with_nodes(&["a:2136"]);
    let driver = open(&fleet, config()).await;
    fleet.overload(2);

    let response = driver
        .retry(&Context::background(), false, |ctx| {
            let driver = driver.clone();
            async move {
                driver
                    .invoke::<_, WhoAmIResponse>(&ctx, proto::WHO_AM_I, WhoAmIRequest::default())
                    .await
            }
        })
        .await
        .unwrap();
    assert!(response.operation.unwrap().to_error().is_none());
    driver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stream_returns_slot_when_drained() {
    let fleet = Fleet::with_nodes(&["a:2136"]);
    let driver = open(&fleet, config()).await;

    let outbound: Outbound<WhoAmIRequest> = futures::stream::empty().boxed();
    let mut stream = driver
        .new_stream::<_, WhoAmIResult>(&Context::background(), "/Test/Stream", outbound)
        .await
        .unwrap();
    let conn = driver.cluster().get_conn("a:2136").unwrap();
    assert_eq!(conn.in_flight(), 1);

    let mut users = Vec::new();
    while let Some(item) = stream.next().await {
        users.push(item.unwrap().user);
    }
    assert_eq!(users, vec!["a:2136#0", "a:2136#1", "a:2136#2"]);
    assert_eq!(conn.in_flight(), 0);
    driver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_parked_and_redialed() {
    let fleet = Fleet::with_nodes(&["a:2136"]);
    let driver = open(&fleet, config().with_connection_ttl(Duration::from_secs(5))).await;

    whoami(&driver).await.unwrap();
    let conn = driver.cluster().get_conn("a:2136").unwrap();
    assert_eq!(conn.state(), ConnState::Online);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(conn.state(), ConnState::Offline);

    whoami(&driver).await.unwrap();
    assert_eq!(conn.state(), ConnState::Online);
    assert_eq!(fleet.dials("a:2136"), 2);
    driver.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn children_close_with_parent() {
    let fleet = Fleet::with_nodes(&["a:2136"]);
    let driver = open(&fleet, config()).await;
    let ctx = Context::background();

    let child = driver
        .with(&ctx, [ConfigOption::Database("/child".into())])
        .await
        .unwrap();
    assert_eq!(child.id(), 1);
    assert_eq!(fleet.databases(), vec!["/local", "/child"]);
    assert_eq!(driver.child_ids(), vec![1]);

    whoami(&child).await.unwrap();
    driver.close().await.unwrap();

    assert!(child.is_closed());
    assert!(child.cluster().is_closed());
    assert!(whoami(&child).await.is_err());
}
