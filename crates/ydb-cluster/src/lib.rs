//! ydb-cluster — client-side connection runtime for a YDB cluster.
//!
//! Maintains one lazily dialed connection per discovered node, refreshes
//! the node list in the background and routes calls to healthy nodes.
//!
//! # Architecture
//!
//! ```text
//! Driver
//!   ├── Cluster (address → Conn registry, balancer)
//!   │     ├── Conn (state machine, in-flight counter, lazy dial)
//!   │     │     └── Transport::Channel (gRPC over tonic)
//!   │     └── explorer: Repeater "discovery"
//!   │           └── DiscoveryClient::discover → diff_endpoints → apply
//!   ├── Repeater "idle-reaper" (parks connections past their TTL)
//!   ├── RetryConfig (classify → backoff → retry)
//!   └── children (Driver::with)
//! ```
//!
//! Lock order is registry before connection. Connections removed from the
//! registry are closed after the registry lock is released.

pub mod conn;
pub mod diff;
pub mod discovery;
pub mod driver;
pub mod proto;
pub mod registry;
pub mod repeater;
pub mod retry;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

pub use conn::{Conn, ConnConfig};
pub use diff::{Change, diff_endpoints};
pub use discovery::{DiscoveryClient, DiscoverySnapshot, WhoAmI};
pub use driver::Driver;
pub use registry::{Cluster, RegistryGuard, WeakCluster};
pub use repeater::{MIN_FORCE_INTERVAL, Repeater};
pub use retry::{Backoff, BackoffKind, MAX_BACKOFF, RetryConfig, Verdict, classify, retry};
pub use stream::ConnStream;
pub use transport::{Channel, ChannelState, GrpcChannel, GrpcTransport, Transport};
