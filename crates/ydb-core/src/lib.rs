//! ydb-core — shared vocabulary for the YDB cluster client.
//!
//! Everything here is transport-agnostic: the runtime in `ydb-cluster`
//! builds connections, discovery and retries on top of these types.
//!
//! # Contents
//!
//! ```text
//! Endpoint      one cluster node (address + metadata)
//! ConnState     Created → Online ⇄ Offline → Banned → Destroyed
//! Error         Transport | Operation | NotReady | Context | Decode | Config
//! Context       cancellation + deadline carried by every call
//! Config        client options (builder + enumerated ConfigOption + TOML)
//! Observer      lifecycle event sink composed by Observers
//! ```

pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod state;
pub mod trace;

pub use config::{Config, ConfigOption};
pub use context::Context;
pub use endpoint::{Endpoint, sort_endpoints};
pub use error::{
    ContextError, Error, Issue, OperationError, Result, StatusCode, TransportError,
    TransportReason,
};
pub use state::ConnState;
pub use trace::{Observer, Observers, WakeUp};
