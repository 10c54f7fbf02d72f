//! Cluster node descriptions.

use std::collections::BTreeSet;
use std::fmt;

/// One reachable database node, as reported by discovery.
///
/// Endpoints are plain values: cheap to clone and compared for registry
/// keying by [`Endpoint::address`] alone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Endpoint {
    address: String,
    node_id: u32,
    location: String,
    load_factor: f32,
    local_dc: bool,
    services: BTreeSet<String>,
}

impl Endpoint {
    /// Create an endpoint for `host:port` with empty metadata.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn with_local_dc(mut self, local_dc: bool) -> Self {
        self.local_dc = local_dc;
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    /// `host:port` of the node. This is the registry key.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Node id, 0 when unknown.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn load_factor(&self) -> f32 {
        self.load_factor
    }

    /// Whether the node lives in the caller's data center.
    pub fn is_local_dc(&self) -> bool {
        self.local_dc
    }

    pub fn services(&self) -> &BTreeSet<String> {
        &self.services
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains(service)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        if self.node_id != 0 {
            write!(f, " (node {})", self.node_id)?;
        }
        if !self.location.is_empty() {
            write!(f, " [{}]", self.location)?;
        }
        Ok(())
    }
}

/// Sort endpoints by address, the order the endpoint differ expects.
pub fn sort_endpoints(endpoints: &mut [Endpoint]) {
    endpoints.sort_by(|a, b| a.address.cmp(&b.address));
}
