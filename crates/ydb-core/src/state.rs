//! Connection lifecycle states.

use std::fmt;

/// State of one node connection.
///
/// ```text
/// Created → Online ⇄ Offline
///    └────────┴───────┴──→ Banned
///                 any ──close──→ Destroyed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Constructed, never dialed.
    Created,
    /// Transport channel established.
    Online,
    /// Channel closed (parked or broken); redialed on next take.
    Offline,
    /// Pessimized after a qualifying failure.
    Banned,
    /// Closed for good.
    Destroyed,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Created => "created",
            ConnState::Online => "online",
            ConnState::Offline => "offline",
            ConnState::Banned => "banned",
            ConnState::Destroyed => "destroyed",
        }
    }

    /// Whether the balancer may route normal traffic here.
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            ConnState::Created | ConnState::Online | ConnState::Offline
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnState::Destroyed
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
