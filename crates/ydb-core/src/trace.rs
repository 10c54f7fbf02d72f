//! Lifecycle event sink.
//!
//! Every method has a no-op default so an observer only overrides what it
//! cares about. Observers are called synchronously from the emitting code,
//! sometimes while a connection lock is held: they must not call back into
//! the connection or the registry.

use std::fmt;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::{Error, TransportError};
use crate::state::ConnState;

/// Why a repeater woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeUp {
    Tick,
    Force,
}

impl fmt::Display for WakeUp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WakeUp::Tick => f.write_str("tick"),
            WakeUp::Force => f.write_str("force"),
        }
    }
}

#[allow(unused_variables)]
pub trait Observer: Send + Sync {
    fn on_state_change(&self, endpoint: &Endpoint, from: ConnState, to: ConnState) {}

    fn on_dial(&self, endpoint: &Endpoint, error: Option<&TransportError>) {}

    fn on_take(&self, endpoint: &Endpoint, in_flight: usize, error: Option<&Error>) {}

    fn on_release(&self, endpoint: &Endpoint, in_flight: usize) {}

    fn on_pessimize(&self, endpoint: &Endpoint, state: ConnState, cause: &Error) {}

    fn on_invoke(&self, endpoint: &Endpoint, method: &str, error: Option<&Error>) {}

    fn on_new_stream(&self, endpoint: &Endpoint, method: &str, error: Option<&Error>) {}

    fn on_discover(
        &self,
        address: &str,
        database: &str,
        self_location: &str,
        endpoints: &[Endpoint],
        error: Option<&Error>,
    ) {
    }

    fn on_repeater_wake_up(&self, name: &str, event: WakeUp, error: Option<&Error>) {}
}

/// Zero or more observers composed into one.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Vec<Arc<dyn Observer>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.inner.push(observer);
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("len", &self.inner.len()).finish()
    }
}

impl Observer for Observers {
    fn on_state_change(&self, endpoint: &Endpoint, from: ConnState, to: ConnState) {
        for o in &self.inner {
            o.on_state_change(endpoint, from, to);
        }
    }

    fn on_dial(&self, endpoint: &Endpoint, error: Option<&TransportError>) {
        for o in &self.inner {
            o.on_dial(endpoint, error);
        }
    }

    fn on_take(&self, endpoint: &Endpoint, in_flight: usize, error: Option<&Error>) {
        for o in &self.inner {
            o.on_take(endpoint, in_flight, error);
        }
    }

    fn on_release(&self, endpoint: &Endpoint, in_flight: usize) {
        for o in &self.inner {
            o.on_release(endpoint, in_flight);
        }
    }

    fn on_pessimize(&self, endpoint: &Endpoint, state: ConnState, cause: &Error) {
        for o in &self.inner {
            o.on_pessimize(endpoint, state, cause);
        }
    }

    fn on_invoke(&self, endpoint: &Endpoint, method: &str, error: Option<&Error>) {
        for o in &self.inner {
            o.on_invoke(endpoint, method, error);
        }
    }

    fn on_new_stream(&self, endpoint: &Endpoint, method: &str, error: Option<&Error>) {
        for o in &self.inner {
            o.on_new_stream(endpoint, method, error);
        }
    }

    fn on_discover(
        &self,
        address: &str,
        database: &str,
        self_location: &str,
        endpoints: &[Endpoint],
        error: Option<&Error>,
    ) {
        for o in &self.inner {
            o.on_discover(address, database, self_location, endpoints, error);
        }
    }

    fn on_repeater_wake_up(&self, name: &str, event: WakeUp, error: Option<&Error>) {
        for o in &self.inner {
            o.on_repeater_wake_up(name, event, error);
        }
    }
}
