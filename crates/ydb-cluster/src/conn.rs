//! Per-node connection: dial-on-demand, in-flight accounting, idle TTL and
//! the invocation wrapper.
//!
//! # Locking
//!
//! All mutable state lives in `Inner` behind the connection's own mutex.
//! The mutex is held only for short synchronous sections and never across
//! an await. Dials are serialized by a separate async gate so concurrent
//! takes on a broken connection produce one dial, not many. On-close
//! callbacks run after the lock is released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use prost::Message;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ydb_core::{
    Config, ConnState, Context, Endpoint, Error, Observer, Observers, TransportError,
};

use crate::proto::OperationResponse;
use crate::stream::{ConnStream, Lease};
use crate::transport::{Channel, MAX_RECV_MESSAGE_SIZE, Outbound, Transport, dial_target};

type OnClose = Box<dyn FnOnce(&Endpoint) + Send>;

/// Settings shared by every connection of one cluster.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Upper bound on one dial. Zero means no bound beyond the caller's
    /// context.
    pub dial_timeout: Duration,
    /// Idle time after which a connection may be parked. Zero disables.
    pub ttl: Duration,
    pub observers: Observers,
}

impl ConnConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dial_timeout: config.dial_timeout(),
            ttl: config.connection_ttl(),
            observers: config.observers().clone(),
        }
    }
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            dial_timeout: ydb_core::config::DEFAULT_DIAL_TIMEOUT,
            ttl: Duration::ZERO,
            observers: Observers::default(),
        }
    }
}

pub struct Conn<T: Transport> {
    id: u64,
    endpoint: Endpoint,
    transport: Arc<T>,
    config: Arc<ConnConfig>,
    inner: Mutex<Inner<T::Channel>>,
    dial_gate: tokio::sync::Mutex<()>,
}

struct Inner<C> {
    channel: Option<Arc<C>>,
    state: ConnState,
    in_flight: usize,
    /// Armed only while in_flight == 0, TTL > 0 and not closed.
    idle_at: Option<Instant>,
    closed: bool,
    on_close: Vec<OnClose>,
}

impl<T: Transport> Conn<T> {
    pub fn new(id: u64, endpoint: Endpoint, transport: Arc<T>, config: Arc<ConnConfig>) -> Self {
        let idle_at = (!config.ttl.is_zero()).then(|| Instant::now() + config.ttl);
        Self {
            id,
            endpoint,
            transport,
            config,
            inner: Mutex::new(Inner {
                channel: None,
                state: ConnState::Created,
                in_flight: 0,
                idle_at,
                closed: false,
                on_close: Vec::new(),
            }),
            dial_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T::Channel>> {
        self.inner.lock().expect("connection lock")
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// When the connection becomes eligible for parking.
    ///
    /// `Some` iff a TTL is configured, the connection is open and nothing
    /// is in flight.
    pub fn idle_deadline(&self) -> Option<Instant> {
        let inner = self.lock();
        if self.config.ttl.is_zero() || inner.closed || inner.in_flight > 0 {
            return None;
        }
        inner.idle_at
    }

    /// Register a callback fired once when the connection closes. Fires
    /// immediately if it already has.
    pub fn on_close(&self, callback: impl FnOnce(&Endpoint) + Send + 'static) {
        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            callback(&self.endpoint);
            return;
        }
        inner.on_close.push(Box::new(callback));
    }

    /// Set the state, returning the previous one. Closing the connection is
    /// the only way into `Destroyed`; a closed connection never changes.
    pub fn set_state(&self, to: ConnState) -> ConnState {
        if to.is_terminal() {
            warn!(address = %self.endpoint.address(), "set_state(destroyed) ignored, use close");
            return self.state();
        }
        let mut inner = self.lock();
        self.transition(&mut inner, to)
    }

    fn transition(&self, inner: &mut Inner<T::Channel>, to: ConnState) -> ConnState {
        let from = inner.state;
        if inner.closed {
            return from;
        }
        if to == ConnState::Offline {
            if let Some(channel) = inner.channel.take() {
                self.close_channel(&channel);
            }
        }
        inner.state = to;
        if from != to {
            debug!(address = %self.endpoint.address(), %from, %to, "connection state changed");
            self.config.observers.on_state_change(&self.endpoint, from, to);
        }
        from
    }

    fn close_channel(&self, channel: &T::Channel) {
        if let Err(e) = channel.close() {
            warn!(address = %self.endpoint.address(), error = %e, "failed to close channel");
        }
    }

    // ── Take / release ─────────────────────────────────────────

    /// Return a live channel, dialing if there is none or it is broken,
    /// and count one more call in flight.
    pub async fn take(&self, ctx: &Context) -> Result<Arc<T::Channel>, Error> {
        if let Some(channel) = self.take_ready()? {
            return Ok(channel);
        }

        let _gate = ctx.run(self.dial_gate.lock()).await?;
        // Someone else may have dialed while we waited.
        if let Some(channel) = self.take_ready()? {
            return Ok(channel);
        }

        self.discard_channel(&mut self.lock());

        let channel = match self.dial(ctx).await {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                let in_flight = self.lock().in_flight;
                self.config.observers.on_take(&self.endpoint, in_flight, Some(&e));
                return Err(e);
            }
        };

        let mut inner = self.lock();
        if inner.closed {
            drop(inner);
            self.close_channel(&channel);
            return Err(self.closed_error());
        }
        inner.channel = Some(channel.clone());
        self.transition(&mut inner, ConnState::Online);
        inner.in_flight += 1;
        inner.idle_at = None;
        self.config
            .observers
            .on_take(&self.endpoint, inner.in_flight, None);
        Ok(channel)
    }

    fn take_ready(&self) -> Result<Option<Arc<T::Channel>>, Error> {
        let mut inner = self.lock();
        if inner.closed {
            let err = self.closed_error();
            self.config
                .observers
                .on_take(&self.endpoint, inner.in_flight, Some(&err));
            return Err(err);
        }
        let channel = match &inner.channel {
            Some(channel) if !channel.state().is_broken() => channel.clone(),
            _ => return Ok(None),
        };
        inner.in_flight += 1;
        inner.idle_at = None;
        self.config
            .observers
            .on_take(&self.endpoint, inner.in_flight, None);
        Ok(Some(channel))
    }

    async fn dial(&self, ctx: &Context) -> Result<T::Channel, Error> {
        let target = dial_target(self.endpoint.address());
        debug!(address = %self.endpoint.address(), "dialing");

        let dial = ctx.run(self.transport.dial(&target));
        let result = if self.config.dial_timeout.is_zero() {
            dial.await
        } else {
            match tokio::time::timeout(self.config.dial_timeout, dial).await {
                Ok(result) => result,
                Err(_) => Ok(Err(TransportError::unavailable(format!(
                    "dial {target}: timed out after {:?}",
                    self.config.dial_timeout
                )))),
            }
        };

        match result? {
            Ok(channel) => {
                self.config.observers.on_dial(&self.endpoint, None);
                Ok(channel)
            }
            Err(e) => {
                warn!(address = %self.endpoint.address(), error = %e, "dial failed");
                self.config.observers.on_dial(&self.endpoint, Some(&e));
                Err(e.into())
            }
        }
    }

    /// Count one call out. Rearms the idle timer when the last call leaves.
    pub fn release(&self) {
        let mut inner = self.lock();
        if inner.in_flight == 0 {
            warn!(address = %self.endpoint.address(), "release without take");
            return;
        }
        inner.in_flight -= 1;
        if inner.in_flight == 0 && !self.config.ttl.is_zero() && !inner.closed {
            inner.idle_at = Some(Instant::now() + self.config.ttl);
        }
        self.config
            .observers
            .on_release(&self.endpoint, inner.in_flight);
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Close the channel of an idle connection, keeping the connection
    /// addressable. Returns whether a channel was released.
    pub fn park(&self) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.in_flight > 0 {
            return false;
        }
        if !self.config.ttl.is_zero() {
            inner.idle_at = Some(Instant::now() + self.config.ttl);
        }
        if !self.discard_channel(&mut inner) {
            return false;
        }
        debug!(address = %self.endpoint.address(), "connection parked");
        true
    }

    /// Close the current channel, if any. The state moves to `Offline`
    /// unless the node is banned.
    fn discard_channel(&self, inner: &mut Inner<T::Channel>) -> bool {
        if inner.channel.is_none() {
            return false;
        }
        if inner.state == ConnState::Banned {
            if let Some(channel) = inner.channel.take() {
                self.close_channel(&channel);
            }
        } else {
            self.transition(inner, ConnState::Offline);
        }
        true
    }

    /// Close for good. The first call closes the channel, moves to
    /// `Destroyed` and fires the on-close callbacks; later calls return
    /// `Ok` and do nothing.
    pub fn close(&self) -> Result<(), TransportError> {
        let (channel, callbacks) = {
            let mut inner = self.lock();
            if inner.closed {
                return Ok(());
            }
            let from = inner.state;
            inner.closed = true;
            inner.idle_at = None;
            inner.state = ConnState::Destroyed;
            self.config
                .observers
                .on_state_change(&self.endpoint, from, ConnState::Destroyed);
            (inner.channel.take(), std::mem::take(&mut inner.on_close))
        };

        let result = match &channel {
            Some(channel) => channel.close(),
            None => Ok(()),
        };
        for callback in callbacks {
            callback(&self.endpoint);
        }
        info!(address = %self.endpoint.address(), "connection closed");
        result
    }

    /// Ban the node after a qualifying failure. No-op once closed.
    pub fn pessimize(&self, cause: &Error) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        let from = self.transition(&mut inner, ConnState::Banned);
        warn!(address = %self.endpoint.address(), %from, error = %cause, "node pessimized");
        self.config.observers.on_pessimize(&self.endpoint, from, cause);
    }

    fn closed_error(&self) -> Error {
        TransportError::unavailable(format!(
            "connection to {} is closed",
            self.endpoint.address()
        ))
        .into()
    }

    fn fail(&self, err: Error, prefix: &str) -> Error {
        let err = err.context(prefix);
        if err.must_pessimize() {
            self.pessimize(&err);
        }
        err
    }

    // ── Invocation ─────────────────────────────────────────────

    /// Unary call. The slot is released on every path, including when the
    /// returned future is dropped mid-call.
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
        let result = self.invoke_inner(ctx, method, request).await;
        self.config
            .observers
            .on_invoke(&self.endpoint, method, result.as_ref().err());
        result
    }

    async fn invoke_inner<Req, Res>(
        &self,
        ctx: &Context,
        method: &str,
        request: Req,
    ) -> Result<Res, Error>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static + OperationResponse,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let channel = self
            .take(ctx)
            .await
            .map_err(|e| self.fail(e, "take failed"))?;
        let slot = Slot::new(self);

        let call_ctx = ctx.child();
        let result = call_ctx.run(channel.invoke::<Req, Res>(method, request)).await;
        call_ctx.cancel();
        drop(slot);

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(status)) => return Err(self.fail(status.into(), "invoke failed")),
            Err(e) => return Err(e.into()),
        };
        if let Some(err) = response.operation().and_then(|op| op.to_error()) {
            return Err(err);
        }
        Ok(response)
    }

    /// Open a streaming call. The slot stays taken until the stream ends,
    /// is closed or dropped, or its context is canceled.
    pub async fn new_stream<Req, Res>(
        self: &Arc<Self>,
        ctx: &Context,
        method: &str,
        outbound: Outbound<Req>,
    ) -> Result<ConnStream<Res>, Error>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        let result = self.new_stream_inner(ctx, method, outbound).await;
        self.config
            .observers
            .on_new_stream(&self.endpoint, method, result.as_ref().err());
        result
    }

    async fn new_stream_inner<Req, Res>(
        self: &Arc<Self>,
        ctx: &Context,
        method: &str,
        outbound: Outbound<Req>,
    ) -> Result<ConnStream<Res>, Error>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let channel = self
            .take(ctx)
            .await
            .map_err(|e| self.fail(e, "take failed"))?;
        let slot = Slot::new(self.as_ref());

        let stream_ctx = ctx.child();
        let opened = stream_ctx
            .run(channel.new_stream::<Req, Res>(method, outbound, MAX_RECV_MESSAGE_SIZE))
            .await;

        match opened {
            Ok(Ok(inner)) => {
                slot.disarm();
                let lease = Lease::new(self.clone());
                Ok(ConnStream::new(lease, stream_ctx, inner))
            }
            Ok(Err(status)) => {
                stream_ctx.cancel();
                drop(slot);
                Err(self.fail(status.into(), "new stream failed"))
            }
            Err(e) => {
                stream_ctx.cancel();
                Err(e.into())
            }
        }
    }
}

/// What a stream needs from the connection it runs on.
pub(crate) trait StreamSlot: Send + Sync {
    fn release(&self);

    fn report(&self, err: &Error);
}

impl<T: Transport> StreamSlot for Conn<T> {
    fn release(&self) {
        Conn::release(self);
    }

    fn report(&self, err: &Error) {
        if err.must_pessimize() {
            self.pessimize(err);
        }
    }
}

/// Releases one taken slot when dropped.
struct Slot<'a, T: Transport> {
    conn: &'a Conn<T>,
    armed: bool,
}

impl<'a, T: Transport> Slot<'a, T> {
    fn new(conn: &'a Conn<T>) -> Self {
        Self { conn, armed: true }
    }

    /// Hand the slot over to someone else.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Transport> Drop for Slot<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.release();
        }
    }
}

impl<T: Transport> std::fmt::Debug for Conn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("address", &self.endpoint.address())
            .field("state", &inner.state)
            .field("in_flight", &inner.in_flight)
            .finish()
    }
}
