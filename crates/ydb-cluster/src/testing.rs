//! Scripted transport and recording observer for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use prost::Message;

use ydb_core::{ConnState, Endpoint, Error, Observer, TransportError, WakeUp};

use crate::transport::{Channel, ChannelState, MessageStream, Outbound, TARGET_SCHEME, Transport};

/// Scripted outcome of one unary call or stream open.
#[derive(Debug, Clone)]
pub enum Reply {
    Message(Vec<u8>),
    Status(tonic::Status),
    /// Never completes.
    Hang,
}

impl Reply {
    pub fn message<M: Message>(m: &M) -> Self {
        Reply::Message(m.encode_to_vec())
    }
}

/// Scripted stream: the items, then either end or hang.
#[derive(Debug, Clone)]
pub struct StreamReply {
    pub items: Vec<Vec<u8>>,
    pub hang: bool,
}

#[derive(Default)]
struct Script {
    dial_errors: VecDeque<TransportError>,
    dial_delay: Option<Duration>,
    replies: HashMap<String, VecDeque<Reply>>,
    streams: VecDeque<Result<StreamReply, tonic::Status>>,
    calls: Vec<(String, String)>,
    channels: Vec<MockChannel>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    dials: Arc<AtomicUsize>,
    script: Arc<Mutex<Script>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn fail_next_dial(&self, err: TransportError) {
        self.script.lock().unwrap().dial_errors.push_back(err);
    }

    pub fn set_dial_delay(&self, delay: Duration) {
        self.script.lock().unwrap().dial_delay = Some(delay);
    }

    pub fn reply(&self, method: &str, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .replies
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn stream(&self, reply: Result<StreamReply, tonic::Status>) {
        self.script.lock().unwrap().streams.push_back(reply);
    }

    /// `(address, method)` of every call, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Every channel dialed so far.
    pub fn channels(&self) -> Vec<MockChannel> {
        self.script.lock().unwrap().channels.clone()
    }
}

impl Transport for MockTransport {
    type Channel = MockChannel;

    async fn dial(&self, target: &str) -> Result<MockChannel, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (err, delay) = {
            let mut script = self.script.lock().unwrap();
            (script.dial_errors.pop_front(), script.dial_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = err {
            return Err(err);
        }
        let channel = MockChannel {
            address: target.strip_prefix(TARGET_SCHEME).unwrap_or(target).to_string(),
            broken: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            script: self.script.clone(),
        };
        self.script.lock().unwrap().channels.push(channel.clone());
        Ok(channel)
    }
}

#[derive(Clone)]
pub struct MockChannel {
    address: String,
    broken: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    script: Arc<Mutex<Script>>,
}

impl MockChannel {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn break_channel(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel for MockChannel {
    fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::SeqCst) {
            ChannelState::Shutdown
        } else if self.broken.load(Ordering::SeqCst) {
            ChannelState::TransientFailure
        } else {
            ChannelState::Ready
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke<Req, Res>(&self, method: &str, _request: Req) -> Result<Res, tonic::Status>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        let reply = {
            let mut script = self.script.lock().unwrap();
            script.calls.push((self.address.clone(), method.to_string()));
            script
                .replies
                .get_mut(method)
                .and_then(VecDeque::pop_front)
        };
        match reply {
            Some(Reply::Message(bytes)) => {
                Res::decode(bytes.as_slice()).map_err(|e| tonic::Status::internal(e.to_string()))
            }
            Some(Reply::Status(status)) => Err(status),
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(tonic::Status::unimplemented(format!("no reply for {method}"))),
        }
    }

    async fn new_stream<Req, Res>(
        &self,
        method: &str,
        _outbound: Outbound<Req>,
        _max_recv_message_size: usize,
    ) -> Result<MessageStream<Res>, tonic::Status>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        let reply = {
            let mut script = self.script.lock().unwrap();
            script.calls.push((self.address.clone(), method.to_string()));
            script.streams.pop_front()
        };
        let reply = reply.unwrap_or_else(|| Err(tonic::Status::unimplemented("no stream")))?;
        let items = futures::stream::iter(reply.items).map(|bytes| {
            Res::decode(bytes.as_slice()).map_err(|e| tonic::Status::internal(e.to_string()))
        });
        if reply.hang {
            Ok(items.chain(futures::stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }
}

// ── Recording observer ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    State(ConnState, ConnState),
    Dial { ok: bool },
    Take { in_flight: usize, ok: bool },
    Release { in_flight: usize },
    Pessimize(ConnState),
    Invoke { method: String, ok: bool },
    Discover { endpoints: usize, ok: bool },
    WakeUp { name: String, event: WakeUp, ok: bool },
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Observer for Recorder {
    fn on_state_change(&self, _endpoint: &Endpoint, from: ConnState, to: ConnState) {
        self.push(Event::State(from, to));
    }

    fn on_dial(&self, _endpoint: &Endpoint, error: Option<&TransportError>) {
        self.push(Event::Dial { ok: error.is_none() });
    }

    fn on_take(&self, _endpoint: &Endpoint, in_flight: usize, error: Option<&Error>) {
        self.push(Event::Take {
            in_flight,
            ok: error.is_none(),
        });
    }

    fn on_release(&self, _endpoint: &Endpoint, in_flight: usize) {
        self.push(Event::Release { in_flight });
    }

    fn on_pessimize(&self, _endpoint: &Endpoint, state: ConnState, _cause: &Error) {
        self.push(Event::Pessimize(state));
    }

    fn on_invoke(&self, _endpoint: &Endpoint, method: &str, error: Option<&Error>) {
        self.push(Event::Invoke {
            method: method.to_string(),
            ok: error.is_none(),
        });
    }

    fn on_discover(
        &self,
        _address: &str,
        _database: &str,
        _self_location: &str,
        endpoints: &[Endpoint],
        error: Option<&Error>,
    ) {
        self.push(Event::Discover {
            endpoints: endpoints.len(),
            ok: error.is_none(),
        });
    }

    fn on_repeater_wake_up(&self, name: &str, event: WakeUp, error: Option<&Error>) {
        self.push(Event::WakeUp {
            name: name.to_string(),
            event,
            ok: error.is_none(),
        });
    }
}
