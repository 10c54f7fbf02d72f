//! Transport seam: the dial and call primitives the runtime consumes.
//!
//! [`Transport`] opens a [`Channel`] to one node; a channel performs unary
//! and streaming calls. [`GrpcTransport`] is the production implementation
//! over tonic; tests script their own.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use http::uri::PathAndQuery;
use prost::Message;
use tonic::codec::ProstCodec;
use tonic::transport::{Certificate, ClientTlsConfig, Endpoint};
use tracing::{debug, warn};

use ydb_core::TransportError;

/// Synthetic scheme prefixed to every dial target.
pub const TARGET_SCHEME: &str = "ydb:///";

/// Largest message a stream will decode.
pub const MAX_RECV_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Server-to-client half of a stream.
pub type MessageStream<T> = BoxStream<'static, Result<T, tonic::Status>>;

/// Client-to-server half of a stream.
pub type Outbound<T> = BoxStream<'static, T>;

pub fn dial_target(address: &str) -> String {
    format!("{TARGET_SCHEME}{address}")
}

/// Connectivity as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ChannelState {
    /// A broken channel is closed and redialed on the next take.
    pub fn is_broken(self) -> bool {
        matches!(self, ChannelState::TransientFailure | ChannelState::Shutdown)
    }
}

pub trait Transport: Send + Sync + 'static {
    type Channel: Channel;

    /// Open a channel to `target` (`ydb:///host:port`).
    fn dial(
        &self,
        target: &str,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}

pub trait Channel: Send + Sync + 'static {
    fn state(&self) -> ChannelState;

    fn close(&self) -> Result<(), TransportError>;

    fn invoke<Req, Res>(
        &self,
        method: &str,
        request: Req,
    ) -> impl Future<Output = Result<Res, tonic::Status>> + Send
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static;

    fn new_stream<Req, Res>(
        &self,
        method: &str,
        outbound: Outbound<Req>,
        max_recv_message_size: usize,
    ) -> impl Future<Output = Result<MessageStream<Res>, tonic::Status>> + Send
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static;
}

// ── gRPC ───────────────────────────────────────────────────────

/// Dials nodes over HTTP/2 with tonic.
#[derive(Debug, Clone, Default)]
pub struct GrpcTransport {
    tls: Option<ClientTlsConfig>,
    keep_alive: Option<Duration>,
}

impl GrpcTransport {
    /// Plaintext transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// TLS trusting the bundled Mozilla root set.
    pub fn secure() -> Self {
        Self {
            tls: Some(ClientTlsConfig::new().with_webpki_roots()),
            keep_alive: None,
        }
    }

    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// TLS trusting the given PEM-encoded CA.
    pub fn with_ca_certificate(self, pem: impl AsRef<[u8]>) -> Self {
        let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
        self.with_tls(tls)
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint, TransportError> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let uri = format!("{scheme}://{address}");
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| TransportError::unavailable(format!("invalid endpoint {uri}: {e}")))?;
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| TransportError::unavailable(format!("tls config for {uri}: {e}")))?;
        }
        if let Some(interval) = self.keep_alive {
            endpoint = endpoint
                .http2_keep_alive_interval(interval)
                .keep_alive_while_idle(true);
        }
        Ok(endpoint)
    }
}

impl Transport for GrpcTransport {
    type Channel = GrpcChannel;

    async fn dial(&self, target: &str) -> Result<GrpcChannel, TransportError> {
        let address = target.strip_prefix(TARGET_SCHEME).unwrap_or(target);
        let endpoint = self.endpoint(address)?;
        let channel = endpoint.connect().await.map_err(|e| {
            warn!(address, error = %e, "failed to connect");
            TransportError::unavailable(format!("connect to {address}: {e}"))
        })?;
        debug!(address, "connected");
        Ok(GrpcChannel::new(channel))
    }
}

/// One tonic channel plus the connectivity flags tonic does not expose.
#[derive(Debug, Clone)]
pub struct GrpcChannel {
    inner: tonic::transport::Channel,
    broken: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl GrpcChannel {
    pub fn new(inner: tonic::transport::Channel) -> Self {
        Self {
            inner,
            broken: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn client(
        &self,
        method: &str,
    ) -> Result<(tonic::client::Grpc<tonic::transport::Channel>, PathAndQuery), tonic::Status> {
        if self.closed.load(Ordering::Acquire) {
            return Err(tonic::Status::unavailable("channel closed"));
        }
        let path = PathAndQuery::try_from(method)
            .map_err(|e| tonic::Status::internal(format!("invalid method {method:?}: {e}")))?;
        let mut grpc = tonic::client::Grpc::new(self.inner.clone());
        grpc.ready().await.map_err(|e| {
            self.broken.store(true, Ordering::Release);
            tonic::Status::unavailable(format!("channel not ready: {e}"))
        })?;
        Ok((grpc, path))
    }

    fn observe(&self, status: &tonic::Status) {
        if status.code() == tonic::Code::Unavailable {
            self.broken.store(true, Ordering::Release);
        }
    }
}

impl Channel for GrpcChannel {
    fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::Acquire) {
            ChannelState::Shutdown
        } else if self.broken.load(Ordering::Acquire) {
            ChannelState::TransientFailure
        } else {
            ChannelState::Ready
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn invoke<Req, Res>(&self, method: &str, request: Req) -> Result<Res, tonic::Status>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        let (mut grpc, path) = self.client(method).await?;
        let codec = ProstCodec::<Req, Res>::default();
        match grpc.unary(tonic::Request::new(request), path, codec).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                self.observe(&status);
                Err(status)
            }
        }
    }

    async fn new_stream<Req, Res>(
        &self,
        method: &str,
        outbound: Outbound<Req>,
        max_recv_message_size: usize,
    ) -> Result<MessageStream<Res>, tonic::Status>
    where
        Req: Message + Send + Sync + 'static,
        Res: Message + Default + Send + Sync + 'static,
    {
        let (grpc, path) = self.client(method).await?;
        let mut grpc = grpc.max_decoding_message_size(max_recv_message_size);
        let codec = ProstCodec::<Req, Res>::default();
        match grpc.streaming(tonic::Request::new(outbound), path, codec).await {
            Ok(response) => Ok(response.into_inner().boxed()),
            Err(status) => {
                self.observe(&status);
                Err(status)
            }
        }
    }
}
