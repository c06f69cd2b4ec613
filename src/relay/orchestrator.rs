// Relay orchestrator: drives one client request from attach to teardown.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::broadcast::MediaRelay;
use super::directory::ChannelDirectory;
use super::registry::{Attachment, SessionRegistry};
use super::stats::StatsCollector;
use crate::config::{EngineConfig, GatewayConfig, BODY_CHANNEL_DEPTH};
use crate::engine::{
    Credentials, Demographics, EngineSession, SessionOptions, StartKind, StartParams, StartRequest,
};
use crate::error::{EngineError, GatewayError, GatewayResult};
use crate::source::traits::{UpstreamSource, UpstreamStream};

pub type EngineRegistry = SessionRegistry<EngineSession>;

type BodyChunk = Result<Bytes, io::Error>;

/// A parsed stream request from a downstream client.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub kind: StartKind,
    /// Unquoted content id or transport URL; scopes session sharing.
    pub key: String,
    /// Positional parameters following the key.
    pub params: Vec<String>,
    pub headers: HeaderMap,
    /// Identity of the requesting peer (its IP address).
    pub peer: String,
}

impl RelayRequest {
    fn start_request(&self) -> StartRequest {
        StartRequest {
            kind: self.kind,
            target: self.key.clone(),
            params: StartParams::from_positional(&self.params),
        }
    }

    fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    /// Name of this content's broadcast on the media relay.
    pub fn broadcast_id(&self) -> String {
        match self.kind {
            StartKind::ContentId => self.key.clone(),
            StartKind::TransportUrl => hex::encode(Sha1::digest(self.key.as_bytes())),
        }
    }
}

/// Creates engine sessions for new content keys.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<EngineSession>, EngineError>;
}

/// Connects to the engine's control port over TCP.
pub struct TcpEngineConnector {
    addr: String,
    connect_timeout: Duration,
    options: SessionOptions,
}

impl TcpEngineConnector {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            addr: config.addr(),
            connect_timeout: config.connect_timeout(),
            options: SessionOptions {
                resume_delay: config.resume_delay(),
            },
        }
    }
}

#[async_trait]
impl EngineConnector for TcpEngineConnector {
    async fn connect(&self) -> Result<Arc<EngineSession>, EngineError> {
        EngineSession::connect(&self.addr, self.connect_timeout, self.options.clone()).await
    }
}

/// A request's hold on its registry entry.
struct Lease {
    key: String,
    peer: String,
    broadcast_id: String,
    attachment: Attachment<EngineSession>,
}

/// Where the response head goes.
enum Responder {
    /// Nothing sent yet; the real head or an error is still to come.
    Pending {
        head: oneshot::Sender<GatewayResult<Response>>,
        body: mpsc::Receiver<BodyChunk>,
    },
    /// Canned headers already went out; only the body remains.
    Sent,
}

impl Responder {
    /// Resolves once the client is gone.
    async fn client_gone(&mut self, body_tx: &mpsc::Sender<BodyChunk>) {
        match self {
            Responder::Pending { head, .. } => head.closed().await,
            Responder::Sent => body_tx.closed().await,
        }
    }
}

struct Prepared {
    session: Arc<EngineSession>,
    upstream: UpstreamStream,
}

pub struct RelayOrchestrator {
    config: Arc<GatewayConfig>,
    registry: Arc<EngineRegistry>,
    connector: Arc<dyn EngineConnector>,
    upstream: Arc<dyn UpstreamSource>,
    media_relay: Option<Arc<dyn MediaRelay>>,
    directory: Option<Arc<dyn ChannelDirectory>>,
    stats: Arc<StatsCollector>,
}

impl RelayOrchestrator {
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<EngineRegistry>,
        connector: Arc<dyn EngineConnector>,
        upstream: Arc<dyn UpstreamSource>,
    ) -> Self {
        Self {
            config,
            registry,
            connector,
            upstream,
            media_relay: None,
            directory: None,
            stats: Arc::new(StatsCollector::new()),
        }
    }

    /// Fan sessions out through `relay`; enables sharing one session between clients.
    pub fn with_media_relay(mut self, relay: Arc<dyn MediaRelay>) -> Self {
        self.media_relay = Some(relay);
        self
    }

    /// Announce channels to `directory` once their URL is known, and withdraw them when their session is destroyed.
    pub fn with_channel_directory(mut self, directory: Arc<dyn ChannelDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn fan_out(&self) -> bool {
        self.media_relay.is_some()
    }

    /// Serve one stream request.
    ///
    /// The returned response streams the relayed bytes. The request's
    /// lifecycle runs on its own task so teardown happens even if the client
    /// goes away before a response is produced.
    pub async fn serve(self: &Arc<Self>, request: RelayRequest) -> GatewayResult<Response> {
        let max = self.config.relay.max_connections;
        if max > 0 && self.registry.total() >= max {
            warn!("maximum connections reached, rejecting {}", request.peer);
            self.stats.request_rejected();
            return Err(GatewayError::TooManyClients);
        }

        if let Some(ua) = request.user_agent() {
            if self.config.relay.fake_user_agents.iter().any(|f| f == ua) {
                debug!("fake user agent {}, answering without the engine", ua);
                return Ok(canned_response(Body::empty()));
            }
        }

        let (head_tx, head_rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(request, head_tx).await });

        head_rx.await.unwrap_or_else(|_| {
            Err(GatewayError::Internal(
                "relay task ended without a response".to_string(),
            ))
        })
    }

    async fn run(
        self: Arc<Self>,
        request: RelayRequest,
        head_tx: oneshot::Sender<GatewayResult<Response>>,
    ) {
        let lease = match self.attach(&request) {
            Ok(lease) => lease,
            Err(e) => {
                self.stats.request_rejected();
                let _ = head_tx.send(Err(e));
                return;
            }
        };
        self.stats.client_joined();

        let (body_tx, body_rx) = mpsc::channel::<BodyChunk>(BODY_CHANNEL_DEPTH);
        let mut responder = Responder::Pending {
            head: head_tx,
            body: body_rx,
        };
        let fake_headers = request.user_agent().is_some_and(|ua| {
            self.config
                .relay
                .fake_header_user_agents
                .iter()
                .any(|f| f == ua)
        });
        if fake_headers {
            if let Responder::Pending { head, body } = responder {
                debug!("sending canned headers to {}", request.peer);
                let _ = head.send(Ok(canned_response(body_from_channel(body))));
            }
            responder = Responder::Sent;
        }

        let setup = tokio::select! {
            prepared = self.prepare(&request, &lease) => prepared,
            _ = responder.client_gone(&body_tx) => Err(GatewayError::ClientDisconnected),
        };
        let errored = setup.is_err();

        match setup {
            Ok(prepared) => match self.deliver(prepared, responder, body_tx, &lease).await {
                Ok(()) => debug!("relay for {} finished", lease.key),
                Err(e) if e.is_disconnect() => debug!("client {} disconnected", lease.peer),
                Err(e) => warn!("relay for {} ended: {}", lease.key, e),
            },
            Err(e) => {
                if e.is_disconnect() {
                    debug!("client {} left during setup of {}", lease.peer, lease.key);
                    if lease.attachment.is_creator() {
                        self.abort_unstarted(&lease).await;
                    }
                } else {
                    error!("request for {} failed: {}", lease.key, e);
                }
                if let Responder::Pending { head, .. } = responder {
                    let _ = head.send(Err(e));
                }
            }
        }

        self.release(lease, errored).await;
    }

    /// The creator went away mid-setup. Its session will never get a URL from
    /// this request, so shut it down to release joiners waiting on it.
    async fn abort_unstarted(&self, lease: &Lease) {
        match self.registry.session(&lease.key) {
            Some(session) if !session.has_resolved_url() => {
                debug!("shutting down unstarted session for {}", lease.key);
                session.shutdown().await;
            }
            Some(_) => {}
            None => self.registry.abandon(&lease.key),
        }
    }

    fn attach(&self, request: &RelayRequest) -> GatewayResult<Lease> {
        let attachment = self.registry.attach(&request.key, &request.peer);
        if attachment.count != 1 && !self.fan_out() {
            self.registry.detach(&request.key, &request.peer);
            warn!(
                "{} already has a client, cannot share without a media relay",
                request.key
            );
            return Err(GatewayError::CapacityExceeded(request.key.clone()));
        }

        Ok(Lease {
            key: request.key.clone(),
            peer: request.peer.clone(),
            broadcast_id: request.broadcast_id(),
            attachment,
        })
    }

    /// Everything up to an open upstream stream.
    async fn prepare(&self, request: &RelayRequest, lease: &Lease) -> GatewayResult<Prepared> {
        let session = if lease.attachment.is_creator() {
            self.create_session(request, lease).await?
        } else {
            self.join_session(lease).await?
        };

        let engine_url = session.resolved_url(self.config.relay.url_timeout()).await?;

        let url = match &self.media_relay {
            Some(relay) => {
                if lease.attachment.is_creator() {
                    debug!("got url {}", engine_url);
                    tokio::time::sleep(self.config.relay.start_delay()).await;
                    let source = if self.config.broadcast.force_ffmpeg {
                        format!("http/ffmpeg://{}", engine_url)
                    } else {
                        engine_url
                    };
                    relay
                        .start_broadcast(&lease.broadcast_id, &source, &self.config.broadcast.mux)
                        .await?;
                    tokio::time::sleep(self.config.broadcast.settle()).await;
                }
                relay.output_url(&lease.broadcast_id)
            }
            None => engine_url,
        };
        if lease.attachment.is_creator() {
            self.announce(&lease.broadcast_id, true);
        }

        debug!("opening upstream {} for {}", url, lease.peer);
        let upstream = self
            .upstream
            .open(&url, &request.headers, self.config.relay.upstream_timeout())
            .await?;
        Ok(Prepared { session, upstream })
    }

    async fn create_session(
        &self,
        request: &RelayRequest,
        lease: &Lease,
    ) -> GatewayResult<Arc<EngineSession>> {
        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.registry.abandon(&lease.key);
                return Err(e.into());
            }
        };
        if !self.registry.bind(&lease.key, Arc::clone(&session)) {
            warn!("{} already had a bound session", lease.key);
        }
        self.stats.session_created();
        debug!("engine session created for {}", lease.key);

        if let Err(e) = self.start_session(&session, request).await {
            session.shutdown().await;
            return Err(e.into());
        }
        Ok(session)
    }

    async fn start_session(
        &self,
        session: &EngineSession,
        request: &RelayRequest,
    ) -> Result<(), EngineError> {
        let engine = &self.config.engine;
        session
            .initialize(
                Credentials {
                    product_key: engine.product_key.clone(),
                },
                Demographics {
                    gender: engine.gender,
                    age: engine.age,
                },
                engine.result_timeout(),
            )
            .await?;

        let start = request.start_request();
        if request.kind == StartKind::TransportUrl {
            session.load(&start, engine.result_timeout()).await?;
            if let Some(info) = session.last_load_info() {
                debug!("descriptor for {}: {}", request.key, info);
            }
        }
        session.start(&start, engine.result_timeout()).await?;
        info!("engine started {}", request.key);
        Ok(())
    }

    async fn join_session(&self, lease: &Lease) -> GatewayResult<Arc<EngineSession>> {
        let engine = &self.config.engine;
        let wait = engine.connect_timeout() + engine.result_timeout();
        match lease.attachment.bound_session(wait).await {
            Some(session) => {
                debug!("{} joins the session for {}", lease.peer, lease.key);
                Ok(session)
            }
            None => Err(GatewayError::Engine(EngineError::Closed)),
        }
    }

    /// Send the head (unless canned) and relay until the upstream drains,
    /// fails, or the client disconnects.
    async fn deliver(
        &self,
        prepared: Prepared,
        responder: Responder,
        body_tx: mpsc::Sender<BodyChunk>,
        lease: &Lease,
    ) -> GatewayResult<()> {
        let Prepared { session, upstream } = prepared;
        let UpstreamStream {
            status,
            headers,
            body,
        } = upstream;

        if let Responder::Pending { head, body: body_rx } = responder {
            let mut response = Response::new(body_from_channel(body_rx));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            if head.send(Ok(response)).is_err() {
                return Err(GatewayError::ClientDisconnected);
            }
            debug!("headers sent to {}", lease.peer);
        }

        tokio::select! {
            relayed = self.pump(&session, body, &body_tx, &lease.broadcast_id) => relayed,
            _ = body_tx.closed() => Err(GatewayError::ClientDisconnected),
        }
    }

    /// Copy upstream bytes to the client, honouring the engine's pause gate.
    async fn pump(
        &self,
        session: &EngineSession,
        mut body: Box<dyn AsyncRead + Send + Unpin>,
        tx: &mpsc::Sender<BodyChunk>,
        broadcast_id: &str,
    ) -> GatewayResult<()> {
        let relay = &self.config.relay;
        if self.media_relay.is_none() {
            tokio::time::sleep(relay.start_delay()).await;
        }

        let mut buf = vec![0u8; relay.chunk_size.max(1)];
        let mut broadcast_paused = false;
        let mut idle_polls = 0u32;

        loop {
            if relay.obey_pacing {
                match &self.media_relay {
                    None => session.wait_for_playable(None).await?,
                    Some(media_relay) => {
                        let poll = Some(self.config.broadcast.pause_poll());
                        match session.wait_for_playable(poll).await {
                            Ok(()) => {
                                if broadcast_paused {
                                    media_relay.unpause_broadcast(broadcast_id).await?;
                                    broadcast_paused = false;
                                }
                            }
                            Err(EngineError::StillPaused) => {
                                if !broadcast_paused {
                                    media_relay.pause_broadcast(broadcast_id).await?;
                                    broadcast_paused = true;
                                }
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }

            let n = body
                .read(&mut buf)
                .await
                .map_err(|e| GatewayError::UpstreamFetch(e.to_string()))?;
            if n == 0 {
                idle_polls += 1;
                if idle_polls > relay.max_idle_polls {
                    debug!("upstream drained");
                    return Ok(());
                }
                tokio::time::sleep(relay.idle_backoff()).await;
                continue;
            }
            idle_polls = 0;

            self.stats.record_relayed(n as u64);
            if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                return Err(GatewayError::ClientDisconnected);
            }
        }
    }

    /// Best-effort directory update on its own task; failures are only logged.
    fn announce(&self, id: &str, active: bool) {
        let Some(directory) = &self.directory else {
            return;
        };
        let directory = Arc::clone(directory);
        let id = id.to_string();
        tokio::spawn(async move {
            match directory.channel_active(&id, active).await {
                Ok(()) => debug!("directory: channel {} active={}", id, active),
                Err(e) => warn!("directory update for {} failed: {}", id, e),
            }
        });
    }

    /// Detach, and destroy the session if this was the last client.
    async fn release(&self, lease: Lease, errored: bool) {
        let remaining = self.registry.detach(&lease.key, &lease.peer);
        self.stats.client_left();
        if remaining == 0 && !errored {
            let grace = self.config.relay.destroy_delay();
            if !grace.is_zero() {
                debug!("last client of {} left, waiting {:?}", lease.key, grace);
                tokio::time::sleep(grace).await;
            }
        }

        let Some(session) = self.registry.destroy(&lease.key, lease.attachment.generation) else {
            return;
        };
        info!("last client of {} gone, destroying engine session", lease.key);
        if let Some(relay) = &self.media_relay {
            if let Err(e) = relay.stop_broadcast(&lease.broadcast_id).await {
                debug!("ignoring stop_broadcast failure: {}", e);
            }
        }
        session.shutdown().await;
        self.stats.session_destroyed();
        self.announce(&lease.broadcast_id, false);
    }
}

fn body_from_channel(rx: mpsc::Receiver<BodyChunk>) -> Body {
    Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }))
}

/// `200 video/mpeg` answer for clients that must not wait on the engine.
fn canned_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mpeg"));
    response
}
