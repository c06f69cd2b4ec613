// Engine session state machine: authentication, start/load correlation and pause gating.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use super::link::{EngineLink, LineHandler, LineReader};
use super::protocol::{ready_key, EngineRequest, EngineResponse, StartRequest, StatusLine};
use super::signal::{OneShot, PlayGate};
use crate::config::{AgeGroup, Gender, SHUTDOWN_WRITE_TIMEOUT};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Authenticated,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Starting,
    Running,
    Paused,
    Errored(String),
    ShuttingDown,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub product_key: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Demographics {
    pub gender: Gender,
    pub age: AgeGroup,
}

impl Default for Demographics {
    fn default() -> Self {
        Self {
            gender: Gender::Male,
            age: AgeGroup::From25To34,
        }
    }
}

/// Options fixed for the lifetime of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Delay between a RESUME line and reopening the pause gate.
    pub resume_delay: Duration,
}

type OpSlot = Arc<OneShot<Result<(), EngineError>>>;
type UrlSlot = Arc<OneShot<Result<String, EngineError>>>;

struct ProtocolState {
    auth: AuthState,
    playback: PlaybackState,
    status: Option<String>,
    engine_state: Option<String>,
    load_info: Option<String>,
    load_tag: Option<String>,
    credentials: Option<Credentials>,
    demographics: Demographics,
}

struct Shared {
    link: Arc<EngineLink>,
    resume_delay: Duration,
    state: Mutex<ProtocolState>,
    auth: OneShot<Result<(), EngineError>>,
    pending: Mutex<OpSlot>,
    url: Mutex<UrlSlot>,
    gate: PlayGate,
    shutting_down: AtomicBool,
    op_in_flight: AtomicBool,
    next_tag: AtomicU64,
}

/// One controlled playback session on the engine.
///
/// Owns the link; the link's reader task is the only writer of protocol
/// state, callers observe it through the auth/op/url slots and the pause gate.
pub struct EngineSession {
    shared: Arc<Shared>,
}

/// Clears the in-flight marker when a start/load call returns.
struct OperationGuard<'a>(&'a AtomicBool);

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EngineSession {
    /// Connect to the engine and start the reader task.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        options: SessionOptions,
    ) -> Result<Arc<Self>, EngineError> {
        let (link, reader) = EngineLink::connect(addr, connect_timeout).await?;
        Ok(Self::start_reader(link, reader, options))
    }

    /// Run a session over an arbitrary stream (used for in-process engines and tests).
    pub fn from_stream<S>(stream: S, options: SessionOptions) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, reader) = EngineLink::from_stream(stream);
        Self::start_reader(link, reader, options)
    }

    fn start_reader(link: Arc<EngineLink>, reader: LineReader, options: SessionOptions) -> Arc<Self> {
        let shared = Arc::new(Shared {
            link: Arc::clone(&link),
            resume_delay: options.resume_delay,
            state: Mutex::new(ProtocolState {
                auth: AuthState::Pending,
                playback: PlaybackState::Idle,
                status: None,
                engine_state: None,
                load_info: None,
                load_tag: None,
                credentials: None,
                demographics: Demographics::default(),
            }),
            auth: OneShot::new(),
            pending: Mutex::new(Arc::new(OneShot::new())),
            url: Mutex::new(Arc::new(OneShot::new())),
            gate: PlayGate::new(false),
            shutting_down: AtomicBool::new(false),
            op_in_flight: AtomicBool::new(false),
            next_tag: AtomicU64::new(1),
        });
        link.spawn_reader(reader, Arc::clone(&shared));
        Arc::new(Self { shared })
    }

    /// Perform the handshake and wait for the engine's verdict.
    ///
    /// On success the USERDATA line has already been sent.
    pub async fn initialize(
        &self,
        credentials: Credentials,
        demographics: Demographics,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        {
            let mut state = self.shared.state.lock();
            state.credentials = Some(credentials);
            state.demographics = demographics;
        }
        self.shared.link.send(&EngineRequest::Hello.encode()).await?;

        match self.shared.auth.wait(timeout).await {
            Some(result) => {
                if result.is_ok() {
                    debug!("engine session authenticated");
                }
                result
            }
            None => {
                error!("engine authentication timed out, wrong product key?");
                Err(EngineError::AuthTimeout)
            }
        }
    }

    /// Ask the engine to start playback and wait for it to accept.
    pub async fn start(&self, request: &StartRequest, timeout: Duration) -> Result<(), EngineError> {
        self.ensure_authenticated()?;
        let _op = self.begin_operation()?;

        let pending = self.replace_pending();
        {
            let mut url = self.shared.url.lock();
            if url.is_set() {
                *url = Arc::new(OneShot::new());
            }
        }
        self.shared.state.lock().playback = PlaybackState::Starting;

        self.shared
            .link
            .send(&EngineRequest::Start(request.clone()).encode())
            .await?;

        match pending.wait(timeout).await {
            Some(result) => result,
            None => {
                error!("START timed out for {}", request.target);
                Err(EngineError::StartTimeout)
            }
        }
    }

    /// Ask the engine for the descriptor of `request` and wait for the answer.
    ///
    /// The descriptor is available afterwards via [`last_load_info`](Self::last_load_info).
    pub async fn load(
        &self,
        request: &StartRequest,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        self.load_tagged(&tag, request, timeout).await
    }

    /// [`load`](Self::load) with a caller-chosen request tag.
    pub async fn load_tagged(
        &self,
        tag: &str,
        request: &StartRequest,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.ensure_authenticated()?;
        let _op = self.begin_operation()?;

        let pending = self.replace_pending();
        self.shared.state.lock().load_tag = Some(tag.to_string());

        let line = EngineRequest::LoadAsync {
            tag: tag.to_string(),
            request: request.clone(),
        }
        .encode();
        self.shared.link.send(&line).await?;

        match pending.wait(timeout).await {
            Some(result) => result,
            None => {
                error!("LOADASYNC timed out for {}", request.target);
                Err(EngineError::LoadTimeout)
            }
        }
    }

    /// Wait for the playback URL announced by the engine.
    pub async fn resolved_url(&self, timeout: Duration) -> Result<String, EngineError> {
        let slot = Arc::clone(&*self.shared.url.lock());
        match slot.wait(timeout).await {
            Some(result) => result,
            None => {
                error!("timed out waiting for the playback url");
                Err(EngineError::UrlTimeout)
            }
        }
    }

    /// Block while the engine has playback paused.
    ///
    /// With `timeout` set, gives up with [`EngineError::StillPaused`] once it
    /// expires. Fails with [`EngineError::Closed`] when the session goes away.
    pub async fn wait_for_playable(&self, timeout: Option<Duration>) -> Result<(), EngineError> {
        self.ensure_open()?;
        let open = self.shared.gate.wait_open(timeout).await;
        self.ensure_open()?;
        if !self.shared.link.is_alive() {
            return Err(EngineError::Transport("engine link is closed".to_string()));
        }
        if open {
            Ok(())
        } else {
            Err(EngineError::StillPaused)
        }
    }

    /// Whether the engine has announced a playback URL (or failed to) for the current start.
    pub fn has_resolved_url(&self) -> bool {
        self.shared.url.lock().is_set()
    }

    pub fn is_playable(&self) -> bool {
        self.shared.gate.is_open()
    }

    pub fn last_load_info(&self) -> Option<String> {
        self.shared.state.lock().load_info.clone()
    }

    pub fn auth_state(&self) -> AuthState {
        self.shared.state.lock().auth
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.shared.state.lock().playback.clone()
    }

    /// Last status code reported by the engine.
    pub fn status(&self) -> Option<String> {
        self.shared.state.lock().status.clone()
    }

    /// Last free-form STATE value, for diagnostics.
    pub fn engine_state(&self) -> Option<String> {
        self.shared.state.lock().engine_state.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Tear the session down. Idempotent and infallible.
    ///
    /// Every task waiting on this session is released with
    /// [`EngineError::Closed`] before the SHUTDOWN line is attempted.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down engine session");
        self.shared.state.lock().playback = PlaybackState::ShuttingDown;
        self.shared.fail_waiters(EngineError::Closed);
        self.shared.gate.open();

        let goodbye = EngineRequest::Shutdown.encode();
        match tokio::time::timeout(SHUTDOWN_WRITE_TIMEOUT, self.shared.link.send(&goodbye)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("ignoring SHUTDOWN write failure: {}", e),
            Err(_) => debug!("SHUTDOWN write timed out"),
        }
        self.shared.link.close().await;
        self.shared.state.lock().playback = PlaybackState::Closed;
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_shutting_down() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn ensure_authenticated(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        match self.auth_state() {
            AuthState::Authenticated => Ok(()),
            AuthState::Rejected => Err(EngineError::AuthRejected),
            AuthState::Pending => Err(EngineError::Protocol(
                "session used before authentication".to_string(),
            )),
        }
    }

    fn begin_operation(&self) -> Result<OperationGuard<'_>, EngineError> {
        if self
            .shared
            .op_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::OperationInFlight);
        }
        Ok(OperationGuard(&self.shared.op_in_flight))
    }

    fn replace_pending(&self) -> OpSlot {
        let slot: OpSlot = Arc::new(OneShot::new());
        *self.shared.pending.lock() = Arc::clone(&slot);
        slot
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        debug!("EngineSession dropped, stopping reader");
        self.shared.link.cancel_reader();
    }
}

impl Shared {
    fn fail_waiters(&self, err: EngineError) {
        self.auth.set(Err(err.clone()));
        self.pending.lock().set(Err(err.clone()));
        self.url.lock().set(Err(err));
    }

    /// Move auth out of `Pending`; later verdicts are ignored.
    fn resolve_auth(&self, verdict: AuthState) -> bool {
        {
            let mut state = self.state.lock();
            if state.auth != AuthState::Pending {
                return false;
            }
            state.auth = verdict;
        }
        let result = match verdict {
            AuthState::Authenticated => Ok(()),
            _ => Err(EngineError::AuthRejected),
        };
        self.auth.set(result);
        true
    }

    async fn send_or_log(&self, request: EngineRequest) -> bool {
        match self.link.send(&request.encode()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("engine write failed: {}", e);
                false
            }
        }
    }

    async fn send_userdata(&self) -> bool {
        let demographics = self.state.lock().demographics;
        self.send_or_log(EngineRequest::UserData {
            gender: demographics.gender.code(),
            age: demographics.age.code(),
        })
        .await
    }

    async fn on_hello(&self, key: Option<String>) {
        let request = match key {
            Some(key) => {
                let product_key = self
                    .state
                    .lock()
                    .credentials
                    .as_ref()
                    .map(|c| c.product_key.clone())
                    .unwrap_or_default();
                EngineRequest::ReadyKeyed {
                    key: ready_key(&key, &product_key),
                }
            }
            None => EngineRequest::ReadyUnkeyed,
        };
        if !self.send_or_log(request).await {
            self.resolve_auth(AuthState::Rejected);
        }
    }

    async fn on_auth(&self, level: Option<String>) {
        match level {
            Some(level) => {
                if self.state.lock().auth != AuthState::Pending {
                    debug!("ignoring repeated AUTH {}", level);
                    return;
                }
                debug!("engine auth level {}", level);
                self.send_userdata().await;
                self.resolve_auth(AuthState::Authenticated);
            }
            None => {
                error!("engine sent AUTH without a level");
                self.resolve_auth(AuthState::Rejected);
            }
        }
    }

    async fn on_get_userdata(&self) {
        let initialized = {
            let state = self.state.lock();
            state.credentials.is_some() && state.auth == AuthState::Authenticated
        };
        if initialized {
            self.send_userdata().await;
            return;
        }
        error!("engine requested user data before initialization");
        let fault = EngineError::Protocol("user data requested before initialization".to_string());
        self.state.lock().playback = PlaybackState::Errored(fault.to_string());
        self.fail_waiters(fault);
    }

    fn on_start(&self, url: Option<String>) {
        let Some(url) = url else {
            debug!("START acknowledgement without url, waiting");
            return;
        };
        info!("engine playback url {}", url);
        self.state.lock().playback = PlaybackState::Running;
        self.url.lock().set(Ok(url));
        self.gate.open();
    }

    fn on_load_response(&self, tag: String, payload: String) {
        let matches = {
            let mut state = self.state.lock();
            state.load_info = Some(payload);
            if state.load_tag.as_deref() == Some(tag.as_str()) {
                state.load_tag = None;
                true
            } else {
                false
            }
        };
        if matches {
            self.pending.lock().set(Ok(()));
        } else {
            debug!("LOADRESP for unknown tag {}", tag);
        }
    }

    fn on_status(&self, status: StatusLine) {
        {
            let mut state = self.state.lock();
            if state.status.as_deref() != Some(status.code.as_str()) {
                debug!("engine status changed to {}", status.code);
                state.status = Some(status.code.clone());
            }
        }
        if status.is_fatal() {
            error!("{} with message {}", status.code, status.detail);
            let err = EngineError::Engine(status.detail.clone());
            self.state.lock().playback = PlaybackState::Errored(status.detail);
            self.pending.lock().set(Err(err.clone()));
            self.url.lock().set(Err(err));
        } else if status.is_starting() {
            self.pending.lock().set(Ok(()));
        }
    }
}

#[async_trait]
impl LineHandler for Shared {
    async fn on_line(&self, line: String) {
        debug!(line = %line, "engine >>");
        match EngineResponse::decode(&line) {
            EngineResponse::Hello { key } => self.on_hello(key).await,
            EngineResponse::NotReady => {
                error!("engine is not ready, wrong product key?");
                self.resolve_auth(AuthState::Rejected);
            }
            EngineResponse::Auth { level } => self.on_auth(level).await,
            EngineResponse::GetUserData => self.on_get_userdata().await,
            EngineResponse::Start { url } => self.on_start(url),
            EngineResponse::LoadResp { tag, payload } => self.on_load_response(tag, payload),
            EngineResponse::State(value) => {
                self.state.lock().engine_state = Some(value);
            }
            EngineResponse::Status(status) => self.on_status(status),
            EngineResponse::Pause => {
                debug!("PAUSE from engine");
                self.gate.close();
                self.state.lock().playback = PlaybackState::Paused;
            }
            EngineResponse::Resume => {
                debug!("RESUME from engine");
                self.state.lock().playback = PlaybackState::Running;
                self.gate.open_after(self.resume_delay);
            }
            EngineResponse::Stop => {}
            EngineResponse::Shutdown => {
                debug!("SHUTDOWN from engine");
                self.link.close().await;
            }
            EngineResponse::Event(name) => debug!("engine event {}", name),
            EngineResponse::Unknown(_) => {}
        }
    }

    async fn on_closed(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        warn!("engine control connection lost");
        self.fail_waiters(EngineError::Transport("engine link closed".to_string()));
        self.state.lock().playback = PlaybackState::Closed;
        self.gate.open();
    }
}
