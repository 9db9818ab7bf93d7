/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::config::{HeartbeatConfig, ReconnectConfig, SessionConfig};
use crate::connection::{WebSocketConnection, WsMessage};
use crate::error::{StreamingError, StreamingResult};
use crate::events::{ConnectionState, EventCode, FailoverState, SessionEvent};
use crate::protocol::{InboundFrame, LoginResponse, ProtocolCodec, split_frames};
use crate::reconnect::EndpointRotation;
use crate::registry::SubscriptionRegistry;
use crate::resolver::ResolvedEndpoints;
use crate::stream::Stream;
use crate::token::TokenInfo;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Whether a connection can carry subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    NotReady,
    Ready,
    /// The connection gave up; it will not become ready again.
    Failed,
}

pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;
pub type TokenRequest = Arc<dyn Fn() + Send + Sync>;

/// What a connection borrows from its session.
#[derive(Clone)]
pub struct ConnectionContext {
    pub subscriptions: Arc<SubscriptionRegistry>,
    /// Latest access token, read when a login frame is built.
    pub token: watch::Receiver<Option<Arc<TokenInfo>>>,
    pub events: EventSink,
    /// Asks for a fresh token after a rejected login. `None` disables login retries.
    pub request_token: Option<TokenRequest>,
}

/// Per-connection policies taken from the session configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub close_timeout: Duration,
    pub max_login_retries: u32,
}

impl From<&SessionConfig> for ConnectionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            reconnect: config.reconnect.clone(),
            heartbeat: config.heartbeat.clone(),
            close_timeout: config.close_timeout,
            max_login_retries: config.max_login_retries,
        }
    }
}

enum Command {
    Send(Value),
    Reauthenticate(String),
    Close(oneshot::Sender<()>),
}

struct Shared {
    state: Mutex<ConnectionState>,
    ready: watch::Sender<ReadyState>,
    ping_timeout: Mutex<Option<Duration>>,
    max_message_size: Mutex<Option<u64>>,
    retries: AtomicU32,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_ready(&self, ready: ReadyState) {
        self.ready.send_if_modified(|current| {
            // Failed is final.
            if *current == ready || *current == ReadyState::Failed {
                return false;
            }
            *current = ready;
            true
        });
    }
}

/// One physical WebSocket connection for a named connection of a session.
///
/// The socket is owned by a background task that logs in, dispatches frames to the
/// streams of the subscription registry, keeps the socket alive and reconnects
/// through the candidate endpoints when it drops. Everything else talks to the task
/// through a command channel, so [`send`](StreamConnection::send) never blocks.
pub struct StreamConnection {
    name: String,
    streaming_session_id: u64,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    runner: Mutex<Option<Runner>>,
    task: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Arc<SubscriptionRegistry>,
    close_timeout: Duration,
    closed: AtomicBool,
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("name", &self.name)
            .field("streaming_session_id", &self.streaming_session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamConnection {
    /// Creates a connection that is not started yet.
    ///
    /// # Errors
    ///
    /// `StreamingError::Resolution` when `endpoints` lists no URI.
    pub fn new(
        name: impl Into<String>,
        streaming_session_id: u64,
        endpoints: &ResolvedEndpoints,
        codec: ProtocolCodec,
        settings: ConnectionSettings,
        context: ConnectionContext,
    ) -> StreamingResult<Self> {
        let name = name.into();
        let rotation = EndpointRotation::new(endpoints.uris.clone(), settings.reconnect.base_delay)?;
        let (ready, _) = watch::channel(ReadyState::NotReady);
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Closed),
            ready,
            ping_timeout: Mutex::new(None),
            max_message_size: Mutex::new(None),
            retries: AtomicU32::new(0),
        });
        let (commands, receiver) = mpsc::unbounded_channel();
        let subscriptions = context.subscriptions.clone();
        let close_timeout = settings.close_timeout;

        let runner = Runner {
            name: name.clone(),
            streaming_session_id,
            codec,
            rotation,
            headers: endpoints.headers.clone(),
            settings,
            context,
            commands: receiver,
            shared: shared.clone(),
            login_id: None,
            login_pending: false,
            login_token: None,
            deferred_token: None,
            login_attempts: 0,
            awaiting_token: false,
            failover: None,
            closing: false,
            close_ack: None,
        };

        Ok(Self {
            name,
            streaming_session_id,
            shared,
            commands,
            runner: Mutex::new(Some(runner)),
            task: Mutex::new(None),
            subscriptions,
            close_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn streaming_session_id(&self) -> u64 {
        self.streaming_session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.shared.ready.borrow()
    }

    /// Ping timeout advertised by the server at login.
    pub fn ping_timeout(&self) -> Option<Duration> {
        *self
            .shared
            .ping_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Maximum message size advertised by the server at login.
    pub fn max_message_size(&self) -> Option<u64> {
        *self
            .shared
            .max_message_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconnection attempts counted against the retry ceiling.
    pub fn retries(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    /// Spawns the connection task. Calling it again does nothing.
    pub fn start(&self) {
        let Some(runner) = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        info!(
            "Starting streaming connection '{}' ({})",
            self.name, self.streaming_session_id
        );
        self.shared.set_state(ConnectionState::Pending);
        let handle = tokio::spawn(runner.run());
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// `true` once the connection can no longer become ready.
    pub fn is_terminated(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.ready_state() == ReadyState::Failed {
            return true;
        }
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| handle.is_finished())
    }

    /// Waits until the connection is logged in.
    ///
    /// # Errors
    ///
    /// * `StreamingError::Connection` if the connection failed for good.
    /// * `StreamingError::Closed` if it was closed while waiting.
    pub async fn wait_ready(&self) -> StreamingResult<()> {
        let mut ready = self.shared.ready.subscribe();
        let outcome = match ready.wait_for(|state| *state != ReadyState::NotReady).await {
            Ok(state) => *state,
            Err(_) => ReadyState::Failed,
        };
        match outcome {
            ReadyState::Ready => Ok(()),
            _ if self.closed.load(Ordering::SeqCst) => Err(StreamingError::Closed(format!(
                "connection '{}' was closed",
                self.name
            ))),
            _ => Err(StreamingError::Connection(format!(
                "streaming connection to API '{}' failed",
                self.name
            ))),
        }
    }

    /// Queues a frame for the socket. Frames queued while disconnected are dropped.
    pub fn send(&self, frame: Value) {
        if self.commands.send(Command::Send(frame)).is_err() {
            debug!("Connection '{}' is gone, frame dropped", self.name);
        }
    }

    /// Hands a new access token to the connection without waiting for the outcome.
    pub fn reauthenticate(&self, token: String) {
        if self.commands.send(Command::Reauthenticate(token)).is_err() {
            debug!("Connection '{}' is gone, token not forwarded", self.name);
        }
    }

    /// Logs out, closes the socket and closes the streams of this connection locally.
    ///
    /// Waits at most the configured close timeout for the task. Closing twice does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing streaming connection '{}'", self.name);

        let never_started = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if !never_started {
            let (ack, done) = oneshot::channel();
            if self.commands.send(Command::Close(ack)).is_ok()
                && timeout(self.close_timeout, done).await.is_err()
            {
                warn!(
                    "Connection '{}' did not close within {:?}",
                    self.name, self.close_timeout
                );
            }
        }
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }

        self.shared.set_state(ConnectionState::Closed);
        self.shared.set_ready(ReadyState::Failed);
        for stream in self.subscriptions.streams_on(&self.name) {
            stream.close_locally();
        }
        info!("Streaming connection '{}' closed", self.name);
    }

    /// Stops a terminated connection without touching the streams, which may
    /// already be waiting on its replacement.
    pub(crate) fn discard(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.shared.set_state(ConnectionState::Closed);
        self.shared.set_ready(ReadyState::Failed);
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

/// Why the socket loop returned.
enum Exit {
    /// The socket dropped; reconnection may follow.
    Dropped,
    /// Closed on request.
    Closing,
    /// The connection failed for good.
    Terminal,
}

struct Runner {
    name: String,
    streaming_session_id: u64,
    codec: ProtocolCodec,
    rotation: EndpointRotation,
    headers: Vec<(String, String)>,
    settings: ConnectionSettings,
    context: ConnectionContext,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    login_id: Option<u64>,
    login_pending: bool,
    /// Token carried by the login in flight.
    login_token: Option<String>,
    /// Token that arrived while a login was in flight; sent once it is accepted.
    deferred_token: Option<String>,
    login_attempts: u32,
    awaiting_token: bool,
    failover: Option<FailoverState>,
    closing: bool,
    close_ack: Option<oneshot::Sender<()>>,
}

impl Runner {
    async fn run(mut self) {
        let endpoints = self.rotation.len() as u32;
        let mut first_connection = true;
        let mut num_retries: u32 = 0;

        while !self.closing {
            let uri = self.rotation.current_uri().to_string();
            self.shared.set_state(ConnectionState::Pending);
            debug!("Connection '{}' connecting to {}", self.name, uri);

            match WebSocketConnection::connect(&uri, Some(self.codec.sub_protocol()), &self.headers)
                .await
            {
                Ok(socket) => {
                    first_connection = false;
                    if self.failover == Some(FailoverState::Started) {
                        num_retries = 0;
                        self.shared.retries.store(0, Ordering::SeqCst);
                        self.rotation.reset();
                    }
                    self.emit(EventCode::StreamConnected, format!("Connected to {}", uri));
                    let exit = self.serve(&socket).await;
                    socket.close().await;
                    match exit {
                        Exit::Closing | Exit::Terminal => break,
                        Exit::Dropped => info!("Connection '{}' to {} dropped", self.name, uri),
                    }
                }
                Err(e) => warn!("Connection '{}' cannot reach {}: {}", self.name, uri, e),
            }

            if self.closing {
                break;
            }
            self.login_pending = false;
            self.awaiting_token = false;
            self.deferred_token = None;
            self.shared.set_ready(ReadyState::NotReady);

            if !self.settings.reconnect.enabled {
                self.terminate(format!(
                    "Streaming connection to API '{}' was disconnected.",
                    self.name
                ));
                break;
            }
            // A first connection that never succeeded gives up after one rotation.
            if first_connection && num_retries % endpoints == endpoints - 1 {
                self.terminate(format!("Streaming connection to API '{}' failed.", self.name));
                break;
            }
            if num_retries >= self.settings.reconnect.max_retry_rotations * endpoints {
                self.terminate(format!(
                    "Streaming connection to API '{}' cannot reconnect after multiple unsuccessful attempts.",
                    self.name
                ));
                break;
            }

            if self.failover != Some(FailoverState::Started) {
                self.start_failover();
            }
            let next = self.rotation.next_uri().to_string();
            let delay = self.rotation.delay();
            info!(
                "Connection '{}' reconnecting to {} in {:?}",
                self.name, next, delay
            );
            if self.pause(delay).await {
                break;
            }
            num_retries = if self.settings.reconnect.unbounded {
                0
            } else {
                num_retries + 1
            };
            self.shared.retries.store(num_retries, Ordering::SeqCst);
            if self.pause(self.settings.reconnect.loop_pause).await {
                break;
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        if let Some(ack) = self.close_ack.take() {
            let _ = ack.send(());
        }
        debug!("Connection task '{}' finished", self.name);
    }

    /// Sleeps while handling commands. Returns `true` when a close was requested.
    async fn pause(&mut self, duration: Duration) -> bool {
        let deadline = sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Send(_)) => {
                        debug!("Connection '{}' is reconnecting, frame dropped", self.name);
                    }
                    Some(Command::Reauthenticate(_)) => {
                        debug!("Connection '{}' will log in with the new token", self.name);
                    }
                    Some(Command::Close(ack)) => {
                        self.close_ack = Some(ack);
                        self.closing = true;
                        return true;
                    }
                    None => {
                        self.closing = true;
                        return true;
                    }
                },
            }
        }
    }

    async fn serve(&mut self, socket: &WebSocketConnection) -> Exit {
        if let Err(e) = self.send_login(socket).await {
            return match e {
                StreamingError::Authentication { message, .. } => {
                    self.terminate(format!(
                        "Streaming connection to API '{}' cannot log in: {}",
                        self.name, message
                    ));
                    Exit::Terminal
                }
                other => {
                    warn!("Connection '{}' failed to send login: {}", self.name, other);
                    Exit::Dropped
                }
            };
        }

        let heartbeat = self.settings.heartbeat.clone();
        let mut awaiting_pong: Option<Instant> = None;
        // Only inbound traffic proves the socket is alive.
        let mut last_inbound = Instant::now();

        loop {
            let wait = match (heartbeat.enabled, awaiting_pong) {
                (false, _) => Duration::from_secs(3600),
                (true, None) => heartbeat.idle_timeout.saturating_sub(last_inbound.elapsed()),
                (true, Some(since)) => self.pong_timeout().saturating_sub(since.elapsed()),
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = socket.send(&vec![frame]).await {
                            warn!("Connection '{}' failed to send: {}", self.name, e);
                            return Exit::Dropped;
                        }
                    }
                    Some(Command::Reauthenticate(token)) => {
                        if let Err(e) = self.on_new_token(socket, &token).await {
                            warn!("Connection '{}' failed to re-authenticate: {}", self.name, e);
                            return Exit::Dropped;
                        }
                    }
                    Some(Command::Close(ack)) => {
                        self.close_ack = Some(ack);
                        self.closing = true;
                        self.logout(socket).await;
                        return Exit::Closing;
                    }
                    None => {
                        self.closing = true;
                        self.logout(socket).await;
                        return Exit::Closing;
                    }
                },
                message = socket.receive_with_timeout(wait) => match message {
                    Ok(None) if !heartbeat.enabled => {}
                    Ok(None) => {
                        if awaiting_pong.is_some() {
                            warn!(
                                "Connection '{}' received no pong within {:?}",
                                self.name,
                                self.pong_timeout()
                            );
                            return Exit::Dropped;
                        }
                        debug!("Connection '{}' idle, sending ping", self.name);
                        let sent = match self.codec.ping_frame() {
                            Some(ping) => socket.send(&vec![ping]).await,
                            None => socket.ping().await,
                        };
                        if let Err(e) = sent {
                            warn!("Connection '{}' failed to ping: {}", self.name, e);
                            return Exit::Dropped;
                        }
                        awaiting_pong = Some(Instant::now());
                    }
                    Ok(Some(WsMessage::Text(text))) => {
                        awaiting_pong = None;
                        last_inbound = Instant::now();
                        if let Some(exit) = self.handle_text(socket, &text).await {
                            return exit;
                        }
                    }
                    Ok(Some(WsMessage::Ping)) | Ok(Some(WsMessage::Pong)) => {
                        awaiting_pong = None;
                        last_inbound = Instant::now();
                    }
                    Ok(Some(WsMessage::Binary(size))) => {
                        awaiting_pong = None;
                        last_inbound = Instant::now();
                        debug!("Connection '{}' ignored {} binary bytes", self.name, size);
                    }
                    Ok(Some(WsMessage::Closed(reason))) => {
                        info!("Connection '{}' closed by server: {:?}", self.name, reason);
                        return Exit::Dropped;
                    }
                    Err(e) => {
                        warn!("Connection '{}' socket error: {}", self.name, e);
                        return Exit::Dropped;
                    }
                },
            }
        }
    }

    fn pong_timeout(&self) -> Duration {
        self.shared
            .ping_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(self.settings.heartbeat.ping_timeout)
    }

    fn current_token(&self) -> Option<String> {
        self.context
            .token
            .borrow()
            .as_ref()
            .map(|token| token.access_token.clone())
    }

    /// Sends a login on a new login stream. Only one login is in flight at a time.
    async fn send_login(&mut self, socket: &WebSocketConnection) -> StreamingResult<()> {
        if self.login_pending {
            debug!("Connection '{}' already has a login in flight", self.name);
            return Ok(());
        }
        let id = self.context.subscriptions.next_id();
        let token = self.current_token();
        let frame = self.codec.login_frame(id, token.as_deref())?;
        self.login_id = Some(id);
        self.login_pending = true;
        self.login_token = token;
        self.deferred_token = None;
        debug!("Connection '{}' logging in with id {}", self.name, id);
        socket.send(&vec![frame]).await
    }

    async fn on_new_token(&mut self, socket: &WebSocketConnection, token: &str) -> StreamingResult<()> {
        if self.awaiting_token {
            self.awaiting_token = false;
            return self.send_login(socket).await;
        }
        if self.login_pending {
            if self.login_token.as_deref() != Some(token) {
                debug!("Connection '{}' login in flight, token kept for later", self.name);
                self.deferred_token = Some(token.to_string());
            }
            return Ok(());
        }
        self.send_reauthentication(socket, token).await
    }

    /// Re-sends the login on the current login stream with `token`.
    async fn send_reauthentication(
        &mut self,
        socket: &WebSocketConnection,
        token: &str,
    ) -> StreamingResult<()> {
        let Some(id) = self.login_id else {
            return Ok(());
        };
        debug!("Connection '{}' re-authenticating login stream {}", self.name, id);
        let frame = self.codec.login_frame(id, Some(token))?;
        self.login_token = Some(token.to_string());
        socket.send(&vec![frame]).await
    }

    async fn logout(&mut self, socket: &WebSocketConnection) {
        let Some(id) = self.login_id.take() else {
            return;
        };
        match self.codec.logout_frame(id) {
            Ok(frame) => {
                if let Err(e) = socket.send(&vec![frame]).await {
                    debug!("Connection '{}' logout not sent: {}", self.name, e);
                }
            }
            Err(e) => debug!("Connection '{}' cannot build logout: {}", self.name, e),
        }
    }

    async fn handle_text(&mut self, socket: &WebSocketConnection, text: &str) -> Option<Exit> {
        let frames = match split_frames(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Connection '{}' dropped a malformed message: {}", self.name, e);
                return None;
            }
        };

        for frame in frames {
            match self.codec.classify(&frame, self.login_id) {
                InboundFrame::Login(response) => {
                    if let Some(exit) = self.on_login(socket, response).await {
                        return Some(exit);
                    }
                }
                InboundFrame::Refresh { id, complete } => {
                    if let Some(stream) = self.stream(id) {
                        stream.deliver_refresh(&frame, complete);
                    }
                }
                InboundFrame::Update { id } => {
                    if let Some(stream) = self.stream(id) {
                        stream.deliver_update(&frame);
                    }
                }
                InboundFrame::Status { id } => {
                    if let Some(stream) = self.stream(id) {
                        stream.deliver_status(&frame);
                    }
                }
                InboundFrame::Error { id: Some(id) } => {
                    if let Some(stream) = self.stream(id) {
                        stream.deliver_error(&frame);
                    }
                }
                InboundFrame::Error { id: None } => {
                    error!("Connection '{}' received an error: {}", self.name, frame);
                }
                InboundFrame::Ack { id } => debug!("Connection '{}' ack for {}", self.name, id),
                InboundFrame::Ping => {
                    if let Some(pong) = self.codec.pong_frame() {
                        if let Err(e) = socket.send(&vec![pong]).await {
                            warn!("Connection '{}' failed to answer ping: {}", self.name, e);
                            return Some(Exit::Dropped);
                        }
                    }
                }
                InboundFrame::Pong => debug!("Connection '{}' pong", self.name),
                InboundFrame::Unsupported(kind) => {
                    debug!("Connection '{}' ignored '{}' frame", self.name, kind)
                }
            }
        }
        None
    }

    fn stream(&self, id: u64) -> Option<Arc<Stream>> {
        let stream = self.context.subscriptions.get(id);
        if stream.is_none() {
            debug!(
                "Connection '{}' received a frame for unknown subscription {}",
                self.name, id
            );
        }
        stream
    }

    async fn on_login(&mut self, socket: &WebSocketConnection, response: LoginResponse) -> Option<Exit> {
        if response.accepted {
            if !self.login_pending {
                debug!("Connection '{}' login refreshed: {}", self.name, response.text);
                return None;
            }
            self.login_pending = false;
            self.login_attempts = 0;
            if let Some(seconds) = response.ping_timeout {
                *self
                    .shared
                    .ping_timeout
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Duration::from_secs(seconds));
            }
            if let Some(size) = response.max_message_size {
                *self
                    .shared
                    .max_message_size
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(size);
            }
            self.shared.set_state(ConnectionState::Open);
            info!("Connection '{}' logged in", self.name);
            self.emit(
                EventCode::StreamAuthenticationSuccess,
                if response.text.is_empty() {
                    "Login accepted".to_string()
                } else {
                    response.text.clone()
                },
            );
            if let Some(token) = self.deferred_token.take() {
                if let Err(e) = self.send_reauthentication(socket, &token).await {
                    warn!("Connection '{}' failed to re-authenticate: {}", self.name, e);
                    return Some(Exit::Dropped);
                }
            }

            if self.failover == Some(FailoverState::Started) {
                if let Err(e) = self.resubscribe(socket).await {
                    warn!("Connection '{}' failed to resubscribe: {}", self.name, e);
                    return Some(Exit::Dropped);
                }
                self.complete_failover();
            }
            self.shared.set_ready(ReadyState::Ready);
            return None;
        }

        warn!("Connection '{}' login rejected: {}", self.name, response.text);
        self.login_pending = false;
        self.shared.set_state(ConnectionState::Pending);
        self.emit(EventCode::StreamAuthenticationFailed, response.text.clone());
        self.shared.set_ready(ReadyState::NotReady);
        if self.failover == Some(FailoverState::Started) {
            self.broadcast_failover(FailoverState::Started, "Login rejected, waiting for a new token");
        }
        self.login_attempts += 1;

        let retry = self
            .context
            .request_token
            .clone()
            .filter(|_| self.codec.uses_token())
            .filter(|_| self.login_attempts <= self.settings.max_login_retries);
        match retry {
            Some(request) => {
                info!(
                    "Connection '{}' requesting a new token (attempt {})",
                    self.name, self.login_attempts
                );
                self.awaiting_token = true;
                request();
                None
            }
            None => {
                self.terminate(format!(
                    "Streaming connection to API '{}' login failed: {}",
                    self.name, response.text
                ));
                Some(Exit::Terminal)
            }
        }
    }

    /// Resends the subscribe frame of every open or pending stream of this connection.
    async fn resubscribe(&self, socket: &WebSocketConnection) -> StreamingResult<()> {
        let mut frames = Vec::new();
        for stream in self.context.subscriptions.streams_on(&self.name) {
            if !stream.is_active() {
                continue;
            }
            match stream.subscribe_frame() {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!("Stream '{}' not resubscribed: {}", stream.name(), e),
            }
        }
        info!("Connection '{}' resubscribing {} streams", self.name, frames.len());
        for frame in frames {
            socket.send(&vec![frame]).await?;
        }
        Ok(())
    }

    fn emit(&self, code: EventCode, message: impl Into<String>) {
        (self.context.events)(SessionEvent::stream(
            code,
            message,
            &self.name,
            self.streaming_session_id,
        ));
    }

    fn start_failover(&mut self) {
        self.failover = Some(FailoverState::Started);
        self.emit(
            EventCode::StreamReconnecting,
            format!("Reconnecting streaming connection '{}'", self.name),
        );
        self.broadcast_failover(FailoverState::Started, "Connection lost, reconnecting");
    }

    fn complete_failover(&mut self) {
        self.failover = Some(FailoverState::Completed);
        self.emit(
            EventCode::StreamConnected,
            format!("Streaming connection '{}' reconnected", self.name),
        );
        self.broadcast_failover(FailoverState::Completed, "Connection restored");
    }

    fn terminate(&mut self, message: String) {
        error!("{}", message);
        self.failover = Some(FailoverState::Error);
        self.shared.set_state(ConnectionState::Closed);
        self.emit(EventCode::StreamDisconnected, message.clone());
        self.broadcast_failover(FailoverState::Error, &message);
        self.shared.set_ready(ReadyState::Failed);
    }

    /// Delivers a locally built status frame to every stream of this connection.
    fn broadcast_failover(&self, state: FailoverState, text: &str) {
        let (stream_state, data_state) = match state {
            FailoverState::Started => ("Open", "Suspect"),
            FailoverState::Completed => ("Open", "Ok"),
            FailoverState::Error => ("Closed", "Suspect"),
        };
        for stream in self.context.subscriptions.streams_on(&self.name) {
            let Some(id) = stream.id() else {
                continue;
            };
            match self.codec.status_frame(
                id,
                &stream.name(),
                stream_state,
                data_state,
                state.status_code(),
                text,
            ) {
                Ok(frame) => stream.deliver_status(&frame),
                Err(e) => warn!("Cannot build status for stream {}: {}", id, e),
            }
        }
    }
}
