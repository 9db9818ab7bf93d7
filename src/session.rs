/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::config::{DacsParams, FALLBACK_POSITION, Protocol, SessionConfig};
use crate::error::{StreamingError, StreamingResult};
use crate::events::{EventCode, SessionEvent, SessionState, StreamState};
use crate::protocol::{DeployedLogin, ProtocolCodec, TokenLogin};
use crate::registry::{SessionRegistry, SubscriptionRegistry};
use crate::resolver::ConnectionResolver;
use crate::stream::{Stream, StreamListener};
use crate::stream_connection::{
    ConnectionContext, ConnectionSettings, EventSink, StreamConnection, TokenRequest,
};
use crate::token::{TokenInfo, TokenProvider, mask_token};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Called with the new session state and a description.
pub type StateCallback = Arc<dyn Fn(SessionState, &str) + Send + Sync>;
/// Called for every session and streaming connection event.
pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Builds a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    registry: Option<Arc<SessionRegistry>>,
    on_state: Option<StateCallback>,
    on_event: Option<EventCallback>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            registry: None,
            on_state: None,
            on_event: None,
        }
    }

    /// Registry the session registers with. Defaults to [`SessionRegistry::global`].
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn on_state<F>(mut self, callback: F) -> Self
    where
        F: Fn(SessionState, &str) + Send + Sync + 'static,
    {
        self.on_state = Some(Arc::new(callback));
        self
    }

    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    /// # Errors
    ///
    /// * `StreamingError::Http` when the HTTP client cannot be built.
    /// * `StreamingError::Config` from the token provider.
    pub fn build(self) -> StreamingResult<Session> {
        let config = self.config;
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let token_provider = match config.grant {
            Some(_) => Some(TokenProvider::new(&config, http.clone())?),
            None => None,
        };
        let (access_token, _) = watch::channel(
            config
                .access_token
                .as_ref()
                .map(|token| Arc::new(TokenInfo::fixed(token.clone()))),
        );
        let resolver = ConnectionResolver::new(
            http,
            config.platform_url.clone(),
            config.app_key.clone(),
            config.connections.clone(),
        );

        Ok(Session {
            inner: Arc::new(SessionInner {
                id: Mutex::new(None),
                state: Mutex::new(SessionState::Closed),
                registry: self.registry.unwrap_or_else(SessionRegistry::global),
                subscriptions: Arc::new(SubscriptionRegistry::new()),
                resolver,
                token_provider,
                access_token,
                connections: Mutex::new(Vec::new()),
                start_lock: tokio::sync::Mutex::new(()),
                stream_status: Mutex::new(HashMap::new()),
                last_event: Mutex::new(None),
                on_state: self.on_state,
                on_event: self.on_event,
                forwarder: Mutex::new(None),
                login_defaults: OnceCell::new(),
                config,
            }),
        })
    }
}

pub(crate) struct SessionInner {
    id: Mutex<Option<u64>>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    registry: Arc<SessionRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    resolver: ConnectionResolver,
    token_provider: Option<TokenProvider>,
    access_token: watch::Sender<Option<Arc<TokenInfo>>>,
    /// Live connections in the order they were started.
    connections: Mutex<Vec<Arc<StreamConnection>>>,
    start_lock: tokio::sync::Mutex<()>,
    stream_status: Mutex<HashMap<String, EventCode>>,
    last_event: Mutex<Option<(EventCode, String)>>,
    on_state: Option<StateCallback>,
    on_event: Option<EventCallback>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Application id and position of token logins, looked up once.
    login_defaults: OnceCell<DacsParams>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionInner {
    pub(crate) fn session_id(&self) -> Option<u64> {
        *lock(&self.id)
    }

    pub(crate) fn set_session_id(&self, id: Option<u64>) {
        *lock(&self.id) = id;
    }

    pub(crate) fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub(crate) fn stream_open_timeout(&self) -> Duration {
        self.config.stream_open_timeout
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SessionState, message: &str) {
        *lock(&self.state) = state;
        info!("Session {:?} is {}: {}", self.session_id(), state, message);
        if let Some(callback) = &self.on_state {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(state, message))).is_err() {
                error!("on_state callback panicked");
            }
        }
    }

    fn connection(&self, name: &str) -> Option<Arc<StreamConnection>> {
        lock(&self.connections)
            .iter()
            .find(|connection| connection.name() == name)
            .cloned()
    }

    /// Routes a frame to the named connection. Unknown names are logged.
    pub(crate) fn send(&self, name: &str, frame: Value) {
        match self.connection(name) {
            Some(connection) => connection.send(frame),
            None => error!("No streaming connection named '{}', frame dropped", name),
        }
    }

    /// Forwards an event to the caller unless it comes from a connection that is no
    /// longer live.
    fn handle_event(&self, event: SessionEvent) {
        if let (Some(name), Some(id)) = (&event.connection_name, event.streaming_session_id) {
            let live = lock(&self.connections)
                .iter()
                .any(|connection| connection.name() == name && connection.streaming_session_id() == id);
            if !live {
                debug!("Dropping event from stale connection: {}", event);
                return;
            }
            lock(&self.stream_status).insert(name.clone(), event.code);
        }
        debug!("Session event {}", event);
        *lock(&self.last_event) = Some((event.code, event.message.clone()));

        if let Some(callback) = &self.on_event {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!("on_event callback panicked while handling {}", event.code);
            }
        }
    }

    /// Stores a new token and hands it to every connection without waiting.
    fn set_access_token(&self, token: Arc<TokenInfo>) {
        debug!("New access token {}", mask_token(&token.access_token));
        self.access_token.send_replace(Some(token.clone()));
        let connections = lock(&self.connections).clone();
        for connection in connections {
            connection.reauthenticate(token.access_token.clone());
        }
    }

    fn request_stream_authentication_token(&self) {
        match &self.token_provider {
            Some(provider) => provider.request_new_token(),
            None => warn!("A new token was requested but the session has no grant"),
        }
    }

    fn current_token(&self) -> Option<String> {
        self.access_token
            .borrow()
            .as_ref()
            .map(|token| token.access_token.clone())
    }

    async fn authorize(self: &Arc<Self>) -> StreamingResult<()> {
        let Some(provider) = &self.token_provider else {
            debug!("Session has no grant, skipping authorization");
            return Ok(());
        };

        let weak = Arc::downgrade(self);
        provider.set_event_hook(Arc::new(move |code: EventCode, message: String| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(SessionEvent::session(code, message));
            }
        }));

        let token = provider.authorize(self.config.auth_timeout).await?;
        self.access_token.send_replace(Some(token));

        let mut updates = provider.subscribe();
        let weak = Arc::downgrade(self);
        let forwarder = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let token = updates.borrow_and_update().clone();
                let (Some(token), Some(inner)) = (token, weak.upgrade()) else {
                    continue;
                };
                inner.set_access_token(token);
            }
        });
        if let Some(previous) = lock(&self.forwarder).replace(forwarder) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_background(&self) {
        if let Some(provider) = &self.token_provider {
            provider.stop();
        }
        if let Some(forwarder) = lock(&self.forwarder).take() {
            forwarder.abort();
        }
    }

    fn unregister(&self) {
        if let Some(id) = self.session_id() {
            if let Err(e) = self.registry.unregister(id) {
                debug!("Session {} was not registered: {}", id, e);
            }
        }
    }

    fn connection_context(self: &Arc<Self>) -> ConnectionContext {
        let weak: Weak<SessionInner> = Arc::downgrade(self);
        let events: EventSink = Arc::new(move |event: SessionEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_event(event);
            }
        });
        let request_token = self.token_provider.as_ref().map(|_| {
            let weak = Arc::downgrade(self);
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.request_stream_authentication_token();
                }
            }) as TokenRequest
        });
        ConnectionContext {
            subscriptions: self.subscriptions.clone(),
            token: self.access_token.subscribe(),
            events,
            request_token,
        }
    }

    /// Returns the logged in connection for `name`, starting it if needed.
    ///
    /// # Errors
    ///
    /// * `StreamingError::Session` when the session is not open.
    /// * `StreamingError::Config` for an unknown name or a protocol mismatch.
    /// * Resolution errors, or `StreamingError::Connection` when the connection failed.
    pub(crate) async fn ensure_connection(
        self: &Arc<Self>,
        name: &str,
        protocol: Option<Protocol>,
    ) -> StreamingResult<Arc<StreamConnection>> {
        if self.state() != SessionState::Open {
            return Err(StreamingError::Session(format!(
                "session is {}, cannot use connection '{}'",
                self.state(),
                name
            )));
        }

        let connection = {
            let _start = self.start_lock.lock().await;
            match self.connection(name) {
                Some(connection) if !connection.is_terminated() => connection,
                stale => {
                    if let Some(stale) = stale {
                        debug!("Replacing terminated connection '{}'", name);
                        lock(&self.connections).retain(|known| !Arc::ptr_eq(known, &stale));
                        stale.discard();
                    }
                    self.start_connection(name, protocol).await?
                }
            }
        };

        connection.wait_ready().await?;
        Ok(connection)
    }

    /// Local login parameters. The host lookup runs once, off the runtime threads.
    async fn login_defaults(&self) -> DacsParams {
        self.login_defaults
            .get_or_init(|| async {
                tokio::task::spawn_blocking(DacsParams::default)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Cannot determine the local position: {}", e);
                        DacsParams::new("user", "256", FALLBACK_POSITION)
                    })
            })
            .await
            .clone()
    }

    async fn start_connection(
        self: &Arc<Self>,
        name: &str,
        protocol: Option<Protocol>,
    ) -> StreamingResult<Arc<StreamConnection>> {
        let config = self.resolver.config(name)?;
        if let Some(wanted) = protocol {
            if wanted != config.protocol {
                return Err(StreamingError::Config(format!(
                    "connection '{}' speaks {}, not {}",
                    name, config.protocol, wanted
                )));
            }
        }

        let endpoints = self
            .resolver
            .resolve(name, self.current_token().as_deref())
            .await?;
        let codec = match &config.dacs {
            Some(dacs) => ProtocolCodec::new(config.protocol).with_deployed_login(DeployedLogin {
                dacs: dacs.clone(),
            }),
            None => {
                let defaults = self.login_defaults().await;
                ProtocolCodec::new(config.protocol).with_token_login(TokenLogin {
                    application_id: defaults.application_id,
                    position: defaults.position,
                })
            }
        };

        let connection = Arc::new(StreamConnection::new(
            name,
            self.registry.next_streaming_session_id(),
            &endpoints,
            codec,
            ConnectionSettings::from(&self.config),
            self.connection_context(),
        )?);
        lock(&self.connections).push(connection.clone());
        self.handle_event(SessionEvent::stream(
            EventCode::StreamConnecting,
            format!("Connecting streaming connection '{}'", name),
            name,
            connection.streaming_session_id(),
        ));
        connection.start();
        Ok(connection)
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(forwarder) = lock(&self.forwarder).take() {
            forwarder.abort();
        }
    }
}

/// Entry point of the library: authorizes, owns the streaming connections and the
/// subscriptions made through it.
///
/// `Session` is a cheap handle; clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Session without callbacks, registered with the global registry.
    pub fn new(config: SessionConfig) -> StreamingResult<Self> {
        SessionBuilder::new(config).build()
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Id assigned by the session registry while the session is open.
    pub fn session_id(&self) -> Option<u64> {
        self.inner.session_id()
    }

    /// Opens the session: registers it and obtains the first access token.
    ///
    /// Returns immediately when the session is already open or opening.
    ///
    /// # Errors
    ///
    /// * `StreamingError::Authentication` when the token endpoint rejects the grant.
    /// * `StreamingError::Timeout` when no token arrives within the auth timeout.
    ///
    /// The session is Closed after an error.
    pub async fn open(&self) -> StreamingResult<()> {
        {
            let mut state = lock(&self.inner.state);
            if matches!(*state, SessionState::Pending | SessionState::Open) {
                return Ok(());
            }
            *state = SessionState::Pending;
        }
        let id = self.inner.registry.register(&self.inner);
        self.inner.set_state(SessionState::Pending, "Session is pending");

        match self.inner.authorize().await {
            Ok(()) => {
                info!("Session {} opened", id);
                self.inner.set_state(SessionState::Open, "Session is opened");
                Ok(())
            }
            Err(e) => {
                error!("Session {} failed to open: {}", id, e);
                self.inner.stop_background();
                self.inner.unregister();
                self.inner
                    .set_state(SessionState::Closed, &format!("Session failed to open: {}", e));
                Err(e)
            }
        }
    }

    /// Closes every connection and stream and unregisters the session.
    /// Closing a closed session does nothing.
    pub async fn close(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        let connections = std::mem::take(&mut *lock(&self.inner.connections));
        for connection in connections {
            connection.close().await;
        }
        self.inner.stop_background();
        for stream in self.inner.subscriptions.all() {
            stream.close_locally();
        }
        self.inner.unregister();
        self.inner.set_state(SessionState::Closed, "Session is closed");
        self.inner.handle_event(SessionEvent::session(
            EventCode::SessionDisconnected,
            "Session closed",
        ));
    }

    /// Creates a stream without opening it.
    pub fn stream(&self, listener: StreamListener) -> Arc<Stream> {
        Stream::new(listener, Arc::downgrade(&self.inner))
    }

    /// Creates a stream and opens it with updates.
    ///
    /// # Errors
    ///
    /// See [`Stream::open_with`].
    pub async fn subscribe(&self, listener: StreamListener) -> StreamingResult<Arc<Stream>> {
        let stream = self.stream(listener);
        stream.open().await?;
        Ok(stream)
    }

    pub fn unsubscribe(&self, stream: &Stream) -> StreamState {
        stream.close()
    }

    /// Sends a raw frame on the named connection. Unknown names are logged, not reported.
    pub fn send(&self, connection_name: &str, frame: Value) {
        self.inner.send(connection_name, frame);
    }

    /// Replaces the access token and re-authenticates every connection with it.
    pub fn set_access_token(&self, token: impl Into<String>) {
        self.inner
            .set_access_token(Arc::new(TokenInfo::fixed(token.into())));
    }

    /// Starts the named connection if needed and reports whether it logged in.
    pub async fn wait_for_streaming(&self, connection_name: &str) -> bool {
        match self.inner.ensure_connection(connection_name, None).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Streaming connection '{}' unavailable: {}", connection_name, e);
                false
            }
        }
    }

    /// Waits for a reconnecting connection to log in again.
    pub async fn wait_for_streaming_reconnection(&self, connection_name: &str) -> bool {
        match self.inner.connection(connection_name) {
            Some(connection) => connection.wait_ready().await.is_ok(),
            None => false,
        }
    }

    pub fn connection(&self, connection_name: &str) -> Option<Arc<StreamConnection>> {
        self.inner.connection(connection_name)
    }

    /// Streams currently registered with this session, ordered by id.
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.inner.subscriptions.all()
    }

    /// Last event code reported by the named connection.
    pub fn stream_status(&self, connection_name: &str) -> Option<EventCode> {
        lock(&self.inner.stream_status)
            .get(connection_name)
            .copied()
    }

    pub fn last_event_code(&self) -> Option<EventCode> {
        lock(&self.inner.last_event).as_ref().map(|(code, _)| *code)
    }

    pub fn last_event_message(&self) -> Option<String> {
        lock(&self.inner.last_event)
            .as_ref()
            .map(|(_, message)| message.clone())
    }
}
