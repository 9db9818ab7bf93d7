/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::config::Protocol;
use crate::error::{StreamingError, StreamingResult};
use crate::events::StreamState;
use crate::messages::{
    OmmCloseMessage, OmmItemKey, OmmRequestMessage, RdpCloseMessage, RdpSubscribeMessage,
};
use crate::protocol::stream_state_of;
use crate::session::SessionInner;
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Default OMM domain; omitted from request frames.
pub const MARKET_PRICE: &str = "MarketPrice";

pub type MessageCallback = Arc<dyn Fn(&Stream, &Value) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&Stream) + Send + Sync>;

/// Caller supplied handlers. Every slot is optional.
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    pub on_refresh: Option<MessageCallback>,
    pub on_update: Option<MessageCallback>,
    pub on_status: Option<MessageCallback>,
    pub on_complete: Option<CompleteCallback>,
    pub on_error: Option<MessageCallback>,
}

/// An OMM item request.
#[derive(Debug, Clone, PartialEq)]
pub struct OmmListener {
    pub name: String,
    pub service: Option<String>,
    pub domain: String,
    pub fields: Vec<String>,
    pub connection: String,
}

impl OmmListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: None,
            domain: MARKET_PRICE.to_string(),
            fields: Vec::new(),
            connection: "pricing".to_string(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    fn domain_field(&self) -> Option<String> {
        (self.domain != MARKET_PRICE).then(|| self.domain.clone())
    }
}

/// A data platform streaming request.
#[derive(Debug, Clone, PartialEq)]
pub struct RdpListener {
    pub universe: Vec<String>,
    pub service: Option<String>,
    pub views: Vec<String>,
    pub parameters: Option<Value>,
    pub connection: String,
}

impl RdpListener {
    pub fn new<I, S>(connection: impl Into<String>, universe: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            universe: universe.into_iter().map(Into::into).collect(),
            service: None,
            views: Vec::new(),
            parameters: None,
            connection: connection.into(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_views<I, S>(mut self, views: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.views = views.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// What a stream subscribes to. Decides the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerKind {
    Omm(OmmListener),
    Rdp(RdpListener),
}

impl From<OmmListener> for ListenerKind {
    fn from(listener: OmmListener) -> Self {
        ListenerKind::Omm(listener)
    }
}

impl From<RdpListener> for ListenerKind {
    fn from(listener: RdpListener) -> Self {
        ListenerKind::Rdp(listener)
    }
}

impl ListenerKind {
    pub fn protocol(&self) -> Protocol {
        match self {
            ListenerKind::Omm(_) => Protocol::Omm,
            ListenerKind::Rdp(_) => Protocol::Rdp,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ListenerKind::Omm(listener) => listener.name.clone(),
            ListenerKind::Rdp(listener) => listener.universe.join(","),
        }
    }

    pub fn connection_name(&self) -> &str {
        match self {
            ListenerKind::Omm(listener) => &listener.connection,
            ListenerKind::Rdp(listener) => &listener.connection,
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            ListenerKind::Omm(listener) => listener.service.as_deref(),
            ListenerKind::Rdp(listener) => listener.service.as_deref(),
        }
    }

    /// Requested fields (OMM view) or views (RDP).
    pub fn fields(&self) -> &[String] {
        match self {
            ListenerKind::Omm(listener) => &listener.fields,
            ListenerKind::Rdp(listener) => &listener.views,
        }
    }

    pub fn subscribe_frame(&self, id: u64, with_updates: bool) -> StreamingResult<Value> {
        let fields = (!self.fields().is_empty()).then(|| self.fields().to_vec());
        match self {
            ListenerKind::Omm(listener) => Ok(serde_json::to_value(OmmRequestMessage {
                id,
                domain: listener.domain_field(),
                key: OmmItemKey {
                    name: listener.name.clone(),
                    service: listener.service.clone(),
                },
                streaming: with_updates,
                view: fields,
            })?),
            ListenerKind::Rdp(listener) => Ok(serde_json::to_value(RdpSubscribeMessage {
                stream_id: id.to_string(),
                method: "Subscribe".to_string(),
                service: listener.service.clone(),
                universe: listener.universe.clone(),
                views: fields,
                parameters: listener.parameters.clone(),
            })?),
        }
    }

    pub fn close_frame(&self, id: u64) -> StreamingResult<Value> {
        match self {
            ListenerKind::Omm(listener) => Ok(serde_json::to_value(OmmCloseMessage {
                id,
                domain: listener.domain_field(),
                message_type: "Close".to_string(),
            })?),
            ListenerKind::Rdp(_) => Ok(serde_json::to_value(RdpCloseMessage {
                stream_id: id.to_string(),
                method: "Close".to_string(),
            })?),
        }
    }
}

/// A subscription request together with its callbacks.
#[derive(Clone)]
pub struct StreamListener {
    pub kind: ListenerKind,
    pub callbacks: StreamCallbacks,
}

impl StreamListener {
    pub fn new(kind: impl Into<ListenerKind>) -> Self {
        Self {
            kind: kind.into(),
            callbacks: StreamCallbacks::default(),
        }
    }

    pub fn on_refresh<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Stream, &Value) + Send + Sync + 'static,
    {
        self.callbacks.on_refresh = Some(Arc::new(callback));
        self
    }

    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Stream, &Value) + Send + Sync + 'static,
    {
        self.callbacks.on_update = Some(Arc::new(callback));
        self
    }

    pub fn on_status<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Stream, &Value) + Send + Sync + 'static,
    {
        self.callbacks.on_status = Some(Arc::new(callback));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Stream) + Send + Sync + 'static,
    {
        self.callbacks.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Stream, &Value) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(callback));
        self
    }
}

enum CachedDelivery {
    Refresh(Value),
    Update(Value),
    Complete,
}

struct StreamInner {
    id: Option<u64>,
    state: StreamState,
    with_updates: bool,
    resume_state: Option<StreamState>,
    cache: Vec<CachedDelivery>,
    first_response: Option<oneshot::Sender<()>>,
    /// The subscribe frame went out since the stream was registered.
    subscribed: bool,
}

/// One subscribed item, multiplexed over a streaming connection.
///
/// Deliveries to a stream are serialized: its callbacks never run concurrently.
pub struct Stream {
    kind: ListenerKind,
    callbacks: StreamCallbacks,
    session: Weak<SessionInner>,
    inner: Mutex<StreamInner>,
    dispatch: Mutex<()>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(listener: StreamListener, session: Weak<SessionInner>) -> Arc<Self> {
        Arc::new(Self {
            kind: listener.kind,
            callbacks: listener.callbacks,
            session,
            inner: Mutex::new(StreamInner {
                id: None,
                state: StreamState::Closed,
                with_updates: true,
                resume_state: None,
                cache: Vec::new(),
                first_response: None,
                subscribed: false,
            }),
            dispatch: Mutex::new(()),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Option<u64> {
        self.lock_inner().id
    }

    pub(crate) fn set_id(&self, id: Option<u64>) {
        self.lock_inner().id = id;
    }

    pub fn state(&self) -> StreamState {
        self.lock_inner().state
    }

    #[cfg(test)]
    pub(crate) fn set_state(&self, state: StreamState) {
        self.lock_inner().state = state;
    }

    pub fn kind(&self) -> &ListenerKind {
        &self.kind
    }

    pub fn name(&self) -> String {
        self.kind.name()
    }

    pub fn connection_name(&self) -> &str {
        self.kind.connection_name()
    }

    pub fn protocol(&self) -> Protocol {
        self.kind.protocol()
    }

    pub fn with_updates(&self) -> bool {
        self.lock_inner().with_updates
    }

    fn session(&self) -> StreamingResult<Arc<SessionInner>> {
        self.session
            .upgrade()
            .ok_or_else(|| StreamingError::Session("the owning session is gone".to_string()))
    }

    /// Opens the stream with updates. See [`open_with`](Self::open_with).
    pub async fn open(self: &Arc<Self>) -> StreamingResult<StreamState> {
        self.open_with(true).await
    }

    /// Registers the stream, waits for its connection, sends the subscribe frame and
    /// waits for the first response.
    ///
    /// Returns immediately when already Open or Pending. A paused stream only records
    /// `with_updates`. When no response arrives within the session's stream open
    /// timeout the stream stays Pending and registered.
    ///
    /// # Errors
    ///
    /// Registration failures, or the connection could not be established.
    pub async fn open_with(self: &Arc<Self>, with_updates: bool) -> StreamingResult<StreamState> {
        {
            let mut inner = self.lock_inner();
            match inner.state {
                StreamState::Open | StreamState::Pending => return Ok(inner.state),
                StreamState::Paused => {
                    inner.with_updates = with_updates;
                    return Ok(StreamState::Paused);
                }
                StreamState::Closed => {}
            }
        }

        let session = self.session()?;
        let id = session.subscriptions().register(self)?;
        let response = {
            let mut inner = self.lock_inner();
            let (tx, rx) = oneshot::channel();
            inner.state = StreamState::Pending;
            inner.with_updates = with_updates;
            inner.first_response = Some(tx);
            inner.subscribed = false;
            rx
        };
        debug!("Opening stream '{}' with id {}", self.name(), id);

        if let Err(e) = session
            .ensure_connection(self.connection_name(), Some(self.protocol()))
            .await
        {
            warn!("Stream '{}' cannot reach its connection: {}", self.name(), e);
            self.close_locally();
            return Err(e);
        }

        // A reconnecting connection resubscribes pending streams before it reports ready.
        match self.first_subscribe_frame() {
            Ok(Some(frame)) => session.send(self.connection_name(), frame),
            Ok(None) => debug!("Stream {} already subscribed", id),
            Err(e) => {
                self.close_locally();
                return Err(e);
            }
        }
        let state = self.state();
        if matches!(state, StreamState::Closed | StreamState::Paused) {
            return Ok(state);
        }

        match timeout(session.stream_open_timeout(), response).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Stream {} was closed before its first response", id),
            Err(_) => warn!(
                "No response for stream '{}' (id {}) within {:?}",
                self.name(),
                id,
                session.stream_open_timeout()
            ),
        }
        Ok(self.state())
    }

    /// Sends the close frame, unregisters the stream and cancels a pending open.
    /// Closing a closed stream does nothing.
    pub fn close(&self) -> StreamState {
        let id = {
            let mut inner = self.lock_inner();
            if inner.state == StreamState::Closed {
                return StreamState::Closed;
            }
            inner.state = StreamState::Closed;
            inner.resume_state = None;
            inner.cache.clear();
            inner.first_response = None;
            inner.id
        };

        if let (Some(id), Some(session)) = (id, self.session.upgrade()) {
            match self.kind.close_frame(id) {
                Ok(frame) => session.send(self.connection_name(), frame),
                Err(e) => warn!("Cannot build close frame for stream {}: {}", id, e),
            }
            if let Err(e) = session.subscriptions().unregister(self) {
                debug!("Stream {} was already unregistered: {}", id, e);
            }
        }
        debug!("Stream '{}' closed", self.name());
        StreamState::Closed
    }

    /// Closes without telling the server, used when the connection is gone.
    pub(crate) fn close_locally(&self) {
        {
            let mut inner = self.lock_inner();
            inner.state = StreamState::Closed;
            inner.resume_state = None;
            inner.cache.clear();
            inner.first_response = None;
            if inner.id.is_none() {
                return;
            }
        }
        if let Some(session) = self.session.upgrade() {
            if let Err(e) = session.subscriptions().unregister(self) {
                debug!("Stream '{}' was already unregistered: {}", self.name(), e);
            }
        } else {
            self.set_id(None);
        }
    }

    /// Stops delivering refreshes and updates; they are kept and replayed on resume.
    pub fn pause(&self) -> StreamState {
        let mut inner = self.lock_inner();
        if matches!(inner.state, StreamState::Open | StreamState::Pending) {
            inner.resume_state = Some(inner.state);
            inner.state = StreamState::Paused;
        }
        inner.state
    }

    /// Restores the state held before [`pause`](Self::pause) and replays what arrived meanwhile.
    ///
    /// Must not be called from one of this stream's own callbacks.
    pub fn resume(&self) -> StreamState {
        let _serial = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, cached) = {
            let mut inner = self.lock_inner();
            if inner.state != StreamState::Paused {
                return inner.state;
            }
            inner.state = inner.resume_state.take().unwrap_or(StreamState::Open);
            (inner.state, std::mem::take(&mut inner.cache))
        };
        for delivery in cached {
            match delivery {
                CachedDelivery::Refresh(message) => {
                    self.invoke("on_refresh", self.callbacks.on_refresh.as_ref(), &message)
                }
                CachedDelivery::Update(message) => {
                    self.invoke("on_update", self.callbacks.on_update.as_ref(), &message)
                }
                CachedDelivery::Complete => self.invoke_complete(),
            }
        }
        state
    }

    /// Resubscribed after a reconnection.
    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state(), StreamState::Open | StreamState::Pending)
    }

    /// Subscribe frame for the current id. Marks the stream as subscribed.
    pub(crate) fn subscribe_frame(&self) -> StreamingResult<Value> {
        let mut inner = self.lock_inner();
        let id = inner.id.ok_or_else(|| {
            StreamingError::Registry(format!("stream '{}' is not registered", self.kind.name()))
        })?;
        let frame = self.kind.subscribe_frame(id, inner.with_updates)?;
        inner.subscribed = true;
        Ok(frame)
    }

    /// The opening subscribe frame, or `None` when it was already sent or the
    /// stream is no longer pending.
    fn first_subscribe_frame(&self) -> StreamingResult<Option<Value>> {
        let mut inner = self.lock_inner();
        if inner.subscribed || inner.state != StreamState::Pending {
            return Ok(None);
        }
        let id = inner.id.ok_or_else(|| {
            StreamingError::Registry(format!("stream '{}' is not registered", self.kind.name()))
        })?;
        let frame = self.kind.subscribe_frame(id, inner.with_updates)?;
        inner.subscribed = true;
        Ok(Some(frame))
    }

    pub(crate) fn deliver_refresh(&self, message: &Value, complete: bool) {
        let _serial = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let (responder, paused) = {
            let mut inner = self.lock_inner();
            match inner.state {
                StreamState::Closed => {
                    debug!("Dropping refresh for closed stream {:?}", inner.id);
                    return;
                }
                StreamState::Paused => {
                    inner.cache.push(CachedDelivery::Refresh(message.clone()));
                    if complete {
                        inner.cache.push(CachedDelivery::Complete);
                    }
                    if inner.resume_state == Some(StreamState::Pending) {
                        inner.resume_state = Some(StreamState::Open);
                    }
                    (inner.first_response.take(), true)
                }
                StreamState::Pending | StreamState::Open => {
                    inner.state = StreamState::Open;
                    (inner.first_response.take(), false)
                }
            }
        };

        if !paused {
            self.invoke("on_refresh", self.callbacks.on_refresh.as_ref(), message);
            if complete {
                self.invoke_complete();
            }
        }
        if let Some(responder) = responder {
            let _ = responder.send(());
        }
    }

    pub(crate) fn deliver_update(&self, message: &Value) {
        let _serial = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut inner = self.lock_inner();
            match inner.state {
                StreamState::Closed => {
                    debug!("Dropping update for closed stream {:?}", inner.id);
                    return;
                }
                StreamState::Paused => {
                    inner.cache.push(CachedDelivery::Update(message.clone()));
                    return;
                }
                StreamState::Pending | StreamState::Open => {}
            }
        }
        self.invoke("on_update", self.callbacks.on_update.as_ref(), message);
    }

    pub(crate) fn deliver_status(&self, message: &Value) {
        self.deliver_immediate("on_status", self.callbacks.on_status.as_ref(), message);
    }

    pub(crate) fn deliver_error(&self, message: &Value) {
        self.deliver_immediate("on_error", self.callbacks.on_error.as_ref(), message);
    }

    /// Status and error frames skip the pause cache. A closed stream state closes the stream.
    fn deliver_immediate(&self, slot: &'static str, callback: Option<&MessageCallback>, message: &Value) {
        let _serial = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let closed_by_server = stream_state_of(message) == Some("Closed");
        if closed_by_server {
            let mut inner = self.lock_inner();
            inner.state = StreamState::Closed;
            inner.resume_state = None;
            inner.cache.clear();
            inner.first_response = None;
        }
        self.invoke(slot, callback, message);
        if closed_by_server {
            debug!("Stream '{}' closed by {}", self.name(), slot);
            self.close_locally();
        }
    }

    fn invoke(&self, slot: &'static str, callback: Option<&MessageCallback>, message: &Value) {
        let Some(callback) = callback else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(self, message))).is_err() {
            error!(
                "{} callback of stream '{}' (id {:?}) panicked",
                slot,
                self.name(),
                self.id()
            );
        }
    }

    fn invoke_complete(&self) {
        let Some(callback) = self.callbacks.on_complete.as_ref() else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
            error!(
                "on_complete callback of stream '{}' (id {:?}) panicked",
                self.name(),
                self.id()
            );
        }
    }
}
