/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::error::{StreamingError, StreamingResult};
use crate::session::{Session, SessionInner};
use crate::stream::Stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tracing::debug;

#[derive(Default)]
struct Subscriptions {
    streams: HashMap<u64, Weak<Stream>>,
    by_connection: HashMap<String, Vec<u64>>,
}

impl Subscriptions {
    /// Forgets streams that were dropped without being closed.
    fn prune(&mut self) {
        let Self {
            streams,
            by_connection,
        } = self;
        let before = streams.len();
        streams.retain(|_, stream| stream.strong_count() > 0);
        if streams.len() == before {
            return;
        }
        by_connection.retain(|_, ids| {
            ids.retain(|id| streams.contains_key(id));
            !ids.is_empty()
        });
        debug!("Pruned {} dropped streams", before - streams.len());
    }
}

/// Maps request ids to live streams for one session.
///
/// Entries are weak: the registry never keeps a stream alive. Login ids are drawn
/// from the same counter so they never collide with stream ids.
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    inner: Mutex<Subscriptions>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Subscriptions::default()),
        }
    }

    /// Next request id. Ids are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Assigns a fresh id to `stream` and indexes it by connection name.
    ///
    /// Registering the same stream twice returns its current id.
    ///
    /// # Errors
    ///
    /// `StreamingError::Registry` when the stream carries an id bound to another
    /// live stream, or an id this registry does not know.
    pub fn register(&self, stream: &Arc<Stream>) -> StreamingResult<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.prune();

        if let Some(id) = stream.id() {
            return match inner.streams.get(&id).and_then(Weak::upgrade) {
                Some(existing) if Arc::ptr_eq(&existing, stream) => Ok(id),
                Some(_) => Err(StreamingError::Registry(format!(
                    "id {} is already registered to another stream",
                    id
                ))),
                None => Err(StreamingError::Registry(format!(
                    "stream '{}' already carries id {} outside this registry",
                    stream.name(),
                    id
                ))),
            };
        }

        let id = self.next_id();
        stream.set_id(Some(id));
        inner.streams.insert(id, Arc::downgrade(stream));
        inner
            .by_connection
            .entry(stream.connection_name().to_string())
            .or_default()
            .push(id);
        debug!(
            "Registered stream '{}' with id {} on '{}'",
            stream.name(),
            id,
            stream.connection_name()
        );
        Ok(id)
    }

    /// Removes `stream` and clears its id.
    ///
    /// # Errors
    ///
    /// `StreamingError::Registry` when the stream has no id or its id is unknown.
    pub fn unregister(&self, stream: &Stream) -> StreamingResult<()> {
        let id = stream.id().ok_or_else(|| {
            StreamingError::Registry(format!("stream '{}' is not registered", stream.name()))
        })?;
        self.unregister_id(id)?;
        stream.set_id(None);
        Ok(())
    }

    /// # Errors
    ///
    /// `StreamingError::Registry` when `id` is unknown.
    pub fn unregister_id(&self, id: u64) -> StreamingResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.streams.remove(&id).is_none() {
            return Err(StreamingError::Registry(format!(
                "id {} is not registered",
                id
            )));
        }
        inner.by_connection.retain(|_, ids| {
            ids.retain(|known| *known != id);
            !ids.is_empty()
        });
        debug!("Unregistered stream id {}", id);
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<Arc<Stream>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .streams
            .get(&id)
            .and_then(Weak::upgrade)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.get(id).is_some()
    }

    /// Live streams of one connection, in registration order.
    pub fn streams_on(&self, connection_name: &str) -> Vec<Arc<Stream>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.prune();
        inner
            .by_connection
            .get(connection_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.streams.get(id).and_then(Weak::upgrade))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every live stream, ordered by id.
    pub fn all(&self) -> Vec<Arc<Stream>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.prune();
        let mut ids: Vec<u64> = inner.streams.keys().copied().collect();
        ids.sort_unstable();
        ids.iter()
            .filter_map(|id| inner.streams.get(id).and_then(Weak::upgrade))
            .collect()
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.prune();
        inner.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counter handing out streaming session ids to connections.
#[derive(Debug)]
pub struct StreamingSessionIds(AtomicU64);

impl Default for StreamingSessionIds {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl StreamingSessionIds {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Registry of open sessions.
///
/// Tests build their own instance; applications may share [`SessionRegistry::global`].
pub struct SessionRegistry {
    next_session_id: AtomicU64,
    streaming_ids: StreamingSessionIds,
    sessions: Mutex<HashMap<u64, Weak<SessionInner>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_session_id: AtomicU64::new(1),
            streaming_ids: StreamingSessionIds::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Process wide instance, created on first use.
    pub fn global() -> Arc<SessionRegistry> {
        static GLOBAL: OnceLock<Arc<SessionRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SessionRegistry::new())).clone()
    }

    /// Registers a session and returns its id. A registered session keeps its id.
    pub(crate) fn register(&self, session: &Arc<SessionInner>) -> u64 {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = session.session_id() {
            if sessions.contains_key(&id) {
                return id;
            }
        }
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        session.set_session_id(Some(id));
        sessions.insert(id, Arc::downgrade(session));
        debug!("Registered session {}", id);
        id
    }

    /// # Errors
    ///
    /// `StreamingError::Registry` when `id` is unknown.
    pub fn unregister(&self, id: u64) -> StreamingResult<()> {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(_) => {
                debug!("Unregistered session {}", id);
                Ok(())
            }
            None => Err(StreamingError::Registry(format!(
                "session {} is not registered",
                id
            ))),
        }
    }

    pub fn get(&self, id: u64) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(Weak::upgrade)
            .map(Session::from_inner)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_streaming_session_id(&self) -> u64 {
        self.streaming_ids.next()
    }
}
