//! Per-connection session state and the shared session registry.
//!
//! A [`Session`] is created by the server for every accepted connection
//! and lives in the [`SessionRegistry`] until its close sequence has run.
//! Outbound writes go through a per-session async mutex so concurrent
//! `send` calls never interleave on the wire.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::framing::{FrameError, FramingStrategy, write_message};

/// Boxed outbound half of a connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opaque unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session has already been closed.
    #[error("session is closed")]
    Closed,

    /// Encoding or writing the message failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Server-side state for one accepted connection.
pub struct Session {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    framing: Arc<dyn FramingStrategy>,
    last_activity: parking_lot::Mutex<Instant>,
    closed: AtomicBool,
    idle_closed: AtomicBool,
    cancel: CancellationToken,
    attributes: DashMap<String, Arc<dyn Any + Send + Sync>>,
    registry: Weak<SessionRegistry>,
}

impl Session {
    /// Create a session around the outbound half of a connection.
    ///
    /// The session is not inserted into `registry`; the caller decides
    /// when it becomes visible to broadcasts and the keep-alive sweep.
    pub fn new(
        id: SessionId,
        remote_addr: Option<SocketAddr>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        framing: Arc<dyn FramingStrategy>,
        registry: &Arc<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            framing,
            last_activity: parking_lot::Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            idle_closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            attributes: DashMap::new(),
            registry: Arc::downgrade(registry),
        })
    }

    /// Unique id assigned at accept.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Peer address, if the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Write one framed message. Waits for any in-progress write on this
    /// session to finish first.
    pub async fn send(&self, message: impl AsRef<[u8]>) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        write_message(writer, self.framing.as_ref(), message.as_ref()).await?;
        Ok(())
    }

    /// Send `message` to every session in the registry, this one included.
    ///
    /// Returns how many deliveries succeeded. A failed recipient does not
    /// affect the others.
    pub async fn broadcast(&self, message: impl AsRef<[u8]>) -> usize {
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let message = message.as_ref();
        let recipients = registry.snapshot();
        let results = futures::future::join_all(recipients.iter().map(|s| s.send(message))).await;

        let mut delivered = 0;
        for (session, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(
                        session_id = %session.id,
                        error = %e,
                        "broadcast delivery failed"
                    )
                }
            }
        }
        delivered
    }

    /// Record inbound activity now.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: Instant) {
        *self.last_activity.lock() = at;
    }

    /// Whether the connection is still open.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Mark the session closed and cancel its read loop.
    ///
    /// Returns `true` only for the call that actually performed the close;
    /// every later or concurrent call is a no-op returning `false`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Close the session because it went idle.
    ///
    /// Same as [`close`](Self::close), but the read loop reports the end
    /// as an idle timeout instead of a local cancel.
    pub fn close_idle(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.idle_closed.store(true, Ordering::Release);
        self.close()
    }

    /// Whether the session was closed by [`close_idle`](Self::close_idle).
    pub fn closed_for_idle(&self) -> bool {
        self.idle_closed.load(Ordering::Acquire)
    }

    /// Close the session and shut down the outbound half of the connection.
    ///
    /// Waits for an in-progress write to finish before releasing the writer.
    pub async fn close_async(&self) -> bool {
        let first = self.close();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(e) = writer.shutdown().await
        {
            tracing::debug!(session_id = %self.id, error = %e, "error shutting down connection");
        }
        first
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Store an attribute, replacing any previous value under `key`.
    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.insert(key.into(), Arc::new(value));
    }

    /// Fetch an attribute if it exists and has type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = Arc::clone(self.attributes.get(key)?.value());
        value.downcast::<T>().ok()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.attributes.remove(key).is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("alive", &self.is_alive())
            .field("framing", &self.framing.name())
            .finish_non_exhaustive()
    }
}

/// Concurrent map of live sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any previous entry with the same id.
    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().clone(), session);
    }

    /// Unregister a session and hand it back.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Point-in-time copy of every registered session.
    ///
    /// No map shard lock is held once this returns, so callers may await
    /// on the sessions freely.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

/// A registered line-framed session over an in-memory pipe, plus the peer end.
#[cfg(test)]
pub(crate) fn test_session() -> (Arc<Session>, Arc<SessionRegistry>, tokio::io::DuplexStream) {
    let registry = Arc::new(SessionRegistry::new());
    let (local, peer) = tokio::io::duplex(64 * 1024);
    let framing: Arc<dyn FramingStrategy> = Arc::new(crate::framing::LineFraming::default());
    let session = Session::new(SessionId::random(), None, local, framing, &registry);
    registry.insert(Arc::clone(&session));
    (session, registry, peer)
}
