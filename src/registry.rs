//! Registry of live sessions.
//!
//! The slab behind the mutex is the only state shared across sessions.
//! Every operation takes the lock once, does O(1) amortized work, and
//! never holds it across an await point.

use crate::error::ServerError;
use slab::Slab;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Unique, never reused session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one live session, for enumeration.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub age: Duration,
}

struct Entry {
    id: SessionId,
    peer: Option<SocketAddr>,
    registered_at: Instant,
}

struct Inner {
    slots: Slab<Entry>,
    next_id: u64,
}

/// Tracks every live session for cancellation and drain.
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    max_sessions: usize,
    /// Parent of every session's cancellation token.
    root: CancellationToken,
    /// Live session count, published after every mutation.
    live: watch::Sender<usize>,
}

impl SessionRegistry {
    /// Create a registry admitting at most `max_sessions` concurrent sessions.
    pub fn new(max_sessions: usize) -> Arc<Self> {
        let (live, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slots: Slab::with_capacity(max_sessions.min(4096)),
                next_id: 1,
            }),
            max_sessions,
            root: CancellationToken::new(),
            live,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a handle for a new session.
    ///
    /// The capacity check and the insert happen under the same lock, so
    /// concurrent callers can never overshoot `max_sessions`.
    pub fn register(
        self: &Arc<Self>,
        peer: Option<SocketAddr>,
    ) -> Result<SessionHandle, ServerError> {
        let mut inner = self.lock();
        if inner.slots.len() >= self.max_sessions {
            return Err(ServerError::CapacityExceeded {
                limit: self.max_sessions,
            });
        }

        let id = SessionId(inner.next_id);
        inner.next_id += 1;
        let key = inner.slots.insert(Entry {
            id,
            peer,
            registered_at: Instant::now(),
        });
        self.live.send_replace(inner.slots.len());
        drop(inner);

        trace!(session = %id, "Session registered");
        Ok(SessionHandle {
            registry: Arc::clone(self),
            key,
            id,
            cancel: self.root.child_token(),
        })
    }

    /// Remove the entry for `handle`. Removing twice is a no-op.
    pub fn deregister(&self, handle: &SessionHandle) {
        self.remove(handle.key, handle.id);
    }

    fn remove(&self, key: usize, id: SessionId) {
        let mut inner = self.lock();
        // Slab keys are reused, so only remove the slot if it is still ours.
        if inner.slots.get(key).is_some_and(|e| e.id == id) {
            inner.slots.remove(key);
            self.live.send_replace(inner.slots.len());
            trace!(session = %id, "Session deregistered");
        }
    }

    /// Signal cancellation to every registered session. Does not block.
    pub fn broadcast_cancel(&self) {
        self.root.cancel();
    }

    /// Wait until no sessions remain or `timeout` elapses.
    ///
    /// Returns `true` if the registry fully drained.
    pub async fn await_drain(&self, timeout: Duration) -> bool {
        let mut live = self.live.subscribe();
        let drained = tokio::time::timeout(timeout, live.wait_for(|n| *n == 0))
            .await
            .is_ok();
        drained
    }

    /// Enumerate live sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let inner = self.lock();
        let mut sessions: Vec<SessionInfo> = inner
            .slots
            .iter()
            .map(|(_, e)| SessionInfo {
                id: e.id,
                peer: e.peer,
                age: e.registered_at.elapsed(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

/// A session's view of its registry entry.
///
/// Dropping the handle deregisters the session, so the entry is released
/// on every exit path including task abort.
pub struct SessionHandle {
    registry: Arc<SessionRegistry>,
    key: usize,
    id: SessionId,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the registry broadcasts cancellation.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.registry.remove(self.key, self.id);
    }
}
