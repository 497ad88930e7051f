//! Session store: persistence for session data.
//!
//! The [`SessionStore`] trait abstracts over storage backends. The built-in
//! implementation is [`InMemorySessionStore`], backed by a `DashMap` with lazy
//! eviction on read and a background reaper for entries nobody reads again.
//! Each entry carries its own TTL, set on every write and every touch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::Result;

/// Session contents: a JSON object keyed by attribute name.
pub type SessionData = serde_json::Map<String, serde_json::Value>;

/// Trait abstracting the session storage backend.
///
/// Implementations must be `Send + Sync` because one store is shared by the
/// session middleware and the Keycloak adapter across all requests.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Load a session. `None` if it does not exist or has expired.
    async fn get(&self, sid: &str) -> Result<Option<SessionData>>;

    /// Create or replace a session, expiring `ttl` from now.
    async fn set(&self, sid: &str, data: SessionData, ttl: Duration) -> Result<()>;

    /// Extend an existing session's lifetime without rewriting it.
    async fn touch(&self, sid: &str, ttl: Duration) -> Result<()>;

    /// Remove a session.
    async fn destroy(&self, sid: &str) -> Result<()>;

    /// Remove all expired sessions. Called periodically by the background reaper.
    async fn reap_expired(&self) -> usize;
}

struct StoredSession {
    data: SessionData,
    expires_at: Instant,
}

impl StoredSession {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory session store.
///
/// Sessions do not survive a restart and are not shared between gateway
/// instances.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, StoredSession>,
}

impl InMemorySessionStore {
    /// Create an empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions, expired ones included until reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, sid: &str) -> Result<Option<SessionData>> {
        let Some(entry) = self.sessions.get(sid) else {
            return Ok(None);
        };
        let expired = entry.is_expired();
        let data = entry.data.clone();
        drop(entry);

        if expired {
            // Lazy eviction: remove on access
            self.sessions.remove(sid);
            debug!("Lazy-evicted expired session");
            return Ok(None);
        }

        Ok(Some(data))
    }

    async fn set(&self, sid: &str, data: SessionData, ttl: Duration) -> Result<()> {
        self.sessions.insert(
            sid.to_string(),
            StoredSession {
                data,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn touch(&self, sid: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.sessions.get_mut(sid) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn destroy(&self, sid: &str) -> Result<()> {
        self.sessions.remove(sid);
        Ok(())
    }

    async fn reap_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired());
        before.saturating_sub(self.sessions.len())
    }
}

/// Spawn a background task that reaps expired sessions every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired sessions");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    });
}
