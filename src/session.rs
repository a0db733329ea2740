//! Session identities and the keyspace that scopes every cache key.
//!
//! A [`ScopedKey`] can only be built from a [`SessionScope`], so any cache
//! that stores `ScopedKey`s is session-isolated by construction: there is no
//! way to spell a key without naming the session it belongs to.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Sessions idle longer than this are expired by the maintenance sweep.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "inactivity_timeout_ms", with = "crate::config::duration_ms")]
    pub inactivity_timeout: Duration,
    /// Period of the maintenance sweep (session expiry, cache purge).
    #[serde(rename = "sweep_interval_ms", with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Opaque identity of a caller (user, conversation, API token...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a non-empty identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Config("session id must not be empty".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A live session: who it is and when it was last seen.
#[derive(Debug, Clone)]
pub struct SessionScope {
    session_id: SessionId,
    created_at: Instant,
    last_active: Instant,
}

impl SessionScope {
    fn new(session_id: SessionId, now: Instant) -> Self {
        Self {
            session_id,
            created_at: now,
            last_active: now,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Build the cache key for `logical_key` inside this session.
    pub fn scoped_key(&self, logical_key: &[u8]) -> ScopedKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.session_id.0.len() as u64).to_le_bytes());
        hasher.update(self.session_id.0.as_bytes());
        hasher.update(logical_key);
        ScopedKey {
            inner: ScopedKeyInner {
                session_id: self.session_id.clone(),
                digest: *hasher.finalize().as_bytes(),
            },
        }
    }
}

/// A cache key bound to exactly one session.
///
/// The digest already mixes in the session id; the id is also kept verbatim
/// so per-session invalidation does not need a reverse index and so caches
/// can check ownership on every read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedKey {
    inner: ScopedKeyInner,
}

/// Private inner struct - prevents construction outside this module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopedKeyInner {
    session_id: SessionId,
    digest: [u8; 32],
}

impl ScopedKey {
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.inner.digest
    }

    pub fn belongs_to(&self, session_id: &SessionId) -> bool {
        &self.inner.session_id == session_id
    }
}

/// Registry of live sessions.
///
/// Owned by the retrieval core and passed around by reference; there is no
/// global instance.
#[derive(Debug)]
pub struct SessionKeyspace {
    sessions: Mutex<HashMap<SessionId, SessionScope>>,
    inactivity_timeout: Duration,
}

impl SessionKeyspace {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            inactivity_timeout: config.inactivity_timeout,
        }
    }

    /// Return the scope for `session_id`, creating it on first use and
    /// marking it active.
    pub fn resolve(&self, session_id: &SessionId) -> SessionScope {
        self.resolve_at(session_id, Instant::now())
    }

    pub(crate) fn resolve_at(
        &self,
        session_id: &SessionId,
        now: Instant,
    ) -> SessionScope {
        let mut sessions = self.sessions.lock();
        let scope = sessions.entry(session_id.clone()).or_insert_with(|| {
            debug!(session = %session_id, "session created");
            SessionScope::new(session_id.clone(), now)
        });
        scope.last_active = now;
        scope.clone()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionScope> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Forget a session. Returns `false` if it was not live.
    pub fn end(&self, session_id: &SessionId) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// Drop every session idle for longer than the inactivity timeout and
    /// return their ids so the caller can cascade the invalidation.
    pub fn expire_inactive(&self) -> Vec<SessionId> {
        self.expire_inactive_at(Instant::now())
    }

    pub(crate) fn expire_inactive_at(&self, now: Instant) -> Vec<SessionId> {
        let mut expired = Vec::new();
        self.sessions.lock().retain(|id, scope| {
            let idle = now.saturating_duration_since(scope.last_active);
            if idle > self.inactivity_timeout {
                expired.push(id.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired inactive sessions");
        }
        expired
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn keyspace(timeout: Duration) -> SessionKeyspace {
        SessionKeyspace::new(&SessionConfig {
            inactivity_timeout: timeout,
            ..SessionConfig::default()
        })
    }

    #[test]
    fn empty_session_id_rejected() {
        assert!(SessionId::new("").is_err());
        assert!(SessionId::new("   ").is_err());
    }

    #[test]
    fn same_logical_key_differs_across_sessions() {
        let ks = keyspace(DEFAULT_INACTIVITY_TIMEOUT);
        let a = ks.resolve(&sid("alice")).scoped_key(b"cat dog");
        let b = ks.resolve(&sid("bob")).scoped_key(b"cat dog");

        assert_ne!(a, b);
        assert_ne!(a.digest(), b.digest());
        assert!(a.belongs_to(&sid("alice")));
        assert!(!a.belongs_to(&sid("bob")));
    }

    #[test]
    fn session_id_boundary_is_unambiguous() {
        let ks = keyspace(DEFAULT_INACTIVITY_TIMEOUT);
        let a = ks.resolve(&sid("ab")).scoped_key(b"c");
        let b = ks.resolve(&sid("a")).scoped_key(b"bc");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn resolve_touches_last_active() {
        let ks = keyspace(DEFAULT_INACTIVITY_TIMEOUT);
        let t0 = Instant::now();
        let first = ks.resolve_at(&sid("alice"), t0);
        let later = ks.resolve_at(&sid("alice"), t0 + Duration::from_secs(5));

        assert_eq!(first.created_at(), later.created_at());
        assert_eq!(later.last_active(), t0 + Duration::from_secs(5));
        assert_eq!(ks.len(), 1);
    }

    #[test]
    fn expire_inactive_only_drops_idle_sessions() {
        let ks = keyspace(Duration::from_secs(60));
        let t0 = Instant::now();
        ks.resolve_at(&sid("idle"), t0);
        ks.resolve_at(&sid("busy"), t0 + Duration::from_secs(50));

        let expired = ks.expire_inactive_at(t0 + Duration::from_secs(61));
        assert_eq!(expired, vec![sid("idle")]);
        assert!(ks.get(&sid("idle")).is_none());
        assert!(ks.get(&sid("busy")).is_some());
    }

    #[test]
    fn end_removes_session() {
        let ks = keyspace(DEFAULT_INACTIVITY_TIMEOUT);
        ks.resolve(&sid("alice"));
        assert!(ks.end(&sid("alice")));
        assert!(!ks.end(&sid("alice")));
        assert!(ks.is_empty());
    }
}
