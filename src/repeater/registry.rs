//! Repeater Session Registry

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Absolute lifetime of a repeater session, measured from its first request
pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(60 * 60);

/// Longest accepted session lifetime
pub const MAX_SESSION_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Longest accepted pause between expiry sweeps
pub const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// `from + after`, capped at `MAX_SESSION_LIFETIME` when the sum overflows
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .or_else(|| from.checked_add(MAX_SESSION_LIFETIME))
        .unwrap_or(from)
}

/// Bookkeeping for one repeater session, keyed by its local endpoint
#[derive(Debug, Clone)]
pub struct RepeaterSession {
    pub session_id: String,
    /// Server-side endpoint the client connected to
    pub local_endpoint: SocketAddr,
    pub peer_endpoint: SocketAddr,
    /// Target to relay to; settled once the session is authenticated
    pub remote_endpoint: SocketAddr,
    pub authenticated: bool,
    pub first_request_at: Instant,
    pub expires_at: Instant,
    cancel: CancellationToken,
}

impl RepeaterSession {
    pub fn new(
        local_endpoint: SocketAddr,
        peer_endpoint: SocketAddr,
        lifetime: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let first_request_at = Instant::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            local_endpoint,
            peer_endpoint,
            remote_endpoint: peer_endpoint,
            authenticated: false,
            first_request_at,
            expires_at: deadline_after(first_request_at, lifetime),
            cancel,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancelling closes the session's sockets through its pumps
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Live repeater sessions of one engine.
///
/// Every operation takes the internal lock for its whole duration, so the
/// accept loop, session tasks and the expiry sweeper can call it concurrently.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SocketAddr, RepeaterSession>>,
    registered: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, RepeaterSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session under its local endpoint.
    ///
    /// Returns false, leaving the registry untouched, when that endpoint
    /// already has a session.
    pub fn try_register(&self, session: RepeaterSession) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(&session.local_endpoint) {
            debug!(
                local_endpoint = %session.local_endpoint,
                "Endpoint already has an active repeater session"
            );
            return false;
        }

        debug!(
            session_id = %session.session_id,
            local_endpoint = %session.local_endpoint,
            "Registered repeater session"
        );
        sessions.insert(session.local_endpoint, session);
        drop(sessions);
        self.registered.notify_one();
        true
    }

    /// Completes after the next successful registration
    pub async fn registered(&self) {
        self.registered.notified().await
    }

    /// Record the negotiated target; false if the session is no longer registered
    pub fn mark_authenticated(&self, key: &SocketAddr, session_id: &str, remote: SocketAddr) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(key) {
            Some(session) if session.session_id == session_id => {
                session.remote_endpoint = remote;
                session.authenticated = true;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &SocketAddr) -> Option<RepeaterSession> {
        self.lock().remove(key)
    }

    /// Remove the entry for `key` only if it still belongs to `session_id`.
    ///
    /// A session that was swept and replaced must not evict its successor.
    pub fn remove_session(&self, key: &SocketAddr, session_id: &str) -> bool {
        let mut sessions = self.lock();
        match sessions.get(key) {
            Some(session) if session.session_id == session_id => {
                sessions.remove(key);
                debug!(session_id, local_endpoint = %key, "Deregistered repeater session");
                true
            }
            _ => false,
        }
    }

    /// Remove and close every session whose expiry is at or before `now`
    pub fn sweep_expired(&self, now: Instant) -> Vec<RepeaterSession> {
        let expired: Vec<RepeaterSession> = {
            let mut sessions = self.lock();
            let keys: Vec<SocketAddr> = sessions
                .iter()
                .filter(|(_, session)| session.is_expired(now))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| sessions.remove(key)).collect()
        };

        for session in &expired {
            info!(
                session_id = %session.session_id,
                local_endpoint = %session.local_endpoint,
                "Repeater session expired"
            );
            session.close();
        }

        expired
    }

    /// Earliest expiry among registered sessions
    pub fn next_expiry(&self) -> Option<Instant> {
        self.lock().values().map(|session| session.expires_at).min()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &SocketAddr) -> bool {
        self.lock().contains_key(key)
    }

    pub fn get(&self, key: &SocketAddr) -> Option<RepeaterSession> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<RepeaterSession> {
        self.lock().values().cloned().collect()
    }

    /// Remove and close all sessions
    pub fn clear(&self) -> usize {
        let drained: Vec<RepeaterSession> = self.lock().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        drained.len()
    }
}
