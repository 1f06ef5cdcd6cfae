//! Session registry.
//!
//! A session is created by `/start-session` and identified by an opaque id
//! stored in a cookie. At most one live WebSocket connection is bound to a
//! session at a time; binding a new connection replaces (and closes) the
//! previous one. Sessions without a connection expire once they have been
//! idle for the configured timeout.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::push::PushEvent;

/// Instruction for a connection's writer task
#[derive(Debug)]
pub(crate) enum Outbound {
    Event(PushEvent),
    Close,
}

/// Handle to a live WebSocket connection
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, outbound: Outbound) -> bool {
        self.sender.send(outbound).is_ok()
    }
}

/// How long an unconnected session survives by default
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
pub struct SessionRegistry {
    /// Session id to the instant it was created or last lost its connection
    sessions: RwLock<HashMap<String, Instant>>,
    bindings: RwLock<HashMap<String, ConnectionHandle>>,
    idle_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_idle_timeout(DEFAULT_SESSION_IDLE_TIMEOUT)
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Return `existing` if it names a live session, otherwise create one
    pub fn ensure_session(&self, existing: Option<&str>) -> String {
        if let Some(id) = existing
            && self.contains(id)
        {
            if let Some(idle_since) = self.sessions.write().get_mut(id) {
                *idle_since = Instant::now();
            }
            return id.to_string();
        }

        self.evict_idle();
        let id = Uuid::new_v4().to_string();
        self.sessions.write().insert(id.clone(), Instant::now());
        debug!(session_id = %id, "Created session");
        id
    }

    /// Known and either connected or not yet expired
    pub fn contains(&self, session_id: &str) -> bool {
        let Some(idle_since) = self.sessions.read().get(session_id).copied() else {
            return false;
        };
        self.is_connected(session_id) || !self.is_expired(idle_since, Instant::now())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drop unconnected sessions idle for longer than the timeout
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let bindings = self.bindings.read();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, idle_since| {
            bindings.contains_key(id) || !self.is_expired(*idle_since, now)
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle sessions");
        }
        evicted
    }

    fn is_expired(&self, idle_since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(idle_since) >= self.idle_timeout
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.bindings.read().contains_key(session_id)
    }

    pub(crate) fn bound_connection(&self, session_id: &str) -> Option<Uuid> {
        self.bindings.read().get(session_id).map(ConnectionHandle::id)
    }

    pub fn connected_sessions(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    /// Bind a connection, returning the connection it replaced
    pub(crate) fn bind(
        &self,
        session_id: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        self.bindings.write().insert(session_id.to_string(), handle)
    }

    /// Remove the binding only if it still points at `connection_id`
    pub(crate) fn unbind(&self, session_id: &str, connection_id: Uuid) -> bool {
        let mut bindings = self.bindings.write();
        match bindings.get(session_id) {
            Some(handle) if handle.id() == connection_id => {
                bindings.remove(session_id);
                // the idle clock starts when the last connection goes away
                if let Some(idle_since) = self.sessions.write().get_mut(session_id) {
                    *idle_since = Instant::now();
                }
                true
            }
            _ => false,
        }
    }

    /// Queue an event for the session's connection. Returns false when unbound.
    pub(crate) fn push(&self, session_id: &str, event: PushEvent) -> bool {
        match self.bindings.read().get(session_id) {
            Some(handle) => handle.send(Outbound::Event(event)),
            None => false,
        }
    }

    pub(crate) fn close(&self, handle: &ConnectionHandle) {
        handle.send(Outbound::Close);
    }

    /// Close and unbind every connection
    pub(crate) fn close_all(&self) {
        let handles: Vec<ConnectionHandle> =
            self.bindings.write().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.send(Outbound::Close);
        }
    }
}
