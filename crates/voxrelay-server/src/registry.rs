//! Session registry: session id to outbound route and live state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use voxrelay_types::{OutboundEvent, SessionState};

/// Why an event could not be routed to its client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no session registered with id {0}")]
    UnknownSession(String),

    #[error("outbound route for session {0} is closed")]
    Closed(String),
}

/// Registry entry for one session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Queue drained by the session's client writer.
    pub outbound: mpsc::Sender<OutboundEvent>,
    /// Current state, published by the session coordinator.
    pub state: watch::Receiver<SessionState>,
    /// Application the client connected for, if any.
    pub app_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn new(
        outbound: mpsc::Sender<OutboundEvent>,
        state: watch::Receiver<SessionState>,
        app_id: Option<String>,
    ) -> Self {
        Self {
            outbound,
            state,
            app_id,
            connected_at: Utc::now(),
        }
    }
}

/// Thread-safe map of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session, returning any entry it replaced.
    pub async fn insert(&self, session_id: String, handle: SessionHandle) -> Option<SessionHandle> {
        let previous = self.sessions.write().await.insert(session_id.clone(), handle);
        if previous.is_some() {
            tracing::warn!(session_id = %session_id, "replaced existing session registration");
        }
        previous
    }

    pub async fn remove(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn lookup(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Current state of a session, if registered.
    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|handle| *handle.state.borrow())
    }

    /// Ids of all registered sessions, in no particular order.
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Delivers an event to a session's client writer.
    ///
    /// Waits for queue space, so a slow client slows its own producers
    /// rather than losing events.
    pub async fn route(&self, session_id: &str, event: OutboundEvent) -> Result<(), RouteError> {
        let sender = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|handle| handle.outbound.clone())
                .ok_or_else(|| RouteError::UnknownSession(session_id.to_string()))?
        };

        let tag = event.tag();
        sender.send(event).await.map_err(|_| {
            tracing::debug!(session_id = %session_id, tag, "outbound route closed");
            RouteError::Closed(session_id.to_string())
        })
    }
}
