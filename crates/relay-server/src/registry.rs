use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_core::ConnectionId;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionState, SessionStatus};

/// A live session as tracked by the registry.
struct SessionEntry {
    status: Arc<SessionStatus>,
    connected_at: DateTime<Utc>,
}

/// Point-in-time view of one session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub state: SessionState,
    pub source: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Registry of all sessions with an open connection.
///
/// Entries are added by the gateway when a connection opens and removed
/// once the session task has finished and its transcoder is reaped.
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, SessionEntry>,
    root: CancellationToken,
    emptied: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            root: CancellationToken::new(),
            emptied: Notify::new(),
        }
    }

    /// Register a session. Returns its shared status and the token that
    /// fires when the relay terminates all sessions.
    pub fn register(&self, id: ConnectionId) -> (Arc<SessionStatus>, CancellationToken) {
        let status = Arc::new(SessionStatus::default());
        let terminate = self.root.child_token();
        self.sessions.insert(
            id,
            SessionEntry {
                status: Arc::clone(&status),
                connected_at: Utc::now(),
            },
        );
        (status, terminate)
    }

    pub fn remove(&self, id: &ConnectionId) {
        if self.sessions.remove(id).is_some() && self.sessions.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    /// Number of sessions with an open connection.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of sessions currently relaying a stream.
    pub fn streaming_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.status.is_streaming())
            .count()
    }

    /// Every open session, oldest first.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                connection_id: entry.key().clone(),
                state: entry.status.state(),
                source: entry.status.source(),
                connected_at: entry.connected_at,
            })
            .collect();
        out.sort_by_key(|s| s.connected_at);
        out
    }

    /// Signal every current and future session to stop its stream.
    pub fn terminate_all(&self) {
        tracing::info!(sessions = self.count(), "Terminating all sessions");
        self.root.cancel();
    }

    /// Wait until no sessions remain. Returns false on timeout.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.emptied.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.sessions.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
