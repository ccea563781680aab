//! Session registry: the in-process authority for room membership
//!
//! Maps each watch session to its locally-connected members and cached
//! playback state. Both live exactly as long as the member set is
//! non-empty: the first join lazily creates them (and subscribes the
//! process to the session's fabric channel), and the last leave removes
//! them, so a fresh session always starts paused at position 0.
//!
//! Uses DashMap for concurrent access without explicit locking; map guards
//! are never held across await points, only across non-blocking channel
//! sends.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection::{ConnectionHandle, ConnectionId};
use super::messages::{PlaybackCommand, PlaybackState, SessionEvent};
use super::pubsub::SessionPubSub;

/// Per-session state: local members plus the playback cache
struct SessionState {
    /// Map of connection id -> handle for every local member
    members: HashMap<ConnectionId, ConnectionHandle>,

    /// Cached playback consensus, updated in fabric delivery order
    playback: PlaybackState,

    /// Fan-out task draining this session's fabric channel
    fanout: JoinHandle<()>,
}

/// Tracks watch session membership and playback state for this process
///
/// Explicitly constructed and handed to each connection (no process-wide
/// singleton), so tests can run isolated registries side by side.
/// Wrapped in Arc internally for cheap cloning.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, SessionState>>,
    pubsub: SessionPubSub,
}

impl SessionRegistry {
    /// Create a registry fanning out through the given fabric
    pub fn new(pubsub: SessionPubSub) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            pubsub,
        }
    }

    /// Add a connection to a session's member set (idempotent).
    ///
    /// The first join of a session subscribes this process to the
    /// session's fabric channel and starts its fan-out task.
    pub fn join(&self, session_id: Uuid, handle: ConnectionHandle) {
        let connection_id = handle.id;

        let mut state = self.sessions.entry(session_id).or_insert_with(|| {
            let receiver = self.pubsub.subscribe(session_id);
            let fanout = tokio::spawn(run_fanout(session_id, receiver, self.clone()));
            tracing::debug!(session_id = %session_id, "Session created, fabric subscribed");

            SessionState {
                members: HashMap::new(),
                playback: PlaybackState::default(),
                fanout,
            }
        });
        state.members.insert(connection_id, handle);
        let member_count = state.members.len();
        drop(state);

        tracing::debug!(
            session_id = %session_id,
            connection_id = %connection_id,
            member_count = member_count,
            "Connection joined session"
        );
    }

    /// Remove a connection from a session's member set.
    ///
    /// When the set empties, the session's playback state and fabric
    /// subscription are dropped with it. Removing an unknown connection or
    /// session is a no-op; returns whether a member was actually removed.
    pub fn leave(&self, session_id: Uuid, connection_id: ConnectionId) -> bool {
        let removed = match self.sessions.get_mut(&session_id) {
            Some(mut state) => state.members.remove(&connection_id).is_some(),
            None => return false,
        };

        if let Some((_, state)) = self
            .sessions
            .remove_if(&session_id, |_, state| state.members.is_empty())
        {
            state.fanout.abort();
            self.pubsub.unsubscribe(session_id);
            tracing::debug!(session_id = %session_id, "Session empty, state discarded");
        }

        if removed {
            tracing::debug!(
                session_id = %session_id,
                connection_id = %connection_id,
                "Connection left session"
            );
        }

        removed
    }

    /// Snapshot of the handles currently joined to a session
    pub fn members(&self, session_id: Uuid) -> Vec<ConnectionHandle> {
        self.sessions
            .get(&session_id)
            .map(|state| state.members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of local members in a session
    pub fn member_count(&self, session_id: Uuid) -> usize {
        self.sessions
            .get(&session_id)
            .map(|state| state.members.len())
            .unwrap_or(0)
    }

    /// Number of sessions with at least one local member
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Current cached playback state, defaulting to paused-at-zero for
    /// sessions this process holds no state for
    pub fn current_playback(&self, session_id: Uuid) -> PlaybackState {
        self.sessions
            .get(&session_id)
            .map(|state| state.playback)
            .unwrap_or_default()
    }

    /// Record a delivered control event in the playback cache.
    ///
    /// Last write wins in fabric delivery order; no-op for sessions with
    /// no members (late events after teardown are intentionally discarded).
    pub fn record_playback(&self, session_id: Uuid, kind: PlaybackCommand, timestamp: u64) {
        if let Some(mut state) = self.sessions.get_mut(&session_id) {
            state.playback.apply(kind, timestamp);
        }
    }

    /// Deliver a fabric event to every local member except its sender
    fn deliver(&self, session_id: Uuid, event: SessionEvent) {
        self.record_playback(session_id, event.kind, event.timestamp);

        let delivered_at = chrono::Utc::now().timestamp_millis();
        let message = event.to_server_message(delivered_at);

        let mut sent = 0;
        for handle in self.members(session_id) {
            if handle.id != event.sender && handle.send(message.clone()).is_ok() {
                sent += 1;
            }
        }

        tracing::trace!(
            session_id = %session_id,
            kind = %event.kind,
            recipients = sent,
            "Fabric event delivered"
        );
    }
}

/// Drain a session's fabric channel into the local member set
async fn run_fanout(
    session_id: Uuid,
    mut receiver: tokio::sync::broadcast::Receiver<SessionEvent>,
    registry: SessionRegistry,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match receiver.recv().await {
            Ok(event) => registry.deliver(session_id, event),
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(session_id = %session_id, lagged = n, "Fan-out receiver lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
