//! WebSocket message types for watch session synchronization
//!
//! This module defines the message protocol for client-server communication
//! over WebSocket connections, plus the event format carried by the
//! broadcast fabric between server processes. Messages are serialized as
//! JSON with snake_case `type` tags.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::connection::ConnectionId;

// =============================================================================
// Client -> Server Messages
// =============================================================================

/// Messages sent from client to server
///
/// Unparsable payloads and unknown tags are logged and dropped without any
/// reply; the connection stays open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate and join a watch session
    JoinSession { session_id: Uuid, token: String },

    /// Leave a watch session (token must match the joined identity)
    LeaveSession { session_id: Uuid, token: String },

    /// Start playback at a position (requires playback control role)
    Play { session_id: Uuid, timestamp: u64 },

    /// Pause playback at a position (requires playback control role)
    Pause { session_id: Uuid, timestamp: u64 },

    /// Jump to a position (requires playback control role)
    Seek { session_id: Uuid, timestamp: u64 },
}

// =============================================================================
// Server -> Client Messages
// =============================================================================

/// Messages sent from server to client
///
/// State-sync messages (sent once on join) carry no metadata; relayed
/// control events carry the delivery timestamp. Denied or malformed client
/// messages never produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent when the socket opens
    Connected { connection_id: ConnectionId },

    /// Playback is running at `timestamp`
    Play {
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<DeliveryMetadata>,
    },

    /// Playback is paused at `timestamp`
    Pause {
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<DeliveryMetadata>,
    },

    /// Playback jumped to `timestamp`
    Seek {
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<DeliveryMetadata>,
    },
}

impl ServerMessage {
    /// Build the one-time state sync sent to a connection that just joined
    pub fn state_sync(state: &PlaybackState) -> Self {
        if state.is_playing {
            ServerMessage::Play {
                timestamp: state.position,
                metadata: None,
            }
        } else {
            ServerMessage::Pause {
                timestamp: state.position,
                metadata: None,
            }
        }
    }
}

/// Relay metadata attached to fanned-out control events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Unix timestamp (ms) when this process delivered the event
    pub delivered_at: i64,
}

// =============================================================================
// Playback state
// =============================================================================

/// Cached playback consensus for a session
///
/// Lives and dies with the session's member set; a session with no
/// connected members has no state, and a fresh session starts paused at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaybackState {
    /// Whether playback is running
    pub is_playing: bool,

    /// Current position in milliseconds
    pub position: u64,
}

impl PlaybackState {
    /// Apply a validated control event. Last write wins; seeks may move the
    /// position backward.
    pub fn apply(&mut self, kind: PlaybackCommand, timestamp: u64) {
        self.is_playing = !matches!(kind, PlaybackCommand::Pause);
        self.position = timestamp;
    }
}

// =============================================================================
// Fabric events (cross-process pub/sub)
// =============================================================================

/// Control event kinds relayed between session members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackCommand {
    Play,
    Pause,
    Seek,
}

impl std::fmt::Display for PlaybackCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackCommand::Play => write!(f, "play"),
            PlaybackCommand::Pause => write!(f, "pause"),
            PlaybackCommand::Seek => write!(f, "seek"),
        }
    }
}

/// Event published through the broadcast fabric for a session
///
/// Delivery includes the publishing process; receivers suppress the echo by
/// comparing `sender` against each local connection's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// What happened
    pub kind: PlaybackCommand,

    /// Playback position in milliseconds
    pub timestamp: u64,

    /// Connection that issued the command
    pub sender: ConnectionId,
}

impl SessionEvent {
    /// Convert to the outbound relay message for local members
    pub fn to_server_message(&self, delivered_at: i64) -> ServerMessage {
        let metadata = Some(DeliveryMetadata { delivered_at });
        match self.kind {
            PlaybackCommand::Play => ServerMessage::Play {
                timestamp: self.timestamp,
                metadata,
            },
            PlaybackCommand::Pause => ServerMessage::Pause {
                timestamp: self.timestamp,
                metadata,
            },
            PlaybackCommand::Seek => ServerMessage::Seek {
                timestamp: self.timestamp,
                metadata,
            },
        }
    }
}
