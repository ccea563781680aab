//! WebSocket synchronization for group watch sessions
//!
//! This module keeps every connected member of a watch session on the same
//! playback position:
//! - authenticated session join/leave with role lookup
//! - play/pause/seek relay to all other members, across server processes
//! - cached playback state served to late joiners

pub mod connection;
pub mod handler;
pub mod messages;
pub mod pubsub;
pub mod registry;
pub mod session;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionLimiter};
pub use handler::{ws_handler, WsSettings};
pub use messages::{ClientMessage, PlaybackState, ServerMessage, SessionEvent};
pub use pubsub::SessionPubSub;
pub use registry::SessionRegistry;
pub use session::SessionHandler;
