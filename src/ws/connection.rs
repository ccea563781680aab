//! WebSocket connection primitives
//!
//! A connection is ephemeral: it gets a transient identifier at accept
//! time, and the registry holds a cloneable handle for pushing messages to
//! its socket. The limiter bounds how many sockets a process will accept.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::ServerMessage;

/// Transient identifier assigned to a connection at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle for sending messages to a specific WebSocket connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Transient connection identifier
    pub id: ConnectionId,

    /// Channel feeding this connection's socket pump
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, sender }
    }

    /// Send a message to this connection. Errors mean the socket pump is
    /// gone; the registry will drop the handle on the close path.
    #[allow(clippy::result_large_err)]
    pub fn send(&self, msg: ServerMessage) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        self.sender.send(msg)
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Bounds the number of concurrently accepted WebSocket connections
///
/// The upgrade handler acquires a permit before upgrading; the permit
/// releases its slot when the socket task finishes.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    active: Arc<AtomicUsize>,
    max: usize,
}

impl ConnectionLimiter {
    /// Create a limiter allowing up to `max` concurrent connections
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Try to reserve a connection slot
    pub fn try_acquire(&self) -> Option<ConnectionPermit> {
        let prev = self.active.fetch_add(1, Ordering::AcqRel);
        if prev >= self.max {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ConnectionPermit {
            active: Arc::clone(&self.active),
        })
    }

    /// Number of currently held slots
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII slot reservation; dropping it frees the slot
#[derive(Debug)]
pub struct ConnectionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_handle_send_and_liveness() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(ConnectionId::new(), tx);

        assert!(handle.is_alive());
        handle
            .send(ServerMessage::Pause {
                timestamp: 0,
                metadata: None,
            })
            .unwrap();
        assert!(rx.try_recv().is_ok());

        drop(rx);
        assert!(!handle.is_alive());
        assert!(handle
            .send(ServerMessage::Pause {
                timestamp: 0,
                metadata: None,
            })
            .is_err());
    }

    #[test]
    fn test_limiter_enforces_ceiling() {
        let limiter = ConnectionLimiter::new(2);

        let a = limiter.try_acquire().unwrap();
        let _b = limiter.try_acquire().unwrap();
        assert_eq!(limiter.active(), 2);

        // At capacity
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.active(), 2);

        // Dropping a permit frees the slot
        drop(a);
        assert_eq!(limiter.active(), 1);
        assert!(limiter.try_acquire().is_some());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
