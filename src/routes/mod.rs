//! HTTP route handlers for the watch party sync server
//!
//! The sync plane is WebSocket-first; the only REST surface is the
//! health check endpoints.

pub mod health;

pub use health::{health_router, HealthState};
