//! Watch party sync server library
//!
//! This module exposes the core server components for use in integration
//! tests and as a library.

pub mod config;
pub mod error;
pub mod models;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod ws;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use services::{AuthConfig, AuthService};
