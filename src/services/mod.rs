//! Services for token verification and membership authorization

pub mod auth;
pub mod membership;

pub use auth::{AuthConfig, AuthService, Claims};
pub use membership::{MembershipVerifier, PgMembershipVerifier};
