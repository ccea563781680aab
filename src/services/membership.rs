//! Membership authorization
//!
//! Resolves a watch session to its owning group and the caller to a role
//! within that group. A missing session and a missing membership are both
//! reported as `None` so callers cannot distinguish the two.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::models::GroupRole;
use crate::repositories::{GroupMemberRepository, WatchSessionRepository};

/// Authorizes a user against the group owning a watch session.
///
/// Behind a trait so connection handling can be tested without Postgres.
#[async_trait]
pub trait MembershipVerifier: Send + Sync {
    /// Resolve the caller's role for a session, or `None` when the session
    /// does not exist or the caller holds no membership.
    async fn authorize(&self, session_id: Uuid, user_id: Uuid) -> ApiResult<Option<GroupRole>>;
}

/// Postgres-backed membership verifier
#[derive(Clone)]
pub struct PgMembershipVerifier {
    sessions: WatchSessionRepository,
    members: GroupMemberRepository,
}

impl PgMembershipVerifier {
    /// Create a new verifier over the session and membership repositories
    pub fn new(sessions: WatchSessionRepository, members: GroupMemberRepository) -> Self {
        Self { sessions, members }
    }
}

#[async_trait]
impl MembershipVerifier for PgMembershipVerifier {
    async fn authorize(&self, session_id: Uuid, user_id: Uuid) -> ApiResult<Option<GroupRole>> {
        let Some(group_id) = self.sessions.find_group_id(session_id).await? else {
            tracing::debug!(session_id = %session_id, "Watch session not found");
            return Ok(None);
        };

        let role = self.members.find_role(user_id, group_id).await?;
        Ok(role)
    }
}
