//! Group membership lookups

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::GroupRole;

/// Repository for group membership database reads
#[derive(Clone)]
pub struct GroupMemberRepository {
    pool: PgPool,
}

impl GroupMemberRepository {
    /// Create a new GroupMemberRepository instance
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a user's role within a group.
    ///
    /// Returns `None` when the user is not a member. A role value this
    /// server does not recognize is also treated as no membership, with a
    /// warning, so a schema change cannot silently grant control.
    pub async fn find_role(
        &self,
        user_id: Uuid,
        group_id: Uuid,
    ) -> Result<Option<GroupRole>, sqlx::Error> {
        let role: Option<String> = sqlx::query_scalar(
            r#"
            SELECT role::text
            FROM group_members
            WHERE user_id = $1 AND group_id = $2
            "#,
        )
        .bind(user_id)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(role.and_then(|raw| match raw.parse::<GroupRole>() {
            Ok(role) => Some(role),
            Err(()) => {
                tracing::warn!(
                    user_id = %user_id,
                    group_id = %group_id,
                    role = %raw,
                    "Unrecognized group role, treating as non-member"
                );
                None
            }
        }))
    }
}
