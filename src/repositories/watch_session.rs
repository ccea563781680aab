//! Watch session lookups

use sqlx::PgPool;
use uuid::Uuid;

/// Repository for watch session database reads
#[derive(Clone)]
pub struct WatchSessionRepository {
    pool: PgPool,
}

impl WatchSessionRepository {
    /// Create a new WatchSessionRepository instance
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve a watch session to the group that owns it.
    ///
    /// Returns `None` when the session does not exist.
    pub async fn find_group_id(&self, session_id: Uuid) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT group_id
            FROM watch_sessions
            WHERE id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
    }
}
