use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use crate::StoragePool;

/// Read-only view of the platform's follow graph. Graph mutation belongs to
/// the relationship service; messaging only consumes the mutual-follow
/// predicate and the contact intersection.
#[derive(Clone)]
pub struct FollowRepository {
    pool: StoragePool,
}

impl FollowRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// True iff both follow edges exist. One-directional following is not
    /// enough to message someone.
    pub async fn is_mutual(&self, user_a: Uuid, user_b: Uuid) -> Result<bool> {
        let edges = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM follows
            WHERE (follower_id = $1 AND following_id = $2)
               OR (follower_id = $2 AND following_id = $1)
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(edges == 2)
    }

    /// Users that `user_id` follows and that follow back.
    pub async fn contacts_of(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let contacts = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT f.following_id
            FROM follows f
            JOIN follows r
              ON r.follower_id = f.following_id AND r.following_id = f.follower_id
            WHERE f.follower_id = $1
            ORDER BY f.following_id
            "#,
        )
        .bind(user_id)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(contacts)
    }

    /// Seed one follow edge. Operational tooling only (CLI); the product path
    /// never writes the graph from this subsystem.
    pub async fn seed_edge(&self, follower_id: Uuid, following_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO follows (follower_id, following_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(follower_id)
        .bind(following_id)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }
}
