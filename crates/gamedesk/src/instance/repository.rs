//! Instance registry on SQLite.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{Instance, InstanceStatus};

/// Repository for instance persistence.
#[derive(Debug, Clone)]
pub struct InstanceRepository {
    pool: SqlitePool,
}

impl InstanceRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new instance record.
    pub async fn create(&self, instance: &Instance) -> Result<()> {
        let config =
            serde_json::to_string(&instance.config).context("serializing instance config")?;

        sqlx::query(
            r#"
            INSERT INTO instances (
                id, user_id, container_id, novnc_port, sunshine_port, display_number,
                status, created_at, last_accessed, config
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.user_id)
        .bind(&instance.container_id)
        .bind(instance.novnc_port)
        .bind(instance.sunshine_port)
        .bind(instance.display_number)
        .bind(instance.status.to_string())
        .bind(&instance.created_at)
        .bind(&instance.last_accessed)
        .bind(config)
        .execute(&self.pool)
        .await
        .context("creating instance")?;

        Ok(())
    }

    /// Get an instance by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Instance>> {
        let instance = sqlx::query_as::<_, Instance>(
            r#"
            SELECT id, user_id, container_id, novnc_port, sunshine_port, display_number,
                   status, created_at, last_accessed, config
            FROM instances
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching instance")?;

        Ok(instance)
    }

    /// List instances, newest first, optionally restricted to one user.
    ///
    /// Records created in the same microsecond keep reverse insertion order.
    pub async fn list(&self, user_id: Option<&str>) -> Result<Vec<Instance>> {
        let instances = sqlx::query_as::<_, Instance>(
            r#"
            SELECT id, user_id, container_id, novnc_port, sunshine_port, display_number,
                   status, created_at, last_accessed, config
            FROM instances
            WHERE ?1 IS NULL OR user_id = ?1
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing instances")?;

        Ok(instances)
    }

    /// Records that still hold pool grants, oldest first.
    pub async fn list_live(&self) -> Result<Vec<Instance>> {
        let instances = sqlx::query_as::<_, Instance>(
            r#"
            SELECT id, user_id, container_id, novnc_port, sunshine_port, display_number,
                   status, created_at, last_accessed, config
            FROM instances
            WHERE status != 'deleted'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing live instances")?;

        Ok(instances)
    }

    /// Records whose delete was claimed but never finished.
    pub async fn list_deleted(&self) -> Result<Vec<Instance>> {
        let instances = sqlx::query_as::<_, Instance>(
            r#"
            SELECT id, user_id, container_id, novnc_port, sunshine_port, display_number,
                   status, created_at, last_accessed, config
            FROM instances
            WHERE status = 'deleted'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing deleted instances")?;

        Ok(instances)
    }

    /// Delete an instance. Returns `false` if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting instance")?;

        Ok(result.rows_affected() > 0)
    }

    /// Set `last_accessed`. Returns `false` if the instance does not exist.
    pub async fn touch_last_accessed(&self, id: &str, timestamp: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE instances SET last_accessed = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating last accessed time")?;

        Ok(result.rows_affected() > 0)
    }

    /// Move a record from `from` to `to`. Returns `false` if the record is
    /// missing or no longer in `from`.
    pub async fn update_status(
        &self,
        id: &str,
        from: InstanceStatus,
        to: InstanceStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE instances SET status = ? WHERE id = ? AND status = ?")
            .bind(to.to_string())
            .bind(id)
            .bind(from.to_string())
            .execute(&self.pool)
            .await
            .context("updating instance status")?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically mark a live record as deleted.
    ///
    /// Exactly one concurrent caller gets `true`; everyone else (and callers
    /// for missing ids) gets `false`.
    pub async fn claim_for_deletion(&self, id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE instances SET status = 'deleted' WHERE id = ? AND status != 'deleted'")
                .bind(id)
                .execute(&self.pool)
                .await
                .context("claiming instance for deletion")?;

        Ok(result.rows_affected() > 0)
    }
}
