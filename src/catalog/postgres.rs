use super::Catalog;
use crate::error::{OrchestrationError, Result};
use crate::model::{
    Artifact, ArtifactKind, ArtifactMetadata, ArtifactStatus, Compression, Schedule,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL-backed catalog.
#[derive(Debug)]
pub struct PgCatalog {
    pool: Arc<PgPool>,
}

impl PgCatalog {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    fn row_to_artifact(&self, row: sqlx::postgres::PgRow) -> Result<Artifact> {
        let kind_str: String = row.try_get("kind")?;
        let kind = ArtifactKind::parse(&kind_str).ok_or_else(|| OrchestrationError::Storage {
            message: format!("unknown artifact kind in catalog: {kind_str}"),
        })?;

        let status_str: String = row.try_get("status")?;
        let status =
            ArtifactStatus::parse(&status_str).ok_or_else(|| OrchestrationError::Storage {
                message: format!("unknown artifact status in catalog: {status_str}"),
            })?;

        let compression_str: String = row.try_get("compression")?;
        let compression = Compression::parse(&compression_str).unwrap_or(Compression::None);

        let metadata_json: serde_json::Value = row.try_get("metadata_json")?;
        let metadata: ArtifactMetadata = serde_json::from_value(metadata_json)?;

        Ok(Artifact {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind,
            compression,
            storage_path: PathBuf::from(row.try_get::<String, _>("storage_path")?),
            size_bytes: row.try_get("size_bytes")?,
            checksum: row.try_get("checksum")?,
            status,
            created_at: row.try_get("created_at")?,
            restored_at: row.try_get("restored_at")?,
            metadata,
        })
    }

    fn row_to_schedule(&self, row: sqlx::postgres::PgRow) -> Result<Schedule> {
        let kind_str: String = row.try_get("kind")?;
        let kind = ArtifactKind::parse(&kind_str).ok_or_else(|| OrchestrationError::Storage {
            message: format!("unknown schedule kind in catalog: {kind_str}"),
        })?;

        let compression_str: String = row.try_get("compression")?;
        let compression = Compression::parse(&compression_str).unwrap_or(Compression::Gzip);

        let include_paths: serde_json::Value = row.try_get("include_paths")?;
        let exclude_patterns: serde_json::Value = row.try_get("exclude_patterns")?;

        Ok(Schedule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind,
            schedule_expr: row.try_get("schedule_expr")?,
            retention_days: row.try_get::<i32, _>("retention_days")? as u32,
            compression,
            include_paths: serde_json::from_value(include_paths)?,
            exclude_patterns: serde_json::from_value(exclude_patterns)?,
            enabled: row.try_get("enabled")?,
            last_run: row.try_get("last_run")?,
            next_run: row.try_get("next_run")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn initialize(&self) -> Result<()> {
        debug!("Initializing catalog tables");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS artifacts (
                id UUID PRIMARY KEY,
                name VARCHAR NOT NULL,
                kind VARCHAR NOT NULL,
                compression VARCHAR NOT NULL,
                storage_path TEXT NOT NULL DEFAULT '',
                size_bytes BIGINT NOT NULL DEFAULT 0,
                checksum VARCHAR,
                status VARCHAR NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                restored_at TIMESTAMPTZ,
                metadata_json JSONB NOT NULL DEFAULT '{}'
            )
        "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id UUID PRIMARY KEY,
                name VARCHAR NOT NULL,
                kind VARCHAR NOT NULL,
                schedule_expr VARCHAR NOT NULL,
                retention_days INTEGER NOT NULL,
                compression VARCHAR NOT NULL,
                include_paths JSONB NOT NULL DEFAULT '[]',
                exclude_patterns JSONB NOT NULL DEFAULT '[]',
                enabled BOOLEAN NOT NULL DEFAULT true,
                last_run TIMESTAMPTZ,
                next_run TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
        "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        debug!("Catalog tables ready");
        Ok(())
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (
                id, name, kind, compression, storage_path, size_bytes,
                checksum, status, created_at, restored_at, metadata_json
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
        )
        .bind(artifact.id)
        .bind(&artifact.name)
        .bind(artifact.kind.as_str())
        .bind(artifact.compression.as_str())
        .bind(artifact.storage_path.to_string_lossy().as_ref())
        .bind(artifact.size_bytes)
        .bind(&artifact.checksum)
        .bind(artifact.status.as_str())
        .bind(artifact.created_at)
        .bind(artifact.restored_at)
        .bind(serde_json::to_value(&artifact.metadata)?)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn complete_artifact(
        &self,
        id: Uuid,
        storage_path: &Path,
        size_bytes: i64,
        checksum: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE artifacts SET
                status = 'Completed', storage_path = $2,
                size_bytes = $3, checksum = $4
            WHERE id = $1
        "#,
        )
        .bind(id)
        .bind(storage_path.to_string_lossy().as_ref())
        .bind(size_bytes)
        .bind(checksum)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn fail_artifact(&self, id: Uuid) -> Result<()> {
        self.set_artifact_status(id, ArtifactStatus::Failed).await
    }

    async fn set_artifact_status(&self, id: Uuid, status: ArtifactStatus) -> Result<()> {
        sqlx::query("UPDATE artifacts SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn mark_restored(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE artifacts SET status = 'Completed', restored_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;

        row.map(|r| self.row_to_artifact(r)).transpose()
    }

    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts ORDER BY created_at DESC")
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.into_iter().map(|r| self.row_to_artifact(r)).collect()
    }

    async fn artifacts_in_status(&self, status: ArtifactStatus) -> Result<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE status = $1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.into_iter().map(|r| self.row_to_artifact(r)).collect()
    }

    async fn artifacts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let rows = sqlx::query("SELECT * FROM artifacts WHERE created_at < $1 ORDER BY created_at")
            .bind(cutoff)
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.into_iter().map(|r| self.row_to_artifact(r)).collect()
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM artifacts WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn is_tracked_path(&self, path: &Path) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM artifacts WHERE storage_path = $1 AND status = 'Completed'",
        )
        .bind(path.to_string_lossy().as_ref())
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(count > 0)
    }

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
                id, name, kind, schedule_expr, retention_days, compression,
                include_paths, exclude_patterns, enabled, last_run, next_run, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(schedule.kind.as_str())
        .bind(&schedule.schedule_expr)
        .bind(schedule.retention_days as i32)
        .bind(schedule.compression.as_str())
        .bind(serde_json::to_value(&schedule.include_paths)?)
        .bind(serde_json::to_value(&schedule.exclude_patterns)?)
        .bind(schedule.enabled)
        .bind(schedule.last_run)
        .bind(schedule.next_run)
        .bind(schedule.created_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;

        row.map(|r| self.row_to_schedule(r)).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules ORDER BY created_at")
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.into_iter().map(|r| self.row_to_schedule(r)).collect()
    }

    async fn update_schedule_runs(
        &self,
        id: Uuid,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE schedules SET last_run = $2, next_run = $3 WHERE id = $1")
            .bind(id)
            .bind(last_run)
            .bind(next_run)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn set_schedule_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // enabled=false always clears next_run.
        let next_run = if enabled { next_run } else { None };
        sqlx::query("UPDATE schedules SET enabled = $2, next_run = $3 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .bind(next_run)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }
}
