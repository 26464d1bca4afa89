use super::Catalog;
use crate::error::{OrchestrationError, Result};
use crate::model::{Artifact, ArtifactStatus, Schedule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory catalog for tests and embedded use. Semantics mirror
/// [`super::PgCatalog`]; each trait method is a single atomic mutation
/// under the write lock.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    artifacts: RwLock<HashMap<Uuid, Artifact>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: Uuid) -> OrchestrationError {
    OrchestrationError::NotFound { id: id.to_string() }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.artifacts
            .write()
            .await
            .insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn complete_artifact(
        &self,
        id: Uuid,
        storage_path: &Path,
        size_bytes: i64,
        checksum: &str,
    ) -> Result<()> {
        let mut artifacts = self.artifacts.write().await;
        let artifact = artifacts.get_mut(&id).ok_or_else(|| not_found(id))?;
        artifact.status = ArtifactStatus::Completed;
        artifact.storage_path = storage_path.to_path_buf();
        artifact.size_bytes = size_bytes;
        artifact.checksum = Some(checksum.to_string());
        Ok(())
    }

    async fn fail_artifact(&self, id: Uuid) -> Result<()> {
        self.set_artifact_status(id, ArtifactStatus::Failed).await
    }

    async fn set_artifact_status(&self, id: Uuid, status: ArtifactStatus) -> Result<()> {
        let mut artifacts = self.artifacts.write().await;
        let artifact = artifacts.get_mut(&id).ok_or_else(|| not_found(id))?;
        artifact.status = status;
        Ok(())
    }

    async fn mark_restored(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut artifacts = self.artifacts.write().await;
        let artifact = artifacts.get_mut(&id).ok_or_else(|| not_found(id))?;
        artifact.status = ArtifactStatus::Completed;
        artifact.restored_at = Some(at);
        Ok(())
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>> {
        Ok(self.artifacts.read().await.get(&id).cloned())
    }

    async fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let mut all: Vec<Artifact> = self.artifacts.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn artifacts_in_status(&self, status: ArtifactStatus) -> Result<Vec<Artifact>> {
        let mut matching: Vec<Artifact> = self
            .artifacts
            .read()
            .await
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn artifacts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let mut matching: Vec<Artifact> = self
            .artifacts
            .read()
            .await
            .values()
            .filter(|a| a.created_at < cutoff)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    async fn delete_artifact(&self, id: Uuid) -> Result<()> {
        self.artifacts.write().await.remove(&id);
        Ok(())
    }

    async fn is_tracked_path(&self, path: &Path) -> Result<bool> {
        Ok(self
            .artifacts
            .read()
            .await
            .values()
            .any(|a| a.status == ArtifactStatus::Completed && a.storage_path == path))
    }

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.schedules
            .write()
            .await
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        Ok(self.schedules.read().await.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let mut all: Vec<Schedule> = self.schedules.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn update_schedule_runs(
        &self,
        id: Uuid,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules.get_mut(&id).ok_or_else(|| not_found(id))?;
        schedule.last_run = last_run;
        schedule.next_run = next_run;
        Ok(())
    }

    async fn set_schedule_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules.get_mut(&id).ok_or_else(|| not_found(id))?;
        schedule.enabled = enabled;
        schedule.next_run = if enabled { next_run } else { None };
        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        self.schedules.write().await.remove(&id);
        Ok(())
    }
}
