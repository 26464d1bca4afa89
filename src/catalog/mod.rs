pub mod memory;
pub mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

use crate::error::Result;
use crate::model::{Artifact, ArtifactStatus, Schedule};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use uuid::Uuid;

/// Single source of truth for artifact and schedule state. The
/// filesystem holds the payloads the catalog points to; every status
/// transition that changes a storage path goes through
/// [`Catalog::complete_artifact`] so the two never disagree for longer
/// than one operation.
#[async_trait]
pub trait Catalog: Send + Sync + std::fmt::Debug {
    async fn initialize(&self) -> Result<()>;

    // Artifacts

    async fn insert_artifact(&self, artifact: &Artifact) -> Result<()>;

    /// Atomically transition an artifact to `Completed`, recording its
    /// storage path, size, and checksum in the same update. There is
    /// no window where a `Completed` row lacks a valid location/size.
    async fn complete_artifact(
        &self,
        id: Uuid,
        storage_path: &Path,
        size_bytes: i64,
        checksum: &str,
    ) -> Result<()>;

    async fn fail_artifact(&self, id: Uuid) -> Result<()>;

    async fn set_artifact_status(&self, id: Uuid, status: ArtifactStatus) -> Result<()>;

    /// Stamp `restored_at` and return the artifact to `Completed`.
    async fn mark_restored(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn get_artifact(&self, id: Uuid) -> Result<Option<Artifact>>;

    async fn list_artifacts(&self) -> Result<Vec<Artifact>>;

    async fn artifacts_in_status(&self, status: ArtifactStatus) -> Result<Vec<Artifact>>;

    async fn artifacts_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Artifact>>;

    async fn delete_artifact(&self, id: Uuid) -> Result<()>;

    /// Whether any `Completed` row references this storage path. Raw
    /// filesystem sweeps consult this before deleting anything.
    async fn is_tracked_path(&self, path: &Path) -> Result<bool>;

    // Schedules

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<()>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>>;

    async fn update_schedule_runs(
        &self,
        id: Uuid,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Disabling a schedule clears `next_run` in the same update.
    async fn set_schedule_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn delete_schedule(&self, id: Uuid) -> Result<()>;
}
