use crate::deps::Deps;
use crate::error::Result;
use crate::model::ArtifactStatus;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Outcome of a sweep or expiry pass. Per-file failures are counted,
/// never fatal for the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub freed_bytes: u64,
    pub deleted_count: usize,
    pub failed_count: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.freed_bytes += other.freed_bytes;
        self.deleted_count += other.deleted_count;
        self.failed_count += other.failed_count;
    }
}

/// Statuses with no operation in flight. Only these are eligible for
/// retention deletion.
fn is_resting(status: ArtifactStatus) -> bool {
    matches!(status, ArtifactStatus::Completed | ArtifactStatus::Failed)
}

/// Age-based cleanup of stored artifacts and raw file trees.
#[derive(Debug)]
pub struct RetentionManager {
    deps: Arc<Deps>,
}

impl RetentionManager {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self { deps }
    }

    /// Delete files under `scope` whose mtime is older than
    /// `older_than`. Files still referenced by a `Completed` catalog
    /// row are left alone. `recursive` descends into subdirectories
    /// for log-style trees.
    pub async fn cleanup(
        &self,
        older_than: Duration,
        scope: &Path,
        recursive: bool,
    ) -> Result<SweepReport> {
        let cutoff = self.deps.clock.now() - older_than;
        let mut report = SweepReport::default();
        self.sweep_dir(scope, cutoff, recursive, &mut report).await?;
        info!(
            "Sweep of {} removed {} files ({} bytes), {} failures",
            scope.display(),
            report.deleted_count,
            report.freed_bytes,
            report.failed_count
        );
        Ok(report)
    }

    async fn sweep_dir(
        &self,
        dir: &Path,
        cutoff: DateTime<Utc>,
        recursive: bool,
        report: &mut SweepReport,
    ) -> Result<()> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Sweep skipping unreadable directory {}: {}", dir.display(), e);
                return Ok(());
            }
        };

        let mut subdirs: Vec<PathBuf> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => {
                    report.failed_count += 1;
                    continue;
                }
            };

            if meta.is_dir() {
                if recursive {
                    subdirs.push(path);
                }
                continue;
            }

            let mtime: DateTime<Utc> = match meta.modified() {
                Ok(t) => t.into(),
                Err(_) => {
                    report.failed_count += 1;
                    continue;
                }
            };
            if mtime >= cutoff {
                continue;
            }

            if self.deps.catalog.is_tracked_path(&path).await? {
                debug!("Sweep keeping catalog-tracked file: {}", path.display());
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    report.freed_bytes += meta.len();
                    report.deleted_count += 1;
                }
                Err(e) => {
                    warn!("Sweep failed to remove {}: {}", path.display(), e);
                    report.failed_count += 1;
                }
            }
        }

        for sub in subdirs {
            Box::pin(self.sweep_dir(&sub, cutoff, recursive, report)).await?;
        }
        Ok(())
    }

    /// Catalog-driven retention: delete artifacts created before the
    /// policy window, file first then row. Duplicate-name groups among
    /// the survivors are pruned down to their oldest member.
    pub async fn expire_artifacts(&self, retention_days: i64) -> Result<SweepReport> {
        let cutoff = self.deps.clock.now() - Duration::days(retention_days);
        let mut report = SweepReport::default();

        let expired = self.deps.catalog.artifacts_created_before(cutoff).await?;
        for artifact in &expired {
            // Only resting artifacts are eligible; Creating/Restoring
            // rows belong to an in-flight operation.
            if !is_resting(artifact.status) {
                debug!(
                    "Retention skipping {} artifact {} ({})",
                    artifact.status.as_str(),
                    artifact.id,
                    artifact.name
                );
                continue;
            }
            report.absorb(self.remove_artifact(artifact.id).await);
        }

        report.absorb(self.prune_duplicate_groups().await?);

        info!(
            "Retention expired {} artifacts ({} bytes), {} failures",
            report.deleted_count, report.freed_bytes, report.failed_count
        );
        Ok(report)
    }

    /// Among artifacts sharing the same (kind, name), keep only the
    /// oldest by creation time.
    async fn prune_duplicate_groups(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut artifacts = self.deps.catalog.list_artifacts().await?;
        artifacts.sort_by_key(|a| a.created_at);

        let mut seen: std::collections::HashSet<(String, String)> =
            std::collections::HashSet::new();
        for artifact in artifacts {
            if artifact.status != ArtifactStatus::Completed {
                continue;
            }
            let key = (artifact.kind.as_str().to_string(), artifact.name.clone());
            if seen.insert(key) {
                continue;
            }
            debug!(
                "Pruning duplicate {} artifact '{}' ({})",
                artifact.kind.as_str(),
                artifact.name,
                artifact.id
            );
            report.absorb(self.remove_artifact(artifact.id).await);
        }
        Ok(report)
    }

    /// Remove the stored file, then the catalog row, under the same
    /// per-artifact lock create/restore/delete use. The status is
    /// re-read under the lock so an operation that started after the
    /// listing still protects its artifact. A missing file is not an
    /// error; a failing row delete is counted without touching other
    /// artifacts.
    async fn remove_artifact(&self, id: uuid::Uuid) -> SweepReport {
        let mut report = SweepReport::default();
        let _guard = self.deps.locks.acquire(&format!("artifact:{id}")).await;

        let artifact = match self.deps.catalog.get_artifact(id).await {
            Ok(Some(artifact)) if is_resting(artifact.status) => artifact,
            Ok(_) => {
                debug!("Retention skipping busy or vanished artifact {}", id);
                return report;
            }
            Err(e) => {
                warn!("Failed to re-read artifact {}: {}", id, e);
                report.failed_count += 1;
                return report;
            }
        };

        let path = &artifact.storage_path;
        let size = match fs::metadata(path).await {
            Ok(meta) => Some(meta.len()),
            Err(_) => None,
        };

        if size.is_some() {
            if let Err(e) = fs::remove_file(path).await {
                warn!("Failed to remove artifact file {}: {}", path.display(), e);
                report.failed_count += 1;
                return report;
            }
        }

        match self.deps.catalog.delete_artifact(id).await {
            Ok(_) => {
                report.freed_bytes += size.unwrap_or(0);
                report.deleted_count += 1;
            }
            Err(e) => {
                warn!("Failed to delete catalog row for {}: {}", id, e);
                report.failed_count += 1;
            }
        }
        report
    }

    /// Sweep the safety-dump directory with the configured short
    /// retention. Kept safety dumps are catalog-tracked and survive.
    pub async fn sweep_safety_dumps(&self) -> Result<SweepReport> {
        let hours = self.deps.config.operational.safety_retention_hours;
        let dir = self.deps.config.storage.safety_directory.clone();
        self.cleanup(Duration::hours(i64::from(hours)), &dir, false)
            .await
    }
}
