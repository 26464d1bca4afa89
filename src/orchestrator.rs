use crate::archive::ArchiveBuilder;
use crate::deps::Deps;
use crate::dump::{DatabaseDumper, DumpOptions};
use crate::error::{OrchestrationError, Result};
use crate::model::{Artifact, ArtifactKind, ArtifactMetadata, ArtifactStatus, Compression};
use crate::verify::file_checksum;
use chrono::Duration;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Caller-tunable knobs for a single create operation.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Roots to archive; empty means the kind-specific defaults.
    pub include_paths: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub compression: Compression,
    /// Database dumps only: capture schema.
    pub include_structure: bool,
    /// Database dumps only: capture rows.
    pub include_data: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            include_paths: Vec::new(),
            exclude_patterns: Vec::new(),
            compression: Compression::Gzip,
            include_structure: true,
            include_data: true,
        }
    }
}

/// Result of a startup recovery pass over stuck rows.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed_creates: usize,
    pub released_restores: usize,
}

/// Drives the create lifecycle: allocates the catalog row, invokes the
/// archive builder / database dumper per kind, and resolves the
/// terminal state atomically with the artifact's location and size.
#[derive(Debug)]
pub struct SnapshotOrchestrator {
    deps: Arc<Deps>,
    builder: ArchiveBuilder,
    dumper: DatabaseDumper,
}

impl SnapshotOrchestrator {
    pub fn new(deps: Arc<Deps>) -> Self {
        let builder = ArchiveBuilder::new(deps.runner.clone());
        let dumper = DatabaseDumper::new(deps.runner.clone());
        Self {
            deps,
            builder,
            dumper,
        }
    }

    /// Create a snapshot of `kind` labelled `name`. The row starts in
    /// `Creating`; on success the terminal `Completed` update carries
    /// storage path, size, and checksum together, and on any step
    /// failure the row goes to `Failed` with no partial file left
    /// behind. Errors are returned, never left to poison the catalog.
    pub async fn create(
        &self,
        kind: ArtifactKind,
        name: &str,
        opts: CreateOptions,
    ) -> Result<Artifact> {
        let _guard = self
            .deps
            .locks
            .acquire(&format!("create:{}:{}", kind.as_str(), name))
            .await;

        let now = self.deps.clock.now();
        let id = Uuid::new_v4();
        let file_name = Artifact::storage_file_name(kind, name, opts.compression, now);
        let destination = self.deps.config.storage.backup_directory.join(&file_name);

        let include_paths = self.resolve_include_paths(kind, &opts);
        let metadata = ArtifactMetadata {
            include_paths: include_paths.clone(),
            exclude_patterns: opts.exclude_patterns.clone(),
            embedded_dump: kind.is_composite().then(|| "database.sql".to_string()),
        };

        let artifact = Artifact {
            id,
            name: name.to_string(),
            kind,
            compression: opts.compression,
            storage_path: destination.clone(),
            size_bytes: 0,
            checksum: None,
            status: ArtifactStatus::Creating,
            created_at: now,
            restored_at: None,
            metadata,
        };
        self.deps.catalog.insert_artifact(&artifact).await?;

        info!(
            "Creating {} snapshot '{}' -> {}",
            kind.as_str(),
            name,
            destination.display()
        );

        let result = match kind {
            ArtifactKind::Database => {
                self.dumper
                    .dump(
                        &self.deps.config.database,
                        DumpOptions {
                            include_structure: opts.include_structure,
                            include_data: opts.include_data,
                            compression: opts.compression,
                        },
                        &destination,
                    )
                    .await
            }
            ArtifactKind::Files | ArtifactKind::Config => {
                self.builder
                    .build(
                        &include_paths,
                        &opts.exclude_patterns,
                        opts.compression,
                        &destination,
                    )
                    .await
            }
            ArtifactKind::Full | ArtifactKind::Quick => {
                self.create_composite(id, &include_paths, &opts, &destination)
                    .await
            }
        };

        // Reading the checksum back is part of the operation: a
        // storage failure here fails the artifact like any other step.
        let result = match result {
            Ok(size_bytes) => file_checksum(&destination)
                .await
                .map(|checksum| (size_bytes, checksum)),
            Err(e) => Err(e),
        };

        match result {
            Ok((size_bytes, checksum)) => {
                self.deps
                    .catalog
                    .complete_artifact(id, &destination, size_bytes, &checksum)
                    .await?;
                info!(
                    "Snapshot '{}' completed: {} ({} bytes)",
                    name,
                    destination.display(),
                    size_bytes
                );
                Ok(self
                    .deps
                    .catalog
                    .get_artifact(id)
                    .await?
                    .ok_or_else(|| OrchestrationError::NotFound { id: id.to_string() })?)
            }
            Err(e) => {
                error!("Snapshot '{}' failed: {}", name, e);
                // Steps clean up their own partial output; this covers
                // a failure after the file was fully produced.
                if fs::metadata(&destination)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false)
                {
                    if let Err(remove_err) = fs::remove_file(&destination).await {
                        warn!(
                            "Failed to remove partial snapshot {}: {}",
                            destination.display(),
                            remove_err
                        );
                    }
                }
                self.deps.catalog.fail_artifact(id).await?;
                Err(e)
            }
        }
    }

    /// Composite (full/quick) creation is all-or-nothing: the dump and
    /// the archive must both succeed, and the temp dump directory is
    /// removed regardless of outcome.
    async fn create_composite(
        &self,
        id: Uuid,
        include_paths: &[PathBuf],
        opts: &CreateOptions,
        destination: &PathBuf,
    ) -> Result<i64> {
        let temp_dir = self
            .deps
            .config
            .storage
            .backup_directory
            .join(format!(".compose_{id}"));
        fs::create_dir_all(&temp_dir).await?;

        let result = async {
            // The embedded dump stays plain; the outer archive layer
            // handles compression.
            let dump_path = temp_dir.join("database.sql");
            self.dumper
                .dump(
                    &self.deps.config.database,
                    DumpOptions {
                        include_structure: opts.include_structure,
                        include_data: opts.include_data,
                        compression: Compression::None,
                    },
                    &dump_path,
                )
                .await?;

            let mut roots = vec![dump_path];
            roots.extend(include_paths.iter().cloned());
            self.builder
                .build(&roots, &opts.exclude_patterns, opts.compression, destination)
                .await
        }
        .await;

        if let Err(e) = fs::remove_dir_all(&temp_dir).await {
            warn!(
                "Failed to remove compose dir {}: {}",
                temp_dir.display(),
                e
            );
        }

        result
    }

    fn resolve_include_paths(&self, kind: ArtifactKind, opts: &CreateOptions) -> Vec<PathBuf> {
        let storage = &self.deps.config.storage;
        match kind {
            ArtifactKind::Database => Vec::new(),
            ArtifactKind::Config => storage.config_paths.clone(),
            ArtifactKind::Files | ArtifactKind::Quick => {
                if opts.include_paths.is_empty() {
                    storage.default_file_roots.clone()
                } else {
                    opts.include_paths.clone()
                }
            }
            ArtifactKind::Full => {
                if opts.include_paths.is_empty() {
                    let mut roots = storage.default_file_roots.clone();
                    roots.extend(storage.config_paths.iter().cloned());
                    roots
                } else {
                    opts.include_paths.clone()
                }
            }
        }
    }

    /// Delete an artifact: file first, then the catalog row, under the
    /// same per-artifact lock create/restore use.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let _guard = self.deps.locks.acquire(&format!("artifact:{id}")).await;

        let artifact = self
            .deps
            .catalog
            .get_artifact(id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound { id: id.to_string() })?;

        if fs::metadata(&artifact.storage_path).await.is_ok() {
            fs::remove_file(&artifact.storage_path).await?;
        }
        self.deps.catalog.delete_artifact(id).await?;

        info!("Deleted artifact {} ({})", id, artifact.name);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Artifact>> {
        self.deps.catalog.list_artifacts().await
    }

    /// Startup watchdog: fail `Creating` rows older than `older_than`
    /// (removing any partial file) and release `Restoring` rows back
    /// to `Completed`. No operation is in flight when this runs, so a
    /// lingering `Restoring` row can only be a crashed restore.
    pub async fn recover_stuck(&self, older_than: Duration) -> Result<RecoveryReport> {
        let cutoff = self.deps.clock.now() - older_than;
        let mut report = RecoveryReport::default();

        for artifact in self
            .deps
            .catalog
            .artifacts_in_status(ArtifactStatus::Creating)
            .await?
        {
            if artifact.created_at < cutoff {
                warn!(
                    "Failing stuck Creating artifact {} ({})",
                    artifact.id, artifact.name
                );
                if fs::metadata(&artifact.storage_path).await.is_ok() {
                    let _ = fs::remove_file(&artifact.storage_path).await;
                }
                self.deps.catalog.fail_artifact(artifact.id).await?;
                report.failed_creates += 1;
            }
        }

        for artifact in self
            .deps
            .catalog
            .artifacts_in_status(ArtifactStatus::Restoring)
            .await?
        {
            warn!(
                "Releasing stuck Restoring artifact {} ({})",
                artifact.id, artifact.name
            );
            self.deps
                .catalog
                .set_artifact_status(artifact.id, ArtifactStatus::Completed)
                .await?;
            report.released_restores += 1;
        }

        debug!(
            "Recovery pass: {} creates failed, {} restores released",
            report.failed_creates, report.released_restores
        );
        Ok(report)
    }
}
