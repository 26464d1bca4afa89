use crate::archive::ArchiveBuilder;
use crate::deps::Deps;
use crate::dump::{DatabaseDumper, DumpOptions};
use crate::error::{OrchestrationError, Result};
use crate::model::{
    Artifact, ArtifactKind, ArtifactMetadata, ArtifactStatus, Compression,
};
use crate::verify::file_checksum;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// When false, files already present at the target are preserved.
    pub overwrite_existing: bool,
    /// Where archives are extracted; defaults to the filesystem root,
    /// i.e. the paths the artifact originally captured.
    pub target_location: Option<PathBuf>,
    /// Explicitly waive the pre-restore safety dump.
    pub skip_safety_dump: bool,
    /// Register the safety dump as a regular catalog artifact instead
    /// of leaving it to the safety-directory sweep.
    pub keep_safety_dump: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: false,
            target_location: None,
            skip_safety_dump: false,
            keep_safety_dump: false,
        }
    }
}

/// How a restore ended. A partial outcome is never collapsed into
/// plain success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Full,
    Partial { detail: String },
}

/// Drives the restore lifecycle: safety dump, `Restoring` transition,
/// kind-specific strategy, and honest reporting of partial failure.
#[derive(Debug)]
pub struct RestoreCoordinator {
    deps: Arc<Deps>,
    builder: ArchiveBuilder,
    dumper: DatabaseDumper,
}

impl RestoreCoordinator {
    pub fn new(deps: Arc<Deps>) -> Self {
        let builder = ArchiveBuilder::new(deps.runner.clone());
        let dumper = DatabaseDumper::new(deps.runner.clone());
        Self {
            deps,
            builder,
            dumper,
        }
    }

    pub async fn restore(&self, artifact_id: Uuid, opts: RestoreOptions) -> Result<RestoreOutcome> {
        let _guard = self
            .deps
            .locks
            .acquire(&format!("artifact:{artifact_id}"))
            .await;

        let artifact = self
            .deps
            .catalog
            .get_artifact(artifact_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound {
                id: artifact_id.to_string(),
            })?;

        if artifact.status != ArtifactStatus::Completed {
            return Err(OrchestrationError::state_conflict(format!(
                "artifact {} is {}, restore requires Completed",
                artifact_id,
                artifact.status.as_str()
            )));
        }

        info!(
            "Restoring {} artifact '{}' from {}",
            artifact.kind.as_str(),
            artifact.name,
            artifact.storage_path.display()
        );

        // Fail closed: no safety net, no restore.
        if !opts.skip_safety_dump {
            self.take_safety_dump(&artifact, opts.keep_safety_dump)
                .await
                .map_err(|e| {
                    error!("Pre-restore safety dump failed, aborting restore: {}", e);
                    e
                })?;
        }

        self.deps
            .catalog
            .set_artifact_status(artifact_id, ArtifactStatus::Restoring)
            .await?;

        let result = match artifact.kind {
            ArtifactKind::Database => self.restore_database(&artifact).await,
            ArtifactKind::Files | ArtifactKind::Config => self.restore_files(&artifact, &opts).await,
            ArtifactKind::Full | ArtifactKind::Quick => self.restore_composite(&artifact, &opts).await,
        };

        // The artifact itself remains reusable whatever happened to
        // the restore; the operation's outcome travels separately.
        self.deps
            .catalog
            .mark_restored(artifact_id, self.deps.clock.now())
            .await?;

        match &result {
            Ok(RestoreOutcome::Full) => info!("Restore of '{}' completed", artifact.name),
            Ok(RestoreOutcome::Partial { detail }) => {
                warn!("Restore of '{}' partially failed: {}", artifact.name, detail)
            }
            Err(e) => error!("Restore of '{}' failed: {}", artifact.name, e),
        }
        result
    }

    async fn restore_database(&self, artifact: &Artifact) -> Result<RestoreOutcome> {
        self.dumper
            .restore(
                &self.deps.config.database,
                &artifact.storage_path,
                artifact.compression,
            )
            .await?;
        Ok(RestoreOutcome::Full)
    }

    async fn restore_files(
        &self,
        artifact: &Artifact,
        opts: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        let target = opts
            .target_location
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"));
        self.builder
            .extract(
                &artifact.storage_path,
                &target,
                artifact.compression,
                opts.overwrite_existing,
                &[],
            )
            .await?;
        Ok(RestoreOutcome::Full)
    }

    /// Composite restore: unpack to an isolated temp directory, replay
    /// the embedded dump, then apply the remaining files, in that
    /// order. A files failure after a successful database restore
    /// surfaces as partial success with detail.
    async fn restore_composite(
        &self,
        artifact: &Artifact,
        opts: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        let dump_name = artifact
            .metadata
            .embedded_dump
            .clone()
            .ok_or_else(|| OrchestrationError::Integrity {
                message: format!(
                    "composite artifact {} records no embedded dump",
                    artifact.id
                ),
            })?;

        let temp_dir = self
            .deps
            .config
            .storage
            .backup_directory
            .join(format!(".restore_{}", artifact.id));

        let outcome = async {
            self.builder
                .extract(
                    &artifact.storage_path,
                    &temp_dir,
                    artifact.compression,
                    true,
                    &[],
                )
                .await?;

            let dump_path = temp_dir.join(&dump_name);
            if fs::metadata(&dump_path).await.is_err() {
                return Err(OrchestrationError::Integrity {
                    message: format!("embedded dump {dump_name} missing from archive"),
                });
            }
            self.dumper
                .restore(&self.deps.config.database, &dump_path, Compression::None)
                .await?;

            // Database is in; apply the file trees. A failure from
            // here on is partial, not total.
            let target = opts
                .target_location
                .clone()
                .unwrap_or_else(|| PathBuf::from("/"));
            match self
                .builder
                .extract(
                    &artifact.storage_path,
                    &target,
                    artifact.compression,
                    opts.overwrite_existing,
                    &[dump_name.clone()],
                )
                .await
            {
                Ok(()) => Ok(RestoreOutcome::Full),
                Err(e) => Ok(RestoreOutcome::Partial {
                    detail: format!("database restored, files step failed: {e}"),
                }),
            }
        }
        .await;

        if let Err(e) = fs::remove_dir_all(&temp_dir).await {
            if fs::metadata(&temp_dir).await.is_ok() {
                warn!(
                    "Failed to remove restore temp dir {}: {}",
                    temp_dir.display(),
                    e
                );
            }
        }

        outcome
    }

    /// Take the transient pre-restore dump under the safety directory.
    /// With `keep`, it is promoted to a regular `Database` artifact.
    async fn take_safety_dump(&self, artifact: &Artifact, keep: bool) -> Result<()> {
        let now = self.deps.clock.now();
        let name = format!("pre_restore_{}", artifact.name);
        let file_name =
            Artifact::storage_file_name(ArtifactKind::Database, &name, Compression::Gzip, now);
        let path = self.deps.config.storage.safety_directory.join(file_name);

        let size = self
            .dumper
            .dump(
                &self.deps.config.database,
                DumpOptions::default(),
                &path,
            )
            .await?;

        info!("Safety dump taken: {} ({} bytes)", path.display(), size);

        if keep {
            let checksum = file_checksum(&path).await?;
            let safety = Artifact {
                id: Uuid::new_v4(),
                name,
                kind: ArtifactKind::Database,
                compression: Compression::Gzip,
                storage_path: path,
                size_bytes: size,
                checksum: Some(checksum),
                status: ArtifactStatus::Completed,
                created_at: now,
                restored_at: None,
                metadata: ArtifactMetadata::default(),
            };
            self.deps.catalog.insert_artifact(&safety).await?;
        }

        Ok(())
    }
}
