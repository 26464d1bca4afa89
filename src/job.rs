use crate::deps::Deps;
use crate::error::{OrchestrationError, Result};
use crate::model::Artifact;
use crate::orchestrator::{CreateOptions, SnapshotOrchestrator};
use crate::schedule::ScheduleEngine;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Executes one scheduled snapshot. The run is recorded on the
/// schedule row whether or not the snapshot itself succeeded; a
/// failed attempt still happened and the next window still advances.
pub async fn run_schedule(
    deps: Arc<Deps>,
    orchestrator: &SnapshotOrchestrator,
    schedule_id: Uuid,
) -> Result<Artifact> {
    let schedule = deps
        .catalog
        .get_schedule(schedule_id)
        .await?
        .ok_or_else(|| OrchestrationError::NotFound {
            id: schedule_id.to_string(),
        })?;

    if !schedule.enabled {
        return Err(OrchestrationError::state_conflict(format!(
            "schedule '{}' is disabled",
            schedule.name
        )));
    }

    info!(
        "Running schedule '{}' ({} snapshot)",
        schedule.name,
        schedule.kind.as_str()
    );

    let opts = CreateOptions {
        include_paths: schedule.include_paths.clone(),
        exclude_patterns: schedule.exclude_patterns.clone(),
        compression: schedule.compression,
        ..Default::default()
    };
    let result = orchestrator
        .create(schedule.kind, &schedule.name, opts)
        .await;

    let now = deps.clock.now();
    let next = ScheduleEngine::new().next_run(&schedule.schedule_expr, now);
    deps.catalog
        .update_schedule_runs(schedule_id, Some(now), Some(next))
        .await?;

    match result {
        Ok(artifact) => {
            info!(
                "Schedule '{}' produced artifact {} ({} bytes)",
                schedule.name, artifact.id, artifact.size_bytes
            );
            Ok(artifact)
        }
        Err(e) => {
            error!("Schedule '{}' run failed: {}", schedule.name, e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::clock::FixedClock;
    use crate::config::Config;
    use crate::model::{ArtifactKind, ArtifactStatus, Compression, Schedule};
    use crate::runner::ScriptedRunner;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn test_deps(runner: Arc<ScriptedRunner>, backup_dir: PathBuf) -> Arc<Deps> {
        let mut config = Config::default();
        config.storage.backup_directory = backup_dir;
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap());
        Arc::new(Deps::with_parts(
            config,
            Arc::new(MemoryCatalog::new()),
            runner,
            Arc::new(clock),
        ))
    }

    async fn seed_schedule(deps: &Deps, enabled: bool) -> Schedule {
        let schedule = Schedule {
            id: Uuid::new_v4(),
            name: "nightly".to_string(),
            kind: ArtifactKind::Database,
            schedule_expr: "0 2 * * *".to_string(),
            retention_days: 30,
            compression: Compression::Gzip,
            include_paths: Vec::new(),
            exclude_patterns: Vec::new(),
            enabled,
            last_run: None,
            next_run: None,
            created_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        };
        deps.catalog.insert_schedule(&schedule).await.unwrap();
        schedule
    }

    fn script_dump(runner: &ScriptedRunner) {
        runner.respond_with(|call| {
            let idx = call.args.iter().position(|a| a == "--file").unwrap();
            std::fs::write(&call.args[idx + 1], b"CREATE TABLE t ();")?;
            Ok(crate::runner::RunOutput::ok())
        });
    }

    #[tokio::test]
    async fn test_run_schedule_creates_and_stamps_runs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        script_dump(&runner);

        let deps = test_deps(runner, dir.path().to_path_buf());
        let orchestrator = SnapshotOrchestrator::new(deps.clone());
        let schedule = seed_schedule(&deps, true).await;

        let artifact = run_schedule(deps.clone(), &orchestrator, schedule.id)
            .await
            .unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Completed);
        assert_eq!(artifact.name, "nightly");

        let stored = deps.catalog.get_schedule(schedule.id).await.unwrap().unwrap();
        let now = deps.clock.now();
        assert_eq!(stored.last_run, Some(now));
        // 02:00 has passed today, so the next window is tomorrow.
        assert_eq!(
            stored.next_run,
            Some(Utc.with_ymd_and_hms(2024, 6, 11, 2, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_disabled_schedule_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let deps = test_deps(runner.clone(), dir.path().to_path_buf());
        let orchestrator = SnapshotOrchestrator::new(deps.clone());
        let schedule = seed_schedule(&deps, false).await;

        let err = run_schedule(deps, &orchestrator, schedule.id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::StateConflict { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_still_advances_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail(1, "connection refused");

        let deps = test_deps(runner, dir.path().to_path_buf());
        let orchestrator = SnapshotOrchestrator::new(deps.clone());
        let schedule = seed_schedule(&deps, true).await;

        let err = run_schedule(deps.clone(), &orchestrator, schedule.id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Subprocess { .. }));

        let stored = deps.catalog.get_schedule(schedule.id).await.unwrap().unwrap();
        assert!(stored.last_run.is_some());
        assert!(stored.next_run.is_some());
    }

    #[tokio::test]
    async fn test_unknown_schedule_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let deps = test_deps(Arc::new(ScriptedRunner::new()), dir.path().to_path_buf());
        let orchestrator = SnapshotOrchestrator::new(deps.clone());

        let err = run_schedule(deps, &orchestrator, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::NotFound { .. }));
    }
}
