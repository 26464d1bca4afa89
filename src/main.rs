use anyhow::Result;
use chrono::Duration;
use clap::{Parser, Subcommand};
use snapvault::catalog::{Catalog, PgCatalog};
use snapvault::model::{ArtifactKind, Compression, Schedule};
use snapvault::orchestrator::CreateOptions;
use snapvault::restore::RestoreOptions;
use snapvault::schedule::Frequency;
use snapvault::{
    Config, Deps, RestoreCoordinator, RetentionManager, ScheduleEngine, SnapshotOrchestrator,
    VerificationService,
};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "snapvault")]
#[command(about = "Backup and snapshot orchestration for servers: archives, database dumps, verification, retention")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a snapshot artifact
    Create {
        /// Snapshot kind: files, database, config, full, quick
        kind: String,
        /// Artifact name
        name: String,
        /// Paths to include (defaults depend on kind)
        #[arg(long)]
        include: Vec<PathBuf>,
        /// Extra exclude patterns
        #[arg(long)]
        exclude: Vec<String>,
        /// Store uncompressed
        #[arg(long)]
        no_compress: bool,
    },
    /// Restore an artifact
    Restore {
        /// Artifact id
        id: Uuid,
        /// Overwrite files that already exist at the target
        #[arg(long)]
        overwrite: bool,
        /// Extract to this directory instead of the original location
        #[arg(long)]
        target: Option<PathBuf>,
        /// Skip the pre-restore safety dump
        #[arg(long)]
        skip_safety_dump: bool,
        /// Register the safety dump as a regular artifact
        #[arg(long)]
        keep_safety_dump: bool,
    },
    /// Verify an artifact's integrity
    Verify {
        /// Artifact id
        id: Uuid,
    },
    /// List catalog artifacts
    List,
    /// Delete an artifact and its stored file
    Delete {
        /// Artifact id
        id: Uuid,
    },
    /// Expire old artifacts and sweep untracked files
    Cleanup {
        /// Override the configured retention window in days
        #[arg(long)]
        days: Option<i64>,
        /// Also sweep a raw directory by file age
        #[arg(long)]
        sweep: Option<PathBuf>,
        /// Descend into subdirectories when sweeping
        #[arg(long)]
        recursive: bool,
    },
    /// Snapshot schedule management
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Execute a schedule immediately
    RunSchedule {
        /// Schedule id
        id: Uuid,
    },
    /// Generate a sample .env configuration file
    InitConfig,
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Register a new schedule
    Add {
        /// Schedule and artifact name
        name: String,
        /// Snapshot kind: files, database, config, full, quick
        kind: String,
        /// Frequency: hourly, daily[:H], weekly:W:H, monthly:D:H, or a
        /// raw 5-field expression
        #[arg(long, default_value = "daily:2")]
        every: String,
        /// Retention in days for artifacts from this schedule
        #[arg(long)]
        retention_days: Option<u32>,
        /// Paths to include
        #[arg(long)]
        include: Vec<PathBuf>,
        /// Extra exclude patterns
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// List schedules
    List,
    /// Enable a schedule
    Enable { id: Uuid },
    /// Disable a schedule
    Disable { id: Uuid },
    /// Remove a schedule
    Remove { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // No configuration or database needed to write the sample file.
    if matches!(cli.command, Commands::InitConfig) {
        return Config::write_sample_env_file();
    }

    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.operational.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&catalog_url(&config))
        .await?;
    let catalog = Arc::new(PgCatalog::new(Arc::new(pool)));
    catalog.initialize().await?;

    let deps = Arc::new(Deps::new(config, catalog));
    let orchestrator = SnapshotOrchestrator::new(deps.clone());

    // Recover rows a crashed process left mid-operation.
    let stuck = Duration::minutes(deps.config.operational.stuck_operation_timeout_minutes as i64);
    let recovery = orchestrator.recover_stuck(stuck).await?;
    if recovery.failed_creates > 0 || recovery.released_restores > 0 {
        info!(
            "Startup recovery: {} stale creates failed, {} stale restores released",
            recovery.failed_creates, recovery.released_restores
        );
    }

    match cli.command {
        Commands::Create {
            kind,
            name,
            include,
            exclude,
            no_compress,
        } => {
            let kind = parse_kind(&kind)?;
            let opts = CreateOptions {
                include_paths: include,
                exclude_patterns: exclude,
                compression: if no_compress {
                    Compression::None
                } else {
                    Compression::Gzip
                },
                ..Default::default()
            };
            let artifact = orchestrator.create(kind, &name, opts).await?;
            println!(
                "Created {} artifact {} ({} bytes) at {}",
                artifact.kind.as_str(),
                artifact.id,
                artifact.size_bytes,
                artifact.storage_path.display()
            );
            Ok(())
        }
        Commands::Restore {
            id,
            overwrite,
            target,
            skip_safety_dump,
            keep_safety_dump,
        } => {
            let coordinator = RestoreCoordinator::new(deps.clone());
            let outcome = coordinator
                .restore(
                    id,
                    RestoreOptions {
                        overwrite_existing: overwrite,
                        target_location: target,
                        skip_safety_dump,
                        keep_safety_dump,
                    },
                )
                .await?;
            match outcome {
                snapvault::RestoreOutcome::Full => println!("Restore completed"),
                snapvault::RestoreOutcome::Partial { detail } => {
                    println!("Restore partially completed: {detail}");
                    std::process::exit(2);
                }
            }
            Ok(())
        }
        Commands::Verify { id } => {
            let service = VerificationService::new(deps.runner.clone());
            let artifact = deps
                .catalog
                .get_artifact(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no artifact with id {id}"))?;
            let report = service.verify(&artifact).await?;
            if report.ok {
                println!("OK: {}", report.detail);
                Ok(())
            } else {
                println!("FAILED: {}", report.detail);
                std::process::exit(1);
            }
        }
        Commands::List => {
            let artifacts = orchestrator.list().await?;
            if artifacts.is_empty() {
                println!("No artifacts");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<24} {:<10} {:>12}  CREATED",
                "ID", "KIND", "NAME", "STATUS", "SIZE"
            );
            for a in artifacts {
                println!(
                    "{:<38} {:<10} {:<24} {:<10} {:>12}  {}",
                    a.id,
                    a.kind.as_str(),
                    a.name,
                    a.status.as_str(),
                    a.size_bytes,
                    a.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Commands::Delete { id } => {
            orchestrator.delete(id).await?;
            println!("Deleted artifact {id}");
            Ok(())
        }
        Commands::Cleanup {
            days,
            sweep,
            recursive,
        } => {
            let manager = RetentionManager::new(deps.clone());
            let retention = days.unwrap_or(deps.config.operational.retention_days as i64);
            let report = manager.expire_artifacts(retention).await?;
            println!(
                "Expired {} artifacts, freed {} bytes, {} failures",
                report.deleted_count, report.freed_bytes, report.failed_count
            );

            let safety = manager.sweep_safety_dumps().await?;
            if safety.deleted_count > 0 {
                println!(
                    "Swept {} safety dumps ({} bytes)",
                    safety.deleted_count, safety.freed_bytes
                );
            }

            if let Some(dir) = sweep {
                let swept = manager
                    .cleanup(Duration::days(retention), &dir, recursive)
                    .await?;
                println!(
                    "Swept {}: {} files removed, {} bytes freed, {} failures",
                    dir.display(),
                    swept.deleted_count,
                    swept.freed_bytes,
                    swept.failed_count
                );
            }
            Ok(())
        }
        Commands::Schedule { command } => handle_schedule_command(command, &deps).await,
        Commands::RunSchedule { id } => {
            let artifact = snapvault::job::run_schedule(deps.clone(), &orchestrator, id).await?;
            println!(
                "Schedule run produced artifact {} ({} bytes)",
                artifact.id, artifact.size_bytes
            );
            Ok(())
        }
        Commands::InitConfig => unreachable!("handled before startup"),
    }
}

async fn handle_schedule_command(command: ScheduleCommands, deps: &Arc<Deps>) -> Result<()> {
    let engine = ScheduleEngine::new();
    match command {
        ScheduleCommands::Add {
            name,
            kind,
            every,
            retention_days,
            include,
            exclude,
        } => {
            let kind = parse_kind(&kind)?;
            let expr = engine.build_expression(&Frequency::parse(&every));
            let now = deps.clock.now();
            let schedule = Schedule {
                id: Uuid::new_v4(),
                name,
                kind,
                schedule_expr: expr.clone(),
                retention_days: retention_days
                    .unwrap_or(deps.config.operational.retention_days),
                compression: Compression::Gzip,
                include_paths: include,
                exclude_patterns: exclude,
                enabled: true,
                last_run: None,
                next_run: Some(engine.next_run(&expr, now)),
                created_at: now,
            };
            deps.catalog.insert_schedule(&schedule).await?;
            println!("Added schedule {} ({})", schedule.id, schedule.schedule_expr);
            Ok(())
        }
        ScheduleCommands::List => {
            let schedules = deps.catalog.list_schedules().await?;
            if schedules.is_empty() {
                println!("No schedules");
                return Ok(());
            }
            println!(
                "{:<38} {:<24} {:<10} {:<12} {:<8}  NEXT RUN",
                "ID", "NAME", "KIND", "EXPRESSION", "ENABLED"
            );
            for s in schedules {
                println!(
                    "{:<38} {:<24} {:<10} {:<12} {:<8}  {}",
                    s.id,
                    s.name,
                    s.kind.as_str(),
                    s.schedule_expr,
                    s.enabled,
                    s.next_run
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            Ok(())
        }
        ScheduleCommands::Enable { id } => {
            let schedule = deps
                .catalog
                .get_schedule(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no schedule with id {id}"))?;
            let next = engine.next_run(&schedule.schedule_expr, deps.clock.now());
            deps.catalog.set_schedule_enabled(id, true, Some(next)).await?;
            println!("Enabled schedule {id}, next run {next}");
            Ok(())
        }
        ScheduleCommands::Disable { id } => {
            deps.catalog.set_schedule_enabled(id, false, None).await?;
            println!("Disabled schedule {id}");
            Ok(())
        }
        ScheduleCommands::Remove { id } => {
            deps.catalog.delete_schedule(id).await?;
            println!("Removed schedule {id}");
            Ok(())
        }
    }
}

fn parse_kind(s: &str) -> Result<ArtifactKind> {
    ArtifactKind::parse(s).ok_or_else(|| {
        anyhow::anyhow!("unknown snapshot kind '{s}' (expected files, database, config, full, quick)")
    })
}

/// Catalog connection string. `DATABASE_URL` wins; otherwise the
/// catalog shares the configured database target.
fn catalog_url(config: &Config) -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            config.database.user,
            config.database.password,
            config.database.host,
            config.database.port,
            config.database.database
        )
    })
}
