pub mod archive;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod deps;
pub mod dump;
pub mod error;
pub mod job;
pub mod model;
pub mod orchestrator;
pub mod restore;
pub mod retention;
pub mod runner;
pub mod schedule;
pub mod verify;

pub use config::Config;
pub use deps::Deps;
pub use error::{OrchestrationError, Result};

// Re-export the data model
pub use model::{
    Artifact, ArtifactKind, ArtifactMetadata, ArtifactStatus, Compression, Schedule,
};

// Re-export catalog types
pub use catalog::{Catalog, MemoryCatalog, PgCatalog};

// Re-export the orchestration surface
pub use orchestrator::{CreateOptions, RecoveryReport, SnapshotOrchestrator};
pub use restore::{RestoreCoordinator, RestoreOptions, RestoreOutcome};
pub use retention::{RetentionManager, SweepReport};
pub use schedule::{Frequency, ScheduleEngine};
pub use verify::{VerificationReport, VerificationService};

// Re-export the external-tool seams
pub use clock::{Clock, SystemClock};
pub use runner::{RunOutput, SubprocessRunner, SystemRunner};
