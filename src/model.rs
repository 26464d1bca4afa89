use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// What a snapshot captures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// File archive of caller-selected directories.
    Files,
    /// Logical dump of the primary database.
    Database,
    /// Archive of the fixed system configuration paths.
    Config,
    /// Composite: database dump plus full directory set.
    Full,
    /// Composite: database dump plus a reduced directory set.
    Quick,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Files => "files",
            ArtifactKind::Database => "database",
            ArtifactKind::Config => "config",
            ArtifactKind::Full => "full",
            ArtifactKind::Quick => "quick",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "files" => Some(ArtifactKind::Files),
            "database" => Some(ArtifactKind::Database),
            "config" => Some(ArtifactKind::Config),
            "full" => Some(ArtifactKind::Full),
            "quick" => Some(ArtifactKind::Quick),
            _ => None,
        }
    }

    /// Composite kinds bundle a database dump inside the file archive.
    pub fn is_composite(&self) -> bool {
        matches!(self, ArtifactKind::Full | ArtifactKind::Quick)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Compression::None),
            "gzip" => Some(Compression::Gzip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArtifactStatus {
    Creating,
    Completed,
    Failed,
    Restoring,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Creating => "Creating",
            ArtifactStatus::Completed => "Completed",
            ArtifactStatus::Failed => "Failed",
            ArtifactStatus::Restoring => "Restoring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Creating" => Some(ArtifactStatus::Creating),
            "Completed" => Some(ArtifactStatus::Completed),
            "Failed" => Some(ArtifactStatus::Failed),
            "Restoring" => Some(ArtifactStatus::Restoring),
            _ => None,
        }
    }
}

/// Kind-specific details stored alongside the catalog row as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ArtifactMetadata {
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,

    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Name of the database dump embedded at the root of a composite
    /// archive, e.g. `database.sql`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_dump: Option<String>,
}

/// A single backup or snapshot file plus its catalog metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: Uuid,
    pub name: String,
    pub kind: ArtifactKind,
    pub compression: Compression,
    pub storage_path: PathBuf,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub restored_at: Option<DateTime<Utc>>,
    pub metadata: ArtifactMetadata,
}

impl Artifact {
    /// File extension for this kind/compression pairing.
    pub fn extension(kind: ArtifactKind, compression: Compression) -> &'static str {
        match (kind, compression) {
            (ArtifactKind::Database, Compression::None) => "sql",
            (ArtifactKind::Database, Compression::Gzip) => "sql.gz",
            (_, Compression::None) => "tar",
            (_, Compression::Gzip) => "tar.gz",
        }
    }

    /// Collision-resistant storage file name:
    /// `<kind>_<sanitizedName>_<YYYY-MM-DD_HH-mm-ss>.<ext>`.
    pub fn storage_file_name(
        kind: ArtifactKind,
        name: &str,
        compression: Compression,
        at: DateTime<Utc>,
    ) -> String {
        format!(
            "{}_{}_{}.{}",
            kind.as_str(),
            sanitize_name(name),
            at.format("%Y-%m-%d_%H-%M-%S"),
            Self::extension(kind, compression),
        )
    }
}

/// Strip anything that could interfere with filesystem naming; never
/// empty (falls back to "backup").
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if trimmed.is_empty() {
        "backup".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A recurring backup policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub kind: ArtifactKind,
    /// Normalized 5-field cron-like expression.
    pub schedule_expr: String,
    pub retention_days: u32,
    pub compression: Compression,
    pub include_paths: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
