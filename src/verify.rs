use crate::archive::ArchiveBuilder;
use crate::error::Result;
use crate::model::{Artifact, ArtifactKind, Compression};
use crate::runner::SubprocessRunner;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

/// Keywords expected near the start of any plausible logical dump.
const SQL_KEYWORDS: &[&str] = &["CREATE", "INSERT", "COPY", "DROP", "ALTER", "SET"];

/// How much decompressed text the SQL content sniff inspects.
const SNIFF_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub ok: bool,
    pub detail: String,
}

impl VerificationReport {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Read-only integrity and content-sanity checks. Never touches the
/// catalog; verifying the same unmodified artifact twice yields the
/// same report.
#[derive(Debug)]
pub struct VerificationService {
    runner: Arc<dyn SubprocessRunner>,
}

impl VerificationService {
    pub fn new(runner: Arc<dyn SubprocessRunner>) -> Self {
        Self { runner }
    }

    pub async fn verify(&self, artifact: &Artifact) -> Result<VerificationReport> {
        debug!("Verifying artifact {} ({})", artifact.id, artifact.name);

        let meta = match fs::metadata(&artifact.storage_path).await {
            Ok(meta) => meta,
            Err(_) => {
                return Ok(VerificationReport::fail(format!(
                    "artifact file missing: {}",
                    artifact.storage_path.display()
                )))
            }
        };
        if meta.len() == 0 {
            return Ok(VerificationReport::fail("artifact file is empty"));
        }

        if let Some(expected) = &artifact.checksum {
            let actual = file_checksum(&artifact.storage_path).await?;
            if &actual != expected {
                return Ok(VerificationReport::fail(format!(
                    "checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }

        let report = match artifact.kind {
            ArtifactKind::Database => {
                self.verify_sql_payload(&artifact.storage_path, artifact.compression)
                    .await?
            }
            _ => self.verify_archive_payload(artifact).await?,
        };

        info!(
            "Verification of {}: {}",
            artifact.id,
            if report.ok { "ok" } else { "failed" }
        );
        Ok(report)
    }

    /// Gzip integrity (streamed, never whole-body in memory) plus a
    /// keyword sniff over the first few KiB of decompressed text.
    async fn verify_sql_payload(
        &self,
        path: &Path,
        compression: Compression,
    ) -> Result<VerificationReport> {
        if compression == Compression::Gzip {
            if let Err(e) = gzip_stream_check(path).await {
                return Ok(VerificationReport::fail(format!(
                    "gzip stream corrupt: {e}"
                )));
            }
        }

        let head = read_decompressed_head(path, compression).await?;
        let text = String::from_utf8_lossy(&head).to_uppercase();
        if SQL_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            Ok(VerificationReport::pass("dump content plausible"))
        } else {
            Ok(VerificationReport::fail(
                "no recognizable DDL/DML near start of dump",
            ))
        }
    }

    /// Listing the table of contents exercises the container (and the
    /// gzip layer, for compressed archives); a non-zero exit is a
    /// corruption signal.
    async fn verify_archive_payload(&self, artifact: &Artifact) -> Result<VerificationReport> {
        let builder = ArchiveBuilder::new(self.runner.clone());
        match builder
            .list(&artifact.storage_path, artifact.compression)
            .await
        {
            Ok(entries) if entries.is_empty() => {
                Ok(VerificationReport::fail("archive lists no entries"))
            }
            Ok(entries) => Ok(VerificationReport::pass(format!(
                "archive lists {} entries",
                entries.len()
            ))),
            Err(e) => Ok(VerificationReport::fail(format!(
                "archive listing failed: {e}"
            ))),
        }
    }
}

/// SHA-256 of a file, streamed in fixed-size chunks.
pub async fn file_checksum(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let path = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| crate::error::OrchestrationError::storage(format!("checksum task failed: {e}")))??;
    Ok(digest)
}

/// Decode the whole gzip stream into a small scratch buffer, chunk by
/// chunk, to detect truncation or corruption anywhere in the body.
async fn gzip_stream_check(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::open(&path)?;
        let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
        let mut chunk = [0u8; 8192];
        loop {
            if decoder.read(&mut chunk)? == 0 {
                return Ok(());
            }
        }
    })
    .await
    .map_err(|e| std::io::Error::other(format!("gzip check task failed: {e}")))?
}

async fn read_decompressed_head(path: &Path, compression: Compression) -> Result<Vec<u8>> {
    let path = path.to_path_buf();
    let head = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let file = std::fs::File::open(&path)?;
        let mut buf = vec![0u8; SNIFF_BYTES];
        let n = match compression {
            Compression::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
                read_up_to(&mut decoder, &mut buf)?
            }
            Compression::None => {
                let mut reader = std::io::BufReader::new(file);
                read_up_to(&mut reader, &mut buf)?
            }
        };
        buf.truncate(n);
        Ok(buf)
    })
    .await
    .map_err(|e| crate::error::OrchestrationError::storage(format!("sniff task failed: {e}")))??;
    Ok(head)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
