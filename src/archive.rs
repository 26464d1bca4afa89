use crate::error::{OrchestrationError, Result};
use crate::model::Compression;
use crate::runner::SubprocessRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Glob patterns excluded from every archive in addition to whatever
/// the caller supplies.
pub const NOISE_EXCLUDES: &[&str] = &["*.log", "*.tmp", "cache/*", "tmp/*", "node_modules/*"];

/// Builds, lists, and extracts tar archives through the subprocess
/// seam.
#[derive(Debug)]
pub struct ArchiveBuilder {
    runner: Arc<dyn SubprocessRunner>,
}

impl ArchiveBuilder {
    pub fn new(runner: Arc<dyn SubprocessRunner>) -> Self {
        Self { runner }
    }

    /// Archive `include_paths` into `destination`. Include paths that
    /// do not exist are skipped silently; an archive with nothing to
    /// put in it is an error. On any tool failure the destination is
    /// removed so no partial artifact is left behind.
    pub async fn build(
        &self,
        include_paths: &[PathBuf],
        exclude_patterns: &[String],
        compression: Compression,
        destination: &Path,
    ) -> Result<i64> {
        if fs::metadata(destination).await.is_ok() {
            return Err(OrchestrationError::state_conflict(format!(
                "destination already exists: {}",
                destination.display()
            )));
        }

        let mut present = Vec::new();
        for path in include_paths {
            match fs::metadata(path).await {
                Ok(meta) => present.push((path.clone(), meta.is_file())),
                Err(_) => debug!("Skipping missing include path: {}", path.display()),
            }
        }

        if present.is_empty() {
            return Err(OrchestrationError::storage(
                "nothing to archive: no include path exists",
            ));
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut args: Vec<String> = vec!["-c".to_string()];
        if compression == Compression::Gzip {
            args.push("-z".to_string());
        }
        args.push("-f".to_string());
        args.push(destination.to_string_lossy().into_owned());

        for pattern in exclude_patterns.iter().map(String::as_str).chain(
            NOISE_EXCLUDES.iter().copied(),
        ) {
            args.push(format!("--exclude={pattern}"));
        }

        // Directory roots are archived relative to the filesystem root
        // (entry `var/www/...`) so extraction to `/` is an exact
        // inverse; file roots land at the archive root by basename,
        // which is how composite artifacts embed their database dump.
        for (path, is_file) in &present {
            if *is_file {
                let parent = path.parent().unwrap_or_else(|| Path::new("/"));
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| ".".to_string());
                args.push("-C".to_string());
                args.push(parent.to_string_lossy().into_owned());
                args.push(name);
            } else {
                let rel = path
                    .strip_prefix("/")
                    .map(|r| r.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| path.to_string_lossy().into_owned());
                args.push("-C".to_string());
                args.push("/".to_string());
                args.push(rel);
            }
        }

        debug!(
            "Archiving {} roots into {}",
            present.len(),
            destination.display()
        );

        let output = match self.runner.run("tar", &args, &[]).await {
            Ok(output) => output,
            Err(e) => {
                self.remove_partial(destination).await;
                return Err(e);
            }
        };

        if !output.success() {
            self.remove_partial(destination).await;
            return Err(OrchestrationError::Subprocess {
                tool: "tar".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let size = match fs::metadata(destination).await {
            Ok(meta) if meta.len() > 0 => meta.len() as i64,
            _ => {
                self.remove_partial(destination).await;
                return Err(OrchestrationError::storage(format!(
                    "tar reported success but produced no archive at {}",
                    destination.display()
                )));
            }
        };

        debug!("Archive written: {} ({} bytes)", destination.display(), size);
        Ok(size)
    }

    /// Table of contents of an archive. A non-zero exit is a
    /// corruption signal surfaced as a subprocess error.
    pub async fn list(&self, archive: &Path, compression: Compression) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec!["-t".to_string()];
        if compression == Compression::Gzip {
            args.push("-z".to_string());
        }
        args.push("-f".to_string());
        args.push(archive.to_string_lossy().into_owned());

        let output = self.runner.run("tar", &args, &[]).await?;
        if !output.success() {
            return Err(OrchestrationError::Subprocess {
                tool: "tar".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        Ok(output
            .stdout
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Extract an archive into `target`, optionally skipping entries
    /// matching `excludes`. With `overwrite` false, existing files are
    /// left in place and the corresponding archive entries are skipped.
    pub async fn extract(
        &self,
        archive: &Path,
        target: &Path,
        compression: Compression,
        overwrite: bool,
        excludes: &[String],
    ) -> Result<()> {
        fs::create_dir_all(target).await?;

        let mut args: Vec<String> = vec!["-x".to_string()];
        if compression == Compression::Gzip {
            args.push("-z".to_string());
        }
        if !overwrite {
            args.push("--skip-old-files".to_string());
        }
        for pattern in excludes {
            args.push(format!("--exclude={pattern}"));
        }
        args.push("-f".to_string());
        args.push(archive.to_string_lossy().into_owned());
        args.push("-C".to_string());
        args.push(target.to_string_lossy().into_owned());

        let output = self.runner.run("tar", &args, &[]).await?;
        if !output.success() {
            return Err(OrchestrationError::Subprocess {
                tool: "tar".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        Ok(())
    }

    async fn remove_partial(&self, destination: &Path) {
        if fs::metadata(destination).await.is_ok() {
            if let Err(e) = fs::remove_file(destination).await {
                warn!(
                    "Failed to remove partial archive {}: {}",
                    destination.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptedRunner;
    use std::fs;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn test_build_skips_missing_paths_silently() {
        let dir = scratch();
        let present = dir.path().join("www");
        fs::create_dir(&present).unwrap();
        let dest = dir.path().join("out.tar.gz");

        let runner = Arc::new(ScriptedRunner::new());
        runner.succeed_creating(dest.clone(), b"archive".to_vec());

        let builder = ArchiveBuilder::new(runner.clone());
        let size = builder
            .build(
                &[present.clone(), dir.path().join("missing")],
                &[],
                Compression::Gzip,
                &dest,
            )
            .await
            .unwrap();
        assert_eq!(size, 7);

        // Only the existing root made it into the tar invocation,
        // rooted relative to /.
        let rel = present.strip_prefix("/").unwrap().to_string_lossy().into_owned();
        let call = &runner.calls()[0];
        assert!(call.args.contains(&rel));
        assert!(!call.args.iter().any(|a| a.contains("missing")));
    }

    #[tokio::test]
    async fn test_build_appends_noise_excludes() {
        let dir = scratch();
        let root = dir.path().join("site");
        fs::create_dir(&root).unwrap();
        let dest = dir.path().join("out.tar");

        let runner = Arc::new(ScriptedRunner::new());
        runner.succeed_creating(dest.clone(), b"x".to_vec());

        let builder = ArchiveBuilder::new(runner.clone());
        builder
            .build(
                &[root],
                &["*.bak".to_string()],
                Compression::None,
                &dest,
            )
            .await
            .unwrap();

        let args = &runner.calls()[0].args;
        assert!(args.contains(&"--exclude=*.bak".to_string()));
        for noise in NOISE_EXCLUDES {
            assert!(args.contains(&format!("--exclude={noise}")));
        }
        // Uncompressed build must not pass -z.
        assert!(!args.contains(&"-z".to_string()));
    }

    #[tokio::test]
    async fn test_build_failure_removes_partial_archive() {
        let dir = scratch();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        let dest = dir.path().join("out.tar");

        let runner = Arc::new(ScriptedRunner::new());
        let dest_clone = dest.clone();
        runner.respond_with(move |_| {
            // Tool wrote a partial file, then died.
            std::fs::write(&dest_clone, b"partial")?;
            Ok(crate::runner::RunOutput::failed(2, "tar: unexpected EOF"))
        });

        let builder = ArchiveBuilder::new(runner);
        let err = builder
            .build(&[root], &[], Compression::None, &dest)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestrationError::Subprocess { exit_code: 2, .. }
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_build_rejects_existing_destination() {
        let dir = scratch();
        let root = dir.path().join("data");
        fs::create_dir(&root).unwrap();
        let dest = dir.path().join("out.tar");
        fs::write(&dest, b"already here").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let builder = ArchiveBuilder::new(runner.clone());
        let err = builder
            .build(&[root], &[], Compression::None, &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::StateConflict { .. }));
        // The conflicting file is untouched and tar was never invoked.
        assert_eq!(fs::read(&dest).unwrap(), b"already here");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_build_with_all_paths_missing_is_storage_error() {
        let dir = scratch();
        let runner = Arc::new(ScriptedRunner::new());
        let builder = ArchiveBuilder::new(runner.clone());

        let err = builder
            .build(
                &[dir.path().join("a"), dir.path().join("b")],
                &[],
                Compression::None,
                &dir.path().join("out.tar"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::Storage { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_list_parses_table_of_contents() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.succeed_with_stdout("www/\nwww/index.html\ndatabase.sql.gz\n");

        let builder = ArchiveBuilder::new(runner);
        let entries = builder
            .list(Path::new("/backups/full.tar.gz"), Compression::Gzip)
            .await
            .unwrap();
        assert_eq!(
            entries,
            vec!["www/", "www/index.html", "database.sql.gz"]
        );
    }

    #[tokio::test]
    async fn test_extract_without_overwrite_skips_old_files() {
        let dir = scratch();
        let runner = Arc::new(ScriptedRunner::new());
        let builder = ArchiveBuilder::new(runner.clone());

        builder
            .extract(
                Path::new("/backups/a.tar"),
                dir.path(),
                Compression::None,
                false,
                &[],
            )
            .await
            .unwrap();
        assert!(runner.calls()[0]
            .args
            .contains(&"--skip-old-files".to_string()));

        builder
            .extract(
                Path::new("/backups/a.tar"),
                dir.path(),
                Compression::None,
                true,
                &["database.sql".to_string()],
            )
            .await
            .unwrap();
        let second = &runner.calls()[1].args;
        assert!(!second.contains(&"--skip-old-files".to_string()));
        assert!(second.contains(&"--exclude=database.sql".to_string()));
    }

    #[tokio::test]
    async fn test_file_roots_land_at_archive_root() {
        let dir = scratch();
        let dump = dir.path().join("stage").join("database.sql");
        fs::create_dir_all(dump.parent().unwrap()).unwrap();
        fs::write(&dump, b"CREATE TABLE t ();").unwrap();
        let dest = dir.path().join("out.tar");

        let runner = Arc::new(ScriptedRunner::new());
        runner.succeed_creating(dest.clone(), b"x".to_vec());

        let builder = ArchiveBuilder::new(runner.clone());
        builder
            .build(&[dump], &[], Compression::None, &dest)
            .await
            .unwrap();

        let args = &runner.calls()[0].args;
        // `-C <stage dir> database.sql`, not a rooted relative path.
        assert!(args.contains(&"database.sql".to_string()));
        let c_idx = args.iter().rposition(|a| a == "-C").unwrap();
        assert!(args[c_idx + 1].ends_with("stage"));
    }
}
