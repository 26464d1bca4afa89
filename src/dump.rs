use crate::config::DbTarget;
use crate::error::{OrchestrationError, Result};
use crate::model::Compression;
use crate::runner::SubprocessRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// What a logical dump should contain.
#[derive(Debug, Clone, Copy)]
pub struct DumpOptions {
    pub include_structure: bool,
    pub include_data: bool,
    pub compression: Compression,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            include_structure: true,
            include_data: true,
            compression: Compression::Gzip,
        }
    }
}

/// Produces and replays logical database dumps through pg_dump/psql.
#[derive(Debug)]
pub struct DatabaseDumper {
    runner: Arc<dyn SubprocessRunner>,
}

impl DatabaseDumper {
    pub fn new(runner: Arc<dyn SubprocessRunner>) -> Self {
        Self { runner }
    }

    /// Dump `target` into `destination`. On failure the destination is
    /// removed; on success it exists and is non-empty. pg_dump runs
    /// against a single consistent snapshot, so the dump is
    /// transactionally consistent.
    pub async fn dump(
        &self,
        target: &DbTarget,
        opts: DumpOptions,
        destination: &Path,
    ) -> Result<i64> {
        if !opts.include_structure && !opts.include_data {
            return Err(OrchestrationError::config(
                "dump must include structure, data, or both",
            ));
        }

        if fs::metadata(destination).await.is_ok() {
            return Err(OrchestrationError::state_conflict(format!(
                "destination already exists: {}",
                destination.display()
            )));
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        // pg_dump always writes plain SQL; gzip is applied as a
        // separate streaming pass.
        let plain_path = match opts.compression {
            Compression::None => destination.to_path_buf(),
            Compression::Gzip => {
                let mut os = destination.as_os_str().to_owned();
                os.push(".plain");
                PathBuf::from(os)
            }
        };

        let mut args: Vec<String> = vec![
            "--no-owner".to_string(),
            "--no-privileges".to_string(),
            "--format=plain".to_string(),
        ];
        if opts.include_structure && !opts.include_data {
            args.push("--schema-only".to_string());
        } else if opts.include_data && !opts.include_structure {
            args.push("--data-only".to_string());
        }
        args.extend(connection_args(target));
        args.push("--file".to_string());
        args.push(plain_path.to_string_lossy().into_owned());

        debug!(
            "Dumping database {} to {}",
            target.database,
            destination.display()
        );

        let env = password_env(target);
        let output = match self.runner.run("pg_dump", &args, &env).await {
            Ok(output) => output,
            Err(e) => {
                self.cleanup(&plain_path, destination).await;
                return Err(e);
            }
        };

        if !output.success() {
            self.cleanup(&plain_path, destination).await;
            return Err(OrchestrationError::Subprocess {
                tool: "pg_dump".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        if opts.compression == Compression::Gzip {
            if let Err(e) = gzip_file(&plain_path, destination).await {
                self.cleanup(&plain_path, destination).await;
                return Err(e);
            }
            if let Err(e) = fs::remove_file(&plain_path).await {
                warn!(
                    "Failed to remove intermediate dump {}: {}",
                    plain_path.display(),
                    e
                );
            }
        }

        match fs::metadata(destination).await {
            Ok(meta) if meta.len() > 0 => Ok(meta.len() as i64),
            _ => {
                self.cleanup(&plain_path, destination).await;
                Err(OrchestrationError::storage(format!(
                    "pg_dump reported success but produced no dump at {}",
                    destination.display()
                )))
            }
        }
    }

    /// Replay a plain or gzipped dump into `target` inside a single
    /// transaction.
    pub async fn restore(
        &self,
        target: &DbTarget,
        dump_path: &Path,
        compression: Compression,
    ) -> Result<()> {
        let (sql_path, temp) = match compression {
            Compression::None => (dump_path.to_path_buf(), None),
            Compression::Gzip => {
                let mut os = dump_path.as_os_str().to_owned();
                os.push(".unpacked");
                let unpacked = PathBuf::from(os);
                gunzip_file(dump_path, &unpacked).await?;
                (unpacked.clone(), Some(unpacked))
            }
        };

        let mut args: Vec<String> = vec![
            "--single-transaction".to_string(),
            "--set".to_string(),
            "ON_ERROR_STOP=1".to_string(),
        ];
        args.extend(connection_args(target));
        args.push("--file".to_string());
        args.push(sql_path.to_string_lossy().into_owned());

        debug!(
            "Restoring {} into database {}",
            dump_path.display(),
            target.database
        );

        let env = password_env(target);
        let result = self.runner.run("psql", &args, &env).await;

        if let Some(temp) = temp {
            if let Err(e) = fs::remove_file(&temp).await {
                warn!("Failed to remove unpacked dump {}: {}", temp.display(), e);
            }
        }

        let output = result?;
        if !output.success() {
            return Err(OrchestrationError::Subprocess {
                tool: "psql".to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        Ok(())
    }

    async fn cleanup(&self, plain_path: &Path, destination: &Path) {
        for path in [plain_path, destination] {
            if fs::metadata(path).await.is_ok() {
                if let Err(e) = fs::remove_file(path).await {
                    warn!("Failed to remove partial dump {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn connection_args(target: &DbTarget) -> Vec<String> {
    vec![
        "--host".to_string(),
        target.host.clone(),
        "--port".to_string(),
        target.port.to_string(),
        "--username".to_string(),
        target.user.clone(),
        "--dbname".to_string(),
        target.database.clone(),
    ]
}

/// The password travels in the child environment, never on argv.
fn password_env(target: &DbTarget) -> Vec<(String, String)> {
    vec![("PGPASSWORD".to_string(), target.password.clone())]
}

/// Stream-compress `source` into `destination`.
async fn gzip_file(source: &Path, destination: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut input = std::fs::File::open(&source)?;
        let output = std::fs::File::create(&destination)?;
        let mut encoder = flate2::write::GzEncoder::new(output, flate2::Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| OrchestrationError::storage(format!("gzip task failed: {e}")))??;
    Ok(())
}

/// Stream-decompress `source` into `destination`.
async fn gunzip_file(source: &Path, destination: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let input = std::fs::File::open(&source)?;
        let mut decoder = flate2::read::GzDecoder::new(input);
        let mut output = std::fs::File::create(&destination)?;
        std::io::copy(&mut decoder, &mut output)?;
        Ok(())
    })
    .await
    .map_err(|e| OrchestrationError::storage(format!("gunzip task failed: {e}")))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptedRunner;

    fn target() -> DbTarget {
        DbTarget {
            host: "db.internal".to_string(),
            port: 5432,
            user: "backup".to_string(),
            password: "hunter2".to_string(),
            database: "appdb".to_string(),
        }
    }

    fn file_arg(args: &[String]) -> PathBuf {
        let idx = args.iter().position(|a| a == "--file").unwrap();
        PathBuf::from(&args[idx + 1])
    }

    #[tokio::test]
    async fn test_dump_rejects_empty_selection_before_any_subprocess() {
        let runner = Arc::new(ScriptedRunner::new());
        let dumper = DatabaseDumper::new(runner.clone());
        let dir = tempfile::tempdir().unwrap();

        let err = dumper
            .dump(
                &target(),
                DumpOptions {
                    include_structure: false,
                    include_data: false,
                    compression: Compression::None,
                },
                &dir.path().join("a.sql"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::Config { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dump_passes_password_via_env_not_argv() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.sql");
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_with(|call| {
            std::fs::write(file_arg(&call.args), b"CREATE TABLE t ();")?;
            Ok(crate::runner::RunOutput::ok())
        });

        let dumper = DatabaseDumper::new(runner.clone());
        let size = dumper
            .dump(&target(), DumpOptions {
                compression: Compression::None,
                ..Default::default()
            }, &dest)
            .await
            .unwrap();
        assert!(size > 0);

        let call = &runner.calls()[0];
        assert!(!call.args.iter().any(|a| a.contains("hunter2")));
        assert!(call
            .env
            .contains(&("PGPASSWORD".to_string(), "hunter2".to_string())));
    }

    #[tokio::test]
    async fn test_structure_only_and_data_only_flags() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        for _ in 0..2 {
            runner.respond_with(|call| {
                std::fs::write(file_arg(&call.args), b"SET x;")?;
                Ok(crate::runner::RunOutput::ok())
            });
        }

        let dumper = DatabaseDumper::new(runner.clone());
        dumper
            .dump(
                &target(),
                DumpOptions {
                    include_structure: true,
                    include_data: false,
                    compression: Compression::None,
                },
                &dir.path().join("schema.sql"),
            )
            .await
            .unwrap();
        dumper
            .dump(
                &target(),
                DumpOptions {
                    include_structure: false,
                    include_data: true,
                    compression: Compression::None,
                },
                &dir.path().join("data.sql"),
            )
            .await
            .unwrap();

        let calls = runner.calls();
        assert!(calls[0].args.contains(&"--schema-only".to_string()));
        assert!(calls[1].args.contains(&"--data-only".to_string()));
    }

    #[tokio::test]
    async fn test_gzip_dump_compresses_and_removes_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("db.sql.gz");
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_with(|call| {
            std::fs::write(file_arg(&call.args), b"CREATE TABLE users (id INT);")?;
            Ok(crate::runner::RunOutput::ok())
        });

        let dumper = DatabaseDumper::new(runner);
        let size = dumper
            .dump(&target(), DumpOptions::default(), &dest)
            .await
            .unwrap();
        assert!(size > 0);
        assert!(dest.exists());

        // The intermediate plain dump is gone.
        let mut plain = dest.as_os_str().to_owned();
        plain.push(".plain");
        assert!(!PathBuf::from(plain).exists());

        // Round-trip through the decoder recovers the SQL.
        let unpacked = dir.path().join("check.sql");
        gunzip_file(&dest, &unpacked).await.unwrap();
        assert_eq!(
            std::fs::read(&unpacked).unwrap(),
            b"CREATE TABLE users (id INT);"
        );
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_no_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("db.sql");
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_with(|call| {
            std::fs::write(file_arg(&call.args), b"half a dump")?;
            Ok(crate::runner::RunOutput::failed(1, "connection refused"))
        });

        let dumper = DatabaseDumper::new(runner);
        let err = dumper
            .dump(
                &target(),
                DumpOptions {
                    compression: Compression::None,
                    ..Default::default()
                },
                &dest,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestrationError::Subprocess { exit_code: 1, .. }
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_restore_runs_in_single_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("db.sql");
        std::fs::write(&dump, b"INSERT INTO t VALUES (1);").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let dumper = DatabaseDumper::new(runner.clone());
        dumper
            .restore(&target(), &dump, Compression::None)
            .await
            .unwrap();

        let call = &runner.calls()[0];
        assert_eq!(call.program, "psql");
        assert!(call.args.contains(&"--single-transaction".to_string()));
        assert!(call.args.contains(&"ON_ERROR_STOP=1".to_string()));
    }
}
