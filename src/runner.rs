use crate::error::{OrchestrationError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of an external tool invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn ok_with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }
}

/// Seam between the orchestration layer and external tools (tar,
/// pg_dump, psql). Arguments are always passed as vectors, never
/// through a shell.
#[async_trait]
pub trait SubprocessRunner: Send + Sync + std::fmt::Debug {
    async fn run(&self, program: &str, args: &[String], env: &[(String, String)])
        -> Result<RunOutput>;
}

/// Runs real processes via tokio with a bounded timeout. The child is
/// killed if the timeout elapses or the calling future is dropped.
#[derive(Debug)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SubprocessRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<RunOutput> {
        debug!("Running {} with {} args", program, args.len());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| OrchestrationError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| OrchestrationError::Storage {
                message: format!("failed to spawn {program}: {e}"),
            })?;

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// One recorded invocation through a [`ScriptedRunner`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

type ScriptEntry = Box<dyn FnOnce(&RecordedCall) -> Result<RunOutput> + Send>;

/// Test double: returns scripted responses in order and records every
/// invocation. An exhausted script answers with plain success, so
/// tests only script the calls they care about.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<ScriptEntry>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("recorded_calls", &self.calls.lock().unwrap().len())
            .finish()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next call to succeed with empty output.
    pub fn succeed(&self) {
        self.respond_with(|_| Ok(RunOutput::ok()));
    }

    /// Script the next call to succeed and write `contents` at `path`,
    /// standing in for a tool that produces an output file.
    pub fn succeed_creating(&self, path: impl Into<std::path::PathBuf>, contents: Vec<u8>) {
        let path = path.into();
        self.respond_with(move |_| {
            std::fs::write(&path, &contents)?;
            Ok(RunOutput::ok())
        });
    }

    /// Script the next call to succeed with the given stdout.
    pub fn succeed_with_stdout(&self, stdout: impl Into<String>) {
        let stdout = stdout.into();
        self.respond_with(move |_| Ok(RunOutput::ok_with_stdout(stdout)));
    }

    /// Script the next call to exit non-zero.
    pub fn fail(&self, exit_code: i32, stderr: impl Into<String>) {
        let stderr = stderr.into();
        self.respond_with(move |_| Ok(RunOutput::failed(exit_code, stderr)));
    }

    /// Script an arbitrary response for the next call.
    pub fn respond_with<F>(&self, f: F)
    where
        F: FnOnce(&RecordedCall) -> Result<RunOutput> + Send + 'static,
    {
        self.script.lock().unwrap().push_back(Box::new(f));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubprocessRunner for ScriptedRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<RunOutput> {
        let call = RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            env: env.to_vec(),
        };
        self.calls.lock().unwrap().push(call.clone());

        let entry = self.script.lock().unwrap().pop_front();
        match entry {
            Some(respond) => respond(&call),
            None => Ok(RunOutput::ok()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_replays_in_order() {
        let runner = ScriptedRunner::new();
        runner.succeed_with_stdout("first");
        runner.fail(2, "boom");

        let out = runner.run("tar", &[], &[]).await.unwrap();
        assert_eq!(out.stdout, "first");
        assert!(out.success());

        let out = runner.run("tar", &[], &[]).await.unwrap();
        assert_eq!(out.exit_code, 2);
        assert_eq!(out.stderr, "boom");

        // Exhausted script falls back to success.
        let out = runner.run("tar", &[], &[]).await.unwrap();
        assert!(out.success());

        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_scripted_runner_side_effect_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tar");
        let runner = ScriptedRunner::new();
        runner.succeed_creating(dest.clone(), b"payload".to_vec());

        runner
            .run("tar", &["-cf".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_system_runner_captures_exit_code() {
        let runner = SystemRunner::new(Duration::from_secs(5));
        let out = runner
            .run("sh", &["-c".to_string(), "exit 3".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_system_runner_times_out() {
        let runner = SystemRunner::new(Duration::from_millis(50));
        let err = runner
            .run("sleep", &["5".to_string()], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Timeout { .. }));
    }
}
