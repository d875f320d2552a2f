//! Subprocess execution with a bounded timeout.
//!
//! A timeout is reported in the output, not as an error: callers decide
//! whether it fails a check. A missing program is a distinct error so
//! optional tools can be skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("command not found: {program}")]
    NotFound { program: String },
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub async fn run(&self) -> Result<CommandOutput, ProcessError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::NotFound {
                    program: self.program.clone(),
                }
            } else {
                ProcessError::Spawn {
                    program: self.program.clone(),
                    source: e,
                }
            }
        })?;

        tracing::debug!(program = %self.program, args = ?self.args, "spawned subprocess");

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
                timed_out: false,
                duration: start.elapsed(),
            }),
            Ok(Err(e)) => Err(ProcessError::Spawn {
                program: self.program.clone(),
                source: e,
            }),
            Err(_) => {
                tracing::warn!(
                    program = %self.program,
                    timeout_secs = self.timeout.as_secs(),
                    "subprocess timed out"
                );
                Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: format!("timed out after {}s", self.timeout.as_secs()),
                    exit_code: None,
                    timed_out: true,
                    duration: start.elapsed(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let out = Invocation::new("sh", Duration::from_secs(5))
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run()
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert!(out.combined().contains("out\n") && out.combined().contains("err"));
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let out = Invocation::new("sh", Duration::from_secs(5))
            .args(["-c", "echo $STITCH_TEST_VAR; pwd"])
            .env("STITCH_TEST_VAR", "hello")
            .cwd(tmp.path())
            .run()
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.starts_with("hello\n"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_not_raised() {
        let out = Invocation::new("sleep", Duration::from_millis(100))
            .arg("5")
            .run()
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.duration < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = Invocation::new("stitch-definitely-not-a-command", Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
    }
}
