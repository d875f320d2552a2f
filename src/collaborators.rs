//! External collaborators: code generation, the project's test runner,
//! version control and telemetry.
//!
//! The orchestrator only talks to these traits. The command-backed
//! implementations shell out with bounded timeouts; tests substitute
//! in-memory fakes.

use crate::config::{CheckpointConfig, GeneratorConfig};
use crate::data_dir::DataDir;
use crate::error::{Result, StitchError};
use crate::feature::Feature;
use crate::process::{Invocation, ProcessError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// What the generator produced for one feature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutcome {
    pub success: bool,
    pub output_files: Vec<PathBuf>,
    pub error: Option<String>,
}

impl GenerationOutcome {
    pub fn ok(files: Vec<PathBuf>) -> Self {
        Self {
            success: true,
            output_files: files,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output_files: Vec::new(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, feature: &Feature) -> GenerationOutcome;
}

/// Raw result of a full test-suite run. `exit_code` is `None` when the run
/// was killed, including by its timeout.
#[derive(Debug, Clone, Default)]
pub struct TestRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_all(&self) -> Result<TestRun>;
    async fn collect_test_ids(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Commit `files` with `message`. Returns whether a commit was made.
    async fn commit(&self, files: &[PathBuf], message: &str) -> bool;
}

#[derive(Debug, Error)]
#[error("telemetry: {0}")]
pub struct TelemetryError(pub String);

pub type SpanId = u64;

/// Span-style instrumentation around each integration. Callers log and
/// ignore every error.
pub trait Telemetry: Send + Sync {
    fn start_span(&self, name: &str) -> std::result::Result<SpanId, TelemetryError>;
    fn set_attribute(
        &self,
        span: SpanId,
        key: &str,
        value: &str,
    ) -> std::result::Result<(), TelemetryError>;
    fn end_span(&self, span: SpanId, success: bool) -> std::result::Result<(), TelemetryError>;
}

// --- Generator ---

/// Runs the configured generator command once per feature. Every file the
/// command leaves in the feature's output directory is a candidate.
///
/// Arguments are passed as argv, never through a shell, and placeholder
/// values are substituted unquoted. Only `{feature_id}` and `{output_dir}`
/// are substituted; the feature name and description arrive in
/// `STITCH_FEATURE_NAME` and `STITCH_FEATURE_DESCRIPTION` so plan text can
/// never become part of a command line.
pub struct CommandGenerator {
    config: GeneratorConfig,
    root: PathBuf,
    data_dir: DataDir,
}

impl CommandGenerator {
    pub fn new(config: GeneratorConfig, root: &Path, data_dir: DataDir) -> Self {
        Self {
            config,
            root: root.to_path_buf(),
            data_dir,
        }
    }

    fn build_args(&self, feature: &Feature, output_dir: &Path) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{feature_id}", &feature.id)
                    .replace("{output_dir}", &output_dir.display().to_string())
            })
            .collect()
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, feature: &Feature) -> GenerationOutcome {
        let output_dir = self.data_dir.feature_output_dir(&feature.id);
        if output_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&output_dir) {
                return GenerationOutcome::failed(format!("clearing output dir: {e}"));
            }
        }
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            return GenerationOutcome::failed(format!("creating output dir: {e}"));
        }

        let invocation = Invocation::new(
            &self.config.command,
            Duration::from_secs(self.config.timeout_secs),
        )
        .args(self.build_args(feature, &output_dir))
        .cwd(&self.root)
        .env("STITCH_FEATURE_ID", &feature.id)
        .env("STITCH_FEATURE_NAME", &feature.name)
        .env("STITCH_FEATURE_DESCRIPTION", &feature.description)
        .env("STITCH_OUTPUT_DIR", output_dir.display().to_string());

        let output = match invocation.run().await {
            Ok(o) => o,
            Err(e) => return GenerationOutcome::failed(e.to_string()),
        };
        if output.timed_out {
            return GenerationOutcome::failed(format!(
                "generator timed out after {}s",
                self.config.timeout_secs
            ));
        }
        if !output.success() {
            let tail: String = output
                .stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return GenerationOutcome::failed(format!(
                "generator exited with {:?}: {tail}",
                output.exit_code
            ));
        }

        let mut files = Vec::new();
        if let Err(e) = collect_files(&output_dir, &mut files) {
            return GenerationOutcome::failed(format!("reading output dir: {e}"));
        }
        if files.is_empty() {
            return GenerationOutcome::failed("generator produced no files");
        }
        files.sort();
        GenerationOutcome::ok(files)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

// --- Test runner ---

/// Runs pytest (or whatever `test_command` is configured) from the project
/// root.
pub struct PytestRunner {
    command: String,
    test_args: Vec<String>,
    collect_args: Vec<String>,
    root: PathBuf,
    timeout: Duration,
}

impl PytestRunner {
    pub fn new(config: &CheckpointConfig, root: &Path) -> Self {
        Self {
            command: config.test_command.clone(),
            test_args: config.test_args.clone(),
            collect_args: config.collect_args.clone(),
            root: root.to_path_buf(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn invoke(&self, args: &[String]) -> Result<TestRun> {
        let output = Invocation::new(&self.command, self.timeout)
            .args(args.iter().cloned())
            .cwd(&self.root)
            .run()
            .await
            .map_err(|e| match e {
                ProcessError::NotFound { program } => StitchError::ToolMissing(program),
                other => StitchError::infra(other.to_string()),
            })?;
        if output.timed_out {
            tracing::warn!(timeout_secs = self.timeout.as_secs(), "test run timed out");
        }
        Ok(TestRun {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }
}

#[async_trait]
impl TestRunner for PytestRunner {
    async fn run_all(&self) -> Result<TestRun> {
        self.invoke(&self.test_args).await
    }

    async fn collect_test_ids(&self) -> Result<Vec<String>> {
        let run = self.invoke(&self.collect_args).await?;
        Ok(parse_collected_ids(&run.stdout))
    }
}

/// Test ids from `pytest --collect-only -q` output.
pub fn parse_collected_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.contains("::") && !l.contains(' '))
        .map(str::to_string)
        .collect()
}

// --- VCS ---

pub struct GitVcs {
    root: PathBuf,
    timeout: Duration,
}

impl GitVcs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            timeout: Duration::from_secs(60),
        }
    }

    async fn git(&self, args: Vec<String>) -> std::result::Result<String, String> {
        let out = Invocation::new("git", self.timeout)
            .args(args)
            .cwd(&self.root)
            .run()
            .await
            .map_err(|e| e.to_string())?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(out.combined())
        }
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn commit(&self, files: &[PathBuf], message: &str) -> bool {
        if files.is_empty() {
            return false;
        }
        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(files.iter().map(|f| f.display().to_string()));
        if let Err(e) = self.git(add).await {
            tracing::error!(error = %e, "git add failed");
            return false;
        }

        let commit = vec![
            "commit".to_string(),
            "-m".to_string(),
            message.to_string(),
            "--no-verify".to_string(),
        ];
        match self.git(commit).await {
            Ok(_) => {
                tracing::info!(files = files.len(), "committed");
                true
            }
            Err(e) if e.contains("nothing to commit") => {
                tracing::info!("nothing to commit");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "git commit failed");
                false
            }
        }
    }
}

// --- Telemetry ---

/// Emits spans as structured log events.
#[derive(Default)]
pub struct TracingTelemetry {
    next: std::sync::atomic::AtomicU64,
}

impl Telemetry for TracingTelemetry {
    fn start_span(&self, name: &str) -> std::result::Result<SpanId, TelemetryError> {
        let id = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        tracing::debug!(span_id = id, span = name, "span start");
        Ok(id)
    }

    fn set_attribute(
        &self,
        span: SpanId,
        key: &str,
        value: &str,
    ) -> std::result::Result<(), TelemetryError> {
        tracing::debug!(span_id = span, key, value, "span attribute");
        Ok(())
    }

    fn end_span(&self, span: SpanId, success: bool) -> std::result::Result<(), TelemetryError> {
        tracing::debug!(span_id = span, success, "span end");
        Ok(())
    }
}

pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn start_span(&self, _name: &str) -> std::result::Result<SpanId, TelemetryError> {
        Ok(0)
    }

    fn set_attribute(
        &self,
        _span: SpanId,
        _key: &str,
        _value: &str,
    ) -> std::result::Result<(), TelemetryError> {
        Ok(())
    }

    fn end_span(&self, _span: SpanId, _success: bool) -> std::result::Result<(), TelemetryError> {
        Ok(())
    }
}
