//! Validation pipeline run after every integration.
//!
//! Four checks run unconditionally and in order: syntax, imports, lint and
//! tests. A failing check never stops the ones after it. Test failures are
//! compared against the baseline captured before the first integration of
//! the run: a previously-passing test that now fails is a regression and
//! always blocks.

use crate::collaborators::TestRunner;
use crate::config::{CheckpointConfig, ProjectConfig};
use crate::error::StitchError;
use crate::process::{CommandOutput, Invocation, ProcessError};
use crate::pysource;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static COUNT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed)").unwrap()
});

static FAILURE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(FAILED|ERROR) (\S+)").unwrap());

static LINT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?):(\d+):(\d+): ([A-Z]+[0-9]+) (.*)$").unwrap());

const COMPILE_SCRIPT: &str =
    "import sys\nsrc = open(sys.argv[1], encoding='utf-8').read()\ncompile(src, sys.argv[1], 'exec')\n";

const IMPORT_SCRIPT: &str = "import importlib, sys\nimportlib.import_module(sys.argv[1])\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Syntax,
    Imports,
    Lint,
    Tests,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckKind::Syntax => "syntax",
            CheckKind::Imports => "imports",
            CheckKind::Lint => "lint",
            CheckKind::Tests => "tests",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
    Warning,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckStatus::Passed => "PASSED",
            CheckStatus::Failed => "FAILED",
            CheckStatus::Skipped => "SKIPPED",
            CheckStatus::Warning => "WARNING",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointResult {
    pub check: CheckKind,
    pub status: CheckStatus,
    pub message: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CheckpointResult {
    fn from_findings(
        check: CheckKind,
        message: String,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        let status = if !errors.is_empty() {
            CheckStatus::Failed
        } else if !warnings.is_empty() {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        };
        Self {
            check,
            status,
            message,
            errors,
            warnings,
        }
    }

    fn skipped(check: CheckKind, message: impl Into<String>) -> Self {
        Self {
            check,
            status: CheckStatus::Skipped,
            message: message.into(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn failed(check: CheckKind, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            check,
            status: CheckStatus::Failed,
            message: error.clone(),
            errors: vec![error],
            warnings: Vec::new(),
        }
    }
}

impl fmt::Display for CheckpointResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.status, self.check, self.message)?;
        for e in &self.errors {
            write!(f, "\n    error: {e}")?;
        }
        for w in &self.warnings {
            write!(f, "\n    warning: {w}")?;
        }
        Ok(())
    }
}

/// Overall verdict: passes unless some check failed.
pub fn summarize(results: &[CheckpointResult]) -> bool {
    !results.iter().any(|r| r.status == CheckStatus::Failed)
}

/// Counts and failing ids parsed from pytest output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    pub failing: Vec<String>,
}

pub fn parse_pytest_output(output: &str) -> TestSummary {
    let mut summary = TestSummary::default();
    for line in output.lines() {
        let line = line.trim();
        if let Some(caps) = FAILURE_LINE.captures(line) {
            let id = caps[2].to_string();
            if !summary.failing.contains(&id) {
                summary.failing.push(id);
            }
            continue;
        }
        // Only the final summary line carries counts, e.g.
        // "==== 1 failed, 3 passed in 0.12s ====".
        if line.contains(" in ") && COUNT_PATTERN.is_match(line) {
            summary = TestSummary {
                failing: std::mem::take(&mut summary.failing),
                ..TestSummary::default()
            };
            for caps in COUNT_PATTERN.captures_iter(line) {
                let n: u32 = caps[1].parse().unwrap_or(0);
                match &caps[2] {
                    "passed" => summary.passed = n,
                    "failed" => summary.failed = n,
                    "error" | "errors" => summary.errors = n,
                    "skipped" => summary.skipped = n,
                    _ => {}
                }
            }
        }
    }
    summary
}

fn short_name(id: &str) -> &str {
    id.rsplit("::").next().unwrap_or(id)
}

/// Tests passing before the run's first integration.
#[derive(Debug, Clone, Default)]
pub struct TestBaseline {
    passing: BTreeSet<String>,
}

impl TestBaseline {
    pub fn new<I, S>(passing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            passing: passing.into_iter().map(Into::into).collect(),
        }
    }

    /// Collected ids minus the ones already failing.
    pub async fn capture(runner: &dyn TestRunner) -> Self {
        let collected = match runner.collect_test_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "could not collect tests, regression detection disabled");
                return Self::default();
            }
        };
        let failing = match runner.run_all().await {
            Ok(run) => parse_pytest_output(&format!("{}\n{}", run.stdout, run.stderr)).failing,
            Err(e) => {
                tracing::warn!(error = %e, "baseline test run failed");
                Vec::new()
            }
        };
        let baseline = Self::new(
            collected
                .into_iter()
                .filter(|id| !failing.iter().any(|f| same_test(f, id))),
        );
        tracing::info!(tests = baseline.len(), "captured test baseline");
        baseline
    }

    pub fn len(&self) -> usize {
        self.passing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passing.is_empty()
    }

    /// Whether the baseline has a test matching `failing`. A file-level
    /// error (no `::`) matches every baseline test in that file.
    pub fn covers(&self, failing: &str) -> bool {
        if !failing.contains("::") {
            let prefix = format!("{failing}::");
            if self.passing.iter().any(|p| p.starts_with(&prefix)) {
                return true;
            }
        }
        self.passing.iter().any(|p| same_test(failing, p))
    }
}

/// Exact match, or equal names after the last `::` when either side is
/// not fully qualified.
fn same_test(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    if a.contains("::") && b.contains("::") {
        return false;
    }
    short_name(a) == short_name(b)
}

pub struct IntegrationCheckpoint {
    config: CheckpointConfig,
    project: ProjectConfig,
    runner: Arc<dyn TestRunner>,
    baseline: TestBaseline,
}

impl IntegrationCheckpoint {
    pub fn new(
        config: CheckpointConfig,
        project: ProjectConfig,
        runner: Arc<dyn TestRunner>,
        baseline: TestBaseline,
    ) -> Self {
        Self {
            config,
            project,
            runner,
            baseline,
        }
    }

    pub fn baseline(&self) -> &TestBaseline {
        &self.baseline
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn python(&self) -> Invocation {
        Invocation::new(&self.project.python, self.timeout()).cwd(&self.project.root)
    }

    /// Run every check against `modified` (paths inside the project root).
    pub async fn run_all(&self, modified: &[PathBuf], feature_name: &str) -> Vec<CheckpointResult> {
        let python_files: Vec<&PathBuf> = modified
            .iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("py"))
            .collect();

        let results = vec![
            self.check_syntax(&python_files).await,
            self.check_imports(&python_files).await,
            self.check_lint(&python_files).await,
            self.check_tests().await,
        ];
        for r in &results {
            tracing::info!(
                feature = feature_name,
                check = %r.check,
                status = %r.status,
                errors = r.errors.len(),
                warnings = r.warnings.len(),
                "checkpoint result"
            );
        }
        results
    }

    async fn check_syntax(&self, files: &[&PathBuf]) -> CheckpointResult {
        if files.is_empty() {
            return CheckpointResult::skipped(CheckKind::Syntax, "no Python files modified");
        }
        let mut errors = Vec::new();
        let mut in_process = false;
        for file in files {
            let run = self
                .python()
                .args(["-c", COMPILE_SCRIPT])
                .arg(file.display().to_string())
                .run()
                .await;
            match run {
                Ok(out) if out.success() => {}
                Ok(out) if out.timed_out => {
                    errors.push(format!("{}: compile timed out", file.display()))
                }
                Ok(out) => errors.push(format!("{}: {}", file.display(), last_line(&out))),
                Err(ProcessError::NotFound { .. }) => {
                    in_process = true;
                    if let Some(e) = parse_in_process(file) {
                        errors.push(e);
                    }
                }
                Err(e) => errors.push(format!("{}: {e}", file.display())),
            }
        }
        let how = if in_process { " (parsed in-process)" } else { "" };
        let message = if errors.is_empty() {
            format!("{} file(s) compile{how}", files.len())
        } else {
            format!("{} of {} file(s) failed to compile{how}", errors.len(), files.len())
        };
        CheckpointResult::from_findings(CheckKind::Syntax, message, errors, Vec::new())
    }

    async fn check_imports(&self, files: &[&PathBuf]) -> CheckpointResult {
        let import_root = self.project.root.join(&self.project.import_root);
        let modules: Vec<String> = files
            .iter()
            .filter_map(|f| module_name(&import_root, f))
            .collect();
        if modules.is_empty() {
            return CheckpointResult::skipped(CheckKind::Imports, "no importable modules modified");
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for module in &modules {
            let run = self
                .python()
                .args(["-c", IMPORT_SCRIPT])
                .arg(module.as_str())
                .env("PYTHONPATH", import_root.display().to_string())
                .env("PYTHONDONTWRITEBYTECODE", "1")
                .run()
                .await;
            match run {
                Ok(out) if out.success() => {}
                Ok(out) if out.timed_out => errors.push(format!("{module}: import timed out")),
                Ok(out) => {
                    let detail = last_line(&out);
                    if detail.contains("ModuleNotFoundError") || detail.contains("ImportError") {
                        errors.push(format!("{module}: {detail}"));
                    } else {
                        warnings.push(format!("{module}: {detail}"));
                    }
                }
                Err(ProcessError::NotFound { program }) => {
                    return CheckpointResult::skipped(
                        CheckKind::Imports,
                        format!("interpreter '{program}' not found"),
                    );
                }
                Err(e) => errors.push(format!("{module}: {e}")),
            }
        }
        let message = format!("{} module(s) checked", modules.len());
        CheckpointResult::from_findings(CheckKind::Imports, message, errors, warnings)
    }

    async fn check_lint(&self, files: &[&PathBuf]) -> CheckpointResult {
        if files.is_empty() {
            return CheckpointResult::skipped(CheckKind::Lint, "no Python files modified");
        }
        let run = Invocation::new(&self.config.linter, self.timeout())
            .cwd(&self.project.root)
            .args(self.config.lint_args.iter().cloned())
            .args(files.iter().map(|f| f.display().to_string()))
            .run()
            .await;
        let out = match run {
            Ok(out) => out,
            Err(ProcessError::NotFound { program }) => {
                return CheckpointResult::skipped(
                    CheckKind::Lint,
                    format!("linter '{program}' not found"),
                );
            }
            Err(e) => return CheckpointResult::failed(CheckKind::Lint, e.to_string()),
        };
        if out.timed_out {
            return CheckpointResult::failed(CheckKind::Lint, "linter timed out");
        }

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for line in out.stdout.lines().chain(out.stderr.lines()) {
            let Some(caps) = LINT_LINE.captures(line.trim()) else {
                continue;
            };
            let code = &caps[4];
            let fatal = self
                .config
                .fatal_lint_prefixes
                .iter()
                .any(|p| code.starts_with(p.as_str()));
            if fatal || self.config.strict {
                errors.push(line.trim().to_string());
            } else {
                warnings.push(line.trim().to_string());
            }
        }
        if errors.is_empty() && warnings.is_empty() && !out.success() {
            warnings.push(format!("linter exited with {:?}: {}", out.exit_code, last_line(&out)));
        }
        let message = format!("{} finding(s)", errors.len() + warnings.len());
        CheckpointResult::from_findings(CheckKind::Lint, message, errors, warnings)
    }

    async fn check_tests(&self) -> CheckpointResult {
        let run = match self.runner.run_all().await {
            Ok(run) => run,
            Err(StitchError::ToolMissing(program)) => {
                return CheckpointResult::skipped(
                    CheckKind::Tests,
                    format!("test runner '{program}' not found"),
                );
            }
            Err(e) => return CheckpointResult::failed(CheckKind::Tests, e.to_string()),
        };
        let Some(exit_code) = run.exit_code else {
            return CheckpointResult::failed(CheckKind::Tests, "test run timed out or was killed");
        };

        let summary = parse_pytest_output(&format!("{}\n{}", run.stdout, run.stderr));
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for id in &summary.failing {
            if self.baseline.covers(id) {
                errors.push(format!("REGRESSION: {id}"));
            } else {
                warnings.push(format!("NEW FAILURE: {id}"));
            }
        }
        // Non-zero exit with nothing parsed, other than "no tests collected".
        if summary.failing.is_empty() && exit_code != 0 && exit_code != 5 {
            warnings.push(format!("test runner exited with {exit_code}"));
        }

        let message = format!(
            "{} passed, {} failed, {} regression(s)",
            summary.passed,
            summary.failed + summary.errors,
            errors.len()
        );
        CheckpointResult::from_findings(CheckKind::Tests, message, errors, warnings)
    }
}

fn last_line(out: &CommandOutput) -> String {
    out.stderr
        .lines()
        .chain(out.stdout.lines())
        .filter(|l| !l.trim().is_empty())
        .last()
        .map(|l| l.trim().to_string())
        .unwrap_or_else(|| format!("exit code {:?}", out.exit_code))
}

/// Syntax check without an interpreter.
fn parse_in_process(file: &Path) -> Option<String> {
    let content = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) => return Some(format!("{}: {e}", file.display())),
    };
    let rows = pysource::syntax_error_rows(&content)?;
    rows.first()
        .map(|row| format!("{}: syntax error at line {}", file.display(), row + 1))
}

/// Dotted module name for a file under `import_root`.
pub fn module_name(import_root: &Path, file: &Path) -> Option<String> {
    let rel = file.strip_prefix(import_root).ok()?;
    let mut parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let last = parts.pop()?;
    let stem = last.strip_suffix(".py")?;
    if stem != "__init__" {
        parts.push(stem.to_string());
    }
    if parts.is_empty() || parts.iter().any(|p| p.contains('-') || p.contains('.')) {
        return None;
    }
    Some(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::TestRun;
    use async_trait::async_trait;

    struct FakeRunner {
        collected: Vec<String>,
        output: String,
        exit_code: Option<i32>,
    }

    #[async_trait]
    impl TestRunner for FakeRunner {
        async fn run_all(&self) -> crate::error::Result<TestRun> {
            Ok(TestRun {
                stdout: self.output.clone(),
                stderr: String::new(),
                exit_code: self.exit_code,
            })
        }

        async fn collect_test_ids(&self) -> crate::error::Result<Vec<String>> {
            Ok(self.collected.clone())
        }
    }

    fn checkpoint(root: &Path, runner: FakeRunner, baseline: TestBaseline) -> IntegrationCheckpoint {
        let project = ProjectConfig {
            root: root.to_path_buf(),
            python: "stitch-no-such-python".to_string(),
            ..ProjectConfig::default()
        };
        let config = CheckpointConfig {
            linter: "stitch-no-such-linter".to_string(),
            ..CheckpointConfig::default()
        };
        IntegrationCheckpoint::new(config, project, Arc::new(runner), baseline)
    }

    #[test]
    fn test_parse_pytest_output() {
        let out = "\
FAILED tests/test_a.py::test_a - AssertionError: boom
FAILED tests/test_b.py::test_b
ERROR tests/test_c.py - ImportError: nope
========= 2 failed, 5 passed, 1 skipped, 1 error in 0.31s =========";
        let s = parse_pytest_output(out);
        assert_eq!(s.passed, 5);
        assert_eq!(s.failed, 2);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.errors, 1);
        assert_eq!(
            s.failing,
            vec!["tests/test_a.py::test_a", "tests/test_b.py::test_b", "tests/test_c.py"]
        );
    }

    #[test]
    fn test_baseline_matching() {
        let baseline = TestBaseline::new(["tests/test_a.py::test_a", "test_plain"]);
        assert!(baseline.covers("tests/test_a.py::test_a"));
        assert!(baseline.covers("test_a"));
        assert!(baseline.covers("tests/test_x.py::test_plain"));
        assert!(baseline.covers("tests/test_a.py"));
        assert!(!baseline.covers("tests/test_other.py::test_a"));
        assert!(!baseline.covers("test_b"));
    }

    #[tokio::test]
    async fn test_regression_is_distinct_from_new_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner {
            collected: Vec::new(),
            output: "FAILED tests/t.py::test_a\nFAILED tests/t.py::test_b\n== 2 failed, 1 passed in 0.1s ==".into(),
            exit_code: Some(1),
        };
        let cp = checkpoint(tmp.path(), runner, TestBaseline::new(["tests/t.py::test_a"]));
        let results = cp.run_all(&[], "feature").await;
        let tests = results.iter().find(|r| r.check == CheckKind::Tests).unwrap();
        assert_eq!(tests.status, CheckStatus::Failed);
        assert_eq!(tests.errors, vec!["REGRESSION: tests/t.py::test_a"]);
        assert_eq!(tests.warnings, vec!["NEW FAILURE: tests/t.py::test_b"]);
        assert!(!summarize(&results));
    }

    #[tokio::test]
    async fn test_new_failures_alone_do_not_block() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner {
            collected: Vec::new(),
            output: "FAILED tests/t.py::test_new\n== 1 failed, 3 passed in 0.1s ==".into(),
            exit_code: Some(1),
        };
        let cp = checkpoint(tmp.path(), runner, TestBaseline::new(["tests/t.py::test_old"]));
        let results = cp.run_all(&[], "feature").await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[3].status, CheckStatus::Warning);
        assert!(summarize(&results));
    }

    #[tokio::test]
    async fn test_all_checks_run_and_syntax_falls_back_in_process() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("src/pkg/good.py");
        let bad = tmp.path().join("src/pkg/bad.py");
        std::fs::create_dir_all(good.parent().unwrap()).unwrap();
        std::fs::write(&good, "def f():\n    return 1\n").unwrap();
        std::fs::write(&bad, "def f(:\n    return 1\n").unwrap();

        let runner = FakeRunner {
            collected: Vec::new(),
            output: "== 4 passed in 0.1s ==".into(),
            exit_code: Some(0),
        };
        let cp = checkpoint(tmp.path(), runner, TestBaseline::default());
        let results = cp.run_all(&[good, bad.clone()], "feature").await;

        let kinds: Vec<CheckKind> = results.iter().map(|r| r.check).collect();
        assert_eq!(
            kinds,
            vec![CheckKind::Syntax, CheckKind::Imports, CheckKind::Lint, CheckKind::Tests]
        );
        assert_eq!(results[0].status, CheckStatus::Failed);
        assert_eq!(results[0].errors.len(), 1);
        assert!(results[0].errors[0].starts_with(&bad.display().to_string()));
        assert_eq!(results[1].status, CheckStatus::Skipped);
        assert_eq!(results[2].status, CheckStatus::Skipped);
        assert_eq!(results[3].status, CheckStatus::Passed);
        assert!(!summarize(&results));
    }

    #[tokio::test]
    async fn test_killed_test_run_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner {
            collected: Vec::new(),
            output: String::new(),
            exit_code: None,
        };
        let cp = checkpoint(tmp.path(), runner, TestBaseline::default());
        let results = cp.run_all(&[], "feature").await;
        assert_eq!(results[3].status, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_baseline_capture_excludes_already_failing() {
        let runner = FakeRunner {
            collected: vec!["t.py::test_a".into(), "t.py::test_b".into()],
            output: "FAILED t.py::test_b\n== 1 failed, 1 passed in 0.1s ==".into(),
            exit_code: Some(1),
        };
        let baseline = TestBaseline::capture(&runner).await;
        assert_eq!(baseline.len(), 1);
        assert!(baseline.covers("t.py::test_a"));
        assert!(!baseline.covers("t.py::test_b"));
    }

    #[test]
    fn test_module_name() {
        let root = Path::new("/p/src");
        assert_eq!(
            module_name(root, Path::new("/p/src/pkg/models.py")).as_deref(),
            Some("pkg.models")
        );
        assert_eq!(
            module_name(root, Path::new("/p/src/pkg/__init__.py")).as_deref(),
            Some("pkg")
        );
        assert_eq!(module_name(root, Path::new("/p/tests/test_x.py")), None);
        assert_eq!(module_name(root, Path::new("/p/src/my-pkg/x.py")), None);
    }
}
