//! `stitch.toml` loading. Every section is optional and falls back to
//! defaults; CLI flags override file values.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level configuration loaded from stitch.toml.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StitchConfig {
    pub project: ProjectConfig,
    pub storage: StorageConfig,
    pub generator: GeneratorConfig,
    pub resolver: ResolverConfig,
    pub integrity: IntegrityConfig,
    pub conflict: ConflictConfig,
    pub checkpoint: CheckpointConfig,
    pub run: RunConfig,
    pub shutdown: ShutdownConfig,
}

impl StitchConfig {
    /// Load configuration from a TOML file. If the file doesn't exist,
    /// returns compiled defaults. Returns an error only if the file exists
    /// but can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Apply CLI overrides. CLI values take precedence over file/default
    /// values when present.
    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if overrides.dry_run {
            self.run.dry_run = true;
        }
        if let Some(max) = overrides.max_features {
            self.run.max_features = Some(max);
        }
        if overrides.continue_on_failure {
            self.run.stop_on_failure = false;
        }
        if overrides.strict {
            self.checkpoint.strict = true;
        }
        if overrides.allow_high_risk {
            self.conflict.allow_high_risk = true;
        }
    }

    /// Check for settings that would make a run fail in confusing ways.
    /// Returns one message per problem; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.generator.command.trim().is_empty() {
            errors.push("generator.command must not be empty".to_string());
        }
        if self.generator.timeout_secs == 0 {
            errors.push("generator.timeout_secs must be greater than 0".to_string());
        }
        if self.generator.max_attempts == 0 {
            errors.push("generator.max_attempts must be at least 1".to_string());
        }
        if self.checkpoint.timeout_secs == 0 {
            errors.push("checkpoint.timeout_secs must be greater than 0".to_string());
        }
        if self.checkpoint.test_command.trim().is_empty() {
            errors.push("checkpoint.test_command must not be empty".to_string());
        }
        if self.run.max_integration_attempts == 0 {
            errors.push("run.max_integration_attempts must be at least 1".to_string());
        }
        for pattern in self
            .conflict
            .always_largest
            .iter()
            .chain(self.conflict.always_newest.iter())
        {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(format!("invalid conflict pattern '{pattern}': {e}"));
            }
        }
        for (i, rule) in self.resolver.rules.iter().enumerate() {
            if rule.keyword.trim().is_empty() {
                errors.push(format!("resolver.rules[{i}].keyword must not be empty"));
            }
            if rule.directory.is_none() == rule.file.is_none() {
                errors.push(format!(
                    "resolver.rules[{i}] must set exactly one of directory or file"
                ));
            }
        }

        errors
    }

    /// Project root as configured.
    pub fn root(&self) -> &Path {
        &self.project.root
    }

    /// Data directory, resolved against the project root when relative.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_absolute() {
            self.storage.data_dir.clone()
        } else {
            self.project.root.join(&self.storage.data_dir)
        }
    }
}

/// CLI values that can override config file settings.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub dry_run: bool,
    pub max_features: Option<u32>,
    pub continue_on_failure: bool,
    pub strict: bool,
    pub allow_high_risk: bool,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root of the source tree being integrated into.
    pub root: PathBuf,
    /// Directory placed on the import path for import checks.
    pub import_root: PathBuf,
    /// Interpreter used for compile and import checks.
    pub python: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneratorConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Attempts per feature before a generation failure is final.
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ResolverRule {
    /// Case-insensitive substring of the feature name.
    pub keyword: String,
    /// Place the candidate in this directory, keeping its file name.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Place the candidate at exactly this path.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl ResolverRule {
    pub fn directory(keyword: &str, dir: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            directory: Some(PathBuf::from(dir)),
            file: None,
        }
    }

    pub fn file(keyword: &str, file: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            directory: None,
            file: Some(PathBuf::from(file)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResolverConfig {
    /// Applied in order; the first matching rule wins.
    pub rules: Vec<ResolverRule>,
    /// Path prefixes recognised when scanning content for an embedded path hint.
    pub known_roots: Vec<String>,
    /// How much of a candidate's head is scanned for a path hint.
    pub hint_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Refuse to integrate content carrying a TRUNCATED issue.
    pub truncation_blocking: bool,
    /// A parse error within this many trailing lines counts as truncation.
    pub tail_lines: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConflictConfig {
    /// Exact file names that always accumulate declarations.
    pub always_merge: Vec<String>,
    /// Glob patterns where the most complete (largest) candidate wins.
    pub always_largest: Vec<String>,
    /// Glob patterns where the most recently written candidate wins.
    pub always_newest: Vec<String>,
    /// Integrate HIGH-risk targets instead of failing the feature.
    pub allow_high_risk: bool,
    /// Require equal content hashes before calling a target already integrated.
    pub verify_content_hash: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Promote lint warnings to blocking failures.
    pub strict: bool,
    pub timeout_secs: u64,
    pub linter: String,
    pub lint_args: Vec<String>,
    /// Lint codes with these prefixes are always blocking.
    pub fatal_lint_prefixes: Vec<String>,
    pub test_command: String,
    pub test_args: Vec<String>,
    pub collect_args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    pub stop_on_failure: bool,
    pub max_features: Option<u32>,
    /// Commit each completed feature through the VCS collaborator.
    pub commit: bool,
    /// Restore backups when a feature fails its checkpoint.
    pub rollback_on_failure: bool,
    pub max_integration_attempts: u32,
    /// Analyse and report only; never write.
    pub dry_run: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    pub stop_file: PathBuf,
}

// --- Default implementations ---

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            import_root: PathBuf::from("src"),
            python: "python3".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".stitch"),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: "stitch-generate".to_string(),
            args: vec![
                "--feature".to_string(),
                "{feature_id}".to_string(),
                "--out".to_string(),
                "{output_dir}".to_string(),
            ],
            timeout_secs: 900,
            max_attempts: 2,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                ResolverRule::directory("test", "tests"),
                ResolverRule::directory("cli", "src/cli"),
                ResolverRule::directory("api", "src/api"),
                ResolverRule::directory("model", "src/models"),
                ResolverRule::directory("util", "src/utils"),
            ],
            known_roots: vec!["src/".to_string(), "tests/".to_string(), "lib/".to_string()],
            hint_bytes: 500,
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            truncation_blocking: true,
            tail_lines: 5,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            always_merge: vec![
                "__init__.py".to_string(),
                "exceptions.py".to_string(),
                "constants.py".to_string(),
                "types.py".to_string(),
            ],
            always_largest: vec![
                "*state*.json".to_string(),
                "*.toml".to_string(),
                "*.yaml".to_string(),
                "*.yml".to_string(),
                "config.py".to_string(),
                "settings.py".to_string(),
            ],
            always_newest: Vec::new(),
            allow_high_risk: false,
            verify_content_hash: true,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            strict: false,
            timeout_secs: 300,
            linter: "ruff".to_string(),
            lint_args: vec![
                "check".to_string(),
                "--output-format".to_string(),
                "concise".to_string(),
                "--select".to_string(),
                "E,F".to_string(),
            ],
            fatal_lint_prefixes: vec![
                "E9".to_string(),
                "F63".to_string(),
                "F7".to_string(),
                "F82".to_string(),
            ],
            test_command: "python3".to_string(),
            test_args: vec![
                "-m".to_string(),
                "pytest".to_string(),
                "-q".to_string(),
                "-rf".to_string(),
                "--tb=no".to_string(),
            ],
            collect_args: vec![
                "-m".to_string(),
                "pytest".to_string(),
                "--collect-only".to_string(),
                "-q".to_string(),
            ],
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stop_on_failure: true,
            max_features: None,
            commit: false,
            rollback_on_failure: true,
            max_integration_attempts: 3,
            dry_run: false,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_file: PathBuf::from("STOP"),
        }
    }
}
