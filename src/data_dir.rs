use std::io::Write;
use std::path::{Path, PathBuf};

/// Default `stitch.toml` written by `stitch init` when none exists.
const DEFAULT_CONFIG: &str = r#"# stitch configuration. Every key is optional.

[project]
import_root = "src"
python = "python3"

[generator]
command = "stitch-generate"
args = ["--feature", "{feature_id}", "--out", "{output_dir}"]
timeout_secs = 900

[checkpoint]
strict = false
linter = "ruff"
test_command = "python3"
test_args = ["-m", "pytest", "-q", "-rf", "--tb=no"]

[run]
stop_on_failure = true
commit = false
"#;

/// Manages the `.stitch/` directory layout.
///
/// Everything stitch persists lives under one data directory: the queue
/// document, the run status file and the per-feature generator output.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the persisted feature queue.
    pub fn queue(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    /// Path to the run status file.
    pub fn run_status(&self) -> PathBuf {
        self.root.join("run-status.json")
    }

    /// Directory holding generator output, one subdirectory per feature.
    pub fn generated_dir(&self) -> PathBuf {
        self.root.join("generated")
    }

    /// Generator output directory for a single feature.
    pub fn feature_output_dir(&self, feature_id: &str) -> PathBuf {
        self.generated_dir().join(sanitize(feature_id))
    }

    /// Create root and generated/. Returns Ok(true) if the root was created.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.generated_dir())?;
        Ok(created)
    }

    /// Ensure the data directory exists and is git-ignored.
    pub fn ensure_initialized(&self) -> std::io::Result<()> {
        self.init()?;
        self.update_gitignore()?;
        Ok(())
    }

    /// Write a default config next to the data directory unless one exists.
    /// Returns the path written, if any.
    pub fn write_default_config(&self, config_path: &Path) -> std::io::Result<Option<PathBuf>> {
        if config_path.exists() {
            return Ok(None);
        }
        std::fs::write(config_path, DEFAULT_CONFIG)?;
        Ok(Some(config_path.to_path_buf()))
    }

    /// Append the data directory to an existing .gitignore beside it.
    fn update_gitignore(&self) -> std::io::Result<()> {
        let gitignore_dir = self.root.parent().unwrap_or_else(|| Path::new("."));
        let gitignore_path = gitignore_dir.join(".gitignore");

        let dir_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.root.to_string_lossy().to_string());
        let entry = format!("{dir_name}/");

        if gitignore_path.exists() {
            let contents = std::fs::read_to_string(&gitignore_path)?;
            let already_present = contents.lines().any(|line| {
                let trimmed = line.trim();
                trimmed == entry || trimmed == dir_name
            });
            if !already_present {
                let prefix = if contents.ends_with('\n') || contents.is_empty() {
                    ""
                } else {
                    "\n"
                };
                let mut file = std::fs::OpenOptions::new()
                    .append(true)
                    .open(&gitignore_path)?;
                writeln!(file, "{prefix}{entry}")?;
            }
        }
        Ok(())
    }
}

/// Feature ids become directory names; keep them to a safe character set.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write `bytes` to `path` so readers never observe a partial file: the
/// content goes to a temp file in the same directory which is then renamed
/// over the destination.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_paths() {
        let dd = DataDir::new(".stitch");
        assert_eq!(dd.root(), Path::new(".stitch"));
        assert_eq!(dd.queue(), PathBuf::from(".stitch/queue.json"));
        assert_eq!(dd.run_status(), PathBuf::from(".stitch/run-status.json"));
        assert_eq!(dd.generated_dir(), PathBuf::from(".stitch/generated"));
        assert_eq!(
            dd.feature_output_dir("auth/login 2"),
            PathBuf::from(".stitch/generated/auth_login_2")
        );
    }

    #[test]
    fn test_init_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".stitch"));
        assert!(dd.init().unwrap());
        assert!(dd.generated_dir().exists());
        assert!(!dd.init().unwrap());
    }

    #[test]
    fn test_gitignore_appended_once() {
        let tmp = tempfile::tempdir().unwrap();
        let gitignore = tmp.path().join(".gitignore");
        std::fs::write(&gitignore, "node_modules/").unwrap();

        let dd = DataDir::new(tmp.path().join(".stitch"));
        dd.ensure_initialized().unwrap();
        dd.ensure_initialized().unwrap();

        let contents = std::fs::read_to_string(&gitignore).unwrap();
        assert_eq!(contents, "node_modules/\n.stitch/\n");
    }

    #[test]
    fn test_gitignore_not_created_if_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".stitch"));
        dd.ensure_initialized().unwrap();
        assert!(!tmp.path().join(".gitignore").exists());
    }

    #[test]
    fn test_default_config_never_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let dd = DataDir::new(tmp.path().join(".stitch"));
        let cfg = tmp.path().join("stitch.toml");

        assert_eq!(dd.write_default_config(&cfg).unwrap(), Some(cfg.clone()));
        std::fs::write(&cfg, "# mine").unwrap();
        assert_eq!(dd.write_default_config(&cfg).unwrap(), None);
        assert_eq!(std::fs::read_to_string(&cfg).unwrap(), "# mine");
    }

    #[test]
    fn test_default_config_parses() {
        let parsed: toml::Value = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert!(parsed.get("generator").is_some());

        let config: crate::config::StitchConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.project.import_root, PathBuf::from("src"));
        let project_keys: Vec<&str> = parsed["project"]
            .as_table()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(project_keys, vec!["import_root", "python"]);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/state.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
