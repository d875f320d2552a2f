//! Target inference for generated files.
//!
//! Declared target files win, then keyword rules, then a path hint near the
//! top of the file. A file that matches none is left for manual review.

use crate::config::{ResolverConfig, ResolverRule};
use crate::feature::Feature;
use crate::merge::strip_code_fences;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// One generated file, loaded and fence-stripped, waiting for a target.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub feature_id: String,
    pub feature_name: String,
    /// Where the generator wrote it.
    pub source: PathBuf,
    /// Target paths the feature declared up front.
    pub declared_targets: Vec<PathBuf>,
    pub content: String,
    pub modified: Option<SystemTime>,
}

impl Candidate {
    pub fn load(feature: &Feature, source: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(source)?;
        let modified = std::fs::metadata(source).and_then(|m| m.modified()).ok();
        Ok(Self {
            feature_id: feature.id.clone(),
            feature_name: feature.name.clone(),
            source: source.to_path_buf(),
            declared_targets: feature.target_files.clone(),
            content: strip_code_fences(&raw),
            modified,
        })
    }

    /// The current content of a destination, standing in as a version.
    pub fn existing(dest: &Path, content: String) -> Self {
        Self {
            feature_id: "(existing)".to_string(),
            feature_name: "(existing)".to_string(),
            source: dest.to_path_buf(),
            declared_targets: Vec::new(),
            content,
            modified: std::fs::metadata(dest).and_then(|m| m.modified()).ok(),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.source.file_name().and_then(|n| n.to_str())
    }
}

/// Maps a candidate to the project-relative path it should occupy.
#[derive(Debug)]
pub struct TargetResolver {
    rules: Vec<ResolverRule>,
    hint_bytes: usize,
    hint_pattern: Option<Regex>,
}

impl TargetResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        let roots: Vec<String> = config
            .known_roots
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| regex::escape(r))
            .collect();
        let hint_pattern = if roots.is_empty() {
            None
        } else {
            Regex::new(&format!(
                r#"(?:^|[\s"'`#(:])((?:{})[\w./-]*\w\.\w+)"#,
                roots.join("|")
            ))
            .ok()
        };
        Self {
            rules: config.rules.clone(),
            hint_bytes: config.hint_bytes,
            hint_pattern,
        }
    }

    /// Resolve a candidate's destination. In order: a declared target with
    /// the same file name, the first keyword rule matching the feature
    /// name, then a path hint in the head of the content. `None` means the
    /// candidate needs manual review.
    pub fn resolve(&self, candidate: &Candidate) -> Option<PathBuf> {
        let file_name = candidate.file_name()?;

        if let Some(declared) = candidate
            .declared_targets
            .iter()
            .find(|t| t.file_name().and_then(|n| n.to_str()) == Some(file_name))
        {
            return safe_relative(declared);
        }

        let name = candidate.feature_name.to_lowercase();
        for rule in &self.rules {
            if !name.contains(&rule.keyword.to_lowercase()) {
                continue;
            }
            let path = match (&rule.file, &rule.directory) {
                (Some(file), _) => file.clone(),
                (None, Some(dir)) => dir.join(file_name),
                (None, None) => continue,
            };
            tracing::debug!(
                feature_id = %candidate.feature_id,
                keyword = %rule.keyword,
                target = %path.display(),
                "resolver rule matched"
            );
            return safe_relative(&path);
        }

        self.path_hint(&candidate.content)
    }

    fn path_hint(&self, content: &str) -> Option<PathBuf> {
        let pattern = self.hint_pattern.as_ref()?;
        let mut end = self.hint_bytes.min(content.len());
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        pattern
            .captures_iter(&content[..end])
            .filter_map(|caps| caps.get(1))
            .find_map(|m| safe_relative(Path::new(m.as_str())))
    }
}

/// Accept only relative paths that stay inside the project.
fn safe_relative(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    let ok = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    ok.then(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, file: &str, content: &str) -> Candidate {
        Candidate {
            feature_id: "f1".into(),
            feature_name: name.into(),
            source: PathBuf::from(".stitch/generated/f1").join(file),
            declared_targets: Vec::new(),
            content: content.into(),
            modified: None,
        }
    }

    fn resolver() -> TargetResolver {
        TargetResolver::new(&ResolverConfig::default())
    }

    #[test]
    fn test_declared_target_wins() {
        let mut c = candidate("Test harness", "runner.py", "");
        c.declared_targets = vec![PathBuf::from("src/app/runner.py")];
        assert_eq!(
            resolver().resolve(&c),
            Some(PathBuf::from("src/app/runner.py"))
        );
    }

    #[test]
    fn test_keyword_rule_maps_to_directory() {
        let c = candidate("CLI entry point", "main.py", "");
        assert_eq!(resolver().resolve(&c), Some(PathBuf::from("src/cli/main.py")));
    }

    #[test]
    fn test_file_rule_maps_to_fixed_path() {
        let config = ResolverConfig {
            rules: vec![ResolverRule::file("settings", "src/app/settings.py")],
            ..ResolverConfig::default()
        };
        let c = candidate("Project Settings loader", "whatever.py", "");
        assert_eq!(
            TargetResolver::new(&config).resolve(&c),
            Some(PathBuf::from("src/app/settings.py"))
        );
    }

    #[test]
    fn test_falls_back_to_path_hint() {
        let c = candidate(
            "Billing",
            "out.py",
            "# File: src/billing/invoice.py\n\nclass Invoice:\n    pass\n",
        );
        assert_eq!(
            resolver().resolve(&c),
            Some(PathBuf::from("src/billing/invoice.py"))
        );
    }

    #[test]
    fn test_hint_beyond_scan_window_is_ignored() {
        let mut content = "x = 1\n".repeat(100);
        content.push_str("# src/late/hint.py\n");
        let c = candidate("Billing", "out.py", &content);
        assert_eq!(resolver().resolve(&c), None);
    }

    #[test]
    fn test_unresolvable_returns_none() {
        let c = candidate("Billing", "out.py", "class Invoice:\n    pass\n");
        assert_eq!(resolver().resolve(&c), None);
    }

    #[test]
    fn test_rejects_paths_escaping_the_project() {
        let mut c = candidate("Billing", "out.py", "");
        c.declared_targets = vec![PathBuf::from("../elsewhere/out.py")];
        assert_eq!(resolver().resolve(&c), None);

        let c = candidate("Billing", "out.py", "# src/../../etc/passwd.py\n");
        assert_eq!(resolver().resolve(&c), None);
    }
}
