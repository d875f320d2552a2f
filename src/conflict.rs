//! Conflict analysis for candidates that resolve to the same target.
//!
//! Classification picks one `MergeStrategy` per target from data-table
//! rules first (file names and glob patterns) and structural heuristics
//! second. Pairwise risk is computed for every pair of candidates and the
//! group reports the maximum.

use crate::config::ConflictConfig;
use crate::pysource::{self, PyModule};
use crate::target::{Candidate, TargetResolver};
use glob::Pattern;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// How a target with one or more candidates becomes one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Union of declarations.
    Merge,
    /// Candidates are duplicates or one supersedes the rest; pick one.
    Choose,
    /// Most complete (largest) candidate wins.
    Largest,
    /// Most recently written candidate wins.
    Newest,
    /// No safe automatic resolution.
    Unknown,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Merge => "merge",
            MergeStrategy::Choose => "choose",
            MergeStrategy::Largest => "largest",
            MergeStrategy::Newest => "newest",
            MergeStrategy::Unknown => "unknown",
        }
    }

    /// Strategies that keep one candidate and discard the others.
    pub fn discards_content(&self) -> bool {
        matches!(
            self,
            MergeStrategy::Choose | MergeStrategy::Largest | MergeStrategy::Newest
        )
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        if score >= 50 {
            RiskLevel::High
        } else if score >= 25 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        };
        write!(f, "{s}")
    }
}

/// Structural comparison of a later candidate against an earlier one.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseConflict {
    pub earlier: String,
    pub later: String,
    pub classes_added: Vec<String>,
    pub classes_removed: Vec<String>,
    pub functions_added: Vec<String>,
    pub functions_removed: Vec<String>,
    pub size_diff_percent: f64,
    pub imports_changed: usize,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone)]
pub struct ConflictReport {
    pub target: PathBuf,
    pub strategy: MergeStrategy,
    pub pairs: Vec<PairwiseConflict>,
    /// Maximum pairwise score.
    pub risk_score: u32,
    pub risk_level: RiskLevel,
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: strategy={} risk={} ({})",
            self.target.display(),
            self.strategy,
            self.risk_level,
            self.risk_score
        )?;
        for p in &self.pairs {
            write!(
                f,
                "  {} -> {}: score={} size_diff={:.0}% imports_changed={}",
                p.earlier, p.later, p.risk_score, p.size_diff_percent, p.imports_changed
            )?;
            if !p.classes_removed.is_empty() {
                write!(f, " classes_removed=[{}]", p.classes_removed.join(", "))?;
            }
            if !p.functions_removed.is_empty() {
                write!(f, " functions_removed=[{}]", p.functions_removed.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Candidates from every feature that resolve to one target.
#[derive(Debug, Clone)]
pub struct ConflictGroup {
    pub target: PathBuf,
    pub candidates: Vec<Candidate>,
}

impl ConflictGroup {
    pub fn feature_names(&self) -> Vec<&str> {
        self.candidates
            .iter()
            .map(|c| c.feature_name.as_str())
            .collect()
    }
}

/// Group candidates by resolved target, keeping candidate order within each
/// group. Candidates the resolver cannot place are returned separately.
pub fn group_candidates(
    resolver: &TargetResolver,
    candidates: Vec<Candidate>,
) -> (Vec<ConflictGroup>, Vec<Candidate>) {
    let mut groups: BTreeMap<PathBuf, Vec<Candidate>> = BTreeMap::new();
    let mut unresolved = Vec::new();
    for candidate in candidates {
        match resolver.resolve(&candidate) {
            Some(target) => groups.entry(target).or_default().push(candidate),
            None => unresolved.push(candidate),
        }
    }
    let groups = groups
        .into_iter()
        .map(|(target, candidates)| ConflictGroup { target, candidates })
        .collect();
    (groups, unresolved)
}

/// SHA-256 of content with trailing whitespace and trailing blank lines
/// removed.
pub fn content_hash(content: &str) -> String {
    let normalized: Vec<&str> = content.lines().map(str::trim_end).collect();
    let end = normalized
        .iter()
        .rposition(|l| !l.is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(normalized[..end].join("\n").as_bytes());
    format!("{:x}", hasher.finalize())
}

struct Version<'a> {
    label: &'a str,
    content: &'a str,
    module: PyModule,
}

pub struct ConflictAnalyzer {
    always_merge: Vec<String>,
    always_largest: Vec<Pattern>,
    always_newest: Vec<Pattern>,
    allow_high_risk: bool,
    verify_content_hash: bool,
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "ignoring invalid conflict pattern");
                None
            }
        })
        .collect()
}

impl ConflictAnalyzer {
    pub fn new(config: &ConflictConfig) -> Self {
        Self {
            always_merge: config.always_merge.clone(),
            always_largest: compile_patterns(&config.always_largest),
            always_newest: compile_patterns(&config.always_newest),
            allow_high_risk: config.allow_high_risk,
            verify_content_hash: config.verify_content_hash,
        }
    }

    /// Pick a strategy for `target` and, when there is more than one
    /// candidate, report pairwise risk.
    pub fn analyze(
        &self,
        target: &Path,
        candidates: &[Candidate],
    ) -> (MergeStrategy, Option<ConflictReport>) {
        let versions: Vec<Version> = candidates
            .iter()
            .map(|c| Version {
                label: c.feature_id.as_str(),
                content: c.content.as_str(),
                module: pysource::parse_module(&c.content).0,
            })
            .collect();

        let strategy = self.classify(target, &versions);
        if versions.len() < 2 {
            return (strategy, None);
        }

        let mut pairs = Vec::new();
        for (i, earlier) in versions.iter().enumerate() {
            for later in &versions[i + 1..] {
                pairs.push(pairwise(earlier, later));
            }
        }
        let risk_score = pairs.iter().map(|p| p.risk_score).max().unwrap_or(0);
        let report = ConflictReport {
            target: target.to_path_buf(),
            strategy,
            pairs,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
        };
        tracing::debug!(
            target = %target.display(),
            %strategy,
            risk = risk_score,
            "conflict analysis"
        );
        (strategy, Some(report))
    }

    fn classify(&self, target: &Path, versions: &[Version]) -> MergeStrategy {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        if self.always_merge.iter().any(|n| n == file_name) {
            return MergeStrategy::Merge;
        }
        if self.always_largest.iter().any(|p| p.matches(file_name)) {
            return MergeStrategy::Largest;
        }
        if self.always_newest.iter().any(|p| p.matches(file_name)) {
            return MergeStrategy::Newest;
        }
        if versions.len() < 2 {
            return MergeStrategy::Choose;
        }

        let first_hash = content_hash(versions[0].content);
        let same_hash = versions[1..]
            .iter()
            .all(|v| content_hash(v.content) == first_hash);
        let same_symbols = versions[1..].iter().all(|v| {
            v.module.class_names() == versions[0].module.class_names()
                && v.module.function_names() == versions[0].module.function_names()
        });
        if same_hash || same_symbols {
            return MergeStrategy::Choose;
        }

        let mut union: BTreeSet<String> = BTreeSet::new();
        let mut max_single = 0;
        for v in versions {
            let symbols = symbols(&v.module);
            max_single = max_single.max(symbols.len());
            union.extend(symbols);
        }
        if max_single > 0 && 2 * union.len() >= 3 * max_single {
            return MergeStrategy::Merge;
        }

        // The newest version already contains everything the others define.
        if let Some(last) = versions.last() {
            if symbols(&last.module).len() == union.len() {
                return MergeStrategy::Choose;
            }
        }

        MergeStrategy::Unknown
    }

    /// Reason to refuse integration, if any. HIGH risk only blocks
    /// strategies that discard candidates.
    pub fn blocking_reason(
        &self,
        strategy: MergeStrategy,
        report: Option<&ConflictReport>,
    ) -> Option<String> {
        if strategy == MergeStrategy::Unknown {
            return Some("no automatic merge strategy applies; manual review required".to_string());
        }
        let report = report?;
        if report.risk_level == RiskLevel::High
            && strategy.discards_content()
            && !self.allow_high_risk
        {
            return Some(format!(
                "risk {} ({}) with strategy '{strategy}'; rerun with --allow-high-risk to override",
                report.risk_level, report.risk_score
            ));
        }
        None
    }

    /// Whether `candidate` already sits at `dest`: the destination is newer
    /// than the generated file and within 100 bytes of its size, and when
    /// hash verification is on, their normalised contents hash equal.
    pub fn is_already_integrated(&self, dest: &Path, candidate: &Candidate) -> bool {
        let Ok(dest_meta) = std::fs::metadata(dest) else {
            return false;
        };
        let (Ok(dest_mtime), Some(src_mtime)) = (dest_meta.modified(), candidate.modified) else {
            return false;
        };
        if dest_mtime <= src_mtime {
            return false;
        }
        let src_len = candidate.content.len() as i64;
        if (dest_meta.len() as i64 - src_len).abs() > 100 {
            return false;
        }
        if !self.verify_content_hash {
            return true;
        }
        match std::fs::read_to_string(dest) {
            Ok(existing) => content_hash(&existing) == content_hash(&candidate.content),
            Err(_) => false,
        }
    }

    /// True when every candidate of the group is already integrated.
    pub fn group_already_integrated(&self, dest: &Path, candidates: &[Candidate]) -> bool {
        !candidates.is_empty()
            && candidates
                .iter()
                .all(|c| self.is_already_integrated(dest, c))
    }
}

/// What integrating one target would take, judged against the tree as it
/// is now.
#[derive(Debug)]
pub enum Assessment {
    /// Every candidate already sits at the destination.
    AlreadyIntegrated,
    /// Single candidate, no file yet: a plain write.
    NewFile,
    Resolve {
        strategy: MergeStrategy,
        report: Option<ConflictReport>,
        /// Why the target needs an operator, if it does.
        blocked: Option<String>,
    },
}

impl ConflictAnalyzer {
    /// Assess `group` for destination `dest`. An existing destination takes
    /// part as the earliest version.
    pub fn assess(&self, dest: &Path, group: &ConflictGroup) -> Assessment {
        if self.group_already_integrated(dest, &group.candidates) {
            return Assessment::AlreadyIntegrated;
        }
        let existing = std::fs::read_to_string(dest).ok();
        if existing.is_none() && group.candidates.len() == 1 {
            return Assessment::NewFile;
        }
        let mut versions = Vec::with_capacity(group.candidates.len() + 1);
        if let Some(content) = existing {
            versions.push(Candidate::existing(dest, content));
        }
        versions.extend(group.candidates.iter().cloned());

        let (strategy, report) = self.analyze(&group.target, &versions);
        let blocked = self.blocking_reason(strategy, report.as_ref());
        Assessment::Resolve {
            strategy,
            report,
            blocked,
        }
    }
}

fn symbols(module: &PyModule) -> BTreeSet<String> {
    let mut out = module.class_names();
    out.extend(module.function_names());
    out
}

fn pairwise(earlier: &Version, later: &Version) -> PairwiseConflict {
    let (ea, la) = (&earlier.module, &later.module);
    let diff = |a: &BTreeSet<String>, b: &BTreeSet<String>| -> Vec<String> {
        a.difference(b).cloned().collect()
    };
    let classes_added = diff(&la.class_names(), &ea.class_names());
    let classes_removed = diff(&ea.class_names(), &la.class_names());
    let functions_added = diff(&la.function_names(), &ea.function_names());
    let functions_removed = diff(&ea.function_names(), &la.function_names());

    let base = earlier.content.len().max(1) as f64;
    let size_diff_percent =
        (later.content.len() as f64 - earlier.content.len() as f64).abs() / base * 100.0;
    let imports_changed = ea
        .import_keys()
        .symmetric_difference(&la.import_keys())
        .count();

    let mut score = 0u32;
    if size_diff_percent > 50.0 {
        score += 30;
    }
    if !classes_removed.is_empty() {
        score += 25;
    }
    if !functions_removed.is_empty() {
        score += 20;
    }
    if imports_changed > 5 {
        score += 15;
    }
    if size_diff_percent > 20.0 {
        score += 10;
    }
    let risk_score = score.min(100);

    PairwiseConflict {
        earlier: earlier.label.to_string(),
        later: later.label.to_string(),
        classes_added,
        classes_removed,
        functions_added,
        functions_removed,
        size_diff_percent,
        imports_changed,
        risk_score,
        risk_level: RiskLevel::from_score(risk_score),
    }
}
