//! Executes a `MergeStrategy` and writes the result.
//!
//! Structural merges put the existing target's declarations first so code
//! already in the tree is never dropped. Every write of an existing file is
//! preceded by a `.backup` copy; backups are never removed.

use crate::conflict::MergeStrategy;
use crate::data_dir::write_atomic;
use crate::error::{Result, StitchError};
use crate::pysource::{self, Declaration, Import, PyModule};
use crate::target::Candidate;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const MAX_IMPORT_LINE: usize = 88;

/// Remove a markdown code-fence wrapper a model may have put around a file.
pub fn strip_code_fences(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) else {
        return String::new();
    };
    if !lines[first].trim_start().starts_with("```") {
        return content.to_string();
    }
    let last = lines
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .unwrap_or(first);
    let end = if last > first && lines[last].trim() == "```" {
        last
    } else {
        lines.len()
    };
    let mut out = lines[first + 1..end].join("\n");
    out.push('\n');
    out
}

/// A file written during integration, enough to undo it.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenFile {
    pub path: PathBuf,
    /// Copy of the previous content; `None` when the file was new.
    pub backup: Option<PathBuf>,
}

impl WrittenFile {
    pub fn was_new(&self) -> bool {
        self.backup.is_none()
    }
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".backup");
    path.with_file_name(name)
}

struct Version {
    label: String,
    content: String,
    modified: Option<SystemTime>,
}

#[derive(Debug, Default)]
pub struct MergeEngine;

impl MergeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Produce the content `target` should hold. The current content of
    /// `target`, when it exists, takes part as the earliest version.
    pub fn merge(
        &self,
        target: &Path,
        candidates: &[Candidate],
        strategy: MergeStrategy,
    ) -> Result<String> {
        let mut versions = Vec::new();
        if target.exists() {
            versions.push(Version {
                label: "(existing)".to_string(),
                content: std::fs::read_to_string(target)?,
                modified: std::fs::metadata(target).and_then(|m| m.modified()).ok(),
            });
        }
        versions.extend(candidates.iter().map(|c| Version {
            label: c.feature_id.clone(),
            content: strip_code_fences(&c.content),
            modified: c.modified,
        }));
        if versions.is_empty() {
            return Err(StitchError::conflict(target, "no candidates to merge"));
        }

        let is_python = target.extension().and_then(|e| e.to_str()) == Some("py");
        let strategy = if strategy == MergeStrategy::Merge && !is_python {
            tracing::warn!(
                target = %target.display(),
                "structural merge needs Python source, using largest candidate"
            );
            MergeStrategy::Largest
        } else {
            strategy
        };

        let chosen = match strategy {
            MergeStrategy::Largest => versions
                .iter()
                .enumerate()
                .max_by_key(|(i, v)| (v.content.len(), std::cmp::Reverse(*i)))
                .map(|(_, v)| v),
            MergeStrategy::Newest => versions
                .iter()
                .enumerate()
                .max_by_key(|(i, v)| (v.modified, *i))
                .map(|(_, v)| v),
            MergeStrategy::Choose => versions
                .iter()
                .enumerate()
                .max_by_key(|(i, v)| (pysource::parse_module(&v.content).0.symbol_count(), *i))
                .map(|(_, v)| v),
            MergeStrategy::Merge => return Ok(structural_merge(&versions)),
            MergeStrategy::Unknown => {
                return Err(StitchError::conflict(
                    target,
                    "merge strategy unknown; manual review required",
                ))
            }
        };
        let chosen = chosen.ok_or_else(|| StitchError::conflict(target, "no candidates"))?;
        tracing::debug!(
            target = %target.display(),
            %strategy,
            winner = %chosen.label,
            "selected candidate"
        );
        Ok(chosen.content.clone())
    }

    /// Write `content` to `path`, backing up any existing file first.
    pub fn write_target(&self, path: &Path, content: &str) -> Result<WrittenFile> {
        let backup = if path.exists() {
            let backup = backup_path(path);
            std::fs::copy(path, &backup).map_err(|e| {
                StitchError::infra(format!("backup of {} failed: {e}", path.display()))
            })?;
            Some(backup)
        } else {
            None
        };
        write_atomic(path, content.as_bytes())
            .map_err(|e| StitchError::infra(format!("write of {} failed: {e}", path.display())))?;
        tracing::info!(
            target = %path.display(),
            backup = backup.is_some(),
            "wrote target"
        );
        Ok(WrittenFile {
            path: path.to_path_buf(),
            backup,
        })
    }

    /// Undo writes in reverse order: restore backups, remove new files.
    /// Backups stay on disk.
    pub fn rollback(&self, written: &[WrittenFile]) -> Result<()> {
        for file in written.iter().rev() {
            match &file.backup {
                Some(backup) => {
                    let bytes = std::fs::read(backup)?;
                    write_atomic(&file.path, &bytes)?;
                }
                None => match std::fs::remove_file(&file.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
            }
            tracing::info!(target = %file.path.display(), "rolled back");
        }
        Ok(())
    }
}

fn structural_merge(versions: &[Version]) -> String {
    let structural: Option<Vec<PyModule>> = versions
        .iter()
        .map(|v| pysource::parse_structural(&v.content))
        .collect();
    let modules = match structural {
        Some(modules) => modules,
        None => {
            tracing::warn!(
                versions = versions.len(),
                "structural parse failed, merging with line-scanning fallback"
            );
            versions
                .iter()
                .map(|v| pysource::parse_line_scan(&v.content))
                .collect()
        }
    };
    render(&union_modules(&modules))
}

/// Union declarations across modules; first occurrence of a name wins.
fn union_modules(modules: &[PyModule]) -> PyModule {
    let mut out = PyModule::default();
    let mut seen_imports: HashSet<Import> = HashSet::new();
    let mut seen_statements: HashSet<String> = HashSet::new();
    let mut seen_trailing: HashSet<String> = HashSet::new();
    let mut seen_classes: HashSet<String> = HashSet::new();
    let mut seen_functions: HashSet<String> = HashSet::new();
    let mut exports: Option<BTreeSet<String>> = None;

    for m in modules {
        if out.header.is_empty() {
            out.header = m.header.clone();
        }
        if out.docstring.is_none() {
            out.docstring = m.docstring.clone();
        }
        for import in &m.imports {
            if seen_imports.insert(import.clone()) {
                out.imports.push(import.clone());
            }
        }
        for stmt in &m.statements {
            if seen_statements.insert(stmt.trim().to_string()) {
                out.statements.push(stmt.clone());
            }
        }
        for stmt in &m.trailing {
            if seen_trailing.insert(stmt.trim().to_string()) {
                out.trailing.push(stmt.clone());
            }
        }
        for class in &m.classes {
            if seen_classes.insert(class.name.clone()) {
                out.classes.push(class.clone());
            }
        }
        for function in &m.functions {
            if seen_functions.insert(function.name.clone()) {
                out.functions.push(function.clone());
            }
        }
        if let Some(names) = &m.exports {
            exports.get_or_insert_with(BTreeSet::new).extend(names.iter().cloned());
        }
    }

    // Export every public declaration plus previously exported names that
    // are still bound.
    let mut bound: HashSet<String> = HashSet::new();
    bound.extend(out.class_names());
    bound.extend(out.function_names());
    bound.extend(
        out.imports
            .iter()
            .filter_map(|i| i.bound_name().map(str::to_string)),
    );
    for stmt in &out.statements {
        if let Some(name) = stmt.split(['=', ':']).next().map(str::trim) {
            bound.insert(name.to_string());
        }
    }
    let mut names: BTreeSet<String> = exports
        .unwrap_or_default()
        .into_iter()
        .filter(|n| bound.contains(n))
        .collect();
    names.extend(
        out.classes
            .iter()
            .chain(out.functions.iter())
            .map(|d| d.name.clone())
            .filter(|n| !n.starts_with('_')),
    );
    if !names.is_empty() {
        out.exports = Some(names.into_iter().collect());
    }

    out.classes.sort_by(|a, b| a.name.cmp(&b.name));
    out.classes = order_by_bases(std::mem::take(&mut out.classes));
    out.functions.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Stable reorder so every class follows the merged classes it inherits
/// from. Cycles keep their sorted order.
fn order_by_bases(classes: Vec<Declaration>) -> Vec<Declaration> {
    let names: HashSet<String> = classes.iter().map(|c| c.name.clone()).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut remaining = classes;
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut deferred = Vec::new();
        for class in remaining {
            let ready = class
                .bases
                .iter()
                .all(|b| b == &class.name || !names.contains(b) || placed.contains(b));
            if ready {
                placed.insert(class.name.clone());
                ordered.push(class);
            } else {
                deferred.push(class);
            }
        }
        if deferred.len() == before {
            ordered.extend(deferred);
            break;
        }
        remaining = deferred;
    }
    ordered
}

fn render_imports(imports: &[Import]) -> Vec<String> {
    let mut plain: BTreeSet<String> = BTreeSet::new();
    let mut from: BTreeMap<(bool, String), BTreeSet<String>> = BTreeMap::new();
    for import in imports {
        match import {
            Import::Module { .. } => {
                plain.insert(import.to_string());
            }
            Import::From {
                module,
                name,
                alias,
            } => {
                let entry = match alias {
                    Some(a) => format!("{name} as {a}"),
                    None => name.clone(),
                };
                // Relative imports sort after absolute ones.
                from.entry((module.starts_with('.'), module.clone()))
                    .or_default()
                    .insert(entry);
            }
        }
    }

    let mut lines: Vec<String> = plain.into_iter().collect();
    for ((_, module), names) in from {
        let names: Vec<String> = names.into_iter().collect();
        let line = format!("from {module} import {}", names.join(", "));
        if line.len() <= MAX_IMPORT_LINE || names.len() == 1 {
            lines.push(line);
        } else {
            let body: Vec<String> = names.iter().map(|n| format!("    {n},")).collect();
            lines.push(format!("from {module} import (\n{}\n)", body.join("\n")));
        }
    }
    lines
}

fn render(module: &PyModule) -> String {
    let mut sections: Vec<String> = Vec::new();

    let mut head: Vec<String> = module.header.clone();
    if let Some(doc) = &module.docstring {
        head.push(doc.clone());
    }
    if !head.is_empty() {
        sections.push(head.join("\n"));
    }

    let (future, imports): (Vec<Import>, Vec<Import>) =
        module.imports.iter().cloned().partition(Import::is_future);
    if !future.is_empty() {
        sections.push(render_imports(&future).join("\n"));
    }
    if !imports.is_empty() {
        sections.push(render_imports(&imports).join("\n"));
    }
    if !module.statements.is_empty() {
        sections.push(module.statements.join("\n"));
    }

    let mut out = sections.join("\n\n");
    let blocks = module
        .classes
        .iter()
        .chain(module.functions.iter())
        .map(|d| d.text.trim_end().to_string());
    for block in blocks {
        if !out.is_empty() {
            out.push_str("\n\n\n");
        }
        out.push_str(&block);
    }
    if let Some(names) = &module.exports {
        let quoted: Vec<String> = names.iter().map(|n| format!("    \"{n}\",")).collect();
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("__all__ = [\n{}\n]", quoted.join("\n")));
    }
    for stmt in &module.trailing {
        if !out.is_empty() {
            out.push_str("\n\n\n");
        }
        out.push_str(stmt.trim_end());
    }
    out.push('\n');
    out
}
