//! Truncation and corruption detection for generated source.
//!
//! Every check runs on every input; issues accumulate rather than stopping
//! at the first one so the operator sees everything wrong with a candidate.

use crate::config::IntegrityConfig;
use crate::pysource::{self, Lexer};
use std::collections::HashSet;
use std::fmt;

/// Whether an issue blocks integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    Truncated,
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub kind: IssueKind,
    pub message: String,
}

impl IntegrityIssue {
    fn truncated(message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Truncated,
            message: message.into(),
        }
    }

    fn advisory(message: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Advisory,
            message: message.into(),
        }
    }

    pub fn is_truncation(&self) -> bool {
        self.kind == IssueKind::Truncated
    }
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IssueKind::Truncated => write!(f, "TRUNCATED: {}", self.message),
            IssueKind::Advisory => write!(f, "{}", self.message),
        }
    }
}

/// Last-line tokens that legitimately end a file.
const TERMINAL_WORDS: &[&str] = &[
    "pass", "return", "break", "continue", "None", "True", "False", "raise", "yield", "else",
    "finally",
];

const BLOCK_KEYWORDS: &[&str] = &[
    "def ", "async def ", "class ", "if ", "elif ", "for ", "while ", "with ", "except ",
];

#[derive(Debug, Clone)]
pub struct IntegrityScanner {
    tail_lines: usize,
}

impl Default for IntegrityScanner {
    fn default() -> Self {
        Self::new(&IntegrityConfig::default())
    }
}

impl IntegrityScanner {
    pub fn new(config: &IntegrityConfig) -> Self {
        Self {
            tail_lines: config.tail_lines.max(1),
        }
    }

    pub fn scan(&self, content: &str) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();
        if content.trim().is_empty() {
            issues.push(IntegrityIssue::advisory("content is empty"));
            return issues;
        }
        check_last_line(content, &mut issues);
        check_brackets(content, &mut issues);
        check_exports(content, &mut issues);
        self.check_parse(content, &mut issues);
        issues
    }

    fn check_parse(&self, content: &str, issues: &mut Vec<IntegrityIssue>) {
        let Some(rows) = pysource::syntax_error_rows(content) else {
            return;
        };
        let total = content.lines().count();
        let tail_start = total.saturating_sub(self.tail_lines);
        if let Some(row) = rows.iter().find(|r| **r >= tail_start) {
            issues.push(IntegrityIssue::truncated(format!(
                "parse error at line {} near end of file",
                (row + 1).min(total)
            )));
        }
    }
}

pub fn has_truncation(issues: &[IntegrityIssue]) -> bool {
    issues.iter().any(IntegrityIssue::is_truncation)
}

fn check_last_line(content: &str, issues: &mut Vec<IntegrityIssue>) {
    let Some(last) = content.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return;
    };
    if last.starts_with('#') {
        return;
    }

    if last.ends_with('=') && !last.ends_with("==") {
        issues.push(IntegrityIssue::truncated(format!(
            "ends with incomplete assignment: '{last}'"
        )));
    } else if last.ends_with('.') && !last.ends_with("...") {
        issues.push(IntegrityIssue::truncated(format!(
            "ends with incomplete attribute access: '{last}'"
        )));
    } else if is_bare_identifier(last) && !TERMINAL_WORDS.contains(&last) {
        issues.push(IntegrityIssue::truncated(format!(
            "ends with dangling identifier '{last}'"
        )));
    } else if BLOCK_KEYWORDS.iter().any(|k| last.starts_with(k)) && !last.ends_with(':') {
        issues.push(IntegrityIssue::truncated(format!(
            "ends with incomplete block header: '{last}'"
        )));
    }
}

fn is_bare_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

fn check_brackets(content: &str, issues: &mut Vec<IntegrityIssue>) {
    let mut lexer = Lexer::default();
    lexer.feed(content);

    for (open, close, diff) in [
        ('(', ')', lexer.paren),
        ('[', ']', lexer.bracket),
        ('{', '}', lexer.brace),
    ] {
        if diff > 0 {
            issues.push(IntegrityIssue::truncated(format!(
                "{diff} unclosed '{open}'"
            )));
        } else if diff < 0 {
            issues.push(IntegrityIssue::advisory(format!(
                "{} unmatched '{close}'",
                -diff
            )));
        }
    }

    if lexer.in_block_string() {
        issues.push(IntegrityIssue::truncated(
            "unterminated triple-quoted string",
        ));
    }
}

fn check_exports(content: &str, issues: &mut Vec<IntegrityIssue>) {
    let module = pysource::parse_line_scan(content);
    let Some(exports) = &module.exports else {
        return;
    };
    if module
        .imports
        .iter()
        .any(|i| matches!(i, pysource::Import::From { name, .. } if name == "*"))
    {
        return;
    }

    let mut defined: HashSet<String> = HashSet::new();
    defined.extend(module.class_names());
    defined.extend(module.function_names());
    defined.extend(
        module
            .imports
            .iter()
            .filter_map(|i| i.bound_name().map(str::to_string)),
    );
    for stmt in module.statements.iter().chain(module.trailing.iter()) {
        defined.extend(assigned_names(stmt));
    }

    let missing: Vec<&str> = exports
        .iter()
        .filter(|n| !defined.contains(*n))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        issues.push(IntegrityIssue::truncated(format!(
            "__all__ lists undefined names: {}",
            missing.join(", ")
        )));
    }
}

/// Names bound by a simple (possibly annotated or tuple) assignment.
fn assigned_names(stmt: &str) -> Vec<String> {
    let Some(first) = stmt.lines().find(|l| !l.trim_start().starts_with('#')) else {
        return Vec::new();
    };
    let Some(eq) = first.find('=') else {
        return Vec::new();
    };
    if first[eq..].starts_with("==") {
        return Vec::new();
    }
    let lhs = first[..eq].split(':').next().unwrap_or("");
    lhs.split(',')
        .map(str::trim)
        .filter(|n| is_bare_identifier(n))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#""""Helpers."""
import os
from typing import List

__all__ = ["DEFAULT", "Loader", "load_all", "List"]

DEFAULT = os.getenv("X", "y")


class Loader:
    def __init__(self, paths: List[str]) -> None:
        self.paths = paths


def load_all(paths):
    return [Loader([p]) for p in paths]
"#;

    fn scan(content: &str) -> Vec<IntegrityIssue> {
        IntegrityScanner::default().scan(content)
    }

    #[test]
    fn test_well_formed_file_has_no_issues() {
        assert_eq!(scan(WELL_FORMED), Vec::new());
    }

    #[test]
    fn test_incomplete_assignment_is_truncated() {
        let issues = scan("import os\n\nx = 1\ny = \n");
        assert!(has_truncation(&issues));
        assert!(issues
            .iter()
            .any(|i| i.to_string().starts_with("TRUNCATED: ends with incomplete assignment")));
    }

    #[test]
    fn test_attribute_access_and_dangling_identifier() {
        let issues = scan("def f(self):\n    return self.\n");
        assert!(issues[0].message.contains("attribute access"));

        let issues = scan("def f():\n    value = 1\n    retu\n");
        assert!(issues.iter().any(|i| i.message.contains("dangling identifier 'retu'")));

        assert!(scan("def f():\n    pass\n").is_empty());
    }

    #[test]
    fn test_unclosed_brackets_report_exact_count() {
        let issues = scan("x = foo(bar(1,\n");
        assert!(issues
            .iter()
            .any(|i| i.is_truncation() && i.message == "2 unclosed '('"));
    }

    #[test]
    fn test_extra_closers_are_advisory() {
        let issues = scan("x = 1)\n");
        let bracket: Vec<_> = issues
            .iter()
            .filter(|i| i.message.contains("unmatched"))
            .collect();
        assert_eq!(bracket.len(), 1);
        assert_eq!(bracket[0].kind, IssueKind::Advisory);
    }

    #[test]
    fn test_unterminated_docstring() {
        let issues = scan("def f():\n    \"\"\"Starts a docstring\n    and never ends\n");
        assert!(issues
            .iter()
            .any(|i| i.message == "unterminated triple-quoted string"));
    }

    #[test]
    fn test_exports_reference_missing_definitions() {
        let src = "__all__ = [\"present\", \"gone\", \"also_gone\"]\n\n\ndef present():\n    pass\n";
        let issues = scan(src);
        assert_eq!(issues.len(), 1);
        assert_eq!(
            issues[0].to_string(),
            "TRUNCATED: __all__ lists undefined names: gone, also_gone"
        );
    }

    #[test]
    fn test_parse_error_early_in_file_is_not_truncation() {
        let mut src = String::from("def broken(:\n    pass\n");
        for i in 0..10 {
            src.push_str(&format!("\n\ndef f{i}():\n    return {i}\n"));
        }
        let issues = scan(&src);
        assert!(
            !issues.iter().any(|i| i.message.contains("parse error")),
            "{issues:?}"
        );
    }

    #[test]
    fn test_checks_accumulate() {
        let issues = scan("__all__ = [\"a\"]\ndata = {\"k\": [1, 2,\n");
        let messages: Vec<String> = issues.iter().map(|i| i.message.clone()).collect();
        assert!(messages.contains(&"1 unclosed '['".to_string()), "{messages:?}");
        assert!(messages.contains(&"1 unclosed '{'".to_string()), "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("undefined names: a")));
    }
}
