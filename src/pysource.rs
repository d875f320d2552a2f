//! Declaration-level model of a Python module.
//!
//! Generated candidates are split into imports, module statements, top-level
//! classes and top-level functions. The structural path uses tree-sitter; a
//! line-scanning fallback approximates the same boundaries from indentation
//! and keyword prefixes when the structural parse fails.

use std::collections::BTreeSet;
use std::fmt;

/// One imported name. `from a import b, c` becomes two entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Import {
    Module {
        module: String,
        alias: Option<String>,
    },
    From {
        module: String,
        name: String,
        alias: Option<String>,
    },
}

impl Import {
    pub fn module(&self) -> &str {
        match self {
            Import::Module { module, .. } | Import::From { module, .. } => module,
        }
    }

    pub fn is_future(&self) -> bool {
        self.module() == "__future__"
    }

    /// Name this import binds in the module namespace.
    pub fn bound_name(&self) -> Option<&str> {
        match self {
            Import::Module { alias: Some(a), .. } | Import::From { alias: Some(a), .. } => Some(a),
            Import::Module { module, .. } => module.split('.').next(),
            Import::From { name, .. } if name == "*" => None,
            Import::From { name, .. } => Some(name),
        }
    }
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Import::Module { module, alias } => {
                write!(f, "import {module}")?;
                if let Some(a) = alias {
                    write!(f, " as {a}")?;
                }
            }
            Import::From {
                module,
                name,
                alias,
            } => {
                write!(f, "from {module} import {name}")?;
                if let Some(a) = alias {
                    write!(f, " as {a}")?;
                }
            }
        }
        Ok(())
    }
}

/// A top-level class or function, with any decorators and the comments
/// directly above it.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub text: String,
    /// Base class names (last dotted segment) for classes.
    pub bases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PyModule {
    /// Comment lines before any code (shebang, encoding, license).
    pub header: Vec<String>,
    pub docstring: Option<String>,
    pub imports: Vec<Import>,
    /// Statements that appear before the first class or function.
    pub statements: Vec<String>,
    pub classes: Vec<Declaration>,
    pub functions: Vec<Declaration>,
    /// Statements that appear after the first class or function.
    pub trailing: Vec<String>,
    /// Names listed in `__all__`, if the module declares one.
    pub exports: Option<Vec<String>>,
}

impl PyModule {
    pub fn class_names(&self) -> BTreeSet<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    pub fn function_names(&self) -> BTreeSet<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }

    pub fn import_keys(&self) -> BTreeSet<String> {
        self.imports.iter().map(|i| i.to_string()).collect()
    }

    pub fn symbol_count(&self) -> usize {
        self.class_names().len() + self.function_names().len()
    }
}

/// Which parser produced a `PyModule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Structural,
    LineScan,
}

/// Parse structurally, falling back to line scanning. The fallback can
/// misplace decorators or split multi-line strings, so every use is logged.
pub fn parse_module(content: &str) -> (PyModule, ParseMode) {
    match parse_structural(content) {
        Some(module) => (module, ParseMode::Structural),
        None => {
            tracing::warn!("structural parse failed, using line-scanning fallback");
            (parse_line_scan(content), ParseMode::LineScan)
        }
    }
}

fn python_parser() -> Option<tree_sitter::Parser> {
    let lang: tree_sitter::Language = tree_sitter_python::LANGUAGE.into();
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&lang).ok()?;
    Some(parser)
}

/// Rows (0-based) of every parse error in `content`. `None` when the
/// grammar could not be loaded.
pub fn syntax_error_rows(content: &str) -> Option<Vec<usize>> {
    let mut parser = python_parser()?;
    let tree = parser.parse(content, None)?;
    let mut rows = Vec::new();
    collect_error_rows(tree.root_node(), &mut rows);
    rows.sort_unstable();
    rows.dedup();
    Some(rows)
}

fn collect_error_rows(node: tree_sitter::Node, rows: &mut Vec<usize>) {
    if node.is_error() {
        rows.push(node.end_position().row);
    } else if node.is_missing() {
        rows.push(node.start_position().row);
    }
    if !node.has_error() {
        return;
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            collect_error_rows(child, rows);
        }
    }
}

#[derive(Clone, Copy)]
enum Slot {
    None,
    Statement(usize),
    Trailing(usize),
    Class(usize),
    Function(usize),
}

impl PyModule {
    fn append_comment(&mut self, slot: Slot, comment: &str) {
        let text = match slot {
            Slot::None => return,
            Slot::Statement(i) => &mut self.statements[i],
            Slot::Trailing(i) => &mut self.trailing[i],
            Slot::Class(i) => &mut self.classes[i].text,
            Slot::Function(i) => &mut self.functions[i].text,
        };
        text.push_str("  ");
        text.push_str(comment);
    }
}

/// Parse with tree-sitter. Returns `None` if the grammar is unavailable or
/// the source contains any syntax error.
pub fn parse_structural(content: &str) -> Option<PyModule> {
    let mut parser = python_parser()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut module = PyModule::default();
    let mut comments: Vec<&str> = Vec::new();
    let mut seen_code = false;
    let mut seen_def = false;
    let mut last = Slot::None;
    let mut last_row: Option<usize> = None;

    for i in 0..root.named_child_count() {
        let Some(node) = root.named_child(i) else {
            continue;
        };
        let text = &content[node.byte_range()];

        if node.kind() == "comment" {
            if last_row == Some(node.start_position().row) {
                module.append_comment(last, text);
            } else if !seen_code {
                module.header.push(text.to_string());
            } else {
                comments.push(text);
            }
            continue;
        }

        last_row = Some(node.end_position().row);
        let leading = take_comments(&mut comments);

        match node.kind() {
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                match parse_import(text) {
                    Some(imports) => module.imports.extend(imports),
                    None => module.statements.push(format!("{leading}{text}")),
                }
                last = Slot::None;
            }
            "class_definition" | "function_definition" | "decorated_definition" => {
                let def = if node.kind() == "decorated_definition" {
                    node.child_by_field_name("definition")?
                } else {
                    node
                };
                let name_node = def.child_by_field_name("name")?;
                let decl = Declaration {
                    name: content[name_node.byte_range()].to_string(),
                    text: format!("{leading}{text}"),
                    bases: class_bases(def, content),
                };
                if def.kind() == "class_definition" {
                    module.classes.push(decl);
                    last = Slot::Class(module.classes.len() - 1);
                } else {
                    module.functions.push(decl);
                    last = Slot::Function(module.functions.len() - 1);
                }
                seen_def = true;
            }
            "expression_statement" if !seen_code && is_docstring(node) => {
                module.docstring = Some(text.to_string());
                last = Slot::None;
            }
            _ => {
                if let Some(names) = parse_all_assignment(text) {
                    module.exports = Some(names);
                    last = Slot::None;
                } else if seen_def {
                    module.trailing.push(format!("{leading}{text}"));
                    last = Slot::Trailing(module.trailing.len() - 1);
                } else {
                    module.statements.push(format!("{leading}{text}"));
                    last = Slot::Statement(module.statements.len() - 1);
                }
            }
        }
        seen_code = true;
    }

    if !comments.is_empty() {
        module.trailing.push(comments.join("\n"));
    }
    Some(module)
}

fn take_comments(comments: &mut Vec<&str>) -> String {
    if comments.is_empty() {
        return String::new();
    }
    let mut s = comments.join("\n");
    s.push('\n');
    comments.clear();
    s
}

fn is_docstring(node: tree_sitter::Node) -> bool {
    node.named_child_count() == 1
        && node
            .named_child(0)
            .map(|c| c.kind() == "string" || c.kind() == "concatenated_string")
            .unwrap_or(false)
}

fn class_bases(def: tree_sitter::Node, content: &str) -> Vec<String> {
    let Some(args) = def.child_by_field_name("superclasses") else {
        return Vec::new();
    };
    let mut bases = Vec::new();
    for i in 0..args.named_child_count() {
        let Some(arg) = args.named_child(i) else {
            continue;
        };
        if matches!(arg.kind(), "identifier" | "attribute") {
            let text = &content[arg.byte_range()];
            if let Some(last) = text.rsplit('.').next() {
                bases.push(last.trim().to_string());
            }
        }
    }
    bases
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}

fn is_dotted(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_identifier)
}

/// Split an import statement (possibly parenthesised across lines) into
/// one `Import` per bound name. `None` if the text is not a plain import.
pub fn parse_import(text: &str) -> Option<Vec<Import>> {
    let cleaned: String = text
        .lines()
        .map(|l| l.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join(" ")
        .replace(['(', ')', '\\'], " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = cleaned.trim_end_matches(';').trim();

    let split_alias = |part: &str| -> Option<(String, Option<String>)> {
        let mut words = part.split_whitespace();
        let name = words.next()?.to_string();
        match (words.next(), words.next(), words.next()) {
            (None, _, _) => Some((name, None)),
            (Some("as"), Some(alias), None) if is_identifier(alias) => {
                Some((name, Some(alias.to_string())))
            }
            _ => None,
        }
    };

    if let Some(rest) = cleaned.strip_prefix("import ") {
        let mut out = Vec::new();
        for part in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (module, alias) = split_alias(part)?;
            if !is_dotted(&module) {
                return None;
            }
            out.push(Import::Module { module, alias });
        }
        return (!out.is_empty()).then_some(out);
    }

    let rest = cleaned.strip_prefix("from ")?;
    let (module, names) = rest.split_once(" import ")?;
    let module = module.trim();
    let relative = module.trim_start_matches('.');
    if !(relative.is_empty() || is_dotted(relative)) {
        return None;
    }
    let mut out = Vec::new();
    for part in names.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, alias) = split_alias(part)?;
        if name != "*" && !is_identifier(&name) {
            return None;
        }
        out.push(Import::From {
            module: module.to_string(),
            name,
            alias,
        });
    }
    (!out.is_empty()).then_some(out)
}

/// Names listed by an `__all__ = [...]` assignment, or `None` if `text`
/// is not one.
pub fn parse_all_assignment(text: &str) -> Option<Vec<String>> {
    let rest = text.trim_start().strip_prefix("__all__")?;
    let rest = rest.trim_start();
    let rest = match rest.strip_prefix(':') {
        Some(annotated) => &annotated[annotated.find('=')?..],
        None => rest,
    };
    let rest = rest.strip_prefix('=')?;
    Some(quoted_names(rest))
}

/// Every quoted identifier in `text`, in order.
pub fn quoted_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let q = bytes[i];
        if q == b'"' || q == b'\'' {
            if let Some(len) = text[i + 1..].find(q as char) {
                let candidate = &text[i + 1..i + 1 + len];
                if is_identifier(candidate) {
                    names.push(candidate.to_string());
                }
                i += len + 2;
                continue;
            }
        }
        i += 1;
    }
    names
}

/// Incremental scanner that tracks bracket depth and open string literals
/// while skipping string contents and comments.
#[derive(Debug, Default, Clone)]
pub struct Lexer {
    pub paren: i64,
    pub bracket: i64,
    pub brace: i64,
    state: LexState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum LexState {
    #[default]
    Code,
    Comment,
    Single(u8),
    Triple(u8),
}

impl Lexer {
    pub fn feed(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            match self.state {
                LexState::Comment => {
                    if c == b'\n' {
                        self.state = LexState::Code;
                    }
                }
                LexState::Single(q) => {
                    if c == b'\\' {
                        i += 2;
                        continue;
                    }
                    if c == q || c == b'\n' {
                        self.state = LexState::Code;
                    }
                }
                LexState::Triple(q) => {
                    if c == b'\\' {
                        i += 2;
                        continue;
                    }
                    if c == q && bytes.get(i + 1) == Some(&q) && bytes.get(i + 2) == Some(&q) {
                        self.state = LexState::Code;
                        i += 3;
                        continue;
                    }
                }
                LexState::Code => match c {
                    b'#' => self.state = LexState::Comment,
                    b'"' | b'\'' => {
                        if bytes.get(i + 1) == Some(&c) && bytes.get(i + 2) == Some(&c) {
                            self.state = LexState::Triple(c);
                            i += 3;
                            continue;
                        }
                        self.state = LexState::Single(c);
                    }
                    b'(' => self.paren += 1,
                    b')' => self.paren -= 1,
                    b'[' => self.bracket += 1,
                    b']' => self.bracket -= 1,
                    b'{' => self.brace += 1,
                    b'}' => self.brace -= 1,
                    _ => {}
                },
            }
            i += 1;
        }
    }

    /// Inside a triple-quoted string that has not been closed yet.
    pub fn in_block_string(&self) -> bool {
        matches!(self.state, LexState::Triple(_))
    }

    /// Positive while any bracket is still open.
    pub fn open_depth(&self) -> i64 {
        self.paren.max(0) + self.bracket.max(0) + self.brace.max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Import,
    Class,
    Function,
    Docstring,
    Statement,
}

struct Block {
    kind: BlockKind,
    lines: Vec<String>,
}

fn classify_line(line: &str) -> BlockKind {
    let t = line.trim_start();
    if t.starts_with("import ") || t.starts_with("from ") {
        BlockKind::Import
    } else if t.starts_with("class ") {
        BlockKind::Class
    } else if t.starts_with("def ") || t.starts_with("async def ") {
        BlockKind::Function
    } else {
        BlockKind::Statement
    }
}

/// Approximate declaration boundaries from indentation and keyword
/// prefixes. Works on source that does not parse.
pub fn parse_line_scan(content: &str) -> PyModule {
    let mut blocks: Vec<Block> = Vec::new();
    let mut prefix: Vec<String> = Vec::new();
    let mut blanks: usize = 0;
    let mut lexer = Lexer::default();
    let mut header: Vec<String> = Vec::new();
    let mut seen_code = false;

    for line in content.lines() {
        let continuing = lexer.in_block_string()
            || lexer.open_depth() > 0
            || blocks
                .last()
                .and_then(|b| b.lines.last())
                .map(|l| l.trim_end().ends_with('\\'))
                .unwrap_or(false);

        if continuing {
            if let Some(block) = blocks.last_mut() {
                block.lines.extend(std::iter::repeat(String::new()).take(blanks));
                block.lines.push(line.to_string());
                blanks = 0;
                lexer.feed(line);
                lexer.feed("\n");
                continue;
            }
        }

        if line.trim().is_empty() {
            blanks += 1;
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        if indented && prefix.is_empty() {
            if let Some(block) = blocks.last_mut() {
                if block.kind != BlockKind::Import {
                    block.lines.extend(std::iter::repeat(String::new()).take(blanks));
                    block.lines.push(line.to_string());
                    blanks = 0;
                    lexer.feed(line);
                    lexer.feed("\n");
                    continue;
                }
            }
        }
        blanks = 0;

        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            if seen_code {
                prefix.push(line.to_string());
            } else {
                header.push(line.to_string());
            }
            continue;
        }
        if trimmed.starts_with('@') {
            prefix.push(line.to_string());
            lexer.feed(line);
            lexer.feed("\n");
            continue;
        }

        let mut kind = classify_line(line);
        if !seen_code && (trimmed.starts_with("\"\"\"") || trimmed.starts_with("'''")) {
            kind = BlockKind::Docstring;
        }
        let mut lines = if kind == BlockKind::Import {
            Vec::new()
        } else {
            std::mem::take(&mut prefix)
        };
        prefix.clear();
        lines.push(line.to_string());
        blocks.push(Block { kind, lines });
        seen_code = true;
        lexer.feed(line);
        lexer.feed("\n");
    }

    let mut module = PyModule {
        header,
        ..PyModule::default()
    };
    let mut seen_def = false;
    for block in blocks {
        let text = block.lines.join("\n").trim_end().to_string();
        match block.kind {
            BlockKind::Docstring => module.docstring = Some(text),
            BlockKind::Import => match parse_import(&text) {
                Some(imports) => module.imports.extend(imports),
                None => module.statements.push(text),
            },
            BlockKind::Class | BlockKind::Function => {
                let Some(name) = declared_name(&text) else {
                    module.statements.push(text);
                    continue;
                };
                let decl = Declaration {
                    name,
                    bases: if block.kind == BlockKind::Class {
                        scanned_bases(&text)
                    } else {
                        Vec::new()
                    },
                    text,
                };
                if block.kind == BlockKind::Class {
                    module.classes.push(decl);
                } else {
                    module.functions.push(decl);
                }
                seen_def = true;
            }
            BlockKind::Statement => {
                if let Some(names) = parse_all_assignment(&text) {
                    module.exports = Some(names);
                } else if seen_def {
                    module.trailing.push(text);
                } else {
                    module.statements.push(text);
                }
            }
        }
    }
    if !prefix.is_empty() {
        module.trailing.push(prefix.join("\n"));
    }
    module
}

/// Name from the `class X` / `def x` line of a block.
fn declared_name(text: &str) -> Option<String> {
    let line = text
        .lines()
        .map(str::trim_start)
        .find(|l| l.starts_with("class ") || l.starts_with("def ") || l.starts_with("async def "))?;
    let rest = line
        .strip_prefix("class ")
        .or_else(|| line.strip_prefix("async def "))
        .or_else(|| line.strip_prefix("def "))?;
    let name: String = rest
        .trim_start()
        .chars()
        .take_while(|c| *c == '_' || c.is_alphanumeric())
        .collect();
    (!name.is_empty()).then_some(name)
}

fn scanned_bases(text: &str) -> Vec<String> {
    let Some(line) = text.lines().find(|l| l.trim_start().starts_with("class ")) else {
        return Vec::new();
    };
    let (Some(open), Some(close)) = (line.find('('), line.rfind(')')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }
    line[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty() && !b.contains('='))
        .filter_map(|b| b.rsplit('.').next())
        .map(str::to_string)
        .collect()
}
