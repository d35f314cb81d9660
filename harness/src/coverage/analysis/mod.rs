//! Tree-sitter source analysis per language.
//!
//! Each analyzer parses one post-patch source file and produces the line
//! facts the must-cover engine works with: executable lines, corrected
//! modified lines, scope mapping, and per-line def/use sets. Formal
//! parameters are deliberately excluded from `defs` so all four languages
//! behave alike under slicing.

mod go;
mod javascript;
mod python;
mod typescript;

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::benchmark::Language;

use super::CoverageError;

/// Scope classification of a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Global,
    Function,
    Class,
    Method,
    Interface,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::Function => "function",
            ScopeKind::Class => "class",
            ScopeKind::Method => "method",
            ScopeKind::Interface => "interface",
        }
    }
}

/// Analysis result for one source file.
#[derive(Debug, Default, Clone)]
pub struct SourceAnalysis {
    /// Lines that carry runtime semantics.
    pub executable_lines: BTreeSet<usize>,
    /// Patch-added lines, corrected for multi-line signatures and calls.
    pub modified_lines: BTreeSet<usize>,
    /// Line → (scope kind, qualified scope name); inner scopes shadow outer.
    pub line_to_scope: HashMap<usize, (ScopeKind, String)>,
    /// Line → variables assigned on that line.
    pub defs: HashMap<usize, HashSet<String>>,
    /// Line → variables read on that line.
    pub uses: HashMap<usize, HashSet<String>>,
    /// Global-scope lines whose top-level statement is ignorable for seeding
    /// (imports, constant assignments, docstrings, type-only declarations).
    pub ignorable_global_lines: HashSet<usize>,
}

impl SourceAnalysis {
    /// Modified lines that survive seed filtering: everything in a non-global
    /// scope, plus global lines with semantic significance.
    pub fn filtered_seeds(&self) -> BTreeSet<usize> {
        self.modified_lines
            .iter()
            .filter(|line| {
                let global = self
                    .line_to_scope
                    .get(line)
                    .map(|(kind, _)| *kind == ScopeKind::Global)
                    .unwrap_or(true);
                !global || !self.ignorable_global_lines.contains(line)
            })
            .copied()
            .collect()
    }
}

/// Analyze a source file in the given language. `modified_lines` are the
/// patch-added line numbers (1-indexed, post-apply). `tsx` selects the TSX
/// grammar for `.tsx` files.
pub fn analyze_source(
    language: Language,
    src: &str,
    modified_lines: &BTreeSet<usize>,
    tsx: bool,
) -> Result<SourceAnalysis, CoverageError> {
    match language {
        Language::Python => python::analyze(src, modified_lines),
        Language::Go => go::analyze(src, modified_lines),
        Language::Javascript => javascript::analyze(src, modified_lines),
        Language::Typescript => typescript::analyze(src, modified_lines, tsx),
    }
}

/// Shared scope bookkeeping used by the per-language walkers.
#[derive(Debug, Clone)]
pub(crate) struct ScopeSpan {
    pub kind: ScopeKind,
    pub qualified: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// Assign every line its innermost scope: spans sorted smallest-first, the
/// first covering span wins, and function-like scopes take priority by being
/// checked in that order.
pub(crate) fn build_line_scope(
    total_lines: usize,
    mut spans: Vec<ScopeSpan>,
) -> HashMap<usize, (ScopeKind, String)> {
    spans.sort_by_key(|s| (s.end_line - s.start_line, s.start_line));

    let mut line_to_scope = HashMap::with_capacity(total_lines);
    for line in 1..=total_lines {
        let mut assigned = (ScopeKind::Global, "__global__".to_string());
        for span in &spans {
            if span.start_line <= line && line <= span.end_line {
                assigned = (span.kind, span.qualified.clone());
                if matches!(span.kind, ScopeKind::Function | ScopeKind::Method) {
                    break;
                }
            }
        }
        line_to_scope.insert(line, assigned);
    }
    line_to_scope
}
