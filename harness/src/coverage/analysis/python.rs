//! Python source analysis.

use std::collections::{BTreeSet, HashMap, HashSet};

use tree_sitter::{Node, Parser};

use super::{build_line_scope, ScopeKind, ScopeSpan, SourceAnalysis};
use crate::coverage::CoverageError;

const EXECUTABLE_NODES: &[&str] = &[
    "assignment",
    "augmented_assignment",
    "expression_statement",
    "return_statement",
    "raise_statement",
    "assert_statement",
    "pass_statement",
    "break_statement",
    "continue_statement",
    "if_statement",
    "for_statement",
    "while_statement",
    "try_statement",
    "with_statement",
    "match_statement",
    "function_definition",
    "async_function_definition",
    "class_definition",
    "import_statement",
    "import_from_statement",
    "global_statement",
    "nonlocal_statement",
    "delete_statement",
];

pub fn analyze(src: &str, modified_lines: &BTreeSet<usize>) -> Result<SourceAnalysis, CoverageError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| CoverageError::TreeSitter(e.to_string()))?;
    let tree = parser
        .parse(src, None)
        .ok_or_else(|| CoverageError::TreeSitter("python parse failed".to_string()))?;

    let bytes = src.as_bytes();
    let root = tree.root_node();

    let mut analysis = SourceAnalysis {
        modified_lines: modified_lines.clone(),
        ..Default::default()
    };

    collect_executable(root, bytes, &mut analysis);

    let mut spans = Vec::new();
    collect_scopes(root, bytes, None, &mut spans);
    analysis.line_to_scope = build_line_scope(src.lines().count(), spans);

    collect_def_use(root, bytes, false, &mut analysis.defs, &mut analysis.uses);
    collect_ignorable_globals(root, bytes, &mut analysis.ignorable_global_lines);

    Ok(analysis)
}

fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

fn end_line_of(node: Node) -> usize {
    node.end_position().row + 1
}

/// Whether an expression statement is a docstring: a string that is the first
/// non-comment statement of its module or block.
fn is_docstring(node: Node) -> bool {
    let first_child_is_string = node
        .child(0)
        .map(|c| c.kind() == "string")
        .unwrap_or(false);
    if !first_child_is_string {
        return false;
    }
    let Some(parent) = node.parent() else {
        return false;
    };
    if parent.kind() != "block" && parent.kind() != "module" {
        return false;
    }
    let mut cursor = parent.walk();
    for sibling in parent.named_children(&mut cursor) {
        if sibling.kind() == "comment" {
            continue;
        }
        return sibling.id() == node.id();
    }
    false
}

fn collect_executable(node: Node, src: &[u8], analysis: &mut SourceAnalysis) {
    if EXECUTABLE_NODES.contains(&node.kind()) {
        let skip = node.kind() == "expression_statement" && is_docstring(node);
        if !skip {
            analysis.executable_lines.insert(line_of(node));
        }
    }

    // Multi-line signatures never execute: modified lines between the `def`
    // and the first body statement are dropped.
    if node.kind() == "function_definition" || node.kind() == "async_function_definition" {
        let func_start = line_of(node);
        let body = {
            let mut cursor = node.walk();
            let found = node.children(&mut cursor).find(|c| c.kind() == "block");
            found
        };
        if let Some(body) = body {
            let first_stmt = {
                let mut cursor = body.walk();
                let found = body
                    .children(&mut cursor)
                    .find(|c| c.kind() != ":" && c.kind() != "comment");
                found
            };
            let sig_end = match first_stmt {
                Some(stmt) => line_of(stmt).saturating_sub(1),
                None => end_line_of(node),
            };
            analysis
                .modified_lines
                .retain(|m| !(func_start <= *m && *m <= sig_end));
        }
    }

    // Only a multi-line call's first line executes.
    if node.kind() == "call" {
        let call_start = line_of(node);
        let call_end = end_line_of(node);
        let collapsed: Vec<usize> = analysis
            .modified_lines
            .iter()
            .filter(|m| call_start <= **m && **m <= call_end)
            .copied()
            .collect();
        if !collapsed.is_empty() {
            for m in collapsed {
                analysis.modified_lines.remove(&m);
            }
            analysis.modified_lines.insert(call_start);
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_executable(child, src, analysis);
    }
}

fn node_name(node: Node, src: &[u8]) -> String {
    let mut cursor = node.walk();
    let name = node
        .children(&mut cursor)
        .find(|c| c.kind() == "identifier")
        .and_then(|c| c.utf8_text(src).ok())
        .unwrap_or("<anonymous>")
        .to_string();
    name
}

#[derive(Clone, Copy, PartialEq)]
enum Enclosing {
    Class,
    Other,
}

fn collect_scopes(node: Node, src: &[u8], parent: Option<(Enclosing, &str)>, spans: &mut Vec<ScopeSpan>) {
    let scope = match node.kind() {
        "function_definition" | "async_function_definition" => Some(ScopeKind::Function),
        "class_definition" => Some(ScopeKind::Class),
        _ => None,
    };

    if let Some(kind) = scope {
        let name = node_name(node, src);
        let qualified = match kind {
            ScopeKind::Function => match parent {
                Some((Enclosing::Class, class_name)) => format!("{class_name}.{name}"),
                _ => format!("global.{name}"),
            },
            _ => name.clone(),
        };
        spans.push(ScopeSpan {
            kind,
            qualified,
            start_line: line_of(node),
            end_line: end_line_of(node),
        });

        let enclosing = if kind == ScopeKind::Class {
            Enclosing::Class
        } else {
            Enclosing::Other
        };
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect_scopes(child, src, Some((enclosing, name.as_str())), spans);
        }
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_scopes(child, src, parent, spans);
    }
}

fn record(map: &mut HashMap<usize, HashSet<String>>, line: usize, name: &str) {
    map.entry(line).or_default().insert(name.to_string());
}

fn collect_def_use(
    node: Node,
    src: &[u8],
    is_lvalue: bool,
    defs: &mut HashMap<usize, HashSet<String>>,
    uses: &mut HashMap<usize, HashSet<String>>,
) {
    match node.kind() {
        "identifier" => {
            if let Ok(name) = node.utf8_text(src) {
                if is_lvalue {
                    record(defs, line_of(node), name);
                } else {
                    record(uses, line_of(node), name);
                }
            }
            return;
        }
        "assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_def_use(left, src, true, defs, uses);
            }
            if let Some(right) = node.child_by_field_name("right") {
                collect_def_use(right, src, false, defs, uses);
            }
            return;
        }
        "augmented_assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_def_use(left, src, true, defs, uses);
                collect_def_use(left, src, false, defs, uses);
            }
            if let Some(right) = node.child_by_field_name("right") {
                collect_def_use(right, src, false, defs, uses);
            }
            return;
        }
        "for_statement" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_def_use(left, src, true, defs, uses);
            }
            if let Some(right) = node.child_by_field_name("right") {
                collect_def_use(right, src, false, defs, uses);
            }
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "block" {
                    collect_def_use(child, src, false, defs, uses);
                }
            }
            return;
        }
        // Parameters stay out of defs for cross-language parity.
        "parameters" => return,
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                collect_def_use(name, src, true, defs, uses);
            }
            if let Some(value) = node.child_by_field_name("value") {
                collect_def_use(value, src, false, defs, uses);
            }
            return;
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_def_use(child, src, is_lvalue, defs, uses);
    }
}

/// Mark lines of ignorable module-level statements: imports, simple constant
/// assignments, and docstrings.
fn collect_ignorable_globals(root: Node, src: &[u8], ignorable: &mut HashSet<usize>) {
    let mut cursor = root.walk();
    for stmt in root.children(&mut cursor) {
        if is_ignorable_global(stmt, src) {
            for line in line_of(stmt)..=end_line_of(stmt) {
                ignorable.insert(line);
            }
        }
    }
}

fn is_ignorable_global(node: Node, _src: &[u8]) -> bool {
    match node.kind() {
        "import_statement" | "import_from_statement" | "comment" => true,
        "expression_statement" => {
            match node.child(0) {
                // Docstrings never execute meaningfully.
                Some(child) if child.kind() == "string" => true,
                // A bare assignment statement wraps the assignment node.
                Some(child) if child.kind() == "assignment" => is_simple_assignment(child),
                _ => false,
            }
        }
        _ => false,
    }
}

fn is_simple_assignment(node: Node) -> bool {
    let left_is_identifier = node
        .child_by_field_name("left")
        .map(|l| l.kind() == "identifier")
        .unwrap_or(false);
    let right_is_literal = node
        .child_by_field_name("right")
        .map(|r| {
            matches!(
                r.kind(),
                "string"
                    | "integer"
                    | "float"
                    | "true"
                    | "false"
                    | "none"
                    | "identifier"
                    | "attribute"
                    | "list"
                    | "dictionary"
                    | "tuple"
                    | "set"
            )
        })
        .unwrap_or(false);
    left_is_identifier && right_is_literal
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#""""Module docstring."""
import os

LIMIT = 10

class Calc:
    def add(self,
            a,
            b):
        total = a + b
        return total

def main():
    calc = Calc()
    result = calc.add(
        1,
        2,
    )
    print(result)
"#;

    fn analyze_all(modified: &[usize]) -> SourceAnalysis {
        analyze(SRC, &modified.iter().copied().collect()).unwrap()
    }

    #[test]
    fn test_executable_lines_skip_docstring() {
        let analysis = analyze_all(&[]);
        assert!(!analysis.executable_lines.contains(&1));
        assert!(analysis.executable_lines.contains(&2)); // import
        assert!(analysis.executable_lines.contains(&4)); // LIMIT = 10
        assert!(analysis.executable_lines.contains(&10)); // total = a + b
    }

    #[test]
    fn test_signature_lines_dropped() {
        // Lines 7-9 span the add() signature; they collapse away entirely.
        let analysis = analyze_all(&[7, 8, 9, 10]);
        assert_eq!(analysis.modified_lines, [10].into_iter().collect());
    }

    #[test]
    fn test_multiline_call_collapses_to_start() {
        let analysis = analyze_all(&[16, 17]);
        assert_eq!(analysis.modified_lines, [15].into_iter().collect());
    }

    #[test]
    fn test_scope_qualification() {
        let analysis = analyze_all(&[]);
        assert_eq!(
            analysis.line_to_scope[&10],
            (ScopeKind::Function, "Calc.add".to_string())
        );
        assert_eq!(
            analysis.line_to_scope[&14],
            (ScopeKind::Function, "global.main".to_string())
        );
        assert_eq!(analysis.line_to_scope[&4].0, ScopeKind::Global);
    }

    #[test]
    fn test_def_use() {
        let analysis = analyze_all(&[]);
        assert!(analysis.defs[&10].contains("total"));
        assert!(analysis.uses[&10].contains("a"));
        assert!(analysis.uses[&11].contains("total"));
        // Parameters are not definitions.
        assert!(!analysis.defs.contains_key(&8));
    }

    #[test]
    fn test_ignorable_globals() {
        let analysis = analyze_all(&[]);
        assert!(analysis.ignorable_global_lines.contains(&1)); // docstring
        assert!(analysis.ignorable_global_lines.contains(&2)); // import
        assert!(analysis.ignorable_global_lines.contains(&4)); // LIMIT = 10
    }

    #[test]
    fn test_filtered_seeds_drop_import_keep_body() {
        let analysis = analyze_all(&[2, 10]);
        assert_eq!(analysis.filtered_seeds(), [10].into_iter().collect());
    }
}
