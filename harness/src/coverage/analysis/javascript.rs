//! JavaScript source analysis. The walker is shared with TypeScript, which
//! layers extra node kinds on top.

use std::collections::{BTreeSet, HashMap, HashSet};

use tree_sitter::{Language as TsLanguage, Node, Parser};

use super::{build_line_scope, ScopeKind, ScopeSpan, SourceAnalysis};
use crate::coverage::CoverageError;

pub(super) const JS_EXECUTABLE_NODES: &[&str] = &[
    "variable_declaration",
    "lexical_declaration",
    "expression_statement",
    "return_statement",
    "throw_statement",
    "break_statement",
    "continue_statement",
    "if_statement",
    "for_statement",
    "for_in_statement",
    "for_of_statement",
    "while_statement",
    "do_statement",
    "try_statement",
    "switch_statement",
    "with_statement",
    "labeled_statement",
    "function_declaration",
    "class_declaration",
    "import_statement",
    "export_statement",
    "debugger_statement",
];

const SIMPLE_LITERALS: &[&str] = &[
    "string",
    "number",
    "true",
    "false",
    "null",
    "undefined",
    "identifier",
    "array",
    "object",
];

/// Dialect knobs layered on the shared JS walker.
pub(super) struct Dialect {
    pub grammar: TsLanguage,
    pub extra_executable: &'static [&'static str],
    pub type_only_nodes: &'static [&'static str],
}

pub fn analyze(src: &str, modified_lines: &BTreeSet<usize>) -> Result<SourceAnalysis, CoverageError> {
    analyze_dialect(
        src,
        modified_lines,
        &Dialect {
            grammar: tree_sitter_javascript::LANGUAGE.into(),
            extra_executable: &[],
            type_only_nodes: &[],
        },
    )
}

pub(super) fn analyze_dialect(
    src: &str,
    modified_lines: &BTreeSet<usize>,
    dialect: &Dialect,
) -> Result<SourceAnalysis, CoverageError> {
    let mut parser = Parser::new();
    parser
        .set_language(&dialect.grammar)
        .map_err(|e| CoverageError::TreeSitter(e.to_string()))?;
    let tree = parser
        .parse(src, None)
        .ok_or_else(|| CoverageError::TreeSitter("javascript parse failed".to_string()))?;

    let bytes = src.as_bytes();
    let root = tree.root_node();

    let mut analysis = SourceAnalysis {
        modified_lines: modified_lines.clone(),
        ..Default::default()
    };

    collect_executable(root, dialect, &mut analysis);

    let mut spans = Vec::new();
    collect_scopes(root, bytes, None, &mut spans);
    analysis.line_to_scope = build_line_scope(src.lines().count(), spans);

    collect_def_use(root, bytes, false, &mut analysis.defs, &mut analysis.uses);
    collect_ignorable_globals(root, dialect, &mut analysis.ignorable_global_lines);

    Ok(analysis)
}

fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

fn end_line_of(node: Node) -> usize {
    node.end_position().row + 1
}

fn collect_executable(node: Node, dialect: &Dialect, analysis: &mut SourceAnalysis) {
    let kind = node.kind();
    if JS_EXECUTABLE_NODES.contains(&kind) || dialect.extra_executable.contains(&kind) {
        analysis.executable_lines.insert(line_of(node));
    }

    // Multi-line signatures: drop modified lines between the function header
    // and the first body statement.
    let has_signature = matches!(
        kind,
        "function_declaration" | "function_expression" | "arrow_function" | "method_definition"
    );
    if has_signature {
        let func_start = line_of(node);
        let body = {
            let mut cursor = node.walk();
            let found = node
                .children(&mut cursor)
                .find(|c| c.kind() == "statement_block");
            found
        };
        if let Some(body) = body {
            let first_stmt = {
                let mut cursor = body.walk();
                let found = body
                    .children(&mut cursor)
                    .find(|c| !matches!(c.kind(), "{" | "}" | "comment"));
                found
            };
            let sig_end = match first_stmt {
                Some(stmt) => line_of(stmt).saturating_sub(1),
                None => body.start_position().row,
            };
            analysis
                .modified_lines
                .retain(|m| !(func_start <= *m && *m <= sig_end));
        }
    }

    if kind == "call_expression" {
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
        collect_executable(child, dialect, analysis);
    }
}

fn identifier_child(node: Node, src: &[u8], kinds: &[&str]) -> Option<String> {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .find(|c| kinds.contains(&c.kind()))
        .and_then(|c| c.utf8_text(src).ok().map(str::to_string));
    found
}

fn collect_scopes(node: Node, src: &[u8], parent_class: Option<&str>, spans: &mut Vec<ScopeSpan>) {
    let scope = match node.kind() {
        "function_declaration" | "function_expression" => Some((
            ScopeKind::Function,
            identifier_child(node, src, &["identifier"]),
        )),
        "arrow_function" => {
            // Arrow functions borrow their name from an enclosing declarator.
            let name = node.parent().and_then(|p| {
                if p.kind() == "variable_declarator" {
                    p.child_by_field_name("name")
                        .and_then(|n| n.utf8_text(src).ok().map(str::to_string))
                } else {
                    None
                }
            });
            Some((ScopeKind::Function, name))
        }
        "method_definition" => Some((
            ScopeKind::Method,
            identifier_child(node, src, &["property_identifier"]),
        )),
        "class_declaration" | "class_expression" => Some((
            ScopeKind::Class,
            identifier_child(node, src, &["identifier", "type_identifier"]),
        )),
        "interface_declaration" => Some((
            ScopeKind::Interface,
            identifier_child(node, src, &["type_identifier", "identifier"]),
        )),
        "internal_module" => Some((
            ScopeKind::Function,
            identifier_child(node, src, &["identifier", "nested_identifier"]),
        )),
        _ => None,
    };

    if let Some((kind, name)) = scope {
        let name = name.unwrap_or_else(|| "<anonymous>".to_string());
        let qualified = match kind {
            ScopeKind::Method => match parent_class {
                Some(class) => format!("{class}.{name}"),
                None => name.clone(),
            },
            ScopeKind::Function => format!("global.{name}"),
            _ => name.clone(),
        };
        spans.push(ScopeSpan {
            kind,
            qualified,
            start_line: line_of(node),
            end_line: end_line_of(node),
        });

        let class_name = if kind == ScopeKind::Class {
            Some(name)
        } else {
            None
        };
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect_scopes(
                child,
                src,
                class_name.as_deref().or(parent_class),
                spans,
            );
        }
        return;
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_scopes(child, src, parent_class, spans);
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
        "shorthand_property_identifier_pattern" => {
            if let Ok(name) = node.utf8_text(src) {
                record(defs, line_of(node), name);
            }
            return;
        }
        "variable_declarator" => {
            if let Some(name) = node.child_by_field_name("name") {
                collect_def_use(name, src, true, defs, uses);
            }
            if let Some(value) = node.child_by_field_name("value") {
                collect_def_use(value, src, false, defs, uses);
            }
            return;
        }
        "assignment_expression" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_def_use(left, src, true, defs, uses);
            }
            if let Some(right) = node.child_by_field_name("right") {
                collect_def_use(right, src, false, defs, uses);
            }
            return;
        }
        "augmented_assignment_expression" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_def_use(left, src, true, defs, uses);
                collect_def_use(left, src, false, defs, uses);
            }
            if let Some(right) = node.child_by_field_name("right") {
                collect_def_use(right, src, false, defs, uses);
            }
            return;
        }
        "update_expression" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "identifier" {
                    if let Ok(name) = child.utf8_text(src) {
                        record(defs, line_of(child), name);
                        record(uses, line_of(child), name);
                    }
                }
            }
            return;
        }
        // Parameters stay out of defs for cross-language parity.
        "formal_parameters" => return,
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_def_use(child, src, is_lvalue, defs, uses);
    }
}

fn collect_ignorable_globals(root: Node, dialect: &Dialect, ignorable: &mut HashSet<usize>) {
    let mut cursor = root.walk();
    for stmt in root.children(&mut cursor) {
        if is_ignorable_global(stmt, dialect) {
            for line in line_of(stmt)..=end_line_of(stmt) {
                ignorable.insert(line);
            }
        }
    }
}

fn is_ignorable_global(node: Node, dialect: &Dialect) -> bool {
    let kind = node.kind();
    if kind == "import_statement" || kind == "comment" {
        return true;
    }
    if dialect.type_only_nodes.contains(&kind) {
        return true;
    }

    // Re-exports (`export { x } from 'y'`) have no local runtime effect.
    if kind == "export_statement" {
        let mut cursor = node.walk();
        return node.children(&mut cursor).any(|c| c.kind() == "string");
    }

    // Simple declarations whose initialisers are all literals.
    if kind == "variable_declaration" || kind == "lexical_declaration" {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            if child.kind() != "variable_declarator" {
                continue;
            }
            if let Some(value) = child.child_by_field_name("value") {
                if !SIMPLE_LITERALS.contains(&value.kind()) {
                    return false;
                }
            }
        }
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"import { join } from 'path';

const LIMIT = 10;

class Store {
  put(
    key,
    value
  ) {
    const entry = { key, value };
    this.data = entry;
    return entry;
  }
}

const load = (name) => {
  let count = 0;
  count += 1;
  return join(
    name,
    String(count)
  );
};
"#;

    fn analyze_all(modified: &[usize]) -> SourceAnalysis {
        analyze(SRC, &modified.iter().copied().collect()).unwrap()
    }

    #[test]
    fn test_executable_lines() {
        let analysis = analyze_all(&[]);
        assert!(analysis.executable_lines.contains(&1)); // import
        assert!(analysis.executable_lines.contains(&3)); // const LIMIT
        assert!(analysis.executable_lines.contains(&10)); // const entry
        assert!(analysis.executable_lines.contains(&12)); // return
    }

    #[test]
    fn test_method_signature_collapse() {
        let analysis = analyze_all(&[6, 7, 8, 9, 10]);
        assert_eq!(analysis.modified_lines, [10].into_iter().collect());
    }

    #[test]
    fn test_scopes() {
        let analysis = analyze_all(&[]);
        assert_eq!(
            analysis.line_to_scope[&10],
            (ScopeKind::Method, "Store.put".to_string())
        );
        assert_eq!(
            analysis.line_to_scope[&17],
            (ScopeKind::Function, "global.load".to_string())
        );
        assert_eq!(analysis.line_to_scope[&3].0, ScopeKind::Global);
    }

    #[test]
    fn test_def_use() {
        let analysis = analyze_all(&[]);
        assert!(analysis.defs[&10].contains("entry"));
        assert!(analysis.defs[&17].contains("count"));
        // Augmented assignment is both def and use.
        assert!(analysis.defs[&18].contains("count"));
        assert!(analysis.uses[&18].contains("count"));
        assert!(analysis.uses[&12].contains("entry"));
    }

    #[test]
    fn test_multiline_call_collapse() {
        let analysis = analyze_all(&[20, 21]);
        assert_eq!(analysis.modified_lines, [19].into_iter().collect());
    }

    #[test]
    fn test_ignorable_globals() {
        let analysis = analyze_all(&[]);
        assert!(analysis.ignorable_global_lines.contains(&1)); // import
        assert!(analysis.ignorable_global_lines.contains(&3)); // const LIMIT = 10
        assert!(!analysis.ignorable_global_lines.contains(&16)); // arrow fn decl
    }

    #[test]
    fn test_reexport_is_ignorable() {
        let src = "export { a } from './a';\nexport const b = compute();\n";
        let analysis = analyze(src, &BTreeSet::new()).unwrap();
        assert!(analysis.ignorable_global_lines.contains(&1));
        assert!(!analysis.ignorable_global_lines.contains(&2));
    }
}
