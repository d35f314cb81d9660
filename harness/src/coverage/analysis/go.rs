//! Go source analysis.

use std::collections::{BTreeSet, HashMap, HashSet};

use tree_sitter::{Node, Parser};

use super::{build_line_scope, ScopeKind, ScopeSpan, SourceAnalysis};
use crate::coverage::CoverageError;

const EXECUTABLE_NODES: &[&str] = &[
    "short_var_declaration",
    "assignment_statement",
    "return_statement",
    "if_statement",
    "for_statement",
    "switch_statement",
    "type_switch_statement",
    "select_statement",
    "go_statement",
    "defer_statement",
    "expression_statement",
    "send_statement",
    "inc_statement",
    "dec_statement",
    "function_declaration",
    "method_declaration",
    "labeled_statement",
    "fallthrough_statement",
    "break_statement",
    "continue_statement",
    "goto_statement",
];

const SIMPLE_LITERALS: &[&str] = &[
    "int_literal",
    "float_literal",
    "rune_literal",
    "raw_string_literal",
    "interpreted_string_literal",
    "true",
    "false",
    "nil",
    "identifier",
    "iota",
];

pub fn analyze(src: &str, modified_lines: &BTreeSet<usize>) -> Result<SourceAnalysis, CoverageError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_go::LANGUAGE.into())
        .map_err(|e| CoverageError::TreeSitter(e.to_string()))?;
    let tree = parser
        .parse(src, None)
        .ok_or_else(|| CoverageError::TreeSitter("go parse failed".to_string()))?;

    let bytes = src.as_bytes();
    let root = tree.root_node();

    let mut analysis = SourceAnalysis {
        modified_lines: modified_lines.clone(),
        ..Default::default()
    };

    collect_executable(root, &mut analysis);

    let mut spans = Vec::new();
    collect_scopes(root, bytes, &mut spans);
    analysis.line_to_scope = build_line_scope(src.lines().count(), spans);

    collect_def_use(root, bytes, false, &mut analysis.defs, &mut analysis.uses);
    collect_ignorable_globals(root, &mut analysis.ignorable_global_lines);

    Ok(analysis)
}

fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

fn end_line_of(node: Node) -> usize {
    node.end_position().row + 1
}

fn collect_executable(node: Node, analysis: &mut SourceAnalysis) {
    if EXECUTABLE_NODES.contains(&node.kind()) {
        analysis.executable_lines.insert(line_of(node));
    }

    if node.kind() == "function_declaration" || node.kind() == "method_declaration" {
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

    if node.kind() == "call_expression" {
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
        collect_executable(child, analysis);
    }
}

/// Extract a method receiver's type name, keeping the pointer sigil.
fn receiver_type(param_list: Node, src: &[u8]) -> String {
    let mut cursor = param_list.walk();
    for child in param_list.children(&mut cursor) {
        if child.kind() != "parameter_declaration" {
            continue;
        }
        let mut inner = child.walk();
        for sub in child.children(&mut inner) {
            match sub.kind() {
                "pointer_type" => {
                    let mut ptr_cursor = sub.walk();
                    for ptr_child in sub.children(&mut ptr_cursor) {
                        if ptr_child.kind() == "type_identifier" {
                            if let Ok(name) = ptr_child.utf8_text(src) {
                                return format!("*{name}");
                            }
                        }
                    }
                }
                "type_identifier" => {
                    if let Ok(name) = sub.utf8_text(src) {
                        return name.to_string();
                    }
                }
                _ => {}
            }
        }
    }
    String::new()
}

fn collect_scopes(node: Node, src: &[u8], spans: &mut Vec<ScopeSpan>) {
    match node.kind() {
        "function_declaration" => {
            let mut cursor = node.walk();
            let name = node
                .children(&mut cursor)
                .find(|c| c.kind() == "identifier")
                .and_then(|c| c.utf8_text(src).ok())
                .unwrap_or("<anonymous>");
            spans.push(ScopeSpan {
                kind: ScopeKind::Function,
                qualified: format!("global.{name}"),
                start_line: line_of(node),
                end_line: end_line_of(node),
            });
        }
        "method_declaration" => {
            let mut cursor = node.walk();
            let mut method_name = "<anonymous>".to_string();
            let mut receiver = String::new();
            for child in node.children(&mut cursor) {
                match child.kind() {
                    "field_identifier" | "identifier" => {
                        if let Ok(name) = child.utf8_text(src) {
                            method_name = name.to_string();
                        }
                    }
                    "parameter_list" if receiver.is_empty() => {
                        receiver = receiver_type(child, src);
                    }
                    _ => {}
                }
            }
            let qualified = if receiver.is_empty() {
                method_name
            } else {
                format!("{receiver}.{method_name}")
            };
            spans.push(ScopeSpan {
                kind: ScopeKind::Method,
                qualified,
                start_line: line_of(node),
                end_line: end_line_of(node),
            });
        }
        "func_literal" => {
            spans.push(ScopeSpan {
                kind: ScopeKind::Function,
                qualified: "global.<anonymous>".to_string(),
                start_line: line_of(node),
                end_line: end_line_of(node),
            });
        }
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_scopes(child, src, spans);
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
                if name == "_" {
                    return;
                }
                if is_lvalue {
                    record(defs, line_of(node), name);
                } else {
                    record(uses, line_of(node), name);
                }
            }
            return;
        }
        "short_var_declaration" | "assignment_statement" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_def_use(left, src, true, defs, uses);
            }
            if let Some(right) = node.child_by_field_name("right") {
                collect_def_use(right, src, false, defs, uses);
            }
            return;
        }
        "for_statement" => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "range_clause" {
                    if let Some(left) = child.child_by_field_name("left") {
                        collect_def_use(left, src, true, defs, uses);
                    }
                    if let Some(right) = child.child_by_field_name("right") {
                        collect_def_use(right, src, false, defs, uses);
                    }
                }
            }
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "block" {
                    collect_def_use(child, src, false, defs, uses);
                }
            }
            return;
        }
        "var_declaration" | "const_declaration" => {
            let spec_kind = if node.kind() == "var_declaration" {
                "var_spec"
            } else {
                "const_spec"
            };
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() != spec_kind {
                    continue;
                }
                let mut inner = child.walk();
                for sub in child.children(&mut inner) {
                    match sub.kind() {
                        "identifier" => {
                            if let Ok(name) = sub.utf8_text(src) {
                                record(defs, line_of(sub), name);
                            }
                        }
                        "expression_list" => collect_def_use(sub, src, false, defs, uses),
                        _ => {}
                    }
                }
            }
            return;
        }
        // Parameters stay out of defs for cross-language parity.
        "parameter_list" => return,
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_def_use(child, src, is_lvalue, defs, uses);
    }
}

fn collect_ignorable_globals(root: Node, ignorable: &mut HashSet<usize>) {
    let mut cursor = root.walk();
    for stmt in root.children(&mut cursor) {
        if is_ignorable_global(stmt) {
            for line in line_of(stmt)..=end_line_of(stmt) {
                ignorable.insert(line);
            }
        }
    }
}

fn is_ignorable_global(node: Node) -> bool {
    match node.kind() {
        "package_clause" | "import_declaration" | "comment" | "type_declaration" => true,
        "const_declaration" | "var_declaration" => {
            let spec_kind = if node.kind() == "var_declaration" {
                "var_spec"
            } else {
                "const_spec"
            };
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() != spec_kind {
                    continue;
                }
                let mut inner = child.walk();
                for sub in child.children(&mut inner) {
                    if sub.kind() != "expression_list" {
                        continue;
                    }
                    let mut exprs = sub.walk();
                    for expr in sub.children(&mut exprs) {
                        if expr.kind() == "," {
                            continue;
                        }
                        let simple = SIMPLE_LITERALS.contains(&expr.kind())
                            || (node.kind() == "var_declaration"
                                && expr.kind() == "composite_literal");
                        if !simple {
                            return false;
                        }
                    }
                }
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = r#"package srv

import "fmt"

const limit = 10

type Server struct {
	addr string
}

func (s *Server) Handle(
	req string,
) string {
	prefix := s.addr
	out := prefix + req
	return out
}

func main() {
	srv := Server{addr: "x"}
	fmt.Println(srv.Handle(
		"y",
	))
}
"#;

    fn analyze_all(modified: &[usize]) -> SourceAnalysis {
        analyze(SRC, &modified.iter().copied().collect()).unwrap()
    }

    #[test]
    fn test_executable_lines() {
        let analysis = analyze_all(&[]);
        assert!(analysis.executable_lines.contains(&11)); // method decl
        assert!(analysis.executable_lines.contains(&14)); // prefix := ...
        assert!(analysis.executable_lines.contains(&16)); // return
        assert!(!analysis.executable_lines.contains(&7)); // type decl
    }

    #[test]
    fn test_method_signature_collapse() {
        let analysis = analyze_all(&[11, 12, 13, 14]);
        assert_eq!(analysis.modified_lines, [14].into_iter().collect());
    }

    #[test]
    fn test_receiver_qualified_scope() {
        let analysis = analyze_all(&[]);
        assert_eq!(
            analysis.line_to_scope[&14],
            (ScopeKind::Method, "*Server.Handle".to_string())
        );
        assert_eq!(
            analysis.line_to_scope[&20],
            (ScopeKind::Function, "global.main".to_string())
        );
    }

    #[test]
    fn test_def_use_short_var() {
        let analysis = analyze_all(&[]);
        assert!(analysis.defs[&14].contains("prefix"));
        assert!(analysis.uses[&14].contains("s"));
        assert!(analysis.defs[&15].contains("out"));
        assert!(analysis.uses[&15].contains("prefix"));
        assert!(analysis.uses[&16].contains("out"));
    }

    #[test]
    fn test_multiline_call_collapse() {
        let analysis = analyze_all(&[22]);
        assert_eq!(analysis.modified_lines, [21].into_iter().collect());
    }

    #[test]
    fn test_ignorable_globals() {
        let analysis = analyze_all(&[]);
        assert!(analysis.ignorable_global_lines.contains(&1)); // package
        assert!(analysis.ignorable_global_lines.contains(&3)); // import
        assert!(analysis.ignorable_global_lines.contains(&5)); // const
        assert!(analysis.ignorable_global_lines.contains(&7)); // type decl
        assert!(!analysis.ignorable_global_lines.contains(&14));
    }

    #[test]
    fn test_blank_identifier_skipped() {
        let src = "package x\n\nfunc f() {\n\t_, err := g()\n\tprint(err)\n}\n";
        let analysis = analyze(src, &BTreeSet::new()).unwrap();
        assert!(analysis.defs[&4].contains("err"));
        assert!(!analysis.defs[&4].contains("_"));
    }
}
