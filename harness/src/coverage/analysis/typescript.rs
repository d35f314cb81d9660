//! TypeScript source analysis: the JavaScript walker plus type-level nodes.

use std::collections::BTreeSet;

use super::javascript::{analyze_dialect, Dialect};
use super::SourceAnalysis;
use crate::coverage::CoverageError;

/// TypeScript-only executable node kinds layered on the JS set.
const TS_EXTRA_EXECUTABLE: &[&str] = &[
    "type_alias_declaration",
    "interface_declaration",
    "enum_declaration",
    "ambient_declaration",
    "internal_module",
    "module",
];

/// Declarations with no runtime effect; never seed a slice from them.
const TS_TYPE_ONLY_NODES: &[&str] = &[
    "type_alias_declaration",
    "interface_declaration",
    "ambient_declaration",
];

pub fn analyze(
    src: &str,
    modified_lines: &BTreeSet<usize>,
    tsx: bool,
) -> Result<SourceAnalysis, CoverageError> {
    let grammar = if tsx {
        tree_sitter_typescript::LANGUAGE_TSX.into()
    } else {
        tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
    };
    analyze_dialect(
        src,
        modified_lines,
        &Dialect {
            grammar,
            extra_executable: TS_EXTRA_EXECUTABLE,
            type_only_nodes: TS_TYPE_ONLY_NODES,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::analysis::ScopeKind;

    const SRC: &str = r#"import { api } from './api';

type Options = { retries: number };

interface Client {
  fetch(path: string): Promise<string>;
}

export class HttpClient {
  async fetch(path: string): Promise<string> {
    const url = api.base + path;
    return api.get(url);
  }
}
"#;

    fn analyze_all(modified: &[usize]) -> SourceAnalysis {
        analyze(SRC, &modified.iter().copied().collect(), false).unwrap()
    }

    #[test]
    fn test_type_alias_seed_is_filtered() {
        let analysis = analyze_all(&[3, 11]);
        assert!(analysis.executable_lines.contains(&3)); // type alias
        assert!(analysis.executable_lines.contains(&5)); // interface
        // The type-only global seed is filtered away; the method body survives.
        assert_eq!(analysis.filtered_seeds(), [11].into_iter().collect());
    }

    #[test]
    fn test_interface_scope() {
        let analysis = analyze_all(&[]);
        assert_eq!(analysis.line_to_scope[&6].0, ScopeKind::Interface);
    }

    #[test]
    fn test_class_method_scope() {
        let analysis = analyze_all(&[]);
        assert_eq!(
            analysis.line_to_scope[&11],
            (ScopeKind::Method, "HttpClient.fetch".to_string())
        );
    }

    #[test]
    fn test_tsx_parses() {
        let src = "const View = () => <div>{value}</div>;\n";
        let analysis = analyze(src, &BTreeSet::new(), true).unwrap();
        assert!(analysis.executable_lines.contains(&1));
    }

    #[test]
    fn test_def_use_in_method() {
        let analysis = analyze_all(&[]);
        assert!(analysis.defs[&11].contains("url"));
        assert!(analysis.uses[&12].contains("url"));
    }
}
