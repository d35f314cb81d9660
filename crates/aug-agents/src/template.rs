//! Minimal `{{var}}` template rendering.
//!
//! Agent prompts come from config files as plain strings with `{{name}}`
//! placeholders, rendered against a flat map of task, config, model, and
//! environment variables. Unknown placeholders are left in place so a typo in
//! a config file is visible in the transcript instead of silently vanishing.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .expect("PLACEHOLDER_RE regex should compile")
});

/// Render `template`, substituting every `{{name}}` with `vars[name]`.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitution() {
        let rendered = render_template(
            "Task: {{task}} in {{workdir}}",
            &vars(&[("task", "fix it"), ("workdir", "/app")]),
        );
        assert_eq!(rendered, "Task: fix it in /app");
    }

    #[test]
    fn test_whitespace_tolerated() {
        assert_eq!(
            render_template("{{ task }}", &vars(&[("task", "x")])),
            "x"
        );
    }

    #[test]
    fn test_unknown_placeholder_survives() {
        assert_eq!(render_template("{{missing}}", &vars(&[])), "{{missing}}");
    }

    #[test]
    fn test_repeated_placeholder() {
        assert_eq!(
            render_template("{{a}}-{{a}}", &vars(&[("a", "1")])),
            "1-1"
        );
    }
}
