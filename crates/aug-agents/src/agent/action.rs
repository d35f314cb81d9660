//! Parsing of shell actions out of assistant messages.

use std::sync::LazyLock;

use regex::Regex;

/// Environment name used when an action carries no `<env>` tag.
pub const DEFAULT_ENV: &str = "default";

/// Environment name that broadcasts an action to every environment.
pub const BROADCAST_ENV: &str = "All";

static BASH_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```bash\s*\n(.*?)```").expect("BASH_BLOCK_RE regex should compile")
});

static ENV_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<env>\s*([^<]+?)\s*</env>").expect("ENV_TAG_RE regex should compile"));

/// One routed shell action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Target environment name (`default` when untagged, `All` to broadcast).
    pub env: String,
    pub command: String,
}

/// Error raised when a message does not contain a well-formed action set.
#[derive(Debug, thiserror::Error)]
#[error("expected exactly one fenced bash action")]
pub struct FormatError;

/// Parse the actions of an assistant message.
///
/// The normal form is exactly one fenced ```bash``` block, optionally
/// preceded by an `<env>name</env>` tag. The multi-environment form pairs
/// several tagged blocks in one message (`<env>Gold</env> … <env>Mutated</env> …`);
/// untagged blocks are only valid when the message contains a single block.
pub fn parse_actions(content: &str) -> Result<Vec<Action>, FormatError> {
    let blocks: Vec<(usize, String)> = BASH_BLOCK_RE
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), caps.get(1)?.as_str().trim().to_string()))
        })
        .collect();

    if blocks.is_empty() {
        return Err(FormatError);
    }

    let tags: Vec<(usize, String)> = ENV_TAG_RE
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), caps.get(1)?.as_str().to_string()))
        })
        .collect();

    // Attach to each block the closest preceding tag that has no other block
    // between them.
    let mut actions = Vec::new();
    let mut previous_block_start = None;
    for (block_start, command) in &blocks {
        let env = tags
            .iter()
            .rev()
            .find(|(tag_start, _)| {
                *tag_start < *block_start
                    && previous_block_start
                        .map(|prev| *tag_start > prev)
                        .unwrap_or(true)
            })
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| DEFAULT_ENV.to_string());
        actions.push(Action {
            env,
            command: command.clone(),
        });
        previous_block_start = Some(*block_start);
    }

    // Multiple blocks are only the multi-env form: every block tagged.
    if actions.len() > 1 && actions.iter().any(|a| a.env == DEFAULT_ENV) {
        return Err(FormatError);
    }

    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_untagged_action() {
        let actions = parse_actions("Let me look.\n```bash\nls -la\n```\n").unwrap();
        assert_eq!(
            actions,
            vec![Action {
                env: DEFAULT_ENV.to_string(),
                command: "ls -la".to_string()
            }]
        );
    }

    #[test]
    fn test_single_tagged_action() {
        let actions = parse_actions("<env>Gold</env>\n```bash\npytest\n```").unwrap();
        assert_eq!(actions[0].env, "Gold");
    }

    #[test]
    fn test_multi_env_form() {
        let content = "<env>Gold</env>\n```bash\npytest -k a\n```\nand\n<env>Mutated</env>\n```bash\npytest -k b\n```\n";
        let actions = parse_actions(content).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].env, "Gold");
        assert_eq!(actions[0].command, "pytest -k a");
        assert_eq!(actions[1].env, "Mutated");
        assert_eq!(actions[1].command, "pytest -k b");
    }

    #[test]
    fn test_broadcast_tag() {
        let actions = parse_actions("<env>All</env>\n```bash\ngit status\n```").unwrap();
        assert_eq!(actions[0].env, BROADCAST_ENV);
    }

    #[test]
    fn test_no_block_is_format_error() {
        assert!(parse_actions("I think we should look around.").is_err());
    }

    #[test]
    fn test_multiple_untagged_blocks_are_format_error() {
        let content = "```bash\nls\n```\n```bash\npwd\n```";
        assert!(parse_actions(content).is_err());
    }

    #[test]
    fn test_mixed_tagged_untagged_is_format_error() {
        let content = "<env>Gold</env>\n```bash\nls\n```\n```bash\npwd\n```";
        assert!(parse_actions(content).is_err());
    }

    #[test]
    fn test_multiline_command_preserved() {
        let actions = parse_actions("```bash\ncat <<'EOF' > t.py\nassert True\nEOF\n```").unwrap();
        assert_eq!(actions[0].command, "cat <<'EOF' > t.py\nassert True\nEOF");
    }

    #[test]
    fn test_plain_fence_is_not_an_action() {
        assert!(parse_actions("```python\nprint(1)\n```").is_err());
    }
}
