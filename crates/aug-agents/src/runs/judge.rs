//! Mutation judge pass.
//!
//! Each surviving mutation is judged `J` times by a single-step agent
//! (possibly across several models). Every verdict answers two questions:
//! is the mutation relevant to the fix, and is it a valid (non-equivalent)
//! mutation. Majority vote across non-parse-error answers yields the final
//! `judge_info`; an all-parse-error instance is recorded with the
//! `parse error` exit status but still gets its (defaulted) judge_info.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use harness::store::ResultStore;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::agent::SingleStepAgent;
use crate::config::AgentConfig;
use crate::model::{HttpModel, HttpModelConfig, Model};
use crate::traj::{save_trajectory, Trajectory};

use super::{run_parallel, write_exit_statuses, RunContext};

/// One judge verdict; `None` fields mean the answer could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub is_relevant: Option<bool>,
    pub is_valid: Option<bool>,
}

impl Verdict {
    fn parse_error(&self) -> bool {
        self.is_relevant.is_none() || self.is_valid.is_none()
    }
}

/// Parse a judge reply: an `<Answer>…</Answer>` block with `Relevance:`,
/// `Mutation Validity:`, and/or `Equivalent Mutation:` lines. An equivalent
/// mutation is by definition not a valid one.
pub fn parse_verdict(response: &str) -> Verdict {
    let block = response
        .split("<Answer>")
        .nth(1)
        .and_then(|rest| rest.split("</Answer>").next());
    let Some(block) = block else {
        return Verdict {
            is_relevant: None,
            is_valid: None,
        };
    };

    let mut is_relevant = None;
    let mut is_valid = None;
    for line in block.lines() {
        let line = line.trim();
        let lower = line.to_lowercase();
        let answer = || {
            line.split(':')
                .nth(1)
                .map(|v| v.trim().to_lowercase() == "yes")
        };
        if lower.starts_with("relevance") {
            is_relevant = answer();
        } else if lower.starts_with("mutation validity") {
            is_valid = answer();
        } else if lower.starts_with("equivalent mutation") {
            is_valid = answer().map(|equivalent| !equivalent);
        }
    }

    Verdict {
        is_relevant,
        is_valid,
    }
}

/// Majority over the true votes; an empty vote list is `false`.
pub fn majority_vote(votes: &[bool]) -> bool {
    if votes.is_empty() {
        return false;
    }
    let ayes = votes.iter().filter(|v| **v).count();
    ayes * 2 > votes.len()
}

/// Options for a judge pass.
#[derive(Debug, Clone)]
pub struct JudgeOptions {
    /// Models voting on each mutation; a single entry is repeated
    /// `judge_times` times.
    pub models: Vec<String>,
    pub judge_times: usize,
}

impl JudgeOptions {
    fn voter_models(&self, default_model: &str) -> Vec<String> {
        if self.models.len() >= 2 {
            self.models.clone()
        } else {
            let model = self
                .models
                .first()
                .cloned()
                .unwrap_or_else(|| default_model.to_string());
            vec![model; self.judge_times.max(1)]
        }
    }
}

/// Judge every record's mutation and write `judge_info` back into the set's
/// preds document.
pub async fn run(
    ctx: &RunContext,
    preds_path: &std::path::Path,
    records: Vec<Value>,
    options: &JudgeOptions,
) -> Result<usize> {
    let default_model = ctx
        .config
        .model
        .as_ref()
        .map(|m| m.model_name.clone())
        .unwrap_or_default();
    let voters = options.voter_models(&default_model);

    let statuses = run_parallel(records, ctx.workers, |record| {
        let ctx = ctx.clone();
        let voters = voters.clone();
        let preds_path = preds_path.to_path_buf();
        async move {
            let id = record
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            match judge_instance(&ctx, &preds_path, &record, &voters).await {
                Ok(status) => (id, status),
                Err(e) => {
                    error!(instance = %id, error = %e, "judge pass failed");
                    (id, format!("Error: {e}"))
                }
            }
        }
    })
    .await;

    write_exit_statuses(&ctx.output_dir, "judge_mutation", &statuses)?;
    Ok(statuses
        .values()
        .filter(|s| s.as_str() == "Submitted")
        .count())
}

async fn judge_instance(
    ctx: &RunContext,
    preds_path: &std::path::Path,
    record: &Value,
    voters: &[String],
) -> Result<String> {
    let instance_id = record
        .get("instance_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("record without instance_id"))?
        .to_string();
    let store = ResultStore::new(preds_path)?;

    let traj_dir = ctx.output_dir.join("traj").join("judge").join(&instance_id);

    let mutation_thinking = record
        .get("mutation_thinking")
        .and_then(Value::as_str)
        .unwrap_or("");
    let model_patch = record
        .get("model_patch")
        .and_then(Value::as_str)
        .unwrap_or("");

    let mut vars = BTreeMap::new();
    vars.insert(
        "issue".to_string(),
        record
            .get("problem_statement")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    );
    vars.insert(
        "gold_patch".to_string(),
        record.get("patch").and_then(Value::as_str).unwrap_or("").to_string(),
    );
    vars.insert(
        "test_patch".to_string(),
        record
            .get("test_patch")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    );
    vars.insert(
        "mutation".to_string(),
        format!("{mutation_thinking}\n{model_patch}"),
    );

    let mut isrele_list: Vec<Value> = Vec::new();
    let mut isvalid_list: Vec<Value> = Vec::new();
    let mut valid_rele_votes: Vec<bool> = Vec::new();
    let mut valid_valid_votes: Vec<bool> = Vec::new();
    let mut exit_status = "Submitted".to_string();

    for (idx, model_name) in voters.iter().enumerate() {
        let model = judge_model(ctx, model_name)?;
        let config = judge_agent_config(&ctx.config.agent);
        let mut agent = SingleStepAgent::new(model, config.clone());

        let verdict = match agent.run(vars.clone()).await {
            Ok(reply) => parse_verdict(&reply),
            Err(e) => {
                error!(instance = %instance_id, judge = idx, error = %e, "judge call failed");
                Verdict {
                    is_relevant: None,
                    is_valid: None,
                }
            }
        };

        let call_status = if verdict.parse_error() {
            exit_status = "parse error".to_string();
            "parse error"
        } else {
            "Submitted"
        };

        isrele_list.push(vote_value(verdict.is_relevant));
        isvalid_list.push(vote_value(verdict.is_valid));
        if let (Some(rele), Some(valid)) = (verdict.is_relevant, verdict.is_valid) {
            valid_rele_votes.push(rele);
            valid_valid_votes.push(valid);
        }

        let trajectory = Trajectory::new(
            &crate::agent::ExitStatus::Error(call_status.to_string()),
            &format!("{verdict:?}"),
            agent.messages.clone(),
            agent.model.n_calls(),
            agent.model.cost(),
        )
        .with_instance(&instance_id)
        .with_config(config, model_name.clone());
        save_trajectory(&traj_dir.join(format!("judge_{idx}.traj.json")), &trajectory)?;
    }

    let judge_info = json!({
        "isrele": majority_vote(&valid_rele_votes),
        "isvalid": majority_vote(&valid_valid_votes),
        "isrele_list": isrele_list,
        "isvalid_list": isvalid_list,
        "outputs": traj_dir.parent().map(|p| p.display().to_string()).unwrap_or_default(),
    });
    store.update_instance(&instance_id, json!({ "judge_info": judge_info }), true)?;

    info!(instance = %instance_id, status = %exit_status, "judge finished");
    Ok(exit_status)
}

fn vote_value(vote: Option<bool>) -> Value {
    match vote {
        Some(v) => Value::from(v),
        None => Value::from("parse error"),
    }
}

fn judge_model(ctx: &RunContext, model_name: &str) -> Result<Arc<dyn Model>> {
    let mut config: HttpModelConfig = ctx
        .config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("run config has no model section"))?;
    config.model_name = model_name.to_string();
    // Repeated same-model votes need sampling spread.
    config.temperature = Some(config.temperature.unwrap_or(1.0));
    Ok(Arc::new(HttpModel::new(config)))
}

fn judge_agent_config(base: &AgentConfig) -> AgentConfig {
    AgentConfig {
        step_limit: 1,
        ..base.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_validity_form() {
        let reply = "thinking...\n<Answer>\nRelevance: yes\nMutation Validity: no\n</Answer>";
        let verdict = parse_verdict(reply);
        assert_eq!(verdict.is_relevant, Some(true));
        assert_eq!(verdict.is_valid, Some(false));
    }

    #[test]
    fn test_parse_verdict_equivalence_form_inverts() {
        let reply = "<Answer>Relevance: yes\nEquivalent Mutation: yes</Answer>";
        let verdict = parse_verdict(reply);
        // Equivalent == not a valid mutation.
        assert_eq!(verdict.is_valid, Some(false));

        let reply = "<Answer>Relevance: no\nEquivalent Mutation: no</Answer>";
        assert_eq!(parse_verdict(reply).is_valid, Some(true));
    }

    #[test]
    fn test_parse_verdict_errors() {
        assert!(parse_verdict("no answer block").parse_error());
        assert!(parse_verdict("<Answer>Relevance: yes</Answer>").parse_error());
    }

    #[test]
    fn test_majority_vote() {
        assert!(majority_vote(&[true, true, false]));
        assert!(!majority_vote(&[true, false]));
        assert!(!majority_vote(&[]));
    }

    #[test]
    fn test_majority_ignores_parse_errors() {
        // relevance: yes / parse-error / yes; validity: yes / yes / parse-error
        let rele_votes = vec![true, true];
        let valid_votes = vec![true, true];
        assert!(majority_vote(&rele_votes));
        assert!(majority_vote(&valid_votes));
    }

    #[test]
    fn test_voter_models_repeat_single() {
        let options = JudgeOptions {
            models: vec![],
            judge_times: 3,
        };
        assert_eq!(options.voter_models("m"), vec!["m", "m", "m"]);

        let options = JudgeOptions {
            models: vec!["a".into(), "b".into(), "c".into()],
            judge_times: 3,
        };
        assert_eq!(options.voter_models("m"), vec!["a", "b", "c"]);
    }
}
