//! Agent configuration loaded from YAML config files.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::HttpModelConfig;

/// Templates and limits for one agent type. Templates are rendered against a
/// flat map of task, config, model, and environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_template")]
    pub system_template: String,
    #[serde(default = "default_instance_template")]
    pub instance_template: String,
    #[serde(default = "default_timeout_template")]
    pub timeout_template: String,
    #[serde(default = "default_format_error_template")]
    pub format_error_template: String,
    #[serde(default = "default_action_observation_template")]
    pub action_observation_template: String,
    /// Extra instruction delivered when 10 steps remain (mutation agent
    /// only): ask for an intentionally equivalent mutation.
    #[serde(default)]
    pub equivalent_mutation_template: String,
    /// Maximum model calls; 0 disables the cap.
    #[serde(default)]
    pub step_limit: u32,
    /// Maximum accumulated cost; 0 disables the cap.
    #[serde(default = "default_cost_limit")]
    pub cost_limit: f64,
}

fn default_system_template() -> String {
    "You are a helpful assistant that can do anything.".to_string()
}

fn default_instance_template() -> String {
    "Your task: {{task}}. Please reply with a single shell command in triple backticks. \
     To finish, the first line of the output of the shell command must be \
     'COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT'."
        .to_string()
}

fn default_timeout_template() -> String {
    "The last command <command>{{action}}</command> timed out and has been killed.\n\
     The output of the command was:\n<output>\n{{output}}\n</output>\n\
     Please try another command and make sure to avoid those requiring interactive input."
        .to_string()
}

fn default_format_error_template() -> String {
    "Please always provide EXACTLY ONE action in triple backticks.".to_string()
}

fn default_action_observation_template() -> String {
    "Observation: {{output}}".to_string()
}

fn default_cost_limit() -> f64 {
    3.0
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_template: default_system_template(),
            instance_template: default_instance_template(),
            timeout_template: default_timeout_template(),
            format_error_template: default_format_error_template(),
            action_observation_template: default_action_observation_template(),
            equivalent_mutation_template: String::new(),
            step_limit: 0,
            cost_limit: default_cost_limit(),
        }
    }
}

impl AgentConfig {
    /// Non-template variables this config contributes to rendering.
    pub fn template_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("step_limit".to_string(), self.step_limit.to_string());
        vars.insert("cost_limit".to_string(), self.cost_limit.to_string());
        vars
    }
}

/// A full run configuration: the agent templates plus the model endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: Option<HttpModelConfig>,
}

impl RunConfig {
    /// Load a YAML run configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading agent config {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing agent config {}", path.display()))
    }
}
