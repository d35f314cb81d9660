//! The cooperative agent loop.
//!
//! Each iteration queries the model with the full message history, parses
//! exactly one fenced bash action out of the reply, executes it in one or
//! more environments, and feeds labelled observations back. Completion is
//! signalled through magic first lines of the action's output. Format errors
//! and execution timeouts are surfaced back to the model and never terminate
//! the loop; step and cost caps do.

mod action;
mod mutation;
mod single_step;

pub use action::{parse_actions, Action, BROADCAST_ENV, DEFAULT_ENV};
pub use mutation::MutationAgent;
pub use single_step::SingleStepAgent;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::env::{Environment, EnvironmentError};
use crate::model::{Message, Model};
use crate::template::render_template;

/// Output first-lines that signal task completion.
pub const FINAL_OUTPUT_TOKENS: &[&str] = &[
    "MINI_SWE_AGENT_FINAL_OUTPUT",
    "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT",
];

/// Output first-line that signals the agent is giving up.
pub const GIVE_UP_TOKEN: &str = "GIVE_UP_TASK";

/// Error type for agent runs
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Unknown environment '{0}' in action")]
    UnknownEnvironment(String),
}

/// Terminal state of an agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The agent submitted a final output.
    Submitted,
    /// Step or cost cap reached.
    LimitsExceeded,
    /// The agent gave up.
    TaskFailed,
    /// Infrastructure failure outside the loop's control.
    Error(String),
}

impl ExitStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ExitStatus::Submitted => "Submitted",
            ExitStatus::LimitsExceeded => "LimitsExceeded",
            ExitStatus::TaskFailed => "TaskFailed",
            ExitStatus::Error(name) => name,
        }
    }
}

/// The default multi-environment agent. A single environment registers under
/// the name `default`; actions without an `<env>` tag route there.
pub struct DefaultAgent {
    pub model: Arc<dyn Model>,
    pub envs: BTreeMap<String, Arc<dyn Environment>>,
    pub config: AgentConfig,
    pub messages: Vec<Message>,
    extra_vars: BTreeMap<String, String>,
}

impl DefaultAgent {
    pub fn new(model: Arc<dyn Model>, env: Arc<dyn Environment>, config: AgentConfig) -> Self {
        let mut envs = BTreeMap::new();
        envs.insert(DEFAULT_ENV.to_string(), env);
        Self::with_envs(model, envs, config)
    }

    pub fn with_envs(
        model: Arc<dyn Model>,
        envs: BTreeMap<String, Arc<dyn Environment>>,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            envs,
            config,
            messages: Vec::new(),
            extra_vars: BTreeMap::new(),
        }
    }

    /// Flat variable map for template rendering: config, model, extra, and
    /// environment vars (prefixed by env name when several environments
    /// exist).
    fn template_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.config.template_vars();
        vars.extend(self.model.template_vars());
        let multi = self.envs.len() > 1;
        for (name, env) in &self.envs {
            for (key, value) in env.template_vars() {
                let key = if multi { format!("{name}_{key}") } else { key };
                vars.insert(key, value);
            }
        }
        vars.extend(self.extra_vars.clone());
        vars
    }

    /// Render a template against the current variable map.
    pub fn render(&self, template: &str) -> String {
        render_template(template, &self.template_vars())
    }

    /// Seed the conversation for a fresh run: install the extra variables and
    /// emit the system and instance messages.
    pub fn begin(&mut self, task: &str, extra_vars: BTreeMap<String, String>) {
        self.extra_vars = extra_vars;
        self.extra_vars.insert("task".to_string(), task.to_string());
        self.messages.clear();
        let system = self.render(&self.config.system_template);
        self.add_message("system", system);
        let instance = self.render(&self.config.instance_template);
        self.add_message("user", instance);
    }

    pub fn add_message(&mut self, role: &str, content: String) {
        self.messages.push(Message::new(role, content));
    }

    fn limits_reached(&self) -> bool {
        let steps = self.config.step_limit > 0 && self.model.n_calls() >= self.config.step_limit;
        let cost = self.config.cost_limit > 0.0 && self.model.cost() >= self.config.cost_limit;
        steps || cost
    }

    /// Run the loop to a terminal state. `extra_vars` join the template map
    /// (`task`, patches, test command, workdir, …). Returns the exit status
    /// and the final submission (empty unless submitted).
    pub async fn run(
        &mut self,
        task: &str,
        extra_vars: BTreeMap<String, String>,
    ) -> (ExitStatus, String) {
        self.begin(task, extra_vars);

        loop {
            match self.step().await {
                Ok(Some((status, output))) => return (status, output),
                Ok(None) => continue,
                Err(AgentError::Environment(EnvironmentError::Container(e))) => {
                    return (ExitStatus::Error(format!("EnvironmentError: {e}")), String::new())
                }
                Err(AgentError::Model(e)) => {
                    return (ExitStatus::Error(format!("ModelError: {e}")), String::new())
                }
                Err(e) => return (ExitStatus::Error(e.to_string()), String::new()),
            }
        }
    }

    /// One loop iteration. `Ok(Some(..))` is a terminal state, `Ok(None)`
    /// continues the loop.
    pub async fn step(&mut self) -> Result<Option<(ExitStatus, String)>, AgentError> {
        if self.limits_reached() {
            info!(
                n_calls = self.model.n_calls(),
                cost = self.model.cost(),
                "agent limits reached"
            );
            return Ok(Some((ExitStatus::LimitsExceeded, String::new())));
        }

        let response = self.model.query(&self.messages).await?;
        self.add_message("assistant", response.content.clone());

        let actions = match parse_actions(&response.content) {
            Ok(actions) => actions,
            Err(_) => {
                let feedback = self.render(&self.config.format_error_template);
                self.add_message("user", feedback);
                return Ok(None);
            }
        };

        let mut terminal: Option<(ExitStatus, String)> = None;
        for action in actions {
            let targets: Vec<String> = if action.env == BROADCAST_ENV {
                self.envs.keys().cloned().collect()
            } else {
                vec![action.env.clone()]
            };

            for target in targets {
                let env = self
                    .envs
                    .get(&target)
                    .cloned()
                    .ok_or_else(|| AgentError::UnknownEnvironment(target.clone()))?;

                match env.execute(&action.command).await {
                    Ok(result) => {
                        debug!(env = %target, returncode = result.returncode, "action executed");
                        if terminal.is_none() {
                            terminal = classify_output(&result.output);
                        }
                        let mut vars = self.template_vars();
                        vars.insert("output".to_string(), result.output.clone());
                        vars.insert("returncode".to_string(), result.returncode.to_string());
                        vars.insert("env_name".to_string(), target.clone());
                        let observation =
                            render_template(&self.config.action_observation_template, &vars);
                        let labelled = if self.envs.len() > 1 {
                            format!("[{target}] {observation}")
                        } else {
                            observation
                        };
                        self.add_message("user", labelled);
                    }
                    Err(EnvironmentError::Timeout {
                        seconds: _,
                        partial_output,
                    }) => {
                        let mut vars = self.template_vars();
                        vars.insert("action".to_string(), action.command.clone());
                        vars.insert("output".to_string(), partial_output);
                        let feedback = render_template(&self.config.timeout_template, &vars);
                        self.add_message("user", feedback);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(terminal)
    }
}

/// Inspect an action's output for completion tokens: the first non-empty
/// line decides, and the remaining output becomes the submission.
fn classify_output(output: &str) -> Option<(ExitStatus, String)> {
    let mut lines = output.lines();
    let first = lines.find(|line| !line.trim().is_empty())?;
    let first = first.trim();

    if FINAL_OUTPUT_TOKENS.contains(&first) {
        let remainder: Vec<&str> = lines.collect();
        return Some((ExitStatus::Submitted, remainder.join("\n")));
    }
    if first == GIVE_UP_TOKEN {
        return Some((ExitStatus::TaskFailed, String::new()));
    }
    None
}
