//! Mutation-generation agent: the default loop plus a late-run nudge to emit
//! an intentionally equivalent mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::env::Environment;
use crate::model::Model;

use super::{DefaultAgent, ExitStatus};

/// Agent that produces `model_patch` mutations. When exactly 10 steps remain
/// before the step cap, the configured equivalent-mutation instruction is
/// injected so the model also emits an equivalent variant.
pub struct MutationAgent {
    inner: DefaultAgent,
    nudge_delivered: bool,
}

impl MutationAgent {
    pub fn new(model: Arc<dyn Model>, env: Arc<dyn Environment>, config: AgentConfig) -> Self {
        Self {
            inner: DefaultAgent::new(model, env, config),
            nudge_delivered: false,
        }
    }

    pub fn inner(&self) -> &DefaultAgent {
        &self.inner
    }

    fn should_nudge(&self) -> bool {
        let config = &self.inner.config;
        !self.nudge_delivered
            && config.step_limit > 0
            && !config.equivalent_mutation_template.is_empty()
            && config.step_limit.saturating_sub(self.inner.model.n_calls()) == 10
    }

    pub async fn run(
        &mut self,
        task: &str,
        extra_vars: BTreeMap<String, String>,
    ) -> (ExitStatus, String) {
        self.inner.begin(task, extra_vars);

        loop {
            if self.should_nudge() {
                let template = self.inner.config.equivalent_mutation_template.clone();
                let nudge = self.inner.render(&template);
                self.inner.add_message("user", nudge);
                self.nudge_delivered = true;
            }
            match self.inner.step().await {
                Ok(Some((status, output))) => return (status, output),
                Ok(None) => continue,
                Err(e) => return (ExitStatus::Error(e.to_string()), String::new()),
            }
        }
    }
}
