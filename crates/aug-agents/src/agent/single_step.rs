//! Single-step agent: render the system and instance templates, query once,
//! return the raw reply. Used by the mutation judge.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::AgentConfig;
use crate::model::{Message, Model};
use crate::template::render_template;

use super::AgentError;

pub struct SingleStepAgent {
    pub model: Arc<dyn Model>,
    pub config: AgentConfig,
    pub messages: Vec<Message>,
}

impl SingleStepAgent {
    pub fn new(model: Arc<dyn Model>, config: AgentConfig) -> Self {
        Self {
            model,
            config,
            messages: Vec::new(),
        }
    }

    /// One round trip: seed the conversation and return the reply content.
    pub async fn run(
        &mut self,
        extra_vars: BTreeMap<String, String>,
    ) -> Result<String, AgentError> {
        let mut vars = self.config.template_vars();
        vars.extend(self.model.template_vars());
        vars.extend(extra_vars);

        self.messages.clear();
        self.messages.push(Message::new(
            "system",
            render_template(&self.config.system_template, &vars),
        ));
        self.messages.push(Message::new(
            "user",
            render_template(&self.config.instance_template, &vars),
        ));

        let response = self.model.query(&self.messages).await?;
        self.messages
            .push(Message::new("assistant", response.content.clone()));
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::ScriptedModel;

    #[tokio::test]
    async fn test_single_round_trip() {
        let model = Arc::new(ScriptedModel::new(vec!["<Answer>Relevance: yes</Answer>"]));
        let config = AgentConfig {
            instance_template: "Judge this mutation: {{mutation}}".to_string(),
            ..Default::default()
        };
        let mut agent = SingleStepAgent::new(model.clone(), config);

        let mut vars = BTreeMap::new();
        vars.insert("mutation".to_string(), "diff".to_string());
        let reply = agent.run(vars).await.unwrap();

        assert!(reply.contains("Relevance"));
        assert_eq!(model.n_calls(), 1);
        assert_eq!(agent.messages.len(), 3);
        assert!(agent.messages[1].content.contains("Judge this mutation: diff"));
    }
}
