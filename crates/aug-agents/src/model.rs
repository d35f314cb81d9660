//! The LLM client interface the agent loop consumes.
//!
//! The loop only needs `query(messages) → content` plus call/cost counters;
//! [`HttpModel`] is the default OpenAI-compatible implementation. Tests use
//! scripted models instead of a live endpoint.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::AgentError;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A model response; only the text content matters to the loop.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
}

/// The model operations the agent loop consumes.
#[async_trait]
pub trait Model: Send + Sync {
    async fn query(&self, messages: &[Message]) -> Result<ModelResponse, AgentError>;

    /// Number of completed calls so far.
    fn n_calls(&self) -> u32;

    /// Accumulated cost so far.
    fn cost(&self) -> f64;

    /// Variables exposed to template rendering.
    fn template_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn name(&self) -> String;
}

/// Configuration for the OpenAI-compatible HTTP model client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpModelConfig {
    pub base_url: String,
    pub model_name: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Cost per million input tokens, for the cost cap.
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    /// Cost per million output tokens.
    #[serde(default)]
    pub output_cost_per_mtok: f64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Default)]
struct ModelStats {
    n_calls: u32,
    cost: f64,
}

/// OpenAI-compatible `/chat/completions` client with call and cost
/// accounting.
pub struct HttpModel {
    config: HttpModelConfig,
    client: reqwest::Client,
    stats: Mutex<ModelStats>,
}

impl HttpModel {
    pub fn new(config: HttpModelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            stats: Mutex::new(ModelStats::default()),
        }
    }

    pub fn config(&self) -> &HttpModelConfig {
        &self.config
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl Model for HttpModel {
    async fn query(&self, messages: &[Message]) -> Result<ModelResponse, AgentError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let api_key = std::env::var(&self.config.api_key_env).unwrap_or_default();

        let request = ChatRequest {
            model: &self.config.model_name,
            messages,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::Model(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Model(format!(
                "model endpoint returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Model(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AgentError::Model("model response had no choices".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        let call_cost = usage.prompt_tokens as f64 / 1_000_000.0 * self.config.input_cost_per_mtok
            + usage.completion_tokens as f64 / 1_000_000.0 * self.config.output_cost_per_mtok;

        {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.n_calls += 1;
            stats.cost += call_cost;
        }
        debug!(model = %self.config.model_name, cost = call_cost, "model call completed");

        Ok(ModelResponse { content })
    }

    fn n_calls(&self) -> u32 {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).n_calls
    }

    fn cost(&self) -> f64 {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).cost
    }

    fn template_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("model_name".to_string(), self.config.model_name.clone());
        vars
    }

    fn name(&self) -> String {
        self.config.model_name.clone()
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted model for agent loop tests.

    use super::*;

    /// Plays back a fixed list of responses, with a configurable per-call
    /// cost.
    pub struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        stats: Mutex<ModelStats>,
        pub cost_per_call: f64,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(str::to_string).collect()),
                stats: Mutex::new(ModelStats::default()),
                cost_per_call: 0.01,
            }
        }
    }

    #[async_trait]
    impl Model for ScriptedModel {
        async fn query(&self, _messages: &[Message]) -> Result<ModelResponse, AgentError> {
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| AgentError::Model("scripted model exhausted".to_string()))?;
            let mut stats = self.stats.lock().unwrap();
            stats.n_calls += 1;
            stats.cost += self.cost_per_call;
            Ok(ModelResponse { content })
        }

        fn n_calls(&self) -> u32 {
            self.stats.lock().unwrap().n_calls
        }

        fn cost(&self) -> f64 {
            self.stats.lock().unwrap().cost
        }

        fn name(&self) -> String {
            "scripted".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_model_config_defaults() {
        let config: HttpModelConfig = serde_json::from_str(
            r#"{"base_url": "http://localhost:8080/v1", "model_name": "m"}"#,
        )
        .unwrap();
        assert_eq!(config.api_key_env, "OPENAI_API_KEY");
        assert!(config.temperature.is_none());
    }

    #[tokio::test]
    async fn test_scripted_model_counts_calls() {
        use testing::ScriptedModel;
        let model = ScriptedModel::new(vec!["a", "b"]);
        model.query(&[]).await.unwrap();
        model.query(&[]).await.unwrap();
        assert_eq!(model.n_calls(), 2);
        assert!((model.cost() - 0.02).abs() < 1e-9);
        assert!(model.query(&[]).await.is_err());
    }
}
