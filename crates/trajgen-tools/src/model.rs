use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use trajgen_core::{CompletionRequest, LanguageModel, Message, ModelConfig, ModelError, SecretValue};

use crate::http::{HttpFailure, build_client, read_success};

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsModel {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretValue>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "no_stops")]
    stop: &'a [String],
}

fn no_stops(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsModel {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<SecretValue>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
        })
    }

    pub fn from_config(config: &ModelConfig, api_key: Option<SecretValue>) -> reqwest::Result<Self> {
        Self::new(
            &config.base_url,
            config.model.clone(),
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, ModelError> {
        let body = ChatRequest {
            model: &self.model,
            messages: request.messages,
            temperature: request.params.temperature,
            max_tokens: request.params.max_tokens,
            stop: request.stop,
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ModelError::from(HttpFailure::transport(&err)))?;
        let raw = read_success(response).await?;
        extract_content(&raw)
    }
}

fn extract_content(raw: &str) -> Result<String, ModelError> {
    let parsed: ChatResponse =
        serde_json::from_str(raw).map_err(|err| ModelError::from(HttpFailure::malformed(err)))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ModelError::transient("completion has no content"))
}
