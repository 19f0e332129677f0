//! OpenAI-compatible chat-completion backend over HTTPS.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::client::LlmError;
use super::message::Message;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Deterministic decoding; all generation in this crate is temperature 0.
const TEMPERATURE: f32 = 0.0;

/// Chat-completion API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Remote API handle. Performs single requests only; retries belong to the
/// wrapping client, never to the transport.
pub(crate) struct RemoteBackend {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: Option<String>,
}

impl RemoteBackend {
    pub(crate) fn new(
        api_key: &str,
        base_url: Option<&str>,
        model: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.map(str::to_string),
        })
    }

    /// Issue one chat-completion request and return the first choice's text.
    pub(crate) async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = json!({
            "messages": messages,
            "temperature": TEMPERATURE,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("{status}: {error_text}")));
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Parse("no choices in response".to_string()))?;

        Ok(choice.message.content)
    }
}
