use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http_client::build_http_client;
use crate::types::Turn;

/// Maps an ordered turn sequence (system turn first) to a generated reply.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, turns: &[Turn]) -> Result<String>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client: build_http_client(timeout)?,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, turns: &[Turn]) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = build_request(&self.model, turns);

        let mut req = self.client.post(&url).json(&request);

        // Local OpenAI-compatible servers often run without a key.
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        extract_reply(completion)
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, turns: &[Turn]) -> Result<String> {
        self.generate(turns).await
    }
}

fn build_request<'a>(model: &'a str, turns: &'a [Turn]) -> ChatCompletionRequest<'a> {
    ChatCompletionRequest {
        model,
        messages: turns
            .iter()
            .map(|turn| Message {
                role: turn.role().as_str(),
                content: turn.text(),
            })
            .collect(),
    }
}

fn extract_reply(completion: ChatCompletionResponse) -> Result<String> {
    completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No response from LLM"))?
        .message
        .content
        .ok_or_else(|| anyhow::anyhow!("LLM response has no message content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> ChatCompletionResponse {
        serde_json::from_str(raw).expect("response json")
    }

    #[test]
    fn request_keeps_turn_order_and_roles() {
        let turns = vec![
            Turn::system("persona"),
            Turn::user("hi"),
            Turn::assistant("hello"),
            Turn::user(""),
        ];
        let json = serde_json::to_value(build_request("gpt-4.1-mini", &turns)).unwrap();

        assert_eq!(json["model"], "gpt-4.1-mini");
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "");
    }

    #[test]
    fn reply_is_first_choice_content() {
        let completion = parse(
            r#"{"choices":[{"message":{"role":"assistant","content":"first"}},
                           {"message":{"role":"assistant","content":"second"}}]}"#,
        );
        assert_eq!(extract_reply(completion).unwrap(), "first");
    }

    #[test]
    fn missing_choices_or_content_is_an_error() {
        assert!(extract_reply(parse(r#"{"choices":[]}"#)).is_err());
        assert!(extract_reply(parse(r#"{}"#)).is_err());
        assert!(extract_reply(parse(
            r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#
        ))
        .is_err());
    }

    #[test]
    fn trailing_slash_is_trimmed_from_api_url() {
        let client = LlmClient::new(
            "http://localhost:1234/v1/".to_string(),
            String::new(),
            "local".to_string(),
            None,
        )
        .unwrap();
        assert_eq!(client.api_url, "http://localhost:1234/v1");
        assert_eq!(client.model(), "local");
    }
}
