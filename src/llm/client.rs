//! Chat LLM transport
//!
//! Thin multi-turn chat client with provider auto-detection from the
//! model name. Transient transport failures are retried with backoff
//! before surfacing as [`IndexError::LlmTransport`].

use crate::config::LlmConfig;
use crate::error::{IndexError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Transport retries before a request is abandoned
const MAX_TRANSPORT_RETRIES: usize = 3;

/// One turn in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Multi-turn chat client over the provider HTTP APIs
pub struct ChatClient {
    client: Client,
    api_key: String,
    model: String,
    provider: String,
    base_url: String,
    max_tokens: usize,
    temperature: f64,
    extended_thinking: bool,
}

impl ChatClient {
    /// Create a client, auto-detecting the provider from the model name
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let model = config.model.clone();
        let provider = if model.starts_with("claude") {
            "anthropic".to_string()
        } else if model.starts_with("gemini") {
            "google".to_string()
        } else {
            "xai".to_string()
        };

        let base_url = match provider.as_str() {
            "anthropic" => "https://api.anthropic.com/v1".to_string(),
            "google" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
            _ => "https://api.x.ai/v1".to_string(),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| IndexError::LlmTransport(format!("cannot build HTTP client: {}", e)))?;

        debug!(
            "LLM client: provider={}, model={}, base_url={}",
            provider, model, base_url
        );

        Ok(Self {
            client,
            api_key,
            model,
            provider,
            base_url,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            extended_thinking: config.extended_thinking,
        })
    }

    /// Create from environment: the API key variable follows the provider
    /// implied by the configured model
    pub fn from_env(config: &LlmConfig) -> Result<Self> {
        let model = config.model.as_str();
        let var = if model.starts_with("claude") {
            "ANTHROPIC_API_KEY"
        } else if model.starts_with("gemini") {
            "GEMINI_API_KEY"
        } else {
            "XAI_API_KEY"
        };
        let api_key = std::env::var(var)
            .map_err(|_| IndexError::Configuration(format!("{} not set in environment", var)))?;
        Self::new(api_key, config)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a conversation and return the assistant's reply text
    ///
    /// Transient failures (connection errors, 429, 5xx) are retried with
    /// exponential backoff; other HTTP errors fail immediately.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..MAX_TRANSPORT_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << attempt);
                warn!(
                    "Retrying LLM request (attempt {}/{}) after {:?}",
                    attempt + 1,
                    MAX_TRANSPORT_RETRIES,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            match self.chat_once(messages).await {
                Ok(text) => return Ok(text),
                Err(RequestError::Transient(msg)) => last_err = Some(msg),
                Err(RequestError::Fatal(msg)) => return Err(IndexError::LlmTransport(msg)),
            }
        }
        Err(IndexError::LlmTransport(format!(
            "exhausted {} attempts: {}",
            MAX_TRANSPORT_RETRIES,
            last_err.unwrap_or_default()
        )))
    }

    async fn chat_once(&self, messages: &[ChatMessage]) -> std::result::Result<String, RequestError> {
        match self.provider.as_str() {
            "anthropic" => self.chat_anthropic(messages).await,
            "google" => self.chat_google(messages).await,
            _ => self.chat_openai_compatible(messages).await,
        }
    }

    async fn chat_openai_compatible(
        &self,
        messages: &[ChatMessage],
    ) -> std::result::Result<String, RequestError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RequestError::Transient(format!("request failed: {}", e)))?;

        let json = Self::check_and_parse(response).await?;
        json.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RequestError::Fatal("no completion text in response".into()))
    }

    async fn chat_anthropic(
        &self,
        messages: &[ChatMessage],
    ) -> std::result::Result<String, RequestError> {
        // Messages API keeps the system prompt out of the turn list
        let system = messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": system,
            "messages": turns,
        });
        if self.extended_thinking {
            // Thinking requires temperature 1 and a budget under max_tokens
            body["temperature"] = json!(1.0);
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": (self.max_tokens / 2).max(1024),
            });
        }

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RequestError::Transient(format!("request failed: {}", e)))?;

        let json = Self::check_and_parse(response).await?;
        // With extended thinking the first content block is the thinking
        // trace; take the first block that carries text
        json.pointer("/content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find_map(|block| block.get("text").and_then(Value::as_str))
            })
            .map(str::to_string)
            .ok_or_else(|| RequestError::Fatal("no completion text in response".into()))
    }

    async fn chat_google(
        &self,
        messages: &[ChatMessage],
    ) -> std::result::Result<String, RequestError> {
        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| {
                json!({
                    "role": if m.role == "assistant" { "model" } else { "user" },
                    "parts": [{"text": m.content}],
                })
            })
            .collect();
        let system = messages
            .iter()
            .find(|m| m.role == "system")
            .map(|m| json!({"parts": [{"text": m.content}]}));

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": self.temperature,
            },
        });
        if let Some(system) = system {
            body["systemInstruction"] = system;
        }

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, self.model, self.api_key
            ))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| RequestError::Transient(format!("request failed: {}", e)))?;

        let json = Self::check_and_parse(response).await?;
        json.pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RequestError::Fatal("no completion text in response".into()))
    }

    async fn check_and_parse(
        response: reqwest::Response,
    ) -> std::result::Result<Value, RequestError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let msg = format!("API returned {}: {}", status, text);
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(RequestError::Transient(msg))
            } else {
                Err(RequestError::Fatal(msg))
            };
        }
        response
            .json()
            .await
            .map_err(|e| RequestError::Transient(format!("cannot parse response: {}", e)))
    }
}

enum RequestError {
    /// Worth retrying: connection failure, 429, 5xx
    Transient(String),
    /// Not worth retrying: auth failure, malformed request
    Fatal(String),
}
