//! Language-model backends.
//!
//! The engine treats the model as a black box: one prompt string in, one
//! reply string out. Providers speaking the OpenAI chat-completions shape
//! and the Anthropic messages API go through [`HttpModelBackend`];
//! [`EchoBackend`] answers locally for offline runs.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model transport error: {0}")]
    Transport(String),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("model call cancelled by shutdown")]
    Cancelled,

    #[error("model backend misconfigured: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::MalformedResponse(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

/// Something that turns a prompt into a reply.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `echo`, `openai`, `openrouter` or `anthropic`.
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "echo".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: 1000,
            temperature: 0.4,
        }
    }
}

/// Build the backend named by `config.provider`.
pub fn backend_from_config(
    config: &LlmConfig,
    timeout: Duration,
) -> Result<Box<dyn ModelBackend>, BackendError> {
    match config.provider.as_str() {
        "echo" => Ok(Box::new(EchoBackend)),
        "openai" | "openrouter" | "anthropic" => {
            Ok(Box::new(HttpModelBackend::new(config.clone(), timeout)?))
        }
        other => Err(BackendError::Configuration(format!(
            "unknown provider `{other}`"
        ))),
    }
}

pub struct HttpModelBackend {
    config: LlmConfig,
    client: Client,
}

impl HttpModelBackend {
    pub fn new(config: LlmConfig, timeout: Duration) -> Result<Self, BackendError> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(BackendError::Configuration(format!(
                "provider `{}` needs an api key",
                config.provider
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Configuration(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    fn base_url(&self) -> String {
        if let Some(url) = &self.config.base_url {
            return url.trim_end_matches('/').to_string();
        }
        match self.config.provider.as_str() {
            "openrouter" => "https://openrouter.ai/api/v1".to_string(),
            "anthropic" => "https://api.anthropic.com/v1".to_string(),
            _ => "https://api.openai.com/v1".to_string(),
        }
    }

    async fn complete_openai(&self, prompt: &str) -> Result<String, BackendError> {
        let url = format!("{}/chat/completions", self.base_url());
        let request_body = json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key()))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;
        let response_json = checked_json(response).await?;

        openai_content(&response_json)
    }

    async fn complete_anthropic(&self, prompt: &str) -> Result<String, BackendError> {
        let url = format!("{}/messages", self.base_url());
        let request_body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [{ "role": "user", "content": prompt }]
        });

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key())
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;
        let response_json = checked_json(response).await?;

        anthropic_content(&response_json)
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    fn name(&self) -> &str {
        &self.config.provider
    }

    async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        info!(
            "[LLM] Sending prompt to {} ({} chars)",
            self.config.provider,
            prompt.len()
        );
        let reply = match self.config.provider.as_str() {
            "anthropic" => self.complete_anthropic(prompt).await?,
            _ => self.complete_openai(prompt).await?,
        };
        debug!("[LLM] Reply received ({} chars)", reply.len());
        Ok(reply)
    }
}

async fn checked_json(response: reqwest::Response) -> Result<Value, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| BackendError::MalformedResponse(e.to_string()))
}

fn openai_content(response: &Value) -> Result<String, BackendError> {
    response["choices"][0]["message"]["content"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| BackendError::MalformedResponse("missing choices[0].message.content".into()))
}

fn anthropic_content(response: &Value) -> Result<String, BackendError> {
    let blocks = response["content"]
        .as_array()
        .ok_or_else(|| BackendError::MalformedResponse("missing content blocks".into()))?;
    let text: Vec<&str> = blocks
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect();
    if text.is_empty() {
        return Err(BackendError::MalformedResponse(
            "no text content block".into(),
        ));
    }
    Ok(text.join(""))
}

/// Offline backend: answers with the last line of the prompt, never with a
/// directive.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoBackend;

#[async_trait]
impl ModelBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        let last = prompt
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        let message = last.strip_prefix("User:").unwrap_or(last).trim();
        // Braces become parentheses so a typed JSON object is never read
        // back as a change request.
        let message = message.replace('{', "(").replace('}', ")");
        Ok(format!("Echo: {}", message))
    }
}
