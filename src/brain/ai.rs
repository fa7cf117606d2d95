//! # brain::ai — เรียก DeepSeek / OpenAI / Claude API
//!
//! เลือก provider ผ่าน `AI_PROVIDER` env var. DeepSeek and OpenAI share the
//! chat-completions wire format; Claude uses the messages API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Env;
use crate::error::InferenceError;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    DeepSeek,
    OpenAi,
    Claude,
}

impl std::fmt::Display for AiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiProvider::DeepSeek => write!(f, "DeepSeek"),
            AiProvider::OpenAi   => write!(f, "OpenAI"),
            AiProvider::Claude   => write!(f, "Claude"),
        }
    }
}

impl std::str::FromStr for AiProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deepseek" => Ok(AiProvider::DeepSeek),
            "openai"   => Ok(AiProvider::OpenAi),
            "claude"   => Ok(AiProvider::Claude),
            other => Err(format!("Unknown AI_PROVIDER: '{other}'. Use 'deepseek', 'openai' or 'claude'")),
        }
    }
}

#[derive(Clone)]
pub struct AiConfig {
    pub provider:    AiProvider,
    /// `None` only allowed in paper mode; every call then fails → HOLD
    pub api_key:     Option<String>,
    pub model:       String,
    pub base_url:    String,
    pub timeout:     Duration,
    pub temperature: f32,
    pub max_tokens:  u32,
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AiConfig {
    pub fn from_env(env: &Env, paper: bool) -> anyhow::Result<Self> {
        let provider: AiProvider = env
            .string_or("AI_PROVIDER", "deepseek")
            .parse()
            .map_err(anyhow::Error::msg)?;

        let api_key = env.get("AI_API_KEY");
        if api_key.is_none() && !paper {
            anyhow::bail!("AI_API_KEY environment variable is required outside paper mode");
        }

        let (default_model, default_url) = match provider {
            AiProvider::DeepSeek => ("deepseek-chat", "https://api.deepseek.com/chat/completions"),
            AiProvider::OpenAi   => ("gpt-4o", "https://api.openai.com/v1/chat/completions"),
            AiProvider::Claude   => ("claude-3-5-sonnet-20241022", "https://api.anthropic.com/v1/messages"),
        };

        Ok(Self {
            provider,
            api_key,
            model:       env.string_or("AI_MODEL", default_model),
            base_url:    env.string_or("AI_BASE_URL", default_url),
            timeout:     env.secs_or("AI_TIMEOUT_SECS", 30)?,
            temperature: env.parse_or("AI_TEMPERATURE", 0.1)?,
            max_tokens:  env.parse_or("AI_MAX_TOKENS", 512)?,
        })
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// One request / one text response. Parsing is the caller's job.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, InferenceError>;

    /// Upper bound the caller should wait for `complete`
    fn timeout(&self) -> Duration;
}

pub struct AiClient {
    http:   reqwest::Client,
    config: AiConfig,
}

impl AiClient {
    pub fn new(http: reqwest::Client, config: AiConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl Inference for AiClient {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, InferenceError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| InferenceError::NotConfigured("AI_API_KEY not set".into()))?;

        match self.config.provider {
            AiProvider::Claude => call_claude(&self.http, &self.config, key, system, prompt).await,
            AiProvider::DeepSeek | AiProvider::OpenAi => {
                call_chat_completions(&self.http, &self.config, key, system, prompt).await
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

// ─── Anthropic Claude ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ClaudeRequest<'a> {
    model:       &'a str,
    max_tokens:  u32,
    temperature: f32,
    system:      &'a str,
    messages:    Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Deserialize)]
struct ClaudeContent {
    #[serde(default)]
    text: String,
}

async fn call_claude(
    client: &reqwest::Client,
    config: &AiConfig,
    key:    &str,
    system: &str,
    prompt: &str,
) -> Result<String, InferenceError> {
    let body = ClaudeRequest {
        model:       &config.model,
        max_tokens:  config.max_tokens,
        temperature: config.temperature,
        system,
        messages:    vec![ChatMessage { role: "user", content: prompt }],
    };

    debug!(model = %config.model, "Calling Claude API...");

    let resp = client
        .post(&config.base_url)
        .header("x-api-key", key)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .timeout(config.timeout)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body   = resp.text().await.unwrap_or_default();
        return Err(InferenceError::Api { status, body });
    }

    let data: ClaudeResponse = resp.json().await?;
    data.content
        .into_iter()
        .map(|c| c.text)
        .find(|t| !t.trim().is_empty())
        .ok_or(InferenceError::Empty)
}

// ─── Chat Completions (DeepSeek / OpenAI) ─────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model:       &'a str,
    messages:    Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens:  u32,
    stream:      bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role:    &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMsg,
}

#[derive(Deserialize)]
struct ChatChoiceMsg {
    content: Option<String>,
}

async fn call_chat_completions(
    client: &reqwest::Client,
    config: &AiConfig,
    key:    &str,
    system: &str,
    prompt: &str,
) -> Result<String, InferenceError> {
    let body = ChatRequest {
        model:       &config.model,
        messages:    vec![
            ChatMessage { role: "system", content: system },
            ChatMessage { role: "user",   content: prompt },
        ],
        temperature: config.temperature,
        max_tokens:  config.max_tokens,
        stream:      false,
    };

    debug!(provider = %config.provider, model = %config.model, "Calling chat-completions API...");

    let resp = client
        .post(&config.base_url)
        .bearer_auth(key)
        .json(&body)
        .timeout(config.timeout)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body   = resp.text().await.unwrap_or_default();
        return Err(InferenceError::Api { status, body });
    }

    let data: ChatResponse = resp.json().await?;
    data.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or(InferenceError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_defaults() {
        let env = Env::from_pairs(&[("AI_PROVIDER", "claude"), ("AI_API_KEY", "k")]);
        let cfg = AiConfig::from_env(&env, false).unwrap();
        assert_eq!(cfg.provider, AiProvider::Claude);
        assert!(cfg.base_url.contains("anthropic"));
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }

    #[test]
    fn key_required_outside_paper() {
        let env = Env::from_pairs(&[("AI_PROVIDER", "deepseek")]);
        assert!(AiConfig::from_env(&env, false).is_err());
        assert!(AiConfig::from_env(&env, true).is_ok());
    }

    #[tokio::test]
    async fn missing_key_fails_without_network() {
        let env = Env::from_pairs(&[]);
        let client = AiClient::new(reqwest::Client::new(), AiConfig::from_env(&env, true).unwrap());
        let err = client.complete("sys", "prompt").await.unwrap_err();
        assert!(matches!(err, InferenceError::NotConfigured(_)));
    }
}
