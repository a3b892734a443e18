//! Generation providers
//!
//! Each provider turns a message list into a stream of tokens delivered
//! through a callback, the same shape for a local Ollama endpoint and an
//! OpenAI-compatible SSE endpoint. The chain walks providers in order and
//! falls through on failures that happen before the first token; once tokens
//! have flowed, a failure surfaces as a terminal stream error instead of a
//! silent restart from another provider.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BrainConfig;

/// One message in a generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Provider failure surface
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("stream decode failed: {0}")]
    Decode(String),
}

/// Token-stream generation backend
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> String;

    /// Stream one completion, invoking `on_token` for each text chunk.
    /// Returns once the provider signals completion.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), ProviderError>;
}

/// Ollama chat endpoint (NDJSON streaming)
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaProvider {
    fn name(&self) -> String {
        format!("ollama/{}", self.model)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), ProviderError> {
        let request = OllamaRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Request(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // One JSON object per line
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }

                let parsed: OllamaChunk = serde_json::from_str(&line)
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                if let Some(error) = parsed.error {
                    return Err(ProviderError::Api {
                        status: 200,
                        body: error,
                    });
                }
                if let Some(message) = parsed.message {
                    if !message.content.is_empty() {
                        on_token(message.content);
                    }
                }
                if parsed.done {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// OpenAI-compatible chat completions endpoint (SSE streaming)
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct SseChunk {
    choices: Vec<SseChoice>,
}

#[derive(Deserialize)]
struct SseChoice {
    delta: SseDelta,
}

#[derive(Deserialize)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    fn name(&self) -> String {
        format!("openai/{}", self.model)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), ProviderError> {
        use reqwest_eventsource::{Event, EventSource};

        let request = OpenAiRequest {
            model: &self.model,
            messages,
            stream: true,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let mut source =
            EventSource::new(builder).map_err(|e| ProviderError::Request(e.to_string()))?;

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => debug!("SSE stream opened"),
                Ok(Event::Message(message)) => {
                    if message.data == "[DONE]" {
                        source.close();
                        return Ok(());
                    }
                    let parsed: SseChunk = serde_json::from_str(&message.data)
                        .map_err(|e| ProviderError::Decode(e.to_string()))?;
                    if let Some(choice) = parsed.choices.first() {
                        if let Some(ref content) = choice.delta.content {
                            if !content.is_empty() {
                                on_token(content.clone());
                            }
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    source.close();
                    return Ok(());
                }
                Err(e) => {
                    source.close();
                    return Err(ProviderError::Request(e.to_string()));
                }
            }
        }

        Ok(())
    }
}

/// Ordered provider chain walked on pre-token failure
pub struct ProviderChain {
    providers: Vec<Box<dyn GenerationProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Box<dyn GenerationProvider>>) -> Self {
        Self { providers }
    }

    /// Build the chain from config: primary first, then configured
    /// fallbacks, with a default Ollama tail when the primary is remote.
    pub fn from_config(config: &BrainConfig) -> Result<Self, ProviderError> {
        let mut providers: Vec<Box<dyn GenerationProvider>> = Vec::new();
        providers.push(build_provider(&config.provider, &config.model, config)?);

        for entry in &config.fallback {
            match build_provider(&entry.provider, &entry.model, config) {
                Ok(provider) => providers.push(provider),
                Err(e) => warn!(
                    "Skipping fallback provider {}: {e}",
                    entry.provider
                ),
            }
        }

        let has_ollama = config.provider == "ollama"
            || config.fallback.iter().any(|f| f.provider == "ollama");
        if !has_ollama {
            providers.push(build_provider("ollama", "qwen3:4b", config)?);
        }

        info!(
            "Provider chain: {}",
            providers
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(Self { providers })
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Stream through the chain. Fallback happens only before the first
    /// token; later failures are reported to the caller.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        on_token: &mut (dyn FnMut(String) + Send),
    ) -> Result<(), ProviderError> {
        let mut last_error = None;

        for (i, provider) in self.providers.iter().enumerate() {
            let mut emitted = 0u64;
            let mut counting = |token: String| {
                emitted += 1;
                on_token(token);
            };

            match provider.stream(messages, &mut counting).await {
                Ok(()) => {
                    if i > 0 {
                        info!("Fallback provider {} succeeded", provider.name());
                    }
                    return Ok(());
                }
                Err(e) => {
                    if emitted == 0 && i + 1 < self.providers.len() {
                        warn!(
                            "Provider {} failed before first token ({e}); trying next",
                            provider.name()
                        );
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::Request("no providers configured".to_string())))
    }
}

fn build_provider(
    kind: &str,
    model: &str,
    config: &BrainConfig,
) -> Result<Box<dyn GenerationProvider>, ProviderError> {
    match kind {
        "ollama" => Ok(Box::new(OllamaProvider::new(
            &config.ollama_url,
            model,
            config.timeout_secs,
        )?)),
        "openai" => Ok(Box::new(OpenAiProvider::new(
            &config.openai_url,
            model,
            config.openai_api_key.clone(),
            config.timeout_secs,
        )?)),
        other => Err(ProviderError::Request(format!(
            "unknown provider type '{other}'"
        ))),
    }
}
