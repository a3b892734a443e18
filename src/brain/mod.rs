//! Generation facade
//!
//! Wraps the provider chain behind a single streaming surface: the session
//! asks for a generation and gets back a [`GenerationHandle`] it can consume
//! token by token or abort on barge-in. Fallback between providers happens
//! inside the chain; the session sees one logical stream.

pub mod providers;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BrainConfig;
pub use providers::{ChatMessage, GenerationProvider, ProviderChain, ProviderError};

/// One event of the logical token stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    Done,
    Error(String),
}

/// Ownership of one in-flight generation. Dropping or aborting the handle
/// cancels the underlying stream task.
pub struct GenerationHandle {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    task: JoinHandle<()>,
}

impl GenerationHandle {
    /// Next stream event; None once the channel closes
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Cancel the in-flight generation
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Streaming LLM facade with system prompt and context injection
pub struct Brain {
    chain: Arc<ProviderChain>,
    system_prompt: String,
    model: String,
}

impl Brain {
    pub fn from_config(config: &BrainConfig) -> Result<Self> {
        let chain = ProviderChain::from_config(config)?;
        info!("Brain initialized (model={})", config.model);
        Ok(Self {
            chain: Arc::new(chain),
            system_prompt: config.system_prompt.clone(),
            model: config.model.clone(),
        })
    }

    #[cfg(test)]
    pub fn with_chain(chain: ProviderChain, system_prompt: &str) -> Self {
        Self {
            chain: Arc::new(chain),
            system_prompt: system_prompt.to_string(),
            model: "test".to_string(),
        }
    }

    /// Assemble the message list: persona, optional context preface, prompt
    fn build_messages(&self, prompt: &str, context_snippets: &[String]) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(&self.system_prompt));
        }
        if !context_snippets.is_empty() {
            let context_text = context_snippets
                .iter()
                .map(|s| format!("- {s}"))
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(ChatMessage::user(format!(
                "Context to consider (recent related notes):\n{context_text}"
            )));
        }
        messages.push(ChatMessage::user(prompt));
        messages
    }

    /// Start a streaming generation. Tokens arrive through the handle as the
    /// provider produces them; the terminal event is `Done` or `Error`.
    pub fn generate_stream(&self, prompt: &str, context_snippets: &[String]) -> GenerationHandle {
        debug!("Generating streaming response for prompt: '{prompt}'");
        let messages = self.build_messages(prompt, context_snippets);
        let chain = Arc::clone(&self.chain);
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let sender = tx.clone();
            let mut on_token = move |token: String| {
                let _ = sender.send(StreamEvent::Token(token));
            };
            match chain.stream(&messages, &mut on_token).await {
                Ok(()) => {
                    let _ = tx.send(StreamEvent::Done);
                }
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(e.to_string()));
                }
            }
        });

        GenerationHandle { rx, task }
    }

    /// Collect a full response (console interface, concise renderings)
    pub async fn generate(&self, prompt: &str, context_snippets: &[String]) -> Result<String> {
        let mut handle = self.generate_stream(prompt, context_snippets);
        let mut response = String::new();
        while let Some(event) = handle.next_event().await {
            match event {
                StreamEvent::Token(token) => response.push_str(&token),
                StreamEvent::Done => break,
                StreamEvent::Error(e) => anyhow::bail!("Generation failed: {e}"),
            }
        }
        Ok(response)
    }

    /// Configured providers, primary first (status reporting)
    pub fn provider_names(&self) -> Vec<String> {
        self.chain.provider_names()
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}
