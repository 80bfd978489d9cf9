use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{domain::UserId, error::ApiError, protocol::AssistantMessage};
use tracing::{debug, warn};

use crate::ApiContext;

pub const SYSTEM_PROMPT: &str = "You are a friendly assistant inside a chat app. \
Keep replies short and conversational, one or two paragraphs at most, and match the user's tone.";

pub const FALLBACK_REPLIES: [&str; 5] = [
    "I'm stepping away for a moment. Try me again shortly!",
    "My signal dropped for a second. Could you send that again?",
    "Something went sideways on my end. Give it another go?",
    "I'm a little overloaded right now. Ask me again in a bit.",
    "Hmm, I lost my train of thought. Mind repeating that?",
];

static NEXT_FALLBACK: AtomicUsize = AtomicUsize::new(0);

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Talks to any endpoint that speaks the chat-completions wire format.
pub struct OpenAiCompatibleProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatTurn<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatTurn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build assistant http client")?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatTurn {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatTurn {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.7,
            max_tokens: 150,
        };
        let response: ChatResponse = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("assistant request failed")?
            .error_for_status()
            .context("assistant endpoint returned an error status")?
            .json()
            .await
            .context("assistant response was not valid json")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            bail!("assistant returned no content");
        }
        Ok(content)
    }
}

/// Stand-in used when no API key is configured. Every turn falls back.
pub struct UnconfiguredProvider;

#[async_trait]
impl CompletionProvider for UnconfiguredProvider {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("assistant provider is not configured")
    }
}

pub fn fallback_reply() -> &'static str {
    let index = NEXT_FALLBACK.fetch_add(1, Ordering::Relaxed) % FALLBACK_REPLIES.len();
    FALLBACK_REPLIES[index]
}

/// Produces the assistant's turn for `prompt`. Provider failures degrade to a
/// canned reply flagged `is_fallback`; nothing is persisted either way.
pub async fn assistant_reply(
    ctx: &ApiContext,
    user_id: UserId,
    prompt: &str,
) -> Result<AssistantMessage, ApiError> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(ApiError::validation("message is required"));
    }

    match ctx.assistant.complete(prompt).await {
        Ok(reply) => {
            debug!(user_id = %user_id, "assistant reply generated");
            Ok(AssistantMessage::from_assistant(user_id, reply, false))
        }
        Err(err) => {
            warn!(user_id = %user_id, error = %err, "assistant unavailable, using fallback");
            Ok(AssistantMessage::from_assistant(
                user_id,
                fallback_reply(),
                true,
            ))
        }
    }
}

#[cfg(test)]
#[path = "tests/assistant_tests.rs"]
mod tests;
