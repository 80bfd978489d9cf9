use super::*;
use std::sync::{Arc, Mutex};

use shared::error::ErrorCode;
use storage::Storage;

use crate::auth::AuthConfig;

struct ScriptedProvider {
    reply: Result<String, String>,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        match &self.reply {
            Ok(reply) => Ok(reply.clone()),
            Err(err) => bail!("{err}"),
        }
    }
}

async fn context_with(reply: Result<String, String>) -> (ApiContext, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider {
        reply,
        prompts: Mutex::new(Vec::new()),
    });
    let ctx = ApiContext {
        storage: Storage::new("sqlite::memory:").await.expect("db"),
        auth: AuthConfig {
            jwt_secret: "secret".into(),
            token_ttl_seconds: 60,
            bcrypt_cost: 4,
        },
        assistant: provider.clone(),
    };
    (ctx, provider)
}

#[tokio::test]
async fn reply_comes_from_assistant_persona() {
    let (ctx, provider) = context_with(Ok("Hello there!".into())).await;
    let reply = assistant_reply(&ctx, UserId(3), "  hi bot  ")
        .await
        .expect("reply");

    assert!(reply.is_from_assistant());
    assert_eq!(reply.receiver_id, UserId(3));
    assert_eq!(reply.content, "Hello there!");
    assert!(!reply.is_fallback);
    assert_eq!(
        provider.prompts.lock().expect("prompts lock").as_slice(),
        ["hi bot".to_string()]
    );
}

#[tokio::test]
async fn provider_failure_degrades_to_fallback() {
    let (ctx, _provider) = context_with(Err("timeout".into())).await;
    let reply = assistant_reply(&ctx, UserId(3), "hello")
        .await
        .expect("fallback reply");
    assert!(reply.is_fallback);
    assert!(FALLBACK_REPLIES.contains(&reply.content.as_str()));
}

#[tokio::test]
async fn blank_prompt_is_rejected_before_provider_call() {
    let (ctx, provider) = context_with(Ok("unused".into())).await;
    let err = assistant_reply(&ctx, UserId(3), "   ")
        .await
        .expect_err("blank");
    assert_eq!(err.code, ErrorCode::Validation);
    assert!(provider.prompts.lock().expect("prompts lock").is_empty());
}

#[tokio::test]
async fn unconfigured_provider_always_fails() {
    let err = UnconfiguredProvider.complete("hi").await.expect_err("fails");
    assert!(err.to_string().contains("not configured"));
}

#[test]
fn fallback_replies_rotate() {
    let first = fallback_reply();
    let second = fallback_reply();
    assert!(FALLBACK_REPLIES.contains(&first));
    assert!(FALLBACK_REPLIES.contains(&second));
}

#[test]
fn chat_request_uses_fixed_sampling_parameters() {
    let body = ChatRequest {
        model: "test-model",
        messages: [
            ChatTurn {
                role: "system",
                content: SYSTEM_PROMPT,
            },
            ChatTurn {
                role: "user",
                content: "hey",
            },
        ],
        temperature: 0.7,
        max_tokens: 150,
    };
    let value = serde_json::to_value(&body).expect("json");
    assert_eq!(value["max_tokens"], 150);
    assert_eq!(value["messages"][1]["content"], "hey");
    assert_eq!(value["messages"][0]["role"], "system");
}
