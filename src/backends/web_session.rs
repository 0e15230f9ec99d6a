//! Web-session backend: the chat service's own conversation endpoint,
//! authenticated with the bearer credential from the cache.

use async_trait::async_trait;
use serde_json::json;

use super::types::{AnswerProvider, DispatchError, GenerateContext, ModelFamily};
use super::utils::{ensure_success, relay_sse};

/// Default base of the chat service's private API.
pub const WEB_SESSION_BASE: &str = "https://chat.openai.com/backend-api";

/// Model slug the conversation endpoint expects; unrelated to the extension's
/// own model keys.
const UPSTREAM_MODEL: &str = "text-davinci-002-render-sha";

pub struct WebSessionProvider {
    client: reqwest::Client,
    base_url: String,
}

impl WebSessionProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, WEB_SESSION_BASE.to_string())
    }

    pub fn with_base_url(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl AnswerProvider for WebSessionProvider {
    fn family(&self) -> ModelFamily {
        ModelFamily::WebSession
    }

    async fn generate(&self, ctx: GenerateContext<'_>) -> Result<(), DispatchError> {
        let credential = ctx.credential.ok_or(DispatchError::Unauthorized)?;
        let session = ctx.session;

        let mut body = json!({
            "action": "next",
            "messages": [{
                "id": session.message_id,
                "role": "user",
                "content": {
                    "content_type": "text",
                    "parts": [session.question],
                },
            }],
            "model": UPSTREAM_MODEL,
            "parent_message_id": session.parent_message_id,
        });
        // Continuing a conversation the service already knows about.
        if let Some(conversation_id) = session.extra.get("conversationId") {
            body["conversation_id"] = conversation_id.clone();
        }

        let response = self
            .client
            .post(format!("{}/conversation", self.base_url))
            .bearer_auth(credential)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(DispatchError::backend)?;

        let response = ensure_success(response).await?;
        relay_sse(response, ctx.sink).await
    }
}
