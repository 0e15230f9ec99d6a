//! Chat-completions-API backend. Single-turn: each question stands alone,
//! conversation state stays with the caller.

use async_trait::async_trait;
use serde_json::json;

use super::types::{AnswerProvider, DispatchError, GenerateContext, ModelFamily};
use super::utils::{ensure_success, relay_sse};

pub struct ChatCompletionProvider {
    client: reqwest::Client,
}

impl ChatCompletionProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnswerProvider for ChatCompletionProvider {
    fn family(&self) -> ModelFamily {
        ModelFamily::ChatCompletion
    }

    async fn generate(&self, ctx: GenerateContext<'_>) -> Result<(), DispatchError> {
        let settings = ctx.settings;
        let body = json!({
            "model": settings.model_name,
            "messages": [{ "role": "user", "content": ctx.session.question }],
            "stream": true,
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", settings.api_host))
            .bearer_auth(&settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(DispatchError::backend)?;

        let response = ensure_success(response).await?;
        relay_sse(response, ctx.sink).await
    }
}
