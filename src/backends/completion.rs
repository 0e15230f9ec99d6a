//! Completions-API backend, parameterized by the live API key and model
//! name from settings.

use async_trait::async_trait;
use serde_json::json;

use super::types::{AnswerProvider, DispatchError, GenerateContext, ModelFamily};
use super::utils::{ensure_success, relay_sse};

const MAX_TOKENS: u32 = 1024;

pub struct CompletionProvider {
    client: reqwest::Client,
}

impl CompletionProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnswerProvider for CompletionProvider {
    fn family(&self) -> ModelFamily {
        ModelFamily::Completion
    }

    async fn generate(&self, ctx: GenerateContext<'_>) -> Result<(), DispatchError> {
        let settings = ctx.settings;
        let body = json!({
            "model": settings.model_name,
            "prompt": ctx.session.question,
            "stream": true,
            "max_tokens": MAX_TOKENS,
        });

        let response = self
            .client
            .post(format!("{}/v1/completions", settings.api_host))
            .bearer_auth(&settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(DispatchError::backend)?;

        let response = ensure_success(response).await?;
        relay_sse(response, ctx.sink).await
    }
}
