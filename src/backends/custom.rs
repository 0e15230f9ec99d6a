//! Custom backend: a user-supplied, completion-shaped endpoint.

use async_trait::async_trait;
use serde_json::json;

use super::types::{AnswerProvider, DispatchError, GenerateContext, ModelFamily};
use super::utils::{ensure_success, relay_sse};

pub struct CustomProvider {
    client: reqwest::Client,
}

impl CustomProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnswerProvider for CustomProvider {
    fn family(&self) -> ModelFamily {
        ModelFamily::Custom
    }

    async fn generate(&self, ctx: GenerateContext<'_>) -> Result<(), DispatchError> {
        let settings = ctx.settings;
        let endpoint = settings
            .custom_endpoint
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                DispatchError::Backend("no custom endpoint configured".to_string())
            })?;

        let body = json!({
            "model": settings.custom_model,
            "prompt": ctx.session.question,
            "stream": true,
        });

        let mut request = self.client.post(endpoint).json(&body);
        if !settings.api_key.is_empty() {
            request = request.bearer_auth(&settings.api_key);
        }

        let response = request.send().await.map_err(DispatchError::backend)?;
        let response = ensure_success(response).await?;
        relay_sse(response, ctx.sink).await
    }
}
