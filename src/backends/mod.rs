//! Multi-backend abstraction layer for answer generation.
//!
//! One provider per backend family, behind a common trait, so the session
//! channel handler never branches on model strings itself.

mod chat_completion;
mod completion;
mod custom;
pub(crate) mod types;
pub(crate) mod utils;
mod web_session;

pub use chat_completion::ChatCompletionProvider;
pub use completion::CompletionProvider;
pub use custom::CustomProvider;
pub use types::{
    AnswerProvider, BackendRegistry, DispatchError, GenerateContext, ModelFamily, ABORT_MARKER,
};
pub use web_session::{WebSessionProvider, WEB_SESSION_BASE};

/// Build the default registry with every shipped provider registered,
/// sharing one HTTP client.
pub fn default_registry(client: reqwest::Client) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(std::sync::Arc::new(WebSessionProvider::new(client.clone())));
    registry.register(std::sync::Arc::new(CompletionProvider::new(client.clone())));
    registry.register(std::sync::Arc::new(ChatCompletionProvider::new(
        client.clone(),
    )));
    registry.register(std::sync::Arc::new(CustomProvider::new(client)));
    registry
}
