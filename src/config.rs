//! User configuration as consumed by the dispatcher.
//!
//! Settings are owned and persisted by the extension's options page; this
//! crate only ever reads a snapshot of them. Field names mirror the JSON the
//! extension stores, so a snapshot deserializes straight out of storage.

use serde::{Deserialize, Serialize};

/// Static tool catalog for the root context menu: (key, label) pairs in
/// display order. Keys double as menu item ids (prefixed, see `menu`).
pub static MENU_TOOLS: &[(&str, &str)] = &[
    ("explain", "Explain"),
    ("summarize", "Summarize"),
    ("rewrite", "Rewrite"),
    ("translate", "Translate"),
    ("grammar", "Fix Grammar"),
];

/// Snapshot of the user's settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Model key selecting the backend family (see `backends::ModelFamily`).
    pub model_name: String,
    /// API key for the token-authenticated families. Read live on every
    /// request, never cached.
    #[serde(default)]
    pub api_key: String,
    /// Host for the token-authenticated families.
    #[serde(default = "default_api_host")]
    pub api_host: String,
    /// Bearer token for the web-session family when no ambient cookie
    /// session is available (see `Environment::Standalone`).
    #[serde(default)]
    pub access_token: Option<String>,
    /// Model name sent to the custom endpoint.
    #[serde(default)]
    pub custom_model: Option<String>,
    /// Fully qualified URL of the custom completion endpoint.
    #[serde(default)]
    pub custom_endpoint: Option<String>,
    /// Selection-tool prompt keys shown below the separator in the context
    /// menu. Parallel to `selection_tools_desc`.
    #[serde(default)]
    pub selection_tools: Vec<String>,
    /// Human-readable labels for `selection_tools`, index for index.
    #[serde(default)]
    pub selection_tools_desc: Vec<String>,
}

fn default_api_host() -> String {
    "https://api.openai.com".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_name: String::new(),
            api_key: String::new(),
            api_host: default_api_host(),
            access_token: None,
            custom_model: None,
            custom_endpoint: None,
            selection_tools: Vec::new(),
            selection_tools_desc: Vec::new(),
        }
    }
}

/// Source of the current settings snapshot.
///
/// The dispatcher resolves settings once per request cycle so that an
/// options-page change takes effect on the next question without a restart.
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> Settings;
}

/// Fixed snapshot provider. Used by embedders that resolve settings
/// out-of-band and by tests.
pub struct StaticSettings(pub Settings);

impl SettingsProvider for StaticSettings {
    fn current(&self) -> Settings {
        self.0.clone()
    }
}
