//! Context-menu tree and one-shot message relay.
//!
//! Stateless glue around the dispatcher core: builds the two-level menu from
//! static configuration, turns clicks into one-shot messages for the
//! originating tab, and forwards feedback to the web-session backend.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::backends::DispatchError;
use crate::config::{SettingsProvider, MENU_TOOLS};
use crate::credentials::CredentialCache;

/// Id of the menu root; child ids are `<root>-<key>` and the prefix is
/// stripped again on click.
pub const MENU_ROOT_ID: &str = "chatrelay";

const MENU_ROOT_TITLE: &str = "Ask chatrelay";

/// Default URL of the web-session backend's feedback endpoint.
pub const FEEDBACK_ENDPOINT: &str = "https://chat.openai.com/backend-api/conversation/message_feedback";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MenuError {
    /// `selectionTools` and `selectionToolsDesc` are parallel sequences;
    /// the i-th key pairs with the i-th description.
    #[error("selection tools ({keys}) and descriptions ({descriptions}) differ in length")]
    MismatchedSelectionTools { keys: usize, descriptions: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MenuItemKind {
    Normal,
    Separator,
}

/// One node of the context-menu tree, in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub kind: MenuItemKind,
}

/// The full menu tree: root, one child per static tool, a separator, then
/// one child per selection tool from settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MenuTree {
    pub items: Vec<MenuItem>,
}

impl MenuTree {
    pub fn build(
        selection_tools: &[String],
        selection_tools_desc: &[String],
    ) -> Result<MenuTree, MenuError> {
        if selection_tools.len() != selection_tools_desc.len() {
            return Err(MenuError::MismatchedSelectionTools {
                keys: selection_tools.len(),
                descriptions: selection_tools_desc.len(),
            });
        }

        let mut items = Vec::with_capacity(2 + MENU_TOOLS.len() + selection_tools.len());
        items.push(MenuItem {
            id: MENU_ROOT_ID.to_string(),
            title: MENU_ROOT_TITLE.to_string(),
            parent_id: None,
            kind: MenuItemKind::Normal,
        });
        for (key, label) in MENU_TOOLS.iter().copied() {
            items.push(MenuItem {
                id: child_id(key),
                title: label.to_string(),
                parent_id: Some(MENU_ROOT_ID.to_string()),
                kind: MenuItemKind::Normal,
            });
        }
        items.push(MenuItem {
            id: child_id("separator"),
            title: String::new(),
            parent_id: Some(MENU_ROOT_ID.to_string()),
            kind: MenuItemKind::Separator,
        });
        for (key, description) in selection_tools.iter().zip(selection_tools_desc) {
            items.push(MenuItem {
                id: child_id(key),
                title: description.clone(),
                parent_id: Some(MENU_ROOT_ID.to_string()),
                kind: MenuItemKind::Normal,
            });
        }

        Ok(MenuTree { items })
    }
}

fn child_id(key: &str) -> String {
    format!("{}-{}", MENU_ROOT_ID, key)
}

/// Extension-wide one-shot messages. Unlike channel traffic these expect no
/// response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OneShotMessage {
    /// Forward user feedback on an answer to the web-session backend.
    Feedback(serde_json::Value),
    /// Rebuild the whole menu tree from scratch.
    RefreshMenu,
    /// Emitted to the originating tab when a menu item is activated.
    #[serde(rename_all = "camelCase")]
    CreateMenu {
        item_id: String,
        selection_text: String,
    },
}

/// Builds menus on demand and forwards fire-and-forget messages.
pub struct MenuRelay {
    settings: Arc<dyn SettingsProvider>,
    credentials: Arc<CredentialCache>,
    client: reqwest::Client,
    feedback_endpoint: String,
    tree: Mutex<MenuTree>,
}

impl MenuRelay {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        credentials: Arc<CredentialCache>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            settings,
            credentials,
            client,
            feedback_endpoint: FEEDBACK_ENDPOINT.to_string(),
            tree: Mutex::new(MenuTree::default()),
        }
    }

    /// Replace the menu tree wholesale from the current settings. Idempotent;
    /// safe to call at process start and on every `REFRESH_MENU`.
    pub fn rebuild(&self) -> Result<(), MenuError> {
        let settings = self.settings.current();
        let tree = MenuTree::build(&settings.selection_tools, &settings.selection_tools_desc)?;
        *self.tree.lock() = tree;
        Ok(())
    }

    /// Snapshot of the current tree.
    pub fn tree(&self) -> MenuTree {
        self.tree.lock().clone()
    }

    /// Turn a menu activation into the one-shot message for the originating
    /// tab, with the root prefix stripped from the item id.
    pub fn click(&self, item_id: &str, selection_text: &str) -> OneShotMessage {
        let stripped = item_id
            .strip_prefix(MENU_ROOT_ID)
            .map(|rest| rest.trim_start_matches('-'))
            .unwrap_or(item_id);
        OneShotMessage::CreateMenu {
            item_id: stripped.to_string(),
            selection_text: selection_text.to_string(),
        }
    }

    /// Best-effort forward of a feedback payload to the web-session backend,
    /// using the cached (or freshly fetched) credential. Failures are logged
    /// and swallowed.
    pub async fn forward_feedback(&self, payload: serde_json::Value) {
        if let Err(err) = self.try_forward_feedback(payload).await {
            log::warn!("feedback forwarding failed: {}", err);
        }
    }

    async fn try_forward_feedback(
        &self,
        payload: serde_json::Value,
    ) -> Result<(), DispatchError> {
        let credential = self.credentials.get().await?;
        let response = self
            .client
            .post(&self.feedback_endpoint)
            .bearer_auth(credential)
            .json(&payload)
            .send()
            .await
            .map_err(DispatchError::backend)?;
        if !response.status().is_success() {
            return Err(DispatchError::Backend(format!(
                "feedback endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
