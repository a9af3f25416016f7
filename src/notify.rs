//! Push notifications, notification clicks and background sync.

use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::{NotificationConfig, SiteConfig};
use crate::error::{Error, Result};

/// Payload of a push message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub primary_key: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// Arrival time in milliseconds since the Unix epoch.
    pub date_of_arrival: i64,
    pub primary_key: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// Notification the host should display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

/// Action identifier that opens the site.
pub const EXPLORE_ACTION: &str = "explore";
/// Action identifier that only dismisses the notification.
pub const CLOSE_ACTION: &str = "close";

/// Builds the notification for a push message. An empty payload shows nothing.
///
/// # Errors
///
/// Returns [`Error::Message`] if the payload is not valid JSON.
pub fn notification_from_push(
    config: &NotificationConfig,
    data: &[u8],
) -> Result<Option<Notification>> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let payload: PushPayload =
        serde_json::from_slice(data).map_err(|e| Error::Message(e.to_string()))?;

    let action = |action: &str, title: &str| NotificationAction {
        action: action.to_string(),
        title: title.to_string(),
        icon: config.action_icon.clone(),
    };

    Ok(Some(Notification {
        title: payload.title,
        body: payload.body,
        icon: config.icon.clone(),
        badge: config.badge.clone(),
        vibrate: config.vibrate.clone(),
        data: NotificationData {
            date_of_arrival: Utc::now().timestamp_millis(),
            primary_key: payload.primary_key,
        },
        actions: vec![
            action(EXPLORE_ACTION, &config.explore_title),
            action(CLOSE_ACTION, &config.close_title),
        ],
    }))
}

/// What the host should do after a notification click. The notification
/// itself is always closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientAction {
    OpenWindow { url: String },
    Close,
}

/// Handles a click on a notification or one of its action buttons.
///
/// # Errors
///
/// Returns an error if the configured open path cannot be resolved.
pub fn handle_notification_click(site: &SiteConfig, action: Option<&str>) -> Result<ClientAction> {
    if action == Some(EXPLORE_ACTION) {
        let url: Url = site.resolve(&site.notifications.open_path)?;
        return Ok(ClientAction::OpenWindow { url: url.into() });
    }
    Ok(ClientAction::Close)
}

/// Handles a background sync event. Returns true if the tag was ours and
/// the sync ran.
pub async fn handle_sync(config: &NotificationConfig, tag: &str) -> bool {
    if tag != config.sync_tag {
        log::debug!("Ignoring sync tag {tag}");
        return false;
    }
    run_background_sync().await;
    true
}

async fn run_background_sync() {
    // No queued work yet: the contact form does not post anything offline.
    log::info!("Running background sync");
}
