//! Push payloads and the notifications they produce.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Push message body. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub tag: Option<String>,
    pub url: Option<String>,
}

impl PushPayload {
    /// Parse push data. Data that is not a JSON object becomes the body.
    pub fn parse(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(data).unwrap_or_else(|e| {
            debug!(error = %e, "Push data is not JSON, using it as the body");
            Self {
                body: Some(String::from_utf8_lossy(data).into_owned()),
                ..Self::default()
            }
        })
    }
}

/// A notification shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: u64,
    pub title: String,
    pub body: String,
    pub icon: Option<Url>,
    pub tag: Option<String>,
    /// Page opened or focused when the notification is clicked.
    pub url: Url,
}

impl Notification {
    pub(crate) fn next_id() -> u64 {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: RwLock<Vec<Notification>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notification. One with the same tag is replaced.
    pub async fn show(&self, notification: Notification) {
        let mut shown = self.shown.write().await;
        if let Some(tag) = &notification.tag {
            shown.retain(|n| n.tag.as_ref() != Some(tag));
        }
        shown.push(notification);
    }

    /// Close a notification.
    pub async fn close(&self, id: u64) -> Option<Notification> {
        let mut shown = self.shown.write().await;
        let index = shown.iter().position(|n| n.id == id)?;
        Some(shown.remove(index))
    }

    /// Look up a notification.
    pub async fn get(&self, id: u64) -> Option<Notification> {
        self.shown.read().await.iter().find(|n| n.id == id).cloned()
    }

    /// Every shown notification, oldest first.
    pub async fn list(&self) -> Vec<Notification> {
        self.shown.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(tag: Option<&str>, title: &str) -> Notification {
        Notification {
            id: Notification::next_id(),
            title: title.to_string(),
            body: String::new(),
            icon: None,
            tag: tag.map(str::to_string),
            url: Url::parse("https://app.test/").unwrap(),
        }
    }

    #[test]
    fn test_parse_payload() {
        let payload = PushPayload::parse(br#"{"title":"Hi","url":"./inbox"}"#);
        assert_eq!(payload.title.as_deref(), Some("Hi"));
        assert_eq!(payload.url.as_deref(), Some("./inbox"));
        assert!(payload.body.is_none());
    }

    #[test]
    fn test_parse_non_json_payload_becomes_body() {
        let payload = PushPayload::parse(b"plain words");
        assert_eq!(payload.body.as_deref(), Some("plain words"));
        assert_eq!(PushPayload::parse(b""), PushPayload::default());
    }

    #[test]
    fn test_notification_serializes_urls_as_strings() {
        let mut n = notification(Some("chat"), "Hi");
        n.icon = Some(Url::parse("https://app.test/icon.png").unwrap());

        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["url"], "https://app.test/");
        assert_eq!(json["icon"], "https://app.test/icon.png");
        assert_eq!(json["tag"], "chat");
    }

    #[tokio::test]
    async fn test_tag_replaces_notification() {
        let notifications = Notifications::new();
        notifications.show(notification(Some("chat"), "one")).await;
        notifications.show(notification(None, "untagged")).await;
        notifications.show(notification(Some("chat"), "two")).await;

        let titles: Vec<String> = notifications
            .list()
            .await
            .into_iter()
            .map(|n| n.title)
            .collect();
        assert_eq!(titles, vec!["untagged", "two"]);
    }

    #[tokio::test]
    async fn test_close() {
        let notifications = Notifications::new();
        let n = notification(None, "x");
        let id = n.id;
        notifications.show(n).await;

        assert!(notifications.get(id).await.is_some());
        assert!(notifications.close(id).await.is_some());
        assert!(notifications.close(id).await.is_none());
        assert!(notifications.list().await.is_empty());
    }
}
