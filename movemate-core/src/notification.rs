use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub title: String,
    pub messages: Vec<String>,
    pub links: Vec<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            messages: vec![message.into()],
            links: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.links.push(link.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// Change to the feed of shipments drivers can pick up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedUpdate {
    pub tracking_number: String,
    pub available: bool,
}

/// Fire-and-forget delivery. Callers log and swallow errors; a failed
/// notification never rolls back a committed state transition.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: Uuid, notification: Notification) -> CoreResult<()>;

    async fn notify_admins(&self, notification: Notification) -> CoreResult<()>;

    async fn push_fcm(&self, token: &str, payload: PushPayload) -> CoreResult<()>;

    async fn publish_feed(&self, update: FeedUpdate) -> CoreResult<()>;
}
