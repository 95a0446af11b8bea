//! In-app channel: a bounded per-user inbox held in process memory.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Channel, DeliveryResult, OutboundMessage};
use crate::Result;
use crate::database::models::ChannelKind;

/// Messages kept per user before the oldest are dropped.
const DEFAULT_INBOX_CAPACITY: usize = 200;

/// Broadcast buffer for live listeners.
const LIVE_CHANNEL_CAPACITY: usize = 256;

/// In-app channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InAppConfig {
    /// Target user. Falls back to the subscription's user when unset.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl InAppConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(user_id) = &self.user_id
            && user_id.trim().is_empty()
        {
            return Err(crate::Error::config("in_app user_id must not be blank"));
        }
        Ok(())
    }
}

/// One inbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InAppMessage {
    pub notification_id: String,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Per-user inboxes shared by every in-app channel instance.
pub struct InAppInbox {
    inboxes: DashMap<String, VecDeque<InAppMessage>>,
    capacity: usize,
    live_tx: broadcast::Sender<InAppMessage>,
}

impl Default for InAppInbox {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY)
    }
}

impl InAppInbox {
    pub fn new(capacity: usize) -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            inboxes: DashMap::new(),
            capacity: capacity.max(1),
            live_tx,
        }
    }

    /// Append a message, dropping the oldest past capacity. Redelivery of the
    /// same notification replaces nothing and is ignored.
    pub fn push(&self, message: InAppMessage) -> bool {
        let mut inbox = self.inboxes.entry(message.user_id.clone()).or_default();
        if inbox
            .iter()
            .any(|m| m.notification_id == message.notification_id)
        {
            return false;
        }
        inbox.push_back(message.clone());
        while inbox.len() > self.capacity {
            inbox.pop_front();
        }
        drop(inbox);

        // No listeners is fine.
        let _ = self.live_tx.send(message);
        true
    }

    /// Messages for a user, oldest first.
    pub fn messages(&self, user_id: &str) -> Vec<InAppMessage> {
        self.inboxes
            .get(user_id)
            .map(|inbox| inbox.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return all messages for a user.
    pub fn drain(&self, user_id: &str) -> Vec<InAppMessage> {
        self.inboxes
            .remove(user_id)
            .map(|(_, inbox)| inbox.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, user_id: &str) -> usize {
        self.inboxes.get(user_id).map(|i| i.len()).unwrap_or(0)
    }

    /// Subscribe to messages as they arrive.
    pub fn subscribe(&self) -> broadcast::Receiver<InAppMessage> {
        self.live_tx.subscribe()
    }
}

/// In-app channel.
pub struct InAppChannel {
    inbox: Arc<InAppInbox>,
}

impl InAppChannel {
    pub fn new(config: InAppConfig, inbox: Arc<InAppInbox>) -> Result<Self> {
        config.validate()?;
        Ok(Self { inbox })
    }
}

#[async_trait]
impl Channel for InAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let entry = InAppMessage {
            notification_id: message.notification_id.clone(),
            user_id: message.recipient.clone(),
            title: message.title.clone(),
            body: message.body.clone(),
            metadata: message.channel_metadata.clone(),
            created_at: message.timestamp,
        };

        let stored = self.inbox.push(entry);
        debug!(
            notification_id = %message.notification_id,
            user_id = %message.recipient,
            stored,
            "In-app notification delivered"
        );
        DeliveryResult::delivered(
            if stored {
                "stored in inbox"
            } else {
                "already in inbox"
            },
            Some(message.notification_id.clone()),
        )
    }
}
