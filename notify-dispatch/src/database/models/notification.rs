//! Notification and notification log models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use super::subscription::ChannelKind;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Delivery state of a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Retrying,
    Cancelled,
}

impl NotificationStatus {
    pub const ALL: [NotificationStatus; 5] = [
        Self::Pending,
        Self::Sent,
        Self::Failed,
        Self::Retrying,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
            .map_err(|_| Error::Database(format!("Unknown notification status: {}", s)))
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }
}

/// Persisted notification: one delivery obligation for one target.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    /// Source event; `None` for direct sends.
    pub event_id: Option<String>,
    /// Source subscription; `None` for direct sends.
    pub subscription_id: Option<String>,
    pub tenant_id: i64,
    pub event_type: String,
    pub channel_kind: String,
    /// Snapshot of the target config at creation time
    pub channel_config: String,
    pub recipient: String,
    pub title: String,
    pub body: String,
    /// JSON object passed through to the channel
    pub channel_metadata: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub sent_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub external_id: Option<String>,
    pub last_error: Option<String>,
    #[serde(skip_serializing)]
    pub claim_token: Option<String>,
    #[serde(skip_serializing)]
    pub claimed_until: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Content and target of a notification about to be created.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub tenant_id: i64,
    pub event_type: String,
    pub channel_kind: ChannelKind,
    pub channel_config: Value,
    pub recipient: String,
    pub title: String,
    pub body: String,
    pub channel_metadata: Value,
    pub max_attempts: u32,
}

impl NotificationDbModel {
    pub fn new(draft: &NotificationDraft) -> Result<Self> {
        if draft.max_attempts == 0 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::now_v7().to_string(),
            event_id: None,
            subscription_id: None,
            tenant_id: draft.tenant_id,
            event_type: draft.event_type.clone(),
            channel_kind: draft.channel_kind.as_str().to_string(),
            channel_config: serde_json::to_string(&draft.channel_config)?,
            recipient: draft.recipient.clone(),
            title: draft.title.clone(),
            body: draft.body.clone(),
            channel_metadata: serde_json::to_string(&draft.channel_metadata)?,
            status: NotificationStatus::Pending.as_str().to_string(),
            attempts: 0,
            max_attempts: i64::from(draft.max_attempts),
            last_attempt_at: None,
            next_retry_at: None,
            sent_at: None,
            failed_at: None,
            cancelled_at: None,
            external_id: None,
            last_error: None,
            claim_token: None,
            claimed_until: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_source(mut self, event_id: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self.subscription_id = Some(subscription_id.into());
        self
    }

    /// Mark the row as owned by `token` until `until_ms`.
    pub fn with_claim(mut self, token: impl Into<String>, until_ms: i64) -> Self {
        self.claim_token = Some(token.into());
        self.claimed_until = Some(until_ms);
        self
    }

    pub fn status(&self) -> Result<NotificationStatus> {
        NotificationStatus::parse(&self.status)
    }

    pub fn kind(&self) -> Result<ChannelKind> {
        ChannelKind::parse(&self.channel_kind)
    }

    pub fn config_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.channel_config)?)
    }

    pub fn metadata_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.channel_metadata)?)
    }
}

/// Append-only record of one attempt or one state transition.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationLogDbModel {
    pub id: String,
    pub notification_id: String,
    /// Attempt number described by this row; 0 for non-attempt transitions.
    pub attempt: i64,
    pub status_at_attempt: String,
    pub message: String,
    /// JSON blob
    pub error_details: Option<String>,
    pub created_at: i64,
}

impl NotificationLogDbModel {
    pub fn new(
        notification_id: impl Into<String>,
        attempt: i64,
        status: NotificationStatus,
        message: impl Into<String>,
        error_details: Option<&Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            notification_id: notification_id.into(),
            attempt,
            status_at_attempt: status.as_str().to_string(),
            message: message.into(),
            error_details: error_details.map(Value::to_string),
            created_at: now_ms(),
        }
    }
}

/// Filters for notification queries. All set fields are conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilters {
    #[serde(default)]
    pub tenant_id: Option<i64>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub channel_kind: Option<ChannelKind>,
    #[serde(default)]
    pub status: Option<NotificationStatus>,
    /// Inclusive lower bound on `created_at` (epoch ms).
    #[serde(default)]
    pub created_from: Option<i64>,
    /// Exclusive upper bound on `created_at` (epoch ms).
    #[serde(default)]
    pub created_to: Option<i64>,
}

/// Notification counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
}

impl NotificationStats {
    pub fn total(&self) -> u64 {
        self.pending + self.sent + self.failed + self.retrying + self.cancelled
    }

    pub(crate) fn add(&mut self, status: NotificationStatus, count: u64) {
        match status {
            NotificationStatus::Pending => self.pending += count,
            NotificationStatus::Sent => self.sent += count,
            NotificationStatus::Failed => self.failed += count,
            NotificationStatus::Retrying => self.retrying += count,
            NotificationStatus::Cancelled => self.cancelled += count,
        }
    }
}
