//! Subscription models and channel kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// Delivery transports a subscription can target.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Push,
    Webhook,
    Sms,
    Telegram,
    Discord,
    InApp,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 7] = [
        Self::Email,
        Self::Push,
        Self::Webhook,
        Self::Sms,
        Self::Telegram,
        Self::Discord,
        Self::InApp,
    ];

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
            .map_err(|_| Error::config(format!("Unknown channel kind: {}", s)))
    }
}

/// Subscription as submitted by subscription management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    pub tenant_id: i64,
    #[serde(default)]
    pub user_id: Option<String>,
    pub event_type: String,
    pub channel_kind: ChannelKind,
    pub channel_config: Value,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_active() -> bool {
    true
}

impl NewSubscription {
    pub fn new(
        tenant_id: i64,
        event_type: impl Into<String>,
        channel_kind: ChannelKind,
        channel_config: Value,
    ) -> Self {
        Self {
            tenant_id,
            user_id: None,
            event_type: event_type.into(),
            channel_kind,
            channel_config,
            filter: None,
            active: true,
            max_attempts: None,
        }
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Partial update. `None` leaves the field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub channel_config: Option<Value>,
    #[serde(default)]
    pub filter: Option<Option<Value>>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub max_attempts: Option<Option<u32>>,
    #[serde(default)]
    pub user_id: Option<Option<String>>,
}

/// Persisted subscription.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionDbModel {
    pub id: String,
    pub tenant_id: i64,
    pub user_id: Option<String>,
    pub event_type: String,
    pub channel_kind: String,
    /// JSON blob, validated by the channel before persisting
    pub channel_config: String,
    /// JSON object predicate over the event payload
    pub filter: Option<String>,
    pub active: bool,
    pub max_attempts: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SubscriptionDbModel {
    pub fn new(sub: &NewSubscription) -> Result<Self> {
        validate_common(&sub.event_type, sub.filter.as_ref(), sub.max_attempts)?;
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::now_v7().to_string(),
            tenant_id: sub.tenant_id,
            user_id: sub.user_id.clone(),
            event_type: sub.event_type.clone(),
            channel_kind: sub.channel_kind.as_str().to_string(),
            channel_config: serde_json::to_string(&sub.channel_config)?,
            filter: sub.filter.as_ref().map(serde_json::to_string).transpose()?,
            active: sub.active,
            max_attempts: sub.max_attempts.map(i64::from),
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a partial update in place. Config validation is the caller's job.
    pub fn apply(&mut self, update: &SubscriptionUpdate) -> Result<()> {
        if let Some(event_type) = &update.event_type {
            self.event_type = event_type.clone();
        }
        if let Some(config) = &update.channel_config {
            self.channel_config = serde_json::to_string(config)?;
        }
        if let Some(filter) = &update.filter {
            self.filter = filter.as_ref().map(serde_json::to_string).transpose()?;
        }
        if let Some(active) = update.active {
            self.active = active;
        }
        if let Some(max_attempts) = update.max_attempts {
            self.max_attempts = max_attempts.map(i64::from);
        }
        if let Some(user_id) = &update.user_id {
            self.user_id = user_id.clone();
        }
        validate_common(
            &self.event_type,
            self.filter_json()?.as_ref(),
            self.max_attempts.map(|m| m.clamp(0, u32::MAX as i64) as u32),
        )?;
        self.updated_at = now_ms();
        Ok(())
    }

    pub fn kind(&self) -> Result<ChannelKind> {
        ChannelKind::parse(&self.channel_kind)
    }

    pub fn config_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.channel_config)?)
    }

    pub fn filter_json(&self) -> Result<Option<Value>> {
        self.filter
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(Error::from)
    }
}

fn validate_common(event_type: &str, filter: Option<&Value>, max_attempts: Option<u32>) -> Result<()> {
    if event_type.trim().is_empty() {
        return Err(Error::validation("event_type must not be empty"));
    }
    if let Some(filter) = filter
        && !filter.is_object()
    {
        return Err(Error::validation("subscription filter must be a JSON object"));
    }
    if max_attempts == Some(0) {
        return Err(Error::validation("max_attempts must be at least 1"));
    }
    Ok(())
}
