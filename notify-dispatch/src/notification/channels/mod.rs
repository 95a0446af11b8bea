//! Delivery channels.
//!
//! Each transport implements [`Channel`]: a validated, immutable
//! configuration plus a `send` that never fails past its boundary. The
//! outcome of every attempt is a [`DeliveryResult`] value; only
//! construction (see [`ChannelRegistry`](super::registry::ChannelRegistry))
//! can fail with a configuration error.
//!
//! - Email (SMTP via lettre)
//! - Push (FCM-style HTTP gateway)
//! - Webhook (HTTP POST/PUT)
//! - SMS (Twilio-compatible REST API)
//! - Telegram Bot API
//! - Discord webhooks
//! - In-app inbox

mod discord;
mod email;
mod in_app;
mod push;
mod sms;
mod telegram;
mod webhook;

pub use discord::{DiscordChannel, DiscordConfig};
pub use email::{EmailChannel, EmailConfig};
pub use in_app::{InAppChannel, InAppConfig, InAppInbox, InAppMessage};
pub use push::{PushChannel, PushConfig};
pub use sms::{SmsChannel, SmsConfig};
pub use telegram::{TelegramChannel, TelegramConfig};
pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::database::models::ChannelKind;

/// Characters of a failed response body kept in error details.
const ERROR_BODY_SNIPPET_CHARS: usize = 512;

/// Trait for delivery channels.
#[async_trait]
pub trait Channel: Send + Sync {
    /// The transport this channel implements.
    fn kind(&self) -> ChannelKind;

    /// Upper bound for one `send`, if the channel's config sets one.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Deliver one message. Transport errors become a failed [`DeliveryResult`].
    async fn send(&self, message: &OutboundMessage) -> DeliveryResult;
}

/// What a channel delivers for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub notification_id: String,
    pub recipient: String,
    pub title: String,
    pub body: String,
    /// Opaque metadata; channels read only the keys they understand.
    pub channel_metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(
        notification_id: impl Into<String>,
        recipient: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        channel_metadata: Value,
    ) -> Self {
        Self {
            notification_id: notification_id.into(),
            recipient: recipient.into(),
            title: title.into(),
            body: body.into(),
            channel_metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Whether a failed attempt is worth retrying.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub message: String,
    /// Transport-assigned message id on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    /// Set on failure only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl DeliveryResult {
    pub fn delivered(message: impl Into<String>, external_id: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            external_id,
            error_details: None,
            failure: None,
        }
    }

    pub fn transient(message: impl Into<String>, error_details: Option<Value>) -> Self {
        Self::failed(FailureKind::Transient, message, error_details)
    }

    pub fn permanent(message: impl Into<String>, error_details: Option<Value>) -> Self {
        Self::failed(FailureKind::Permanent, message, error_details)
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>, error_details: Option<Value>) -> Self {
        Self {
            success: false,
            message: message.into(),
            external_id: None,
            error_details,
            failure: Some(kind),
        }
    }

    pub fn is_permanent_failure(&self) -> bool {
        !self.success && self.failure == Some(FailureKind::Permanent)
    }
}

/// HTTP statuses that may succeed on a later attempt.
pub(crate) fn classify_status(status: StatusCode) -> FailureKind {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

/// Map a `reqwest` send error to a failed result.
pub(crate) fn request_error(channel: &str, err: &reqwest::Error) -> DeliveryResult {
    let (kind, reason) = if err.is_timeout() {
        (FailureKind::Transient, "timeout")
    } else if err.is_connect() {
        (FailureKind::Transient, "connect")
    } else if err.is_builder() {
        (FailureKind::Permanent, "request")
    } else {
        (FailureKind::Transient, "transport")
    };

    DeliveryResult::failed(
        kind,
        format!("{} request failed: {}", channel, err),
        Some(json!({ "reason": reason, "error": err.to_string() })),
    )
}

/// Seconds until a rate limit resets, from `Retry-After` or `X-RateLimit-Reset-After`.
pub(crate) fn retry_after_secs(headers: &HeaderMap) -> Option<f64> {
    ["Retry-After", "X-RateLimit-Reset-After"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok()?.trim().parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
}

/// Build a failed result from a non-success HTTP response.
pub(crate) async fn http_failure(channel: &str, response: reqwest::Response) -> DeliveryResult {
    let status = response.status();
    let retry_after = retry_after_secs(response.headers());
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(ERROR_BODY_SNIPPET_CHARS).collect();

    let mut details = json!({
        "status": status.as_u16(),
        "body": snippet,
    });
    if let Some(secs) = retry_after {
        details["retry_after_secs"] = json!(secs);
    }

    DeliveryResult::failed(
        classify_status(status),
        format!("{} responded with {}", channel, status),
        Some(details),
    )
}

/// Truncate text to `limit` characters, marking the cut.
pub(crate) fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit.saturating_sub(suffix.chars().count());
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

pub(crate) fn validate_timeout(timeout_secs: u64) -> crate::Result<()> {
    if timeout_secs == 0 || timeout_secs > 300 {
        return Err(crate::Error::config(format!(
            "timeout_secs must be between 1 and 300, got {}",
            timeout_secs
        )));
    }
    Ok(())
}

pub(crate) fn validate_http_url(field: &str, value: &str) -> crate::Result<url::Url> {
    let parsed = url::Url::parse(value)
        .map_err(|e| crate::Error::config(format!("{} is not a valid URL: {}", field, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(crate::Error::config(format!(
            "{} must use http or https, got {}",
            field, other
        ))),
    }
}

pub(crate) fn default_timeout_secs() -> u64 {
    30
}
