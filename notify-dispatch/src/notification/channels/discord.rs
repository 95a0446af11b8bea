//! Discord webhook channel.
//!
//! Posts one embed per notification. A 429 reply is a transient failure with
//! the `Retry-After` hint kept in the error details.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    Channel, DeliveryResult, OutboundMessage, default_timeout_secs, http_failure, request_error,
    truncate_message, validate_http_url, validate_timeout,
};
use crate::database::models::ChannelKind;
use crate::database::time::to_iso8601;
use crate::Result;

/// Discord embed description limit.
const EMBED_DESCRIPTION_LIMIT: usize = 4096;

/// Discord channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Discord webhook URL.
    pub webhook_url: String,
    /// Optional username for the webhook.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional avatar URL for the webhook.
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Embed color (default: blue).
    #[serde(default = "default_color")]
    pub color: u32,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_color() -> u32 {
    0x3498db
}

impl DiscordConfig {
    pub fn validate(&self) -> Result<()> {
        validate_http_url("discord webhook_url", &self.webhook_url)?;
        if let Some(avatar_url) = &self.avatar_url {
            validate_http_url("discord avatar_url", avatar_url)?;
        }
        validate_timeout(self.timeout_secs)
    }
}

/// Discord channel.
pub struct DiscordChannel {
    config: DiscordConfig,
    client: Client,
}

impl DiscordChannel {
    pub fn new(config: DiscordConfig, client: Client) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, client })
    }

    /// Build the webhook payload.
    fn build_payload(&self, message: &OutboundMessage) -> serde_json::Value {
        let footer = message
            .channel_metadata
            .get("event_type")
            .and_then(|v| v.as_str())
            .map(|event_type| format!("Type: {}", event_type))
            .unwrap_or_else(|| "notify-dispatch".to_string());

        let embed = json!({
            "title": message.title,
            "description": truncate_message(&message.body, EMBED_DESCRIPTION_LIMIT),
            "color": self.config.color,
            "timestamp": to_iso8601(message.timestamp),
            "footer": { "text": footer }
        });

        let mut payload = json!({
            "embeds": [embed]
        });

        if let Some(username) = &self.config.username {
            payload["username"] = json!(username);
        }
        if let Some(avatar_url) = &self.config.avatar_url {
            payload["avatar_url"] = json!(avatar_url);
        }

        payload
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Discord
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout_secs))
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let payload = self.build_payload(message);

        let response = match self
            .client
            .post(&self.config.webhook_url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(notification_id = %message.notification_id, "Discord request failed: {}", e);
                return request_error("discord", &e);
            }
        };

        if !response.status().is_success() {
            let result = http_failure("discord", response).await;
            warn!(notification_id = %message.notification_id, "{}", result.message);
            return result;
        }

        debug!(notification_id = %message.notification_id, "Discord notification sent");
        DeliveryResult::delivered("discord webhook accepted", None)
    }
}
