//! Telegram Bot API channel.
//!
//! Sends messages via `POST /bot<token>/sendMessage`. A 429 reply is a
//! transient failure; `parameters.retry_after` from the body is kept in the
//! error details.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{
    Channel, DeliveryResult, OutboundMessage, classify_status, default_timeout_secs,
    request_error, truncate_message, validate_http_url, validate_timeout,
};
use crate::database::models::ChannelKind;
use crate::{Error, Result};

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram Bot API token.
    pub bot_token: String,
    /// Target chat ID (user, group, or channel).
    pub chat_id: String,
    /// Parse mode for message formatting (HTML, Markdown, MarkdownV2).
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_parse_mode() -> String {
    "HTML".to_string()
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            parse_mode: default_parse_mode(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl TelegramConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bot_token.trim().is_empty() {
            return Err(Error::config("telegram bot_token must not be empty"));
        }
        if self.chat_id.trim().is_empty() {
            return Err(Error::config("telegram chat_id must not be empty"));
        }
        if !matches!(self.parse_mode.as_str(), "HTML" | "Markdown" | "MarkdownV2") {
            return Err(Error::config(format!(
                "telegram parse_mode must be HTML, Markdown or MarkdownV2, got {}",
                self.parse_mode
            )));
        }
        validate_http_url("telegram api_base", &self.api_base)?;
        validate_timeout(self.timeout_secs)
    }
}

/// Telegram channel.
pub struct TelegramChannel {
    config: TelegramConfig,
    client: Client,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, client: Client) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, client })
    }

    /// Build the message text.
    fn build_message(&self, message: &OutboundMessage) -> String {
        let title = &message.title;
        let body = &message.body;

        let text = if self.config.parse_mode == "HTML" {
            format!("\u{1f514} <b>{title}</b>\n\n{body}")
        } else {
            format!("\u{1f514} *{title}*\n\n{body}")
        };

        truncate_message(&text, TELEGRAM_MESSAGE_LIMIT)
    }

    fn send_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout_secs))
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": self.build_message(message),
            "parse_mode": self.config.parse_mode,
        });

        let response = match self
            .client
            .post(self.send_url())
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(notification_id = %message.notification_id, "Telegram request failed: {}", e);
                return request_error("telegram", &e);
            }
        };

        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();

        if status.is_success() && body.get("ok").and_then(Value::as_bool) != Some(false) {
            let message_id = body
                .pointer("/result/message_id")
                .and_then(Value::as_i64)
                .map(|id| id.to_string());
            debug!(notification_id = %message.notification_id, "Telegram notification sent");
            return DeliveryResult::delivered("telegram message sent", message_id);
        }

        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let mut details = json!({
            "status": status.as_u16(),
            "description": description,
        });
        if status == StatusCode::TOO_MANY_REQUESTS
            && let Some(retry_after) = body.pointer("/parameters/retry_after").and_then(Value::as_u64)
        {
            details["retry_after_secs"] = json!(retry_after);
        }

        warn!(
            notification_id = %message.notification_id,
            "Telegram sendMessage failed: {} - {}", status, description
        );
        DeliveryResult::failed(
            classify_status(status),
            format!("telegram sendMessage failed: {} - {}", status, description),
            Some(details),
        )
    }
}
