//! Mobile push channel for FCM-style HTTP gateways.
//!
//! Envelope: `{to, notification: {title, body, sound, badge}, data, priority}`
//! authenticated with `Authorization: key=<server key>`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{
    Channel, DeliveryResult, OutboundMessage, default_timeout_secs, http_failure, request_error,
    validate_http_url, validate_timeout,
};
use crate::database::models::ChannelKind;
use crate::{Error, Result};

/// Gateway per-message errors that will never succeed on retry.
const PERMANENT_GATEWAY_ERRORS: &[&str] = &[
    "InvalidRegistration",
    "NotRegistered",
    "MismatchSenderId",
    "MissingRegistration",
    "InvalidPackageName",
    "MessageTooBig",
    "InvalidDataKey",
];

/// Push channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Device registration token.
    pub device_token: String,
    /// Gateway server key.
    pub server_key: String,
    /// Gateway send endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Notification sound.
    #[serde(default = "default_sound")]
    pub sound: String,
    /// App icon badge count.
    #[serde(default = "default_badge")]
    pub badge: u32,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://fcm.googleapis.com/fcm/send".to_string()
}

fn default_sound() -> String {
    "default".to_string()
}

fn default_badge() -> u32 {
    1
}

impl PushConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device_token.trim().is_empty() {
            return Err(Error::config("push device_token must not be empty"));
        }
        if self.server_key.trim().is_empty() {
            return Err(Error::config("push server_key must not be empty"));
        }
        validate_http_url("push endpoint", &self.endpoint)?;
        validate_timeout(self.timeout_secs)
    }
}

/// Push channel.
pub struct PushChannel {
    config: PushConfig,
    client: Client,
}

impl PushChannel {
    pub fn new(config: PushConfig, client: Client) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, client })
    }

    fn build_payload(&self, message: &OutboundMessage) -> Value {
        json!({
            "to": self.config.device_token,
            "notification": {
                "title": message.title,
                "body": message.body,
                "sound": self.config.sound,
                "badge": self.config.badge,
            },
            "data": message.channel_metadata,
            "priority": "high",
        })
    }
}

/// Interpret a 2xx gateway response body.
fn interpret_gateway_body(body: &Value) -> DeliveryResult {
    let result = body
        .get("results")
        .and_then(Value::as_array)
        .and_then(|results| results.first());

    if let Some(message_id) = result
        .and_then(|r| r.get("message_id"))
        .and_then(Value::as_str)
    {
        return DeliveryResult::delivered("push accepted", Some(message_id.to_string()));
    }

    if let Some(error) = result.and_then(|r| r.get("error")).and_then(Value::as_str) {
        let details = Some(json!({ "gateway_error": error }));
        return if PERMANENT_GATEWAY_ERRORS.contains(&error) {
            DeliveryResult::permanent(format!("push rejected: {}", error), details)
        } else {
            DeliveryResult::transient(format!("push deferred: {}", error), details)
        };
    }

    if body.get("success").and_then(Value::as_u64).unwrap_or(0) > 0 {
        return DeliveryResult::delivered("push accepted", None);
    }

    DeliveryResult::transient(
        "push gateway returned no result",
        Some(json!({ "body": body })),
    )
}

#[async_trait]
impl Channel for PushChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout_secs))
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let payload = self.build_payload(message);

        let response = match self
            .client
            .post(&self.config.endpoint)
            .header(AUTHORIZATION, format!("key={}", self.config.server_key))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(notification_id = %message.notification_id, "Push request failed: {}", e);
                return request_error("push", &e);
            }
        };

        if !response.status().is_success() {
            let result = http_failure("push", response).await;
            warn!(notification_id = %message.notification_id, "{}", result.message);
            return result;
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return DeliveryResult::transient(
                    format!("push gateway returned unreadable body: {}", e),
                    None,
                );
            }
        };

        let result = interpret_gateway_body(&body);
        debug!(
            notification_id = %message.notification_id,
            success = result.success,
            "Push gateway response"
        );
        result
    }
}
