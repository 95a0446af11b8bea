//! Generic webhook channel.
//!
//! Payload: `{title, message, timestamp, channel_metadata}` as JSON, with
//! optional bearer, basic, or custom-header authentication.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    Channel, DeliveryResult, OutboundMessage, default_timeout_secs, http_failure, request_error,
    validate_http_url, validate_timeout,
};
use crate::database::models::ChannelKind;
use crate::database::time::to_iso8601;
use crate::{Error, Result};

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL.
    pub url: String,
    /// HTTP method, POST or PUT (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra static headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Authentication.
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// `Authorization: Basic base64(username:password)`.
    Basic { username: String, password: String },
    /// Arbitrary header.
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: default_method(),
            headers: HashMap::new(),
            auth: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<()> {
        validate_http_url("webhook url", &self.url)?;
        validate_timeout(self.timeout_secs)?;

        if !matches!(self.method.to_ascii_uppercase().as_str(), "POST" | "PUT") {
            return Err(Error::config(format!(
                "webhook method must be POST or PUT, got {}",
                self.method
            )));
        }

        // Header names/values must be representable.
        build_headers(self)?;

        match &self.auth {
            Some(WebhookAuth::Bearer { token }) if token.trim().is_empty() => {
                Err(Error::config("webhook bearer token must not be empty"))
            }
            Some(WebhookAuth::Basic { username, .. }) if username.is_empty() => {
                Err(Error::config("webhook basic auth username must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = name
        .parse::<HeaderName>()
        .map_err(|_| Error::config(format!("invalid header name: {}", name)))?;
    let value = value
        .parse::<HeaderValue>()
        .map_err(|_| Error::config(format!("invalid value for header {}", name)))?;
    Ok((name, value))
}

/// Build the request headers.
fn build_headers(config: &WebhookConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for (name, value) in &config.headers {
        let (name, value) = header_pair(name, value)?;
        headers.insert(name, value);
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    match &config.auth {
        Some(WebhookAuth::Bearer { token }) => {
            let (_, value) = header_pair("authorization", &format!("Bearer {}", token))?;
            headers.insert(AUTHORIZATION, value);
        }
        Some(WebhookAuth::Basic { username, password }) => {
            let encoded = BASE64.encode(format!("{}:{}", username, password));
            let (_, value) = header_pair("authorization", &format!("Basic {}", encoded))?;
            headers.insert(AUTHORIZATION, value);
        }
        Some(WebhookAuth::Header { name, value }) => {
            let (name, value) = header_pair(name, value)?;
            headers.insert(name, value);
        }
        None => {}
    }

    Ok(headers)
}

/// Generic webhook channel.
pub struct WebhookChannel {
    config: WebhookConfig,
    headers: HeaderMap,
    client: Client,
}

impl WebhookChannel {
    /// Create a webhook channel from a validated config.
    pub fn new(config: WebhookConfig, client: Client) -> Result<Self> {
        config.validate()?;
        let headers = build_headers(&config)?;
        Ok(Self {
            config,
            headers,
            client,
        })
    }

    /// Build the JSON payload.
    fn build_payload(&self, message: &OutboundMessage) -> serde_json::Value {
        json!({
            "title": message.title,
            "message": message.body,
            "timestamp": to_iso8601(message.timestamp),
            "channel_metadata": message.channel_metadata,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout_secs))
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let payload = self.build_payload(message);

        let request = if self.config.method.eq_ignore_ascii_case("PUT") {
            self.client.put(&self.config.url)
        } else {
            self.client.post(&self.config.url)
        };

        let response = match request
            .headers(self.headers.clone())
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .body(payload.to_string())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(notification_id = %message.notification_id, "Webhook request failed: {}", e);
                return request_error("webhook", &e);
            }
        };

        if !response.status().is_success() {
            let result = http_failure("webhook", response).await;
            warn!(notification_id = %message.notification_id, "{}", result.message);
            return result;
        }

        let external_id = ["x-message-id", "x-request-id"]
            .iter()
            .find_map(|name| response.headers().get(*name))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(notification_id = %message.notification_id, "Webhook notification sent");
        DeliveryResult::delivered(format!("webhook responded {}", response.status()), external_id)
    }
}
