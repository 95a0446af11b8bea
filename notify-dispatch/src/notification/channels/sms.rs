//! SMS channel for Twilio-compatible REST APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    Channel, DeliveryResult, OutboundMessage, default_timeout_secs, http_failure, request_error,
    truncate_message, validate_http_url, validate_timeout,
};
use crate::database::models::ChannelKind;
use crate::{Error, Result};

/// Longest body the API accepts (concatenated segments).
const SMS_BODY_LIMIT: usize = 1600;

/// SMS channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    /// Account identifier, also the basic-auth username.
    pub account_sid: String,
    /// API secret, the basic-auth password.
    pub auth_token: String,
    /// Sender number in E.164 format.
    pub from_number: String,
    /// Recipient number in E.164 format.
    pub to_number: String,
    /// API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.twilio.com".to_string()
}

/// `+` followed by 8 to 15 digits.
fn is_e164(number: &str) -> bool {
    number
        .strip_prefix('+')
        .is_some_and(|digits| (8..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit()))
}

impl SmsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.account_sid.trim().is_empty() || self.auth_token.trim().is_empty() {
            return Err(Error::config("sms account_sid and auth_token are required"));
        }
        if !is_e164(&self.from_number) {
            return Err(Error::config(format!(
                "sms from_number is not E.164: {}",
                self.from_number
            )));
        }
        if !is_e164(&self.to_number) {
            return Err(Error::config(format!(
                "sms to_number is not E.164: {}",
                self.to_number
            )));
        }
        validate_http_url("sms api_base", &self.api_base)?;
        validate_timeout(self.timeout_secs)
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base.trim_end_matches('/'),
            self.account_sid
        )
    }
}

/// SMS channel.
pub struct SmsChannel {
    config: SmsConfig,
    client: Client,
}

impl SmsChannel {
    pub fn new(config: SmsConfig, client: Client) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, client })
    }

    fn build_body(message: &OutboundMessage) -> String {
        let text = if message.body.is_empty() {
            message.title.clone()
        } else {
            format!("{}\n{}", message.title, message.body)
        };
        truncate_message(&text, SMS_BODY_LIMIT)
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout_secs))
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let body = Self::build_body(message);
        let form = [
            ("To", self.config.to_number.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", body.as_str()),
        ];

        let response = match self
            .client
            .post(self.config.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(notification_id = %message.notification_id, "SMS request failed: {}", e);
                return request_error("sms", &e);
            }
        };

        if !response.status().is_success() {
            let result = http_failure("sms", response).await;
            warn!(notification_id = %message.notification_id, "{}", result.message);
            return result;
        }

        let sid = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("sid").and_then(Value::as_str).map(str::to_string));

        debug!(notification_id = %message.notification_id, sid = ?sid, "SMS sent");
        DeliveryResult::delivered("sms queued", sid)
    }
}
