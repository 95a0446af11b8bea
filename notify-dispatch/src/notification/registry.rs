//! Channel registry: the single place channel kinds are wired to implementations.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::channels::{
    Channel, DiscordChannel, DiscordConfig, EmailChannel, EmailConfig, InAppChannel, InAppConfig,
    InAppInbox, PushChannel, PushConfig, SmsChannel, SmsConfig, TelegramChannel, TelegramConfig,
    WebhookChannel, WebhookConfig,
};
use crate::database::models::ChannelKind;
use crate::utils::http_client::build_channel_client;
use crate::{Error, Result};

/// Cached channel instances before the cache is reset.
const MAX_CACHED_CHANNELS: usize = 1024;

fn parse_config<T: DeserializeOwned>(kind: ChannelKind, config: &Value) -> Result<T> {
    if !config.is_object() {
        return Err(Error::config(format!(
            "{} channel config must be a JSON object",
            kind
        )));
    }
    serde_json::from_value(config.clone())
        .map_err(|e| Error::config(format!("invalid {} channel config: {}", kind, e)))
}

/// Builds and validates channels from `(kind, config)` pairs.
pub struct ChannelRegistry {
    client: reqwest::Client,
    inbox: Arc<InAppInbox>,
    cache: DashMap<(ChannelKind, String), Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new(client: reqwest::Client, inbox: Arc<InAppInbox>) -> Self {
        Self {
            client,
            inbox,
            cache: DashMap::new(),
        }
    }

    /// Registry with a fresh HTTP client and an empty in-app inbox.
    pub fn with_defaults() -> Result<Self> {
        let client = build_channel_client(Duration::from_secs(10))?;
        Ok(Self::new(client, Arc::new(InAppInbox::default())))
    }

    /// The in-app inbox that `in_app` channels deliver to.
    pub fn inbox(&self) -> Arc<InAppInbox> {
        self.inbox.clone()
    }

    /// All channel kinds this registry can build.
    pub fn supported_kinds(&self) -> BTreeSet<ChannelKind> {
        ChannelKind::ALL.into_iter().collect()
    }

    /// Validate a config without building a channel. No I/O.
    pub fn check_config(&self, kind: ChannelKind, config: &Value) -> Result<()> {
        match kind {
            ChannelKind::Email => parse_config::<EmailConfig>(kind, config)?.validate(),
            ChannelKind::Push => parse_config::<PushConfig>(kind, config)?.validate(),
            ChannelKind::Webhook => parse_config::<WebhookConfig>(kind, config)?.validate(),
            ChannelKind::Sms => parse_config::<SmsConfig>(kind, config)?.validate(),
            ChannelKind::Telegram => parse_config::<TelegramConfig>(kind, config)?.validate(),
            ChannelKind::Discord => parse_config::<DiscordConfig>(kind, config)?.validate(),
            ChannelKind::InApp => parse_config::<InAppConfig>(kind, config)?.validate(),
        }
    }

    /// Whether `config` is a valid configuration for `kind`.
    pub fn validate_config(&self, kind: ChannelKind, config: &Value) -> bool {
        self.check_config(kind, config).is_ok()
    }

    /// Delivery address a `(kind, config)` target resolves to.
    pub fn recipient_for(
        &self,
        kind: ChannelKind,
        config: &Value,
        user_id: Option<&str>,
    ) -> Result<String> {
        self.check_config(kind, config)?;
        let recipient = match kind {
            ChannelKind::Email => parse_config::<EmailConfig>(kind, config)?.recipient(),
            ChannelKind::Push => parse_config::<PushConfig>(kind, config)?.device_token,
            ChannelKind::Webhook => parse_config::<WebhookConfig>(kind, config)?.url,
            ChannelKind::Sms => parse_config::<SmsConfig>(kind, config)?.to_number,
            ChannelKind::Telegram => parse_config::<TelegramConfig>(kind, config)?.chat_id,
            ChannelKind::Discord => parse_config::<DiscordConfig>(kind, config)?.webhook_url,
            ChannelKind::InApp => parse_config::<InAppConfig>(kind, config)?
                .user_id
                .or_else(|| user_id.map(str::to_string))
                .ok_or_else(|| {
                    Error::config("in_app channel needs a user_id in its config or subscription")
                })?,
        };
        Ok(recipient)
    }

    /// Build (or reuse) a channel for `(kind, config)`.
    pub fn create(&self, kind: ChannelKind, config: &Value) -> Result<Arc<dyn Channel>> {
        let key = (kind, config.to_string());
        if let Some(channel) = self.cache.get(&key) {
            return Ok(channel.clone());
        }

        let channel: Arc<dyn Channel> = match kind {
            ChannelKind::Email => Arc::new(EmailChannel::new(parse_config(kind, config)?)?),
            ChannelKind::Push => Arc::new(PushChannel::new(
                parse_config(kind, config)?,
                self.client.clone(),
            )?),
            ChannelKind::Webhook => Arc::new(WebhookChannel::new(
                parse_config(kind, config)?,
                self.client.clone(),
            )?),
            ChannelKind::Sms => Arc::new(SmsChannel::new(
                parse_config(kind, config)?,
                self.client.clone(),
            )?),
            ChannelKind::Telegram => Arc::new(TelegramChannel::new(
                parse_config(kind, config)?,
                self.client.clone(),
            )?),
            ChannelKind::Discord => Arc::new(DiscordChannel::new(
                parse_config(kind, config)?,
                self.client.clone(),
            )?),
            ChannelKind::InApp => Arc::new(InAppChannel::new(
                parse_config(kind, config)?,
                self.inbox.clone(),
            )?),
        };

        if self.cache.len() >= MAX_CACHED_CHANNELS {
            debug!("Channel cache full, resetting");
            self.cache.clear();
        }
        self.cache.insert(key, channel.clone());
        Ok(channel)
    }
}
