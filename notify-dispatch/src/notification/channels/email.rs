//! Email channel using SMTP.
//!
//! Sends a `multipart/alternative` message (plain text + HTML) through an
//! SMTP relay. Port 465 uses implicit TLS, other ports STARTTLS when
//! `use_tls` is set.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::response::Response;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Channel, DeliveryResult, FailureKind, OutboundMessage, default_timeout_secs, validate_timeout};
use crate::database::models::ChannelKind;
use crate::database::time::to_iso8601;
use crate::{Error, Result};

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// SMTP server host.
    pub smtp_host: String,
    /// SMTP server port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// SMTP username.
    #[serde(default)]
    pub smtp_username: Option<String>,
    /// SMTP password.
    #[serde(default)]
    pub smtp_password: Option<String>,
    /// Use TLS.
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Sender address (`Name <addr>` or bare address).
    pub from_address: String,
    /// Recipient addresses.
    pub to_addresses: Vec<String>,
    /// Subject prefix, e.g. `[Bistro]`.
    #[serde(default)]
    pub subject_prefix: Option<String>,
    /// SMTP command timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_use_tls() -> bool {
    true
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            use_tls: true,
            from_address: String::new(),
            to_addresses: Vec::new(),
            subject_prefix: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmailConfig {
    pub fn validate(&self) -> Result<()> {
        if self.smtp_host.trim().is_empty() {
            return Err(Error::config("smtp_host must not be empty"));
        }
        if self.smtp_port == 0 {
            return Err(Error::config("smtp_port must not be 0"));
        }
        validate_timeout(self.timeout_secs)?;
        parse_mailbox("from_address", &self.from_address)?;
        if self.to_addresses.is_empty() {
            return Err(Error::config("to_addresses must not be empty"));
        }
        for addr in &self.to_addresses {
            parse_mailbox("to_addresses", addr)?;
        }
        if self.smtp_username.is_some() != self.smtp_password.is_some() {
            return Err(Error::config(
                "smtp_username and smtp_password must be set together",
            ));
        }
        Ok(())
    }

    /// Comma-separated recipient list.
    pub fn recipient(&self) -> String {
        self.to_addresses.join(", ")
    }
}

fn parse_mailbox(field: &str, value: &str) -> Result<Mailbox> {
    value
        .parse::<Mailbox>()
        .map_err(|e| Error::config(format!("{} has invalid address '{}': {}", field, value, e)))
}

/// Email channel.
pub struct EmailChannel {
    config: EmailConfig,
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailChannel {
    /// Create an email channel. The SMTP connection pool is opened lazily.
    pub fn new(config: EmailConfig) -> Result<Self> {
        config.validate()?;
        crate::utils::http_client::install_rustls_provider();

        let from = parse_mailbox("from_address", &config.from_address)?;
        let to = config
            .to_addresses
            .iter()
            .map(|addr| parse_mailbox("to_addresses", addr))
            .collect::<Result<Vec<_>>>()?;

        let mut builder = if !config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        } else if config.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| Error::config(format!("invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| Error::config(format!("invalid SMTP relay: {}", e)))?
        };

        builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            config,
            from,
            to,
            transport: builder.build(),
        })
    }

    /// Build the email subject.
    fn build_subject(&self, message: &OutboundMessage) -> String {
        match &self.config.subject_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{} {}", prefix, message.title),
            _ => message.title.clone(),
        }
    }

    /// Build the email body (plain text).
    fn build_body_text(&self, message: &OutboundMessage) -> String {
        format!(
            "{}\n\n{}\n\nTime: {}",
            message.title,
            message.body,
            to_iso8601(message.timestamp)
        )
    }

    /// Build the email body (HTML).
    fn build_body_html(&self, message: &OutboundMessage) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 20px; }}
        .header {{ background-color: #3498db; color: white; padding: 15px; border-radius: 5px; }}
        .content {{ padding: 20px; background-color: #f9f9f9; border-radius: 5px; margin-top: 10px; }}
        .footer {{ color: #666; font-size: 12px; margin-top: 20px; }}
    </style>
</head>
<body>
    <div class="header">
        <h2>{}</h2>
    </div>
    <div class="content">
        <p>{}</p>
    </div>
    <div class="footer">
        <p>Time: {}</p>
    </div>
</body>
</html>"#,
            escape_html(&message.title),
            escape_html(&message.body).replace('\n', "<br>"),
            to_iso8601(message.timestamp)
        )
    }

    fn message_id(&self, message: &OutboundMessage) -> String {
        let domain = self
            .from
            .email
            .domain()
            .to_string();
        format!("<{}@{}>", message.notification_id, domain)
    }

    fn build_message(&self, message: &OutboundMessage) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.build_subject(message))
            .message_id(Some(self.message_id(message)));
        for to in &self.to {
            builder = builder.to(to.clone());
        }

        builder
            .multipart(MultiPart::alternative_plain_html(
                self.build_body_text(message),
                self.build_body_html(message),
            ))
            .map_err(|e| Error::Other(format!("Failed to build email: {}", e)))
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn response_text(response: &Response) -> String {
    response.message().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Channel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.timeout_secs))
    }

    async fn send(&self, message: &OutboundMessage) -> DeliveryResult {
        let email = match self.build_message(message) {
            Ok(email) => email,
            Err(e) => return DeliveryResult::permanent(e.to_string(), None),
        };
        let message_id = self.message_id(message);

        match self.transport.send(email).await {
            Ok(response) => {
                debug!(notification_id = %message.notification_id, "Email notification sent");
                DeliveryResult::delivered(
                    format!("smtp accepted: {}", response_text(&response)),
                    Some(message_id),
                )
            }
            Err(e) => {
                let kind = if e.is_permanent() {
                    FailureKind::Permanent
                } else {
                    FailureKind::Transient
                };
                warn!(notification_id = %message.notification_id, "Email send failed: {}", e);
                DeliveryResult::failed(
                    kind,
                    format!("smtp send failed: {}", e),
                    Some(json!({
                        "smtp_code": e.status().map(|code| code.to_string()),
                        "timeout": e.is_timeout(),
                        "error": e.to_string(),
                    })),
                )
            }
        }
    }
}
