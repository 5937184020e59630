//! Twilio SMS channel, the direct-message sender.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use super::channel::{Audience, ChannelKind, Delivery, Notification, NotificationChannel};
use crate::error::DispatchError;

const DEFAULT_BASE_URL: &str = "https://api.twilio.com";

static E164: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\+[1-9]\d{6,14}$").ok());

/// Whether `number` is an E.164 phone number (`+` then 7–15 digits).
pub fn is_e164(number: &str) -> bool {
    E164.as_ref().is_some_and(|re| re.is_match(number))
}

/// Twilio credentials.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
}

impl TwilioConfig {
    /// `None` unless all three Twilio variables are set.
    pub fn from_env() -> Option<Self> {
        let account_sid = std::env::var("TWILIO_ACCOUNT_SID").ok()?;
        let auth_token = std::env::var("TWILIO_AUTH_TOKEN").ok()?;
        let from_number = std::env::var("TWILIO_PHONE_NUMBER").ok()?;
        if account_sid.is_empty() || auth_token.is_empty() || from_number.is_empty() {
            return None;
        }
        Some(Self {
            account_sid,
            auth_token: SecretString::from(auth_token),
            from_number,
        })
    }
}

pub struct SmsChannel {
    config: TwilioConfig,
    client: reqwest::Client,
    base_url: String,
}

impl SmsChannel {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.config.account_sid
        )
    }
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: Option<String>,
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &str {
        "sms"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError> {
        let to = match &notification.audience {
            Audience::Recipient(to) => to.as_str(),
            other => {
                return Err(DispatchError::permanent(
                    self.name(),
                    format!("SMS cannot address {other}"),
                ));
            }
        };
        if !is_e164(to) {
            return Err(DispatchError::permanent(
                self.name(),
                format!("recipient '{to}' is not an E.164 number"),
            ));
        }

        let body = notification.render_text();
        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&[
                ("To", to),
                ("From", self.config.from_number.as_str()),
                ("Body", body.as_str()),
            ])
            .send()
            .await
            .map_err(|e| DispatchError::retriable(self.name(), e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            warn!(status = %status, detail = %detail, "Twilio rejected message");
            let reason = format!("HTTP {status}");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                DispatchError::retriable(self.name(), reason)
            } else {
                DispatchError::permanent(self.name(), reason)
            });
        }

        let sid = resp
            .json::<MessageResource>()
            .await
            .ok()
            .and_then(|m| m.sid);
        info!(report_id = %notification.report_id, sid = ?sid, "SMS sent");
        Ok(Delivery::single(sid))
    }
}
