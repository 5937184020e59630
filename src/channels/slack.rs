//! Slack broadcast channel via `chat.postMessage`.
//!
//! Responder broadcasts go to the coordination channel as rich blocks. Public
//! area alerts go to the public channel when one is configured, otherwise to
//! the coordination channel.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

use super::channel::{
    Audience, ChannelKind, Delivery, Notification, NotificationChannel, NotificationKind,
};
use crate::error::DispatchError;

const DEFAULT_BASE_URL: &str = "https://slack.com";

#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    /// Responder coordination channel.
    pub channel_id: String,
    /// Channel for public-area alerts.
    pub public_channel_id: Option<String>,
}

impl SlackConfig {
    /// `None` unless `SLACK_BOT_TOKEN` and `SLACK_CHANNEL_ID` are set.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("SLACK_BOT_TOKEN").ok().filter(|t| !t.is_empty())?;
        let channel_id = std::env::var("SLACK_CHANNEL_ID").ok().filter(|c| !c.is_empty())?;
        Some(Self {
            bot_token: SecretString::from(bot_token),
            channel_id,
            public_channel_id: std::env::var("SLACK_PUBLIC_CHANNEL_ID")
                .ok()
                .filter(|c| !c.is_empty()),
        })
    }
}

pub struct SlackChannel {
    config: SlackConfig,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

impl SlackChannel {
    pub fn new(config: SlackConfig) -> Self {
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

    fn target_channel(&self, audience: &Audience) -> Option<&str> {
        match audience {
            Audience::Group(_) => Some(self.config.channel_id.as_str()),
            Audience::Area { .. } => Some(
                self.config
                    .public_channel_id
                    .as_deref()
                    .unwrap_or(self.config.channel_id.as_str()),
            ),
            Audience::Recipient(_) => None,
        }
    }
}

/// Header, fields, description and analysis blocks for a report broadcast.
fn build_blocks(notification: &Notification) -> serde_json::Value {
    let c = &notification.content;
    let severity = notification.severity.label().to_uppercase();
    let header = match notification.kind {
        NotificationKind::PublicAlert => {
            format!("{} PUBLIC ALERT - {severity}", notification.severity.marker())
        }
        _ if notification.urgent => format!("🚨 URGENT EMERGENCY ALERT - {severity}"),
        _ => format!("🚨 EMERGENCY ALERT - {severity}"),
    };

    let mut blocks = vec![
        serde_json::json!({
            "type": "header",
            "text": { "type": "plain_text", "text": header }
        }),
        serde_json::json!({
            "type": "section",
            "fields": [
                { "type": "mrkdwn", "text": format!("*Title:*\n{}", c.title) },
                { "type": "mrkdwn", "text": format!("*Reporter:*\n{}", c.reporter) },
                {
                    "type": "mrkdwn",
                    "text": format!("*Location:*\n{}", c.location.as_deref().unwrap_or("Not specified"))
                },
                {
                    "type": "mrkdwn",
                    "text": format!("*Time:*\n{}", c.reported_at.format("%Y-%m-%d %H:%M:%S"))
                }
            ]
        }),
        serde_json::json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Description:*\n{}", c.description) }
        }),
    ];

    if let Some(ref analysis) = c.analysis {
        blocks.push(serde_json::json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*🤖 AI Analysis:*\n```{analysis}```") }
        }));
    }
    if let Audience::Area { .. } = notification.audience {
        blocks.push(serde_json::json!({
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": format!("Affected area: {}", notification.audience) }]
        }));
    }

    serde_json::Value::Array(blocks)
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Broadcast
    }

    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError> {
        let Some(channel) = self.target_channel(&notification.audience) else {
            return Err(DispatchError::permanent(
                self.name(),
                format!("broadcast cannot address {}", notification.audience),
            ));
        };

        let body = serde_json::json!({
            "channel": channel,
            "text": format!("Emergency Alert: {}", notification.content.title),
            "blocks": build_blocks(notification),
        });

        let resp = self
            .client
            .post(format!("{}/api/chat.postMessage", self.base_url))
            .bearer_auth(self.config.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::retriable(self.name(), e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DispatchError::retriable(self.name(), format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DispatchError::permanent(self.name(), format!("HTTP {status}")));
        }

        let parsed: PostMessageResponse = resp
            .json()
            .await
            .map_err(|e| DispatchError::retriable(self.name(), format!("bad response: {e}")))?;

        if !parsed.ok {
            let error = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
            warn!(report_id = %notification.report_id, error = %error, "Slack rejected message");
            return Err(if error == "ratelimited" {
                DispatchError::retriable(self.name(), error)
            } else {
                DispatchError::permanent(self.name(), error)
            });
        }

        info!(report_id = %notification.report_id, channel = %channel, "Posted to Slack");
        Ok(Delivery::single(parsed.ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{Json, Router, routing::post};
    use chrono::Utc;
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use crate::channels::channel::MessageContent;
    use crate::classifier::Severity;

    fn config() -> SlackConfig {
        SlackConfig {
            bot_token: SecretString::from("xoxb-test"),
            channel_id: "C-RESPONDERS".into(),
            public_channel_id: Some("C-PUBLIC".into()),
        }
    }

    fn notification(audience: Audience) -> Notification {
        Notification {
            report_id: Uuid::new_v4(),
            audience,
            severity: Severity::Critical,
            urgent: true,
            kind: NotificationKind::EmergencyAlert,
            content: MessageContent {
                title: "Gas explosion".into(),
                location: Some("Harbor Rd".into()),
                reported_at: Utc::now(),
                description: "Loud blast, smoke visible".into(),
                reporter: "u9".into(),
                category: "explosion".into(),
                analysis: Some("Evacuate 200m radius".into()),
                status: None,
            },
        }
    }

    async fn fake_slack(reply: serde_json::Value) -> String {
        let app = Router::new().route(
            "/api/chat.postMessage",
            post(move || {
                let reply = reply.clone();
                async move { Json(reply) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    }

    #[test]
    fn area_alerts_use_public_channel() {
        let channel = SlackChannel::new(config());
        let area = Audience::Area {
            center: None,
            radius_km: 10.0,
        };
        assert_eq!(channel.target_channel(&area), Some("C-PUBLIC"));
        assert_eq!(
            channel.target_channel(&Audience::Group("responders".into())),
            Some("C-RESPONDERS")
        );
        assert_eq!(channel.target_channel(&Audience::Recipient("x".into())), None);
    }

    #[test]
    fn blocks_include_analysis_and_urgent_header() {
        let blocks = build_blocks(&notification(Audience::Group("responders".into())));
        let text = blocks.to_string();
        assert!(text.contains("URGENT EMERGENCY ALERT - CRITICAL"));
        assert!(text.contains("AI Analysis"));
        assert!(text.contains("Harbor Rd"));
    }

    #[tokio::test]
    async fn ok_response_returns_ts() {
        let base = fake_slack(serde_json::json!({ "ok": true, "ts": "1700.01" })).await;
        let channel = SlackChannel::new(config()).with_base_url(base);
        let delivery = channel
            .send(&notification(Audience::Group("responders".into())))
            .await
            .unwrap();
        assert_eq!(delivery.provider_id.as_deref(), Some("1700.01"));
    }

    #[tokio::test]
    async fn ratelimited_is_retriable() {
        let base = fake_slack(serde_json::json!({ "ok": false, "error": "ratelimited" })).await;
        let channel = SlackChannel::new(config()).with_base_url(base);
        let err = channel
            .send(&notification(Audience::Group("responders".into())))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn channel_not_found_is_permanent() {
        let base =
            fake_slack(serde_json::json!({ "ok": false, "error": "channel_not_found" })).await;
        let channel = SlackChannel::new(config()).with_base_url(base);
        let err = channel
            .send(&notification(Audience::Group("responders".into())))
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
    }
}
