//! Notification channel trait and the payloads that flow through it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::Severity;
use crate::error::DispatchError;
use crate::report::{Coordinate, ReportId, ReportStatus, model::truncate_chars};

/// Characters of the description carried in a direct message.
const DIRECT_DESCRIPTION_CHARS: usize = 100;

/// The two channel families. Closed set; callers match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// One recipient at a time (SMS).
    Direct,
    /// Team or public broadcast (chat channel).
    Broadcast,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Audience {
    /// A single recipient (phone number or user reference).
    Recipient(String),
    /// A named broadcast group (e.g. the responder channel).
    Group(String),
    /// Everyone around a point.
    Area {
        center: Option<Coordinate>,
        radius_km: f64,
    },
}

impl Audience {
    /// Stable textual identity, used for deduplication.
    pub fn key(&self) -> String {
        match self {
            Self::Recipient(r) => format!("recipient:{r}"),
            Self::Group(g) => format!("group:{g}"),
            Self::Area {
                center: Some(c),
                radius_km,
            } => format!("area:{:.5},{:.5}:{radius_km:.3}", c.latitude, c.longitude),
            Self::Area {
                center: None,
                radius_km,
            } => format!("area:unplaced:{radius_km:.3}"),
        }
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recipient(r) => write!(f, "{r}"),
            Self::Group(g) => write!(f, "#{g}"),
            Self::Area {
                center: Some(c),
                radius_km,
            } => write!(f, "{radius_km} km around {c}"),
            Self::Area { radius_km, .. } => write!(f, "{radius_km} km area"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// New report, sent to the submitter and responders.
    EmergencyAlert,
    /// Public-area warning.
    PublicAlert,
    /// Lifecycle change on an existing report.
    StatusUpdate,
}

/// Report facts rendered into a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageContent {
    pub title: String,
    pub location: Option<String>,
    pub reported_at: DateTime<Utc>,
    pub description: String,
    pub reporter: String,
    pub category: String,
    /// Classifier recommendations, one per line.
    pub analysis: Option<String>,
    pub status: Option<ReportStatus>,
}

/// A concrete message for one audience.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub report_id: ReportId,
    pub audience: Audience,
    pub severity: Severity,
    /// Set for critical broadcasts; channels may highlight it.
    pub urgent: bool,
    pub kind: NotificationKind,
    pub content: MessageContent,
}

impl Notification {
    /// Plain-text rendering used by SMS and log channels.
    pub fn render_text(&self) -> String {
        let c = &self.content;
        let location = c.location.as_deref().unwrap_or("Location unknown");
        match self.kind {
            NotificationKind::EmergencyAlert => format!(
                "{} EMERGENCY ALERT\n{} PRIORITY\n\nTitle: {}\nLocation: {}\nTime: {}\n\n\
                 Description: {}\n\nCrisis Navigator - Immediate response required",
                self.severity.marker(),
                self.severity.label().to_uppercase(),
                c.title,
                location,
                c.reported_at.format("%m/%d/%Y %I:%M %p"),
                truncate_chars(&c.description, DIRECT_DESCRIPTION_CHARS),
            ),
            NotificationKind::PublicAlert => format!(
                "{} PUBLIC SAFETY ALERT\n\n{}\n\nType: {}\nSeverity: {}\nArea: {}\n\n{}",
                self.severity.marker(),
                c.title,
                c.category,
                self.severity.label().to_uppercase(),
                self.audience,
                truncate_chars(&c.description, DIRECT_DESCRIPTION_CHARS * 2),
            ),
            NotificationKind::StatusUpdate => {
                let status = c.status.unwrap_or(ReportStatus::Resolved);
                let line = match status {
                    ReportStatus::Dispatched => {
                        "🚁 Emergency responders have been dispatched to your location".to_string()
                    }
                    ReportStatus::Resolved => {
                        "✅ Emergency situation has been resolved. Stay safe!".to_string()
                    }
                    other => format!("Status updated to: {other}"),
                };
                format!(
                    "Crisis Navigator Update\n\nEmergency Report #{}\nStatus: {}\n\n{}\n\n\
                     Thank you for using Crisis Navigator",
                    self.report_id,
                    status.to_string().to_uppercase(),
                    line,
                )
            }
        }
    }
}

/// Successful (possibly partial) delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Delivery {
    pub delivered: usize,
    /// Recipients a broadcast could not reach; the send itself still succeeded.
    pub failed_recipients: Vec<String>,
    /// Provider message id (Twilio SID, Slack ts).
    pub provider_id: Option<String>,
}

impl Delivery {
    pub fn single(provider_id: Option<String>) -> Self {
        Self {
            delivered: 1,
            failed_recipients: Vec::new(),
            provider_id,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failed_recipients.is_empty()
    }
}

/// A notification sender.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    async fn send(&self, notification: &Notification) -> Result<Delivery, DispatchError>;
}

/// One channel per kind.
#[derive(Clone)]
pub struct ChannelSet {
    pub direct: Arc<dyn NotificationChannel>,
    pub broadcast: Arc<dyn NotificationChannel>,
}

impl ChannelSet {
    pub fn new(
        direct: Arc<dyn NotificationChannel>,
        broadcast: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self { direct, broadcast }
    }

    pub fn get(&self, kind: ChannelKind) -> &Arc<dyn NotificationChannel> {
        match kind {
            ChannelKind::Direct => &self.direct,
            ChannelKind::Broadcast => &self.broadcast,
        }
    }
}
