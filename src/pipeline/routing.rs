//! Routing policy engine.
//!
//! Pure mapping from (report, classification) to an ordered list of
//! notification intents:
//!
//! | severity | submitter | responders        | public area |
//! |----------|-----------|-------------------|-------------|
//! | low      | yes       | no                | no          |
//! | medium   | yes       | yes               | no          |
//! | high     | yes       | yes               | yes         |
//! | critical | yes       | yes (urgent)      | yes         |
//!
//! Categories registered as high-priority promote severity one band before
//! the lookup. Promotion never demotes.

use regex::Regex;
use tracing::{debug, warn};

use crate::channels::{Audience, ChannelKind, MessageContent, Notification, NotificationKind};
use crate::classifier::{Classification, Severity};
use crate::pipeline::types::{IntentKind, NotificationIntent};
use crate::report::{Report, ReportStatus};

/// Public-alert radius when the report gives none.
pub const DEFAULT_ALERT_RADIUS_KM: f64 = 10.0;

/// Broadcast group for responder notifications.
pub const DEFAULT_RESPONDER_GROUP: &str = "responders";

/// A category pattern that promotes severity one band.
#[derive(Debug, Clone)]
pub struct PromotionRule {
    pub pattern: String,
    pub regex: Regex,
}

#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    promoted: Vec<PromotionRule>,
    pub default_radius_km: f64,
    pub responder_group: String,
}

impl RoutingPolicy {
    /// Policy with the stock high-priority categories.
    pub fn default_policy() -> Self {
        let mut policy = Self::empty();
        for pattern in [
            r"^structural_fire$",
            r"^(building_)?collapse$",
            r"^active_shooter$",
            r"^explosion$",
            r"^hazmat$",
        ] {
            if let Err(e) = policy.add_promoted_category(pattern) {
                warn!(pattern, error = %e, "Skipping invalid promotion pattern");
            }
        }
        policy
    }

    /// Policy without promotion rules.
    pub fn empty() -> Self {
        Self {
            promoted: Vec::new(),
            default_radius_km: DEFAULT_ALERT_RADIUS_KM,
            responder_group: DEFAULT_RESPONDER_GROUP.to_string(),
        }
    }

    /// Register a category pattern (regex over the normalized category).
    pub fn add_promoted_category(&mut self, pattern: &str) -> Result<(), regex::Error> {
        let regex = Regex::new(pattern)?;
        self.promoted.push(PromotionRule {
            pattern: pattern.to_string(),
            regex,
        });
        Ok(())
    }

    pub fn promoted_categories(&self) -> impl Iterator<Item = &str> {
        self.promoted.iter().map(|r| r.pattern.as_str())
    }

    pub fn is_promoted(&self, category: &str) -> bool {
        self.promoted.iter().any(|r| r.regex.is_match(category))
    }

    /// Severity after category promotion.
    pub fn effective_severity(&self, classification: &Classification) -> Severity {
        if self.is_promoted(&classification.category) {
            classification.severity.promote()
        } else {
            classification.severity
        }
    }

    /// Intents for a classified report, in order: submitter, responders,
    /// public area.
    pub fn route(&self, report: &Report, classification: &Classification) -> Vec<NotificationIntent> {
        let severity = self.effective_severity(classification);
        let content = message_content(report, classification);
        let notification = |audience, kind, urgent| Notification {
            report_id: report.id,
            audience,
            severity,
            urgent,
            kind,
            content: content.clone(),
        };

        let mut intents = vec![NotificationIntent {
            kind: IntentKind::SubmitterNotice,
            channel: ChannelKind::Direct,
            notification: notification(
                Audience::Recipient(report.direct_recipient().to_string()),
                NotificationKind::EmergencyAlert,
                false,
            ),
        }];

        if severity >= Severity::Medium {
            intents.push(NotificationIntent {
                kind: IntentKind::ResponderBroadcast,
                channel: ChannelKind::Broadcast,
                notification: notification(
                    Audience::Group(self.responder_group.clone()),
                    NotificationKind::EmergencyAlert,
                    severity == Severity::Critical,
                ),
            });
        }

        if severity >= Severity::High {
            intents.push(NotificationIntent {
                kind: IntentKind::PublicAreaAlert,
                channel: ChannelKind::Broadcast,
                notification: notification(
                    self.public_area(report),
                    NotificationKind::PublicAlert,
                    false,
                ),
            });
        }

        debug!(
            report_id = %report.id,
            classified = %classification.severity,
            effective = %severity,
            intents = intents.len(),
            "Routed report"
        );
        intents
    }

    /// Direct status-change message to the submitter.
    pub fn route_status_update(&self, report: &Report, status: ReportStatus) -> NotificationIntent {
        let (severity, mut content) = match report.classification {
            Some(ref c) => (self.effective_severity(c), message_content(report, c)),
            None => (
                Severity::High,
                message_content(report, &Classification::fallback()),
            ),
        };
        content.status = Some(status);
        NotificationIntent {
            kind: IntentKind::StatusUpdate,
            channel: ChannelKind::Direct,
            notification: Notification {
                report_id: report.id,
                audience: Audience::Recipient(report.direct_recipient().to_string()),
                severity,
                urgent: false,
                kind: NotificationKind::StatusUpdate,
                content,
            },
        }
    }

    /// Area covered by a public alert for `report`.
    pub fn public_area(&self, report: &Report) -> Audience {
        Audience::Area {
            center: report.coordinate,
            radius_km: report.radius_km.unwrap_or(self.default_radius_km),
        }
    }
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

fn message_content(report: &Report, classification: &Classification) -> MessageContent {
    let analysis = if classification.recommended_actions.is_empty() {
        None
    } else {
        let mut lines: Vec<String> = classification
            .recommended_actions
            .iter()
            .map(|a| format!("- {a}"))
            .collect();
        lines.push(format!(
            "Estimated response: {}",
            classification.estimated_response_time
        ));
        Some(lines.join("\n"))
    };
    MessageContent {
        title: report.display_title(),
        location: report.location_label(),
        reported_at: report.submitted_at,
        description: report.description.clone(),
        reporter: report.submitter.clone(),
        category: classification.category.clone(),
        analysis,
        status: None,
    }
}
