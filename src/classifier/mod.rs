//! Report classification.
//!
//! A [`Classifier`] wraps a remote text/image classification capability. The
//! [`ClassifierAdapter`] bounds every call with a timeout and turns every
//! failure into a [`ClassificationFailure`] value. Retries and fallback are
//! the triage pipeline's business, not the adapter's.

pub mod gemini;

pub use gemini::GeminiClassifier;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ClassificationFailure;
use crate::report::Report;

/// Category assigned when no classification could be obtained.
pub const FALLBACK_CATEGORY: &str = "unclassified";

/// Ordered severity band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One band up; critical stays critical.
    pub fn promote(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Marker prefixed to outbound messages.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Critical => "🚨",
            Self::High => "⚠️",
            Self::Medium => "📢",
            Self::Low => "📍",
        }
    }

    /// Urgency score implied by the band when the classifier gives none.
    pub fn default_urgency(&self) -> f32 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 0.95,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" | "moderate" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

/// Structured classification of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub severity: Severity,
    /// Open tag ("fire", "flood", "structural_fire", ...), lowercase.
    pub category: String,
    /// 0.0–1.0.
    pub urgency: f32,
    pub recommended_actions: Vec<String>,
    pub estimated_response_time: String,
}

impl Classification {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        urgency: f32,
        recommended_actions: Vec<String>,
        estimated_response_time: impl Into<String>,
    ) -> Self {
        let urgency = if urgency.is_finite() {
            urgency.clamp(0.0, 1.0)
        } else {
            severity.default_urgency()
        };
        Self {
            severity,
            category: normalize_category(&category.into()),
            urgency,
            recommended_actions,
            estimated_response_time: estimated_response_time.into(),
        }
    }

    /// Conservative classification used when the classifier cannot answer.
    ///
    /// Never `low`: an unanswered report is treated as `high` so it still
    /// reaches responders and the surrounding area.
    pub fn fallback() -> Self {
        Self::new(
            Severity::High,
            FALLBACK_CATEGORY,
            Severity::High.default_urgency(),
            vec![
                "Please contact emergency services immediately".to_string(),
                "Provide more details if possible".to_string(),
            ],
            "15-30 minutes",
        )
    }

    pub fn is_fallback(&self) -> bool {
        self.category == FALLBACK_CATEGORY
    }
}

/// Lowercase, trimmed, inner whitespace and hyphens collapsed to `_`.
pub fn normalize_category(raw: &str) -> String {
    let normalized = raw
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if normalized.is_empty() {
        "other".to_string()
    } else {
        normalized
    }
}

/// What the classifier is asked about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRequest {
    pub description: String,
    pub image_ref: Option<String>,
    /// Location context (free text or coordinates).
    pub location: Option<String>,
}

impl ClassificationRequest {
    pub fn from_report(report: &Report) -> Self {
        Self {
            description: report.description.clone(),
            image_ref: report.image_ref.clone(),
            location: report.location_label(),
        }
    }
}

/// A remote classification capability.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Name for logs and failure reasons.
    fn name(&self) -> &str;

    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, ClassificationFailure>;
}

/// Bounds classifier calls with a timeout. Holds no shared state.
#[derive(Clone)]
pub struct ClassifierAdapter {
    inner: Arc<dyn Classifier>,
    timeout: Duration,
}

impl ClassifierAdapter {
    pub fn new(inner: Arc<dyn Classifier>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classify a report. Timeouts and transport errors come back as values.
    pub async fn classify(&self, report: &Report) -> Result<Classification, ClassificationFailure> {
        let request = ClassificationRequest::from_report(report);
        match tokio::time::timeout(self.timeout, self.inner.classify(&request)).await {
            Ok(Ok(classification)) => {
                debug!(
                    report_id = %report.id,
                    classifier = self.inner.name(),
                    severity = %classification.severity,
                    category = %classification.category,
                    "Report classified"
                );
                Ok(classification)
            }
            Ok(Err(failure)) => {
                warn!(
                    report_id = %report.id,
                    reason = failure.reason_code(),
                    error = %failure,
                    "Classification failed"
                );
                Err(failure)
            }
            Err(_) => {
                warn!(
                    report_id = %report.id,
                    classifier = self.inner.name(),
                    timeout = ?self.timeout,
                    "Classification timed out"
                );
                Err(ClassificationFailure::Timeout {
                    classifier: self.inner.name().to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

/// Stand-in used when no classifier is configured. Every call fails, so every
/// report takes the fallback path.
pub struct UnavailableClassifier;

#[async_trait]
impl Classifier for UnavailableClassifier {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn classify(
        &self,
        _request: &ClassificationRequest,
    ) -> Result<Classification, ClassificationFailure> {
        Err(ClassificationFailure::Unavailable {
            classifier: self.name().to_string(),
            reason: "no classifier API key configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::report::NewReport;

    struct SlowClassifier;

    #[async_trait]
    impl Classifier for SlowClassifier {
        fn name(&self) -> &str {
            "slow"
        }

        async fn classify(
            &self,
            _request: &ClassificationRequest,
        ) -> Result<Classification, ClassificationFailure> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Classification::fallback())
        }
    }

    fn report() -> Report {
        Report::accept(
            NewReport {
                description: "Building on fire, people trapped on 3rd floor".into(),
                submitter: "u1".into(),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn promote_stops_at_critical() {
        assert_eq!(Severity::Low.promote(), Severity::Medium);
        assert_eq!(Severity::High.promote(), Severity::Critical);
        assert_eq!(Severity::Critical.promote(), Severity::Critical);
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("moderate".parse::<Severity>().unwrap(), Severity::Medium);
        assert!("apocalyptic".parse::<Severity>().is_err());
    }

    #[test]
    fn fallback_is_high_and_unclassified() {
        let fallback = Classification::fallback();
        assert_eq!(fallback.severity, Severity::High);
        assert_eq!(fallback.category, FALLBACK_CATEGORY);
        assert!(fallback.is_fallback());
    }

    #[test]
    fn urgency_is_clamped() {
        let c = Classification::new(Severity::Low, "flood", 3.0, vec![], "1 hour");
        assert_eq!(c.urgency, 1.0);
        let c = Classification::new(Severity::Low, "flood", f32::NAN, vec![], "1 hour");
        assert_eq!(c.urgency, Severity::Low.default_urgency());
    }

    #[test]
    fn categories_are_normalized() {
        assert_eq!(normalize_category("  Structural Fire "), "structural_fire");
        assert_eq!(normalize_category("active-shooter"), "active_shooter");
        assert_eq!(normalize_category(""), "other");
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_turns_timeout_into_failure() {
        let adapter = ClassifierAdapter::new(Arc::new(SlowClassifier), Duration::from_secs(8));
        let failure = adapter.classify(&report()).await.unwrap_err();
        assert_eq!(failure.reason_code(), "timeout");
    }

    #[tokio::test]
    async fn unavailable_classifier_always_fails() {
        let adapter =
            ClassifierAdapter::new(Arc::new(UnavailableClassifier), Duration::from_secs(1));
        let failure = adapter.classify(&report()).await.unwrap_err();
        assert_eq!(failure.reason_code(), "unavailable");
    }

    #[test]
    fn request_carries_location_context() {
        let mut r = report();
        r.location = Some("Main St".into());
        r.image_ref = Some("uploads/1.jpg".into());
        let request = ClassificationRequest::from_report(&r);
        assert_eq!(request.location.as_deref(), Some("Main St"));
        assert_eq!(request.image_ref.as_deref(), Some("uploads/1.jpg"));
    }
}
