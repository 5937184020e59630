//! Report data model: intake payload, accepted report, status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::Classification;
use crate::error::ValidationError;
use crate::pipeline::types::CycleToken;

/// Maximum accepted description length in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 5_000;

/// Maximum accepted title length in characters.
pub const MAX_TITLE_CHARS: usize = 200;

/// Largest radius a report may ask a public alert to cover.
pub const MAX_RADIUS_KM: f64 = 500.0;

/// Report identity. Assigned at intake and never reused.
pub type ReportId = Uuid;

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ValidationError> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            return Err(ValidationError::InvalidCoordinate {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.5}, {:.5}", self.latitude, self.longitude)
    }
}

/// Report lifecycle. Ordered; a report only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Classified,
    Dispatched,
    Resolved,
}

impl ReportStatus {
    /// Staying put is allowed (idempotent publish); moving backwards is not.
    pub fn can_advance_to(&self, target: ReportStatus) -> bool {
        target >= *self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved)
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Classified => "classified",
            Self::Dispatched => "dispatched",
            Self::Resolved => "resolved",
        };
        write!(f, "{s}")
    }
}

/// Intake payload, as submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewReport {
    #[serde(default)]
    pub title: Option<String>,
    pub description: String,
    /// Reference to an already-uploaded image.
    #[serde(default)]
    pub image_ref: Option<String>,
    /// Free-text location ("corner of 5th and Main").
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Explicit radius for a public-area alert.
    #[serde(default)]
    pub radius_km: Option<f64>,
    /// Submitter reference (user id or handle).
    pub submitter: String,
    /// Where direct notifications for the submitter go (phone number).
    #[serde(default)]
    pub contact: Option<String>,
}

/// An accepted report. Owned by the incident store after intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub title: Option<String>,
    pub description: String,
    pub image_ref: Option<String>,
    pub location: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub radius_km: Option<f64>,
    pub submitter: String,
    pub contact: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub status: ReportStatus,
    pub classification: Option<Classification>,
    /// The attached classification is the conservative fallback.
    pub fallback_classified: bool,
    /// Cycle that produced the attached classification.
    #[serde(skip)]
    pub classified_in: Option<CycleToken>,
    pub updated_at: DateTime<Utc>,
}

impl Report {
    /// Validate an intake payload and assign a fresh id.
    pub fn accept(new: NewReport, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let description = new.description.trim().to_string();
        if description.is_empty() {
            return Err(ValidationError::EmptyDescription);
        }
        let length = description.chars().count();
        if length > MAX_DESCRIPTION_CHARS {
            return Err(ValidationError::DescriptionTooLong {
                length,
                max: MAX_DESCRIPTION_CHARS,
            });
        }

        let title = non_empty(new.title);
        if let Some(ref t) = title {
            let length = t.chars().count();
            if length > MAX_TITLE_CHARS {
                return Err(ValidationError::TitleTooLong {
                    length,
                    max: MAX_TITLE_CHARS,
                });
            }
        }

        let submitter = new.submitter.trim().to_string();
        if submitter.is_empty() {
            return Err(ValidationError::MissingSubmitter);
        }

        let coordinate = match (new.latitude, new.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)?),
            (None, None) => None,
            _ => return Err(ValidationError::PartialCoordinate),
        };

        if let Some(radius_km) = new.radius_km {
            if !radius_km.is_finite() || radius_km <= 0.0 || radius_km > MAX_RADIUS_KM {
                return Err(ValidationError::InvalidRadius { radius_km });
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            title,
            description,
            image_ref: non_empty(new.image_ref),
            location: non_empty(new.location),
            coordinate,
            radius_km: new.radius_km,
            submitter,
            contact: non_empty(new.contact),
            submitted_at: now,
            status: ReportStatus::Pending,
            classification: None,
            fallback_classified: false,
            classified_in: None,
            updated_at: now,
        })
    }

    /// Title for display: the explicit title, else the head of the description.
    pub fn display_title(&self) -> String {
        match self.title {
            Some(ref t) => t.clone(),
            None => truncate_chars(&self.description, 60),
        }
    }

    /// Human-readable location: free text, else coordinates.
    pub fn location_label(&self) -> Option<String> {
        self.location
            .clone()
            .or_else(|| self.coordinate.map(|c| c.to_string()))
    }

    /// Where direct notifications for the submitter go.
    pub fn direct_recipient(&self) -> &str {
        self.contact.as_deref().unwrap_or(&self.submitter)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Truncate to `max` characters, appending "..." when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intake(description: &str) -> NewReport {
        NewReport {
            description: description.into(),
            submitter: "user-17".into(),
            ..Default::default()
        }
    }

    #[test]
    fn accept_assigns_pending_status_and_fresh_id() {
        let a = Report::accept(intake("Smoke from the warehouse"), Utc::now()).unwrap();
        let b = Report::accept(intake("Smoke from the warehouse"), Utc::now()).unwrap();
        assert_eq!(a.status, ReportStatus::Pending);
        assert!(a.classification.is_none());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn accept_rejects_blank_description() {
        let err = Report::accept(intake("   "), Utc::now()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyDescription);
    }

    #[test]
    fn accept_rejects_oversized_description() {
        let long = "x".repeat(MAX_DESCRIPTION_CHARS + 1);
        let err = Report::accept(intake(&long), Utc::now()).unwrap_err();
        assert!(matches!(err, ValidationError::DescriptionTooLong { .. }));
    }

    #[test]
    fn accept_requires_both_coordinates() {
        let new = NewReport {
            latitude: Some(40.7),
            ..intake("Flooding on the underpass")
        };
        let err = Report::accept(new, Utc::now()).unwrap_err();
        assert_eq!(err, ValidationError::PartialCoordinate);
    }

    #[test]
    fn accept_rejects_out_of_range_coordinate() {
        let new = NewReport {
            latitude: Some(91.0),
            longitude: Some(10.0),
            ..intake("Flooding")
        };
        assert!(matches!(
            Report::accept(new, Utc::now()),
            Err(ValidationError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn accept_rejects_non_positive_radius() {
        let new = NewReport {
            radius_km: Some(0.0),
            ..intake("Gas leak")
        };
        assert!(matches!(
            Report::accept(new, Utc::now()),
            Err(ValidationError::InvalidRadius { .. })
        ));
    }

    #[test]
    fn accept_requires_submitter() {
        let new = NewReport {
            submitter: " ".into(),
            ..intake("Tree down")
        };
        assert_eq!(
            Report::accept(new, Utc::now()).unwrap_err(),
            ValidationError::MissingSubmitter
        );
    }

    #[test]
    fn blank_optionals_are_dropped() {
        let new = NewReport {
            title: Some("  ".into()),
            contact: Some("".into()),
            ..intake("Power line sparking")
        };
        let report = Report::accept(new, Utc::now()).unwrap();
        assert!(report.title.is_none());
        assert!(report.contact.is_none());
        assert_eq!(report.direct_recipient(), "user-17");
    }

    #[test]
    fn status_never_moves_backwards() {
        assert!(ReportStatus::Pending.can_advance_to(ReportStatus::Classified));
        assert!(ReportStatus::Dispatched.can_advance_to(ReportStatus::Dispatched));
        assert!(!ReportStatus::Dispatched.can_advance_to(ReportStatus::Classified));
        assert!(!ReportStatus::Resolved.can_advance_to(ReportStatus::Pending));
    }

    #[test]
    fn display_title_falls_back_to_description() {
        let report = Report::accept(intake(&"a".repeat(80)), Utc::now()).unwrap();
        assert_eq!(report.display_title().chars().count(), 63);
    }

    #[test]
    fn location_label_prefers_free_text() {
        let new = NewReport {
            location: Some("Pier 9".into()),
            latitude: Some(37.8),
            longitude: Some(-122.4),
            ..intake("Boat fire")
        };
        let report = Report::accept(new, Utc::now()).unwrap();
        assert_eq!(report.location_label().as_deref(), Some("Pier 9"));
    }
}
