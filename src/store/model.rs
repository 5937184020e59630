//! Alerts and shelters.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::{Classification, Severity};
use crate::error::ValidationError;
use crate::report::model::MAX_RADIUS_KM;
use crate::report::{Coordinate, Report, ReportId};

pub type AlertId = Uuid;
pub type ShelterId = Uuid;

/// Public-area alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub title: String,
    pub description: String,
    pub alert_type: String,
    pub severity: Severity,
    pub location: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub radius_km: f64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Report that raised the alert; `None` for manual alerts.
    pub source_report: Option<ReportId>,
}

impl Alert {
    /// Active and not past its expiry.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|expires| now <= expires)
    }

    /// Alert raised by the pipeline for a high-severity report.
    pub fn for_report(
        report: &Report,
        classification: &Classification,
        severity: Severity,
        radius_km: f64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: report.display_title(),
            description: report.description.clone(),
            alert_type: classification.category.clone(),
            severity,
            location: report.location_label(),
            coordinate: report.coordinate,
            radius_km,
            active: true,
            created_at: now,
            expires_at: Some(now + ttl),
            source_report: Some(report.id),
        }
    }
}

/// Operator-created alert.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAlert {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub alert_type: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub radius_km: Option<f64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewAlert {
    pub fn into_alert(self, default_radius_km: f64, now: DateTime<Utc>) -> Result<Alert, ValidationError> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(ValidationError::MissingField { field: "title" });
        }
        let coordinate = match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)?),
            (None, None) => None,
            _ => return Err(ValidationError::PartialCoordinate),
        };
        let radius_km = self.radius_km.unwrap_or(default_radius_km);
        if !radius_km.is_finite() || radius_km <= 0.0 || radius_km > MAX_RADIUS_KM {
            return Err(ValidationError::InvalidRadius { radius_km });
        }
        Ok(Alert {
            id: Uuid::new_v4(),
            title,
            description: self.description.trim().to_string(),
            alert_type: self
                .alert_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "general".to_string()),
            severity: self.severity,
            location: self.location.filter(|l| !l.trim().is_empty()),
            coordinate,
            radius_km,
            active: true,
            created_at: now,
            expires_at: self.expires_at,
            source_report: None,
        })
    }
}

/// Emergency shelter. `0 <= occupancy <= capacity` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shelter {
    pub id: ShelterId,
    pub name: String,
    pub address: String,
    pub coordinate: Option<Coordinate>,
    pub capacity: u32,
    pub occupancy: u32,
    pub shelter_type: String,
    pub contact_phone: Option<String>,
    pub facilities: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Shelter {
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.occupancy)
    }

    /// Validate a new occupancy against capacity.
    pub fn check_occupancy(&self, occupancy: i64) -> Result<u32, ValidationError> {
        if occupancy < 0 || occupancy > i64::from(self.capacity) {
            return Err(ValidationError::OccupancyOutOfRange {
                occupancy,
                capacity: self.capacity,
            });
        }
        Ok(occupancy as u32)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewShelter {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub capacity: u32,
    #[serde(default)]
    pub occupancy: u32,
    #[serde(default)]
    pub shelter_type: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub facilities: Vec<String>,
}

impl NewShelter {
    pub fn into_shelter(self, now: DateTime<Utc>) -> Result<Shelter, ValidationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::MissingField { field: "name" });
        }
        if self.occupancy > self.capacity {
            return Err(ValidationError::OccupancyOutOfRange {
                occupancy: i64::from(self.occupancy),
                capacity: self.capacity,
            });
        }
        let coordinate = match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)?),
            (None, None) => None,
            _ => return Err(ValidationError::PartialCoordinate),
        };
        Ok(Shelter {
            id: Uuid::new_v4(),
            name,
            address: self.address.trim().to_string(),
            coordinate,
            capacity: self.capacity,
            occupancy: self.occupancy,
            shelter_type: self
                .shelter_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "general".to_string()),
            contact_phone: self.contact_phone.filter(|p| !p.trim().is_empty()),
            facilities: self.facilities,
            active: true,
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shelter(capacity: u32, occupancy: u32) -> Shelter {
        NewShelter {
            name: "Lincoln High Gym".into(),
            address: "1 School Rd".into(),
            latitude: None,
            longitude: None,
            capacity,
            occupancy,
            shelter_type: None,
            contact_phone: None,
            facilities: vec!["beds".into()],
        }
        .into_shelter(Utc::now())
        .unwrap()
    }

    #[test]
    fn available_is_capacity_minus_occupancy() {
        assert_eq!(shelter(100, 40).available(), 60);
    }

    #[test]
    fn occupancy_bounds() {
        let s = shelter(100, 0);
        assert_eq!(s.check_occupancy(100).unwrap(), 100);
        assert!(s.check_occupancy(101).is_err());
        assert!(s.check_occupancy(-1).is_err());
    }

    #[test]
    fn new_shelter_rejects_overfull() {
        let result = NewShelter {
            name: "Hall".into(),
            address: String::new(),
            latitude: None,
            longitude: None,
            capacity: 10,
            occupancy: 11,
            shelter_type: None,
            contact_phone: None,
            facilities: vec![],
        }
        .into_shelter(Utc::now());
        assert!(matches!(result, Err(ValidationError::OccupancyOutOfRange { .. })));
    }

    #[test]
    fn alert_expiry() {
        let now = Utc::now();
        let alert = NewAlert {
            title: "Boil water notice".into(),
            description: String::new(),
            alert_type: None,
            severity: Severity::Medium,
            location: None,
            latitude: None,
            longitude: None,
            radius_km: None,
            expires_at: Some(now + Duration::minutes(5)),
        }
        .into_alert(10.0, now)
        .unwrap();
        assert_eq!(alert.alert_type, "general");
        assert!(alert.is_live_at(now));
        assert!(!alert.is_live_at(now + Duration::minutes(6)));
    }

    #[test]
    fn new_alert_requires_title() {
        let result = NewAlert {
            title: "  ".into(),
            description: String::new(),
            alert_type: None,
            severity: Severity::Low,
            location: None,
            latitude: None,
            longitude: None,
            radius_km: None,
            expires_at: None,
        }
        .into_alert(10.0, Utc::now());
        assert_eq!(result.unwrap_err(), ValidationError::MissingField { field: "title" });
    }
}
