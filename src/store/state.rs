//! Incident state store.
//!
//! Owns reports, alerts and shelters. Writers serialize per entity; each
//! write is validated, persisted through the backend and only then applied,
//! so a rejected or failed write leaves the prior state untouched.
//!
//! Snapshots are consistent: every writer holds the read side of a gate
//! while it applies a change and a snapshot rebuild takes the write side, so
//! a snapshot never observes half of a write. Writers take the gate before
//! any entity lock and never take it twice. Rebuilt views are cached per
//! version, and readers share them until the next commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::classifier::Classification;
use crate::error::{StoreError, ValidationError};
use crate::pipeline::types::CycleToken;
use crate::report::{Report, ReportId, ReportStatus};
use crate::store::backend::StateBackend;
use crate::store::model::{Alert, AlertId, NewAlert, NewShelter, Shelter, ShelterId};

type Entities<K, V> = RwLock<HashMap<K, Arc<Mutex<V>>>>;

/// A change to a report.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    /// Attach a classification; status moves to at least `classified`.
    Classified {
        report_id: ReportId,
        classification: Classification,
        fallback: bool,
        cycle: CycleToken,
    },
    Status {
        report_id: ReportId,
        status: ReportStatus,
    },
}

impl StateUpdate {
    pub fn report_id(&self) -> ReportId {
        match self {
            Self::Classified { report_id, .. } | Self::Status { report_id, .. } => *report_id,
        }
    }
}

/// Immutable point-in-time view.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentSnapshot {
    pub version: u64,
    pub last_update: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
    /// Ordered by submission time, then id.
    pub reports: Vec<Report>,
    /// Live alerts only, newest first.
    pub alerts: Vec<Alert>,
    /// Active shelters, by name.
    pub shelters: Vec<Shelter>,
}

/// Committed collections at one version, before expiry filtering.
struct CommittedView {
    version: u64,
    last_update: DateTime<Utc>,
    reports: Vec<Report>,
    alerts: Vec<Alert>,
    shelters: Vec<Shelter>,
}

pub struct IncidentStore {
    backend: Arc<dyn StateBackend>,
    gate: RwLock<()>,
    reports: Entities<ReportId, Report>,
    alerts: Entities<AlertId, Alert>,
    shelters: Entities<ShelterId, Shelter>,
    version: AtomicU64,
    last_update_ms: AtomicI64,
    cached: StdMutex<Option<Arc<CommittedView>>>,
}

impl IncidentStore {
    /// Empty store writing through `backend`.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            gate: RwLock::new(()),
            reports: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            shelters: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            last_update_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            cached: StdMutex::new(None),
        }
    }

    /// Store preloaded with whatever `backend` already holds.
    pub async fn open(backend: Arc<dyn StateBackend>) -> Result<Self, StoreError> {
        let state = backend.load_all().await?;
        let store = Self::new(backend);
        {
            let mut reports = store.reports.write().await;
            for r in state.reports {
                reports.insert(r.id, Arc::new(Mutex::new(r)));
            }
            let mut alerts = store.alerts.write().await;
            for a in state.alerts {
                alerts.insert(a.id, Arc::new(Mutex::new(a)));
            }
            let mut shelters = store.shelters.write().await;
            for s in state.shelters {
                shelters.insert(s.id, Arc::new(Mutex::new(s)));
            }
            info!(
                reports = reports.len(),
                alerts = alerts.len(),
                shelters = shelters.len(),
                "Incident store loaded"
            );
        }
        Ok(store)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_update_ms.load(Ordering::SeqCst)).unwrap_or_default()
    }

    fn commit(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    async fn entry<K: std::hash::Hash + Eq + Copy, V>(
        map: &Entities<K, V>,
        id: K,
    ) -> Option<Arc<Mutex<V>>> {
        map.read().await.get(&id).cloned()
    }

    // ── Reports ─────────────────────────────────────────────────────

    pub async fn insert_report(&self, report: Report) -> Result<Report, StoreError> {
        let _gate = self.gate.read().await;
        self.backend.save_report(&report).await?;
        self.reports
            .write()
            .await
            .insert(report.id, Arc::new(Mutex::new(report.clone())));
        self.commit();
        debug!(report_id = %report.id, "Report stored");
        Ok(report)
    }

    pub async fn report(&self, id: ReportId) -> Result<Report, StoreError> {
        let entry = Self::entry(&self.reports, id)
            .await
            .ok_or(StoreError::NotFound { entity: "report", id })?;
        let report = entry.lock().await;
        Ok(report.clone())
    }

    /// Apply a classification or status change atomically.
    pub async fn publish(&self, update: StateUpdate) -> Result<Report, StoreError> {
        let id = update.report_id();
        let _gate = self.gate.read().await;
        let entry = Self::entry(&self.reports, id)
            .await
            .ok_or(StoreError::NotFound { entity: "report", id })?;
        let mut current = entry.lock().await;

        let candidate = match apply_update(&current, update, Utc::now()) {
            Ok(Some(candidate)) => candidate,
            Ok(None) => return Ok(current.clone()),
            Err(e) => {
                warn!(report_id = %id, error = %e, "Report update rejected");
                return Err(e);
            }
        };

        self.backend.save_report(&candidate).await?;
        debug!(
            report_id = %id,
            from = %current.status,
            to = %candidate.status,
            "Report updated"
        );
        *current = candidate;
        self.commit();
        Ok(current.clone())
    }

    // ── Alerts ──────────────────────────────────────────────────────

    /// Create or refresh the single alert raised for `alert.source_report`.
    pub async fn upsert_report_alert(&self, alert: Alert) -> Result<Alert, StoreError> {
        let _gate = self.gate.read().await;
        let Some(report_id) = alert.source_report else {
            return self.insert_alert_gated(alert).await;
        };
        // The report's lock serializes upserts for the same report.
        let report_entry = Self::entry(&self.reports, report_id)
            .await
            .ok_or(StoreError::NotFound { entity: "report", id: report_id })?;
        let _report = report_entry.lock().await;

        let existing = {
            let alerts = self.alerts.read().await;
            let mut found = None;
            for entry in alerts.values() {
                if entry.lock().await.source_report == Some(report_id) {
                    found = Some(Arc::clone(entry));
                    break;
                }
            }
            found
        };

        let Some(entry) = existing else {
            return self.insert_alert_gated(alert).await;
        };

        let mut current = entry.lock().await;
        let candidate = Alert {
            id: current.id,
            created_at: current.created_at,
            ..alert
        };
        self.backend.save_alert(&candidate).await?;
        *current = candidate;
        self.commit();
        debug!(alert_id = %current.id, report_id = %report_id, "Report alert refreshed");
        Ok(current.clone())
    }

    pub async fn create_alert(&self, new: NewAlert, default_radius_km: f64) -> Result<Alert, StoreError> {
        let alert = new.into_alert(default_radius_km, Utc::now())?;
        let _gate = self.gate.read().await;
        self.insert_alert_gated(alert).await
    }

    /// Caller holds the gate.
    async fn insert_alert_gated(&self, alert: Alert) -> Result<Alert, StoreError> {
        self.backend.save_alert(&alert).await?;
        self.alerts
            .write()
            .await
            .insert(alert.id, Arc::new(Mutex::new(alert.clone())));
        self.commit();
        info!(alert_id = %alert.id, severity = %alert.severity, title = %alert.title, "Alert raised");
        Ok(alert)
    }

    pub async fn alert(&self, id: AlertId) -> Result<Alert, StoreError> {
        let entry = Self::entry(&self.alerts, id)
            .await
            .ok_or(StoreError::NotFound { entity: "alert", id })?;
        let alert = entry.lock().await;
        Ok(alert.clone())
    }

    pub async fn deactivate_alert(&self, id: AlertId) -> Result<Alert, StoreError> {
        let _gate = self.gate.read().await;
        let entry = Self::entry(&self.alerts, id)
            .await
            .ok_or(StoreError::NotFound { entity: "alert", id })?;
        let mut current = entry.lock().await;
        if !current.active {
            return Ok(current.clone());
        }
        let candidate = Alert {
            active: false,
            ..current.clone()
        };
        self.backend.save_alert(&candidate).await?;
        *current = candidate;
        self.commit();
        info!(alert_id = %id, "Alert deactivated");
        Ok(current.clone())
    }

    /// Deactivate every alert past its expiry. Returns how many changed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let entries: Vec<Arc<Mutex<Alert>>> = self.alerts.read().await.values().cloned().collect();
        let mut swept = 0;
        for entry in entries {
            let _gate = self.gate.read().await;
            let mut current = entry.lock().await;
            if !current.active || current.is_live_at(now) {
                continue;
            }
            let candidate = Alert {
                active: false,
                ..current.clone()
            };
            self.backend.save_alert(&candidate).await?;
            *current = candidate;
            self.commit();
            swept += 1;
        }
        if swept > 0 {
            info!(swept, "Expired alerts deactivated");
        }
        Ok(swept)
    }

    // ── Shelters ────────────────────────────────────────────────────

    pub async fn add_shelter(&self, new: NewShelter) -> Result<Shelter, StoreError> {
        let shelter = new.into_shelter(Utc::now())?;
        let _gate = self.gate.read().await;
        self.backend.save_shelter(&shelter).await?;
        self.shelters
            .write()
            .await
            .insert(shelter.id, Arc::new(Mutex::new(shelter.clone())));
        self.commit();
        info!(shelter_id = %shelter.id, name = %shelter.name, capacity = shelter.capacity, "Shelter added");
        Ok(shelter)
    }

    pub async fn shelter(&self, id: ShelterId) -> Result<Shelter, StoreError> {
        let entry = Self::entry(&self.shelters, id)
            .await
            .ok_or(StoreError::NotFound { entity: "shelter", id })?;
        let shelter = entry.lock().await;
        Ok(shelter.clone())
    }

    /// Set occupancy. Values outside `[0, capacity]` are rejected.
    pub async fn set_occupancy(&self, id: ShelterId, occupancy: i64) -> Result<Shelter, StoreError> {
        self.update_shelter(id, |s| s.check_occupancy(occupancy)).await
    }

    /// Add `delta` (may be negative) to occupancy, within `[0, capacity]`.
    pub async fn adjust_occupancy(&self, id: ShelterId, delta: i64) -> Result<Shelter, StoreError> {
        self.update_shelter(id, |s| s.check_occupancy(i64::from(s.occupancy).saturating_add(delta)))
            .await
    }

    async fn update_shelter(
        &self,
        id: ShelterId,
        next_occupancy: impl FnOnce(&Shelter) -> Result<u32, ValidationError>,
    ) -> Result<Shelter, StoreError> {
        let _gate = self.gate.read().await;
        let entry = Self::entry(&self.shelters, id)
            .await
            .ok_or(StoreError::NotFound { entity: "shelter", id })?;
        let mut current = entry.lock().await;
        let occupancy = next_occupancy(&current).inspect_err(|e| {
            warn!(shelter_id = %id, error = %e, "Occupancy update rejected");
        })?;
        if occupancy == current.occupancy {
            return Ok(current.clone());
        }
        let candidate = Shelter {
            occupancy,
            ..current.clone()
        };
        self.backend.save_shelter(&candidate).await?;
        *current = candidate;
        self.commit();
        debug!(shelter_id = %id, occupancy, available = current.available(), "Occupancy updated");
        Ok(current.clone())
    }

    pub async fn set_shelter_active(&self, id: ShelterId, active: bool) -> Result<Shelter, StoreError> {
        let _gate = self.gate.read().await;
        let entry = Self::entry(&self.shelters, id)
            .await
            .ok_or(StoreError::NotFound { entity: "shelter", id })?;
        let mut current = entry.lock().await;
        if current.active == active {
            return Ok(current.clone());
        }
        let candidate = Shelter {
            active,
            ..current.clone()
        };
        self.backend.save_shelter(&candidate).await?;
        *current = candidate;
        self.commit();
        Ok(current.clone())
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub async fn snapshot(&self) -> IncidentSnapshot {
        self.snapshot_at(Utc::now()).await
    }

    /// Consistent view with alert expiry evaluated at `now`.
    pub async fn snapshot_at(&self, now: DateTime<Utc>) -> IncidentSnapshot {
        let view = self.committed_view().await;
        IncidentSnapshot {
            version: view.version,
            last_update: view.last_update,
            taken_at: now,
            reports: view.reports.clone(),
            alerts: view
                .alerts
                .iter()
                .filter(|a| a.is_live_at(now))
                .cloned()
                .collect(),
            shelters: view.shelters.clone(),
        }
    }

    fn cached_view(&self) -> Option<Arc<CommittedView>> {
        let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        cached
            .as_ref()
            .filter(|v| v.version == self.version())
            .cloned()
    }

    async fn committed_view(&self) -> Arc<CommittedView> {
        if let Some(view) = self.cached_view() {
            return view;
        }

        let _gate = self.gate.write().await;
        if let Some(view) = self.cached_view() {
            return view;
        }

        let mut reports = Vec::new();
        for entry in self.reports.read().await.values() {
            reports.push(entry.lock().await.clone());
        }
        reports.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));

        let mut alerts = Vec::new();
        for entry in self.alerts.read().await.values() {
            alerts.push(entry.lock().await.clone());
        }
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let mut shelters = Vec::new();
        for entry in self.shelters.read().await.values() {
            let shelter = entry.lock().await;
            if shelter.active {
                shelters.push(shelter.clone());
            }
        }
        shelters.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        let view = Arc::new(CommittedView {
            version: self.version(),
            last_update: self.last_update(),
            reports,
            alerts,
            shelters,
        });
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&view));
        view
    }
}

/// Validate `update` against `current`. `Ok(None)` means nothing changes.
fn apply_update(
    current: &Report,
    update: StateUpdate,
    now: DateTime<Utc>,
) -> Result<Option<Report>, StoreError> {
    let conflict = |reason: String| StoreError::Conflict {
        entity: "report",
        id: current.id,
        reason,
    };

    match update {
        StateUpdate::Classified {
            classification,
            fallback,
            cycle,
            ..
        } => {
            if current.status.is_terminal() {
                return Err(conflict("report is resolved".to_string()));
            }
            // A fallback never replaces a classifier answer.
            if fallback && current.classification.is_some() {
                return Ok(None);
            }
            if current.classification.as_ref() == Some(&classification)
                && current.fallback_classified == fallback
                && current.classified_in == Some(cycle)
            {
                return Ok(None);
            }
            Ok(Some(Report {
                status: current.status.max(ReportStatus::Classified),
                classification: Some(classification),
                fallback_classified: fallback,
                classified_in: Some(cycle),
                updated_at: now,
                ..current.clone()
            }))
        }
        StateUpdate::Status { status, .. } => {
            if status == current.status {
                return Ok(None);
            }
            if !current.status.can_advance_to(status) {
                return Err(conflict(format!(
                    "status cannot move from {} to {status}",
                    current.status
                )));
            }
            if matches!(status, ReportStatus::Classified | ReportStatus::Dispatched)
                && current.classification.is_none()
            {
                return Err(conflict(format!("cannot mark {status} without a classification")));
            }
            Ok(Some(Report {
                status,
                updated_at: now,
                ..current.clone()
            }))
        }
    }
}
