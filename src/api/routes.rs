//! Request handlers and response views.
//!
//! Views never expose submitter contact details or dispatch bookkeeping.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::classifier::Classification;
use crate::report::model::truncate_chars;
use crate::report::{NewReport, Report, ReportId, ReportStatus};
use crate::store::{Alert, IncidentSnapshot, NewAlert, NewShelter, Shelter};

/// Map feed description length.
const MAP_DESCRIPTION_CHARS: usize = 100;

// ── Views ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ReportView {
    pub id: ReportId,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: ReportStatus,
    pub severity: Option<String>,
    pub category: Option<String>,
    pub has_image: bool,
    pub submitted_at: DateTime<Utc>,
}

impl ReportView {
    fn for_map(report: &Report) -> Self {
        let classification = report.classification.as_ref();
        Self {
            id: report.id,
            title: report.display_title(),
            description: truncate_chars(&report.description, MAP_DESCRIPTION_CHARS),
            location: report.location.clone(),
            latitude: report.coordinate.map(|c| c.latitude),
            longitude: report.coordinate.map(|c| c.longitude),
            status: report.status,
            severity: classification.map(|c| c.severity.to_string()),
            category: classification.map(|c| c.category.clone()),
            has_image: report.image_ref.is_some(),
            submitted_at: report.submitted_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReportDetail {
    pub id: ReportId,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_km: Option<f64>,
    pub status: ReportStatus,
    pub classification: Option<Classification>,
    pub fallback_classified: bool,
    pub has_image: bool,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Report> for ReportDetail {
    fn from(report: &Report) -> Self {
        Self {
            id: report.id,
            title: report.display_title(),
            description: report.description.clone(),
            location: report.location.clone(),
            latitude: report.coordinate.map(|c| c.latitude),
            longitude: report.coordinate.map(|c| c.longitude),
            radius_km: report.radius_km,
            status: report.status,
            classification: report.classification.clone(),
            fallback_classified: report.fallback_classified,
            has_image: report.image_ref.is_some(),
            submitted_at: report.submitted_at,
            updated_at: report.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ShelterView {
    #[serde(flatten)]
    pub shelter: Shelter,
    pub available: u32,
}

impl From<Shelter> for ShelterView {
    fn from(shelter: Shelter) -> Self {
        let available = shelter.available();
        Self { shelter, available }
    }
}

/// Map synchronisation payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub version: u64,
    pub last_update: DateTime<Utc>,
    pub reports: Vec<ReportView>,
    pub alerts: Vec<Alert>,
    pub shelters: Vec<ShelterView>,
}

impl From<IncidentSnapshot> for SnapshotView {
    fn from(snapshot: IncidentSnapshot) -> Self {
        Self {
            version: snapshot.version,
            last_update: snapshot.last_update,
            reports: snapshot.reports.iter().map(ReportView::for_map).collect(),
            alerts: snapshot.alerts,
            shelters: snapshot.shelters.into_iter().map(ShelterView::from).collect(),
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid id: {raw}")))
}

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "crisis-triage"
    }))
}

// ── Snapshot ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub since: Option<u64>,
}

pub async fn snapshot(State(state): State<AppState>, Query(query): Query<SnapshotQuery>) -> Response {
    let store = state.pipeline.store();
    if query.since.is_some_and(|since| since >= store.version()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    Json(SnapshotView::from(store.snapshot().await)).into_response()
}

// ── Reports ─────────────────────────────────────────────────────────────

pub async fn submit_report(
    State(state): State<AppState>,
    Json(body): Json<NewReport>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.pipeline.submit(body).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Map feed: only reports that can be placed on the map.
pub async fn list_reports(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.pipeline.store().snapshot().await;
    let reports: Vec<ReportView> = snapshot
        .reports
        .iter()
        .filter(|r| r.coordinate.is_some())
        .map(ReportView::for_map)
        .collect();
    Json(reports)
}

pub async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReportDetail>, ApiError> {
    let report = state.pipeline.store().report(parse_id(&id)?).await?;
    Ok(Json(ReportDetail::from(&report)))
}

pub async fn reclassify_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.pipeline.start_reclassify(parse_id(&id)?).await?;
    info!(report_id = %report.id, "Re-classification requested");
    Ok((StatusCode::ACCEPTED, Json(ReportDetail::from(&report))))
}

pub async fn withdraw_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReportDetail>, ApiError> {
    let report = state.pipeline.withdraw(parse_id(&id)?).await?;
    Ok(Json(ReportDetail::from(&report)))
}

pub async fn resolve_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ReportDetail>, ApiError> {
    // The status notice finishes in the background.
    let resolution = state.pipeline.resolve(parse_id(&id)?).await?;
    Ok(Json(ReportDetail::from(&resolution.report)))
}

// ── Alerts ──────────────────────────────────────────────────────────────

pub async fn list_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.store().snapshot().await.alerts)
}

pub async fn create_alert(
    State(state): State<AppState>,
    Json(body): Json<NewAlert>,
) -> Result<impl IntoResponse, ApiError> {
    let radius = state.pipeline.policy().default_radius_km;
    let alert = state.pipeline.store().create_alert(body, radius).await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

pub async fn deactivate_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Alert>, ApiError> {
    let alert = state.pipeline.store().deactivate_alert(parse_id(&id)?).await?;
    Ok(Json(alert))
}

// ── Shelters ────────────────────────────────────────────────────────────

pub async fn list_shelters(State(state): State<AppState>) -> impl IntoResponse {
    let shelters: Vec<ShelterView> = state
        .pipeline
        .store()
        .snapshot()
        .await
        .shelters
        .into_iter()
        .map(ShelterView::from)
        .collect();
    Json(shelters)
}

pub async fn create_shelter(
    State(state): State<AppState>,
    Json(body): Json<NewShelter>,
) -> Result<impl IntoResponse, ApiError> {
    let shelter = state.pipeline.store().add_shelter(body).await?;
    Ok((StatusCode::CREATED, Json(ShelterView::from(shelter))))
}

#[derive(Debug, Deserialize)]
pub struct OccupancyRequest {
    pub occupancy: i64,
}

pub async fn set_occupancy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OccupancyRequest>,
) -> Result<Json<ShelterView>, ApiError> {
    let shelter = state
        .pipeline
        .store()
        .set_occupancy(parse_id(&id)?, body.occupancy)
        .await?;
    Ok(Json(ShelterView::from(shelter)))
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub delta: i64,
}

pub async fn adjust_occupancy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AdjustRequest>,
) -> Result<Json<ShelterView>, ApiError> {
    let shelter = state
        .pipeline
        .store()
        .adjust_occupancy(parse_id(&id)?, body.delta)
        .await?;
    Ok(Json(ShelterView::from(shelter)))
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

pub async fn set_shelter_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ActiveRequest>,
) -> Result<Json<ShelterView>, ApiError> {
    let shelter = state
        .pipeline
        .store()
        .set_shelter_active(parse_id(&id)?, body.active)
        .await?;
    Ok(Json(ShelterView::from(shelter)))
}
