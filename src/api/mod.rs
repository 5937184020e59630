//! HTTP surface: report intake, map snapshot, alerts, shelters.

pub mod routes;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};

use crate::error::{Error, StoreError, ValidationError};
use crate::pipeline::TriagePipeline;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TriagePipeline>,
}

/// Build the router with every public route.
pub fn router(pipeline: Arc<TriagePipeline>) -> Router {
    let state = AppState { pipeline };

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/snapshot", get(routes::snapshot))
        .route("/api/reports", get(routes::list_reports).post(routes::submit_report))
        .route("/api/reports/{id}", get(routes::get_report))
        .route("/api/reports/{id}/reclassify", post(routes::reclassify_report))
        .route("/api/reports/{id}/withdraw", post(routes::withdraw_report))
        .route("/api/reports/{id}/resolve", post(routes::resolve_report))
        .route("/api/alerts", get(routes::list_alerts).post(routes::create_alert))
        .route("/api/alerts/{id}/deactivate", post(routes::deactivate_alert))
        .route("/api/shelters", get(routes::list_shelters).post(routes::create_shelter))
        .route("/api/shelters/{id}/occupancy", put(routes::set_occupancy))
        .route("/api/shelters/{id}/occupancy/adjust", post(routes::adjust_occupancy))
        .route("/api/shelters/{id}/active", put(routes::set_shelter_active))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Domain(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Domain(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Domain(e.into())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::Domain(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Domain(Error::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Domain(Error::Store(e)) => match e {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::Conflict { .. } => StatusCode::CONFLICT,
                StoreError::Validation(_) => StatusCode::BAD_REQUEST,
                StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Domain(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::BadRequest(m) => m.clone(),
            Self::Domain(e) => e.to_string(),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %message, "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
