//! Triage and notification dispatch pipeline.
//!
//! Every accepted report flows through:
//! 1. `ClassifierAdapter::classify()`: bounded call, degrades to a fallback
//! 2. `RoutingPolicy::route()`: pure mapping to notification intents
//! 3. `DispatchCoordinator`: rate-limited, deduplicated, retried sends
//! 4. `IncidentStore::publish()`: atomic state update for the map view

pub mod dispatch;
pub mod retry;
pub mod routing;
pub mod throttle;
pub mod triage;
pub mod types;

pub use dispatch::{BatchResult, CycleContext, DispatchBatch, DispatchCoordinator, DispatchLedger};
pub use routing::RoutingPolicy;
pub use triage::{Receipt, Resolution, TriagePipeline};
pub use types::{
    CycleToken, DedupKey, DispatchAttempt, DispatchOutcome, IntentKind, NotificationIntent,
    TriageState, TriageSummary,
};
