//! Types shared across routing, dispatch and triage orchestration.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::{Audience, ChannelKind, Notification};
use crate::classifier::{Classification, Severity};
use crate::error::PipelineError;
use crate::report::ReportId;

/// Identity of one triage cycle. Dedup keys are scoped to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleToken(Uuid);

impl CycleToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CycleToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CycleToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an intent exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    SubmitterNotice,
    ResponderBroadcast,
    PublicAreaAlert,
    StatusUpdate,
}

/// A planned, not-yet-executed notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationIntent {
    pub kind: IntentKind,
    pub channel: ChannelKind,
    pub notification: Notification,
}

impl NotificationIntent {
    pub fn report_id(&self) -> ReportId {
        self.notification.report_id
    }

    pub fn audience(&self) -> &Audience {
        &self.notification.audience
    }

    /// Priority, inherited from the effective severity.
    pub fn severity(&self) -> Severity {
        self.notification.severity
    }

    pub fn dedup_key(&self, cycle: CycleToken) -> DedupKey {
        DedupKey::new(self.report_id(), self.channel, self.audience(), cycle)
    }
}

/// Hash of (report, channel, audience, cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(u64);

impl DedupKey {
    pub fn new(
        report_id: ReportId,
        channel: ChannelKind,
        audience: &Audience,
        cycle: CycleToken,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        report_id.hash(&mut hasher);
        channel.hash(&mut hasher);
        audience.key().hash(&mut hasher);
        cycle.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Terminal outcome of one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success,
    /// Retries exhausted on retriable errors.
    RetriableFailure,
    PermanentFailure,
    /// Dropped from a full rate-limit queue.
    Shed,
    /// Cycle cancelled before the intent could finish.
    Cancelled,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::RetriableFailure => "retriable_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::Shed => "shed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Record of how one intent was dispatched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchAttempt {
    pub report_id: ReportId,
    pub cycle: CycleToken,
    pub dedup_key: DedupKey,
    pub channel: ChannelKind,
    /// Concrete sender ("sms", "slack", ...).
    pub channel_name: String,
    pub intent: IntentKind,
    pub audience: String,
    pub severity: Severity,
    pub outcome: DispatchOutcome,
    /// Sends actually made (0 when shed or cancelled before the first).
    pub attempts: u32,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ── Triage cycle state machine ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageState {
    Pending,
    Classifying,
    FallbackClassified,
    Routed,
    Dispatching,
    Completed,
    Cancelled,
}

impl TriageState {
    pub fn can_transition_to(&self, target: TriageState) -> bool {
        use TriageState::*;

        matches!(
            (self, target),
            (Pending, Classifying) | (Pending, Cancelled) |
            (Classifying, Routed) | (Classifying, FallbackClassified) | (Classifying, Cancelled) |
            (FallbackClassified, Routed) | (FallbackClassified, Cancelled) |
            // Nothing to send (unchanged re-classification)
            (Routed, Dispatching) | (Routed, Completed) | (Routed, Cancelled) |
            (Dispatching, Completed) | (Dispatching, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for TriageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Classifying => "classifying",
            Self::FallbackClassified => "fallback_classified",
            Self::Routed => "routed",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: TriageState,
    pub to: TriageState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Tracks one cycle through its states.
#[derive(Debug, Clone)]
pub struct TriageCycle {
    pub report_id: ReportId,
    pub cycle: CycleToken,
    pub state: TriageState,
    pub transitions: Vec<StateTransition>,
}

impl TriageCycle {
    pub fn new(report_id: ReportId, cycle: CycleToken) -> Self {
        Self {
            report_id,
            cycle,
            state: TriageState::Pending,
            transitions: Vec::new(),
        }
    }

    pub fn transition_to(
        &mut self,
        target: TriageState,
        reason: Option<String>,
    ) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(target) {
            return Err(PipelineError::InvalidTransition {
                report_id: self.report_id,
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.transitions.push(StateTransition {
            from: self.state,
            to: target,
            timestamp: Utc::now(),
            reason,
        });
        self.state = target;
        Ok(())
    }
}

/// Completion summary of one triage cycle.
#[derive(Debug, Clone, Serialize)]
pub struct TriageSummary {
    pub report_id: ReportId,
    pub cycle: CycleToken,
    pub state: TriageState,
    pub transitions: Vec<StateTransition>,
    pub classification: Option<Classification>,
    pub fallback_used: bool,
    /// Terminal attempts recorded before completion.
    pub attempts: Vec<DispatchAttempt>,
    /// Intents skipped because their key was already dispatched this cycle.
    pub deduplicated: usize,
    /// Intents still running when the deadline passed.
    pub pending_reconciliation: Vec<DedupKey>,
}

impl TriageSummary {
    pub fn permanent_failures(&self) -> impl Iterator<Item = &DispatchAttempt> {
        self.attempts
            .iter()
            .filter(|a| a.outcome == DispatchOutcome::PermanentFailure)
    }

    pub fn needs_reconciliation(&self) -> bool {
        !self.pending_reconciliation.is_empty()
    }
}
