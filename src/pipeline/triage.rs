//! Triage orchestrator.
//!
//! One cycle per report: classify (one retry, then the conservative
//! fallback), route, raise the public alert if routed, dispatch, publish.
//! Cycles run concurrently across reports; cycles of one report run one at
//! a time, a later cycle waiting for the active one to finish. A cycle can
//! be cancelled at any point; cancellation stops new sends and retries but
//! does not retract anything already sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classification, ClassifierAdapter};
use crate::config::TriageConfig;
use crate::error::{ClassificationFailure, Error, Result, StoreError, ValidationError};
use crate::pipeline::dispatch::{BatchResult, CycleContext, DispatchCoordinator};
use crate::pipeline::routing::RoutingPolicy;
use crate::pipeline::types::{CycleToken, IntentKind, TriageCycle, TriageState, TriageSummary};
use crate::report::{NewReport, Report, ReportId, ReportStatus};
use crate::store::{Alert, IncidentStore, StateUpdate};

/// Intake acknowledgement.
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: ReportId,
    pub status: ReportStatus,
    pub cycle: CycleToken,
}

/// Result of resolving a report. `notice` finishes when the submitter's
/// status update has been dispatched.
pub struct Resolution {
    pub report: Report,
    pub notice: Option<JoinHandle<BatchResult>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleMode {
    Initial,
    /// Dispatch only if the classification changed.
    Reclassify,
}

enum Outcome {
    Fresh(Classification),
    /// Classification already stored by an earlier run of this cycle.
    Reused {
        classification: Classification,
        fallback: bool,
    },
    Fallback(ClassificationFailure),
    /// Re-classification failed; the existing classification stands.
    Kept,
}

struct ActiveCycle {
    cycle: CycleToken,
    cancel: CancellationToken,
    /// Fired when the last run of this cycle ends.
    finished: CancellationToken,
    runs: usize,
}

pub struct TriagePipeline {
    store: Arc<IncidentStore>,
    classifier: ClassifierAdapter,
    policy: RoutingPolicy,
    coordinator: Arc<DispatchCoordinator>,
    config: TriageConfig,
    active: Mutex<HashMap<ReportId, ActiveCycle>>,
}

impl TriagePipeline {
    pub fn new(
        store: Arc<IncidentStore>,
        classifier: ClassifierAdapter,
        policy: RoutingPolicy,
        coordinator: Arc<DispatchCoordinator>,
        config: TriageConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            policy,
            coordinator,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<IncidentStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<DispatchCoordinator> {
        &self.coordinator
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<ReportId, ActiveCycle>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `cycle` as the report's active cycle. Runs of the same
    /// cycle share its token; a different cycle waits until the active one
    /// has finished, so its sends and retries are never cut short.
    async fn begin_cycle(&self, report_id: ReportId, cycle: CycleToken) -> CycleContext {
        loop {
            let finished = {
                let mut active = self.active();
                match active.get_mut(&report_id) {
                    Some(current) if current.cycle == cycle => {
                        current.runs += 1;
                        return CycleContext {
                            report_id,
                            cycle,
                            cancel: current.cancel.clone(),
                        };
                    }
                    Some(current) => current.finished.clone(),
                    None => {
                        let ctx = CycleContext::new(report_id, cycle);
                        active.insert(
                            report_id,
                            ActiveCycle {
                                cycle,
                                cancel: ctx.cancel.clone(),
                                finished: CancellationToken::new(),
                                runs: 1,
                            },
                        );
                        return ctx;
                    }
                }
            };
            debug!(report_id = %report_id, cycle = %cycle, "Waiting for active triage cycle");
            finished.cancelled().await;
        }
    }

    fn end_cycle(&self, ctx: &CycleContext) {
        let mut active = self.active();
        let Some(current) = active.get_mut(&ctx.report_id) else {
            return;
        };
        if current.cycle != ctx.cycle {
            return;
        }
        current.runs = current.runs.saturating_sub(1);
        if current.runs > 0 {
            return;
        }
        if let Some(done) = active.remove(&ctx.report_id) {
            done.finished.cancel();
        }
    }

    /// Accept a report and start its triage cycle in the background.
    /// Returns as soon as the report is stored.
    pub async fn submit(self: &Arc<Self>, new: NewReport) -> Result<Receipt> {
        let report = Report::accept(new, Utc::now()).inspect_err(|e| {
            warn!(error = %e, "Report rejected at intake");
        })?;
        let report = self.store.insert_report(report).await?;
        let cycle = CycleToken::new();
        info!(report_id = %report.id, cycle = %cycle, "Report accepted");

        let pipeline = Arc::clone(self);
        let id = report.id;
        tokio::spawn(async move {
            if let Err(e) = pipeline.run(id, cycle).await {
                error!(report_id = %id, cycle = %cycle, error = %e, "Triage cycle failed");
            }
        });

        Ok(Receipt {
            id: report.id,
            status: report.status,
            cycle,
        })
    }

    /// Run (or re-run) a triage cycle to completion. Running the same cycle
    /// twice reuses its classification and sends nothing twice.
    pub async fn run(&self, report_id: ReportId, cycle: CycleToken) -> Result<TriageSummary> {
        let ctx = self.begin_cycle(report_id, cycle).await;
        let result = self.run_cycle(&ctx, CycleMode::Initial).await;
        self.end_cycle(&ctx);
        result
    }

    /// Classify again under a new cycle, after any active cycle finishes.
    /// Notifications go out only if the classification changed; a failed
    /// attempt keeps the old one.
    pub async fn reclassify(&self, report_id: ReportId) -> Result<TriageSummary> {
        let ctx = self.begin_cycle(report_id, CycleToken::new()).await;
        let result = self.run_cycle(&ctx, CycleMode::Reclassify).await;
        self.end_cycle(&ctx);
        result
    }

    /// Validate and start a re-classification in the background.
    pub async fn start_reclassify(self: &Arc<Self>, report_id: ReportId) -> Result<Report> {
        let report = self.store.report(report_id).await?;
        if report.status.is_terminal() {
            return Err(ValidationError::ReportClosed { id: report_id }.into());
        }
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pipeline.reclassify(report_id).await {
                error!(report_id = %report_id, error = %e, "Re-classification failed");
            }
        });
        Ok(report)
    }

    /// Cancel the report's active cycle. `false` if none was running.
    pub fn cancel(&self, report_id: ReportId) -> bool {
        match self.active().get(&report_id) {
            Some(active) => {
                info!(report_id = %report_id, cycle = %active.cycle, "Cancelling triage cycle");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and close the report without notifying anyone.
    pub async fn withdraw(&self, report_id: ReportId) -> Result<Report> {
        self.cancel(report_id);
        let report = self
            .store
            .publish(StateUpdate::Status {
                report_id,
                status: ReportStatus::Resolved,
            })
            .await?;
        self.coordinator.release(report_id);
        info!(report_id = %report_id, "Report withdrawn");
        Ok(report)
    }

    /// Close the report and tell the submitter. The dispatch ledger is
    /// released once the status update is out.
    pub async fn resolve(&self, report_id: ReportId) -> Result<Resolution> {
        let current = self.store.report(report_id).await?;
        if current.status.is_terminal() {
            return Ok(Resolution {
                report: current,
                notice: None,
            });
        }

        self.cancel(report_id);
        let report = self
            .store
            .publish(StateUpdate::Status {
                report_id,
                status: ReportStatus::Resolved,
            })
            .await?;
        info!(report_id = %report_id, "Report resolved");

        let ctx = CycleContext::new(report_id, CycleToken::new());
        let intent = self.policy.route_status_update(&report, ReportStatus::Resolved);
        let batch = self.coordinator.spawn(&ctx, vec![intent]);
        let coordinator = Arc::clone(&self.coordinator);
        let deadline = Instant::now() + self.config.deadline;
        let notice = tokio::spawn(async move {
            let result = batch.join_until(deadline).await;
            coordinator.release(report_id);
            result
        });

        Ok(Resolution {
            report,
            notice: Some(notice),
        })
    }

    async fn classify_with_retry(&self, report: &Report) -> std::result::Result<Classification, ClassificationFailure> {
        let mut last = match self.classifier.classify(report).await {
            Ok(c) => return Ok(c),
            Err(f) => f,
        };
        for retry in 1..=self.config.classification_retries {
            debug!(report_id = %report.id, retry, "Retrying classification");
            match self.classifier.classify(report).await {
                Ok(c) => return Ok(c),
                Err(f) => last = f,
            }
        }
        Err(last)
    }

    async fn run_cycle(&self, ctx: &CycleContext, mode: CycleMode) -> Result<TriageSummary> {
        let started = Instant::now();
        let mut tracker = TriageCycle::new(ctx.report_id, ctx.cycle);
        let report = self.store.report(ctx.report_id).await?;
        if report.status.is_terminal() {
            return Err(ValidationError::ReportClosed { id: report.id }.into());
        }

        advance(&mut tracker, TriageState::Classifying, None)?;

        let reusable = mode == CycleMode::Initial && report.classified_in == Some(ctx.cycle);
        let outcome = match report.classification {
            Some(ref c) if reusable => {
                debug!(report_id = %report.id, cycle = %ctx.cycle, "Reusing classification from this cycle");
                Outcome::Reused {
                    classification: c.clone(),
                    fallback: report.fallback_classified,
                }
            }
            _ => {
                let attempt = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => None,
                    result = self.classify_with_retry(&report) => Some(result),
                };
                match attempt {
                    None => return Ok(self.cancelled(tracker, &report, 0, Vec::new())),
                    Some(Ok(c)) => Outcome::Fresh(c),
                    Some(Err(_)) if mode == CycleMode::Reclassify && report.classification.is_some() => {
                        Outcome::Kept
                    }
                    Some(Err(f)) => Outcome::Fallback(f),
                }
            }
        };

        let previous = report.classification.clone();
        let report = match outcome {
            Outcome::Fresh(classification) => {
                let updated = self
                    .store
                    .publish(StateUpdate::Classified {
                        report_id: report.id,
                        classification,
                        fallback: false,
                        cycle: ctx.cycle,
                    })
                    .await?;
                advance(&mut tracker, TriageState::Routed, None)?;
                updated
            }
            Outcome::Reused {
                classification,
                fallback,
            } => {
                if fallback {
                    advance(
                        &mut tracker,
                        TriageState::FallbackClassified,
                        Some("fallback reused".into()),
                    )?;
                }
                let updated = self
                    .store
                    .publish(StateUpdate::Classified {
                        report_id: report.id,
                        classification,
                        fallback,
                        cycle: ctx.cycle,
                    })
                    .await?;
                advance(&mut tracker, TriageState::Routed, None)?;
                updated
            }
            Outcome::Fallback(failure) => {
                warn!(
                    report_id = %report.id,
                    reason = failure.reason_code(),
                    "Classifier unavailable; using conservative fallback"
                );
                advance(
                    &mut tracker,
                    TriageState::FallbackClassified,
                    Some(failure.reason_code().to_string()),
                )?;
                let updated = self
                    .store
                    .publish(StateUpdate::Classified {
                        report_id: report.id,
                        classification: Classification::fallback(),
                        fallback: true,
                        cycle: ctx.cycle,
                    })
                    .await?;
                advance(&mut tracker, TriageState::Routed, None)?;
                updated
            }
            Outcome::Kept => {
                info!(report_id = %report.id, "Re-classification failed; keeping current classification");
                advance(&mut tracker, TriageState::Routed, Some("classification kept".into()))?;
                report
            }
        };

        let Some(classification) = report.classification.clone() else {
            return Err(StoreError::Conflict {
                entity: "report",
                id: report.id,
                reason: "classified report has no classification".to_string(),
            }
            .into());
        };

        if ctx.cancel.is_cancelled() {
            return Ok(self.cancelled(tracker, &report, 0, Vec::new()));
        }

        let changed = previous.as_ref() != Some(&classification);
        if mode == CycleMode::Reclassify && !changed {
            advance(&mut tracker, TriageState::Completed, Some("classification unchanged".into()))?;
            return Ok(summary(tracker, &report, BatchResult::default()));
        }

        let intents = self.policy.route(&report, &classification);
        if intents.iter().any(|i| i.kind == IntentKind::PublicAreaAlert) {
            let alert = Alert::for_report(
                &report,
                &classification,
                self.policy.effective_severity(&classification),
                report.radius_km.unwrap_or(self.policy.default_radius_km),
                chrono::Duration::from_std(self.config.alert_ttl).unwrap_or(chrono::Duration::hours(6)),
                Utc::now(),
            );
            self.store.upsert_report_alert(alert).await?;
        }

        advance(&mut tracker, TriageState::Dispatching, None)?;
        let batch = self.coordinator.spawn(ctx, intents);
        let result = batch.join_until(started + self.config.deadline).await;

        if ctx.cancel.is_cancelled() {
            let BatchResult {
                attempts,
                outstanding,
                deduplicated,
            } = result;
            let mut summary = self.cancelled(tracker, &report, deduplicated, attempts);
            summary.pending_reconciliation = outstanding;
            return Ok(summary);
        }

        match self
            .store
            .publish(StateUpdate::Status {
                report_id: report.id,
                status: ReportStatus::Dispatched,
            })
            .await
        {
            Ok(_) => {}
            // Resolved while dispatching.
            Err(StoreError::Conflict { reason, .. }) => {
                debug!(report_id = %report.id, reason = %reason, "Dispatched status not published");
            }
            Err(e) => return Err(Error::Store(e)),
        }

        let reason = (!result.outstanding.is_empty()).then(|| "triage deadline passed".to_string());
        advance(&mut tracker, TriageState::Completed, reason)?;
        let summary = summary(tracker, &report, result);
        info!(
            report_id = %summary.report_id,
            cycle = %summary.cycle,
            attempts = summary.attempts.len(),
            deduplicated = summary.deduplicated,
            reconciling = summary.pending_reconciliation.len(),
            fallback = summary.fallback_used,
            "Triage cycle completed"
        );
        Ok(summary)
    }

    fn cancelled(
        &self,
        mut tracker: TriageCycle,
        report: &Report,
        deduplicated: usize,
        attempts: Vec<crate::pipeline::types::DispatchAttempt>,
    ) -> TriageSummary {
        if let Err(e) = tracker.transition_to(TriageState::Cancelled, Some("cancelled".into())) {
            warn!(error = %e, "Cancel transition rejected");
        }
        info!(report_id = %report.id, cycle = %tracker.cycle, "Triage cycle cancelled");
        summary(
            tracker,
            report,
            BatchResult {
                attempts,
                outstanding: Vec::new(),
                deduplicated,
            },
        )
    }
}

fn advance(tracker: &mut TriageCycle, state: TriageState, reason: Option<String>) -> Result<()> {
    debug!(
        report_id = %tracker.report_id,
        cycle = %tracker.cycle,
        from = %tracker.state,
        to = %state,
        "Triage transition"
    );
    tracker.transition_to(state, reason)?;
    Ok(())
}

fn summary(tracker: TriageCycle, report: &Report, result: BatchResult) -> TriageSummary {
    TriageSummary {
        report_id: tracker.report_id,
        cycle: tracker.cycle,
        state: tracker.state,
        transitions: tracker.transitions,
        classification: report.classification.clone(),
        fallback_used: report.fallback_classified,
        attempts: result.attempts,
        deduplicated: result.deduplicated,
        pending_reconciliation: result.outstanding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::channels::{ChannelKind, ChannelSet, Delivery, Notification, NotificationChannel};
    use crate::classifier::{ClassificationRequest, Classifier, Severity};
    use crate::config::{DispatchConfig, RetryConfig};
    use crate::error::DispatchError;
    use crate::pipeline::types::DispatchOutcome;
    use crate::store::MemoryBackend;

    /// Answers from a script; `None` entries fail.
    struct ScriptedClassifier {
        answers: Mutex<Vec<Option<Classification>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn classify(
            &self,
            _request: &ClassificationRequest,
        ) -> std::result::Result<Classification, ClassificationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            let next = if answers.is_empty() { None } else { answers.remove(0) };
            next.ok_or(ClassificationFailure::Unavailable {
                classifier: "scripted".into(),
                reason: "scripted failure".into(),
            })
        }
    }

    struct CountingChannel {
        kind: ChannelKind,
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationChannel for CountingChannel {
        fn name(&self) -> &str {
            "counting"
        }

        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, n: &Notification) -> std::result::Result<Delivery, DispatchError> {
            self.sent.lock().unwrap().push(n.clone());
            Ok(Delivery::single(None))
        }
    }

    struct Harness {
        pipeline: Arc<TriagePipeline>,
        classifier: Arc<ScriptedClassifier>,
        direct: Arc<CountingChannel>,
        broadcast: Arc<CountingChannel>,
    }

    fn harness(answers: Vec<Option<Classification>>) -> Harness {
        let classifier = Arc::new(ScriptedClassifier {
            answers: Mutex::new(answers),
            calls: AtomicU32::new(0),
        });
        let direct = Arc::new(CountingChannel {
            kind: ChannelKind::Direct,
            sent: Mutex::new(Vec::new()),
        });
        let broadcast = Arc::new(CountingChannel {
            kind: ChannelKind::Broadcast,
            sent: Mutex::new(Vec::new()),
        });
        let coordinator = Arc::new(DispatchCoordinator::new(
            ChannelSet::new(direct.clone(), broadcast.clone()),
            DispatchConfig {
                retry: RetryConfig {
                    jitter: false,
                    ..RetryConfig::default()
                },
                ..DispatchConfig::default()
            },
        ));
        let store = Arc::new(IncidentStore::new(Arc::new(MemoryBackend::new())));
        let pipeline = Arc::new(TriagePipeline::new(
            store,
            ClassifierAdapter::new(classifier.clone(), Duration::from_secs(8)),
            RoutingPolicy::default_policy(),
            coordinator,
            TriageConfig::default(),
        ));
        Harness {
            pipeline,
            classifier,
            direct,
            broadcast,
        }
    }

    fn classification(severity: Severity, category: &str) -> Classification {
        Classification::new(severity, category, 0.5, vec!["Send a unit".into()], "10 minutes")
    }

    async fn stored(h: &Harness) -> Report {
        let report = Report::accept(
            NewReport {
                description: "Water entering ground floor".into(),
                submitter: "u1".into(),
                contact: Some("+14155550100".into()),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap();
        h.pipeline.store().insert_report(report).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn medium_report_runs_full_cycle() {
        let h = harness(vec![Some(classification(Severity::Medium, "flood"))]);
        let report = stored(&h).await;
        let summary = h.pipeline.run(report.id, CycleToken::new()).await.unwrap();

        assert_eq!(summary.state, TriageState::Completed);
        assert!(!summary.fallback_used);
        assert_eq!(summary.attempts.len(), 2);
        assert!(summary.attempts.iter().all(|a| a.outcome == DispatchOutcome::Success));
        let states: Vec<_> = summary.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                TriageState::Classifying,
                TriageState::Routed,
                TriageState::Dispatching,
                TriageState::Completed
            ]
        );
        let stored = h.pipeline.store().report(report.id).await.unwrap();
        assert_eq!(stored.status, ReportStatus::Dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn one_retry_then_fallback() {
        let h = harness(vec![None, None, Some(classification(Severity::Low, "other"))]);
        let report = stored(&h).await;
        let summary = h.pipeline.run(report.id, CycleToken::new()).await.unwrap();

        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 2);
        assert!(summary.fallback_used);
        assert_eq!(summary.classification.unwrap().severity, Severity::High);
        assert!(summary.transitions.iter().any(|t| t.to == TriageState::FallbackClassified));
        // high: submitter, responders, public area
        assert_eq!(summary.attempts.len(), 3);
        assert_eq!(h.pipeline.store().snapshot().await.alerts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_classification() {
        let h = harness(vec![None, Some(classification(Severity::Low, "other"))]);
        let report = stored(&h).await;
        let summary = h.pipeline.run(report.id, CycleToken::new()).await.unwrap();
        assert!(!summary.fallback_used);
        assert_eq!(summary.attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reclassify_unchanged_sends_nothing() {
        let c = classification(Severity::Medium, "flood");
        let h = harness(vec![Some(c.clone()), Some(c)]);
        let report = stored(&h).await;
        h.pipeline.run(report.id, CycleToken::new()).await.unwrap();
        let sent_before = h.direct.sent.lock().unwrap().len() + h.broadcast.sent.lock().unwrap().len();

        let summary = h.pipeline.reclassify(report.id).await.unwrap();
        assert_eq!(summary.state, TriageState::Completed);
        assert!(summary.attempts.is_empty());
        let sent_after = h.direct.sent.lock().unwrap().len() + h.broadcast.sent.lock().unwrap().len();
        assert_eq!(sent_before, sent_after);
    }

    #[tokio::test(start_paused = true)]
    async fn reclassify_escalation_notifies_again() {
        let h = harness(vec![
            Some(classification(Severity::Low, "other")),
            Some(classification(Severity::Critical, "explosion")),
        ]);
        let report = stored(&h).await;
        h.pipeline.run(report.id, CycleToken::new()).await.unwrap();
        let summary = h.pipeline.reclassify(report.id).await.unwrap();
        assert_eq!(summary.attempts.len(), 3);
        assert_eq!(h.direct.sent.lock().unwrap().len(), 2);
        assert!(h.broadcast.sent.lock().unwrap()[0].urgent);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reclassify_keeps_classification() {
        let h = harness(vec![Some(classification(Severity::Medium, "flood"))]);
        let report = stored(&h).await;
        h.pipeline.run(report.id, CycleToken::new()).await.unwrap();
        let summary = h.pipeline.reclassify(report.id).await.unwrap();
        assert!(!summary.fallback_used);
        assert_eq!(summary.classification.unwrap().severity, Severity::Medium);
        assert!(summary.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_report_cannot_be_triaged() {
        let h = harness(vec![]);
        let report = stored(&h).await;
        h.pipeline.withdraw(report.id).await.unwrap();
        let err = h.pipeline.run(report.id, CycleToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::ReportClosed { .. })));
        assert!(h.direct.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_sends_status_update_and_releases_ledger() {
        let h = harness(vec![Some(classification(Severity::Low, "other"))]);
        let report = stored(&h).await;
        h.pipeline.run(report.id, CycleToken::new()).await.unwrap();
        assert_eq!(h.pipeline.coordinator().attempts(report.id).len(), 1);

        let resolution = h.pipeline.resolve(report.id).await.unwrap();
        assert_eq!(resolution.report.status, ReportStatus::Resolved);
        let result = resolution.notice.unwrap().await.unwrap();
        assert_eq!(result.attempts.len(), 1);

        let sent = h.direct.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].content.status, Some(ReportStatus::Resolved));
        drop(sent);
        assert!(h.pipeline.coordinator().attempts(report.id).is_empty());

        // Resolving again is a no-op.
        assert!(h.pipeline.resolve(report.id).await.unwrap().notice.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_keeps_fallback_flag() {
        let h = harness(vec![]);
        let report = stored(&h).await;
        let cycle = CycleToken::new();

        let first = h.pipeline.run(report.id, cycle).await.unwrap();
        assert!(first.fallback_used);

        let second = h.pipeline.run(report.id, cycle).await.unwrap();
        assert!(second.fallback_used);
        assert_eq!(second.deduplicated, 3);
        // The stored fallback is reused, not re-requested.
        assert_eq!(h.classifier.calls.load(Ordering::SeqCst), 2);

        let stored = h.pipeline.store().report(report.id).await.unwrap();
        assert!(stored.fallback_classified);
        assert_eq!(stored.classification.unwrap().category, "unclassified");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_active_cycle() {
        let h = harness(vec![]);
        let report = stored(&h).await;
        assert!(!h.pipeline.cancel(report.id));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_rejects_invalid_report() {
        let h = harness(vec![]);
        let err = h
            .pipeline
            .submit(NewReport {
                description: "".into(),
                submitter: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::EmptyDescription)));
    }
}
