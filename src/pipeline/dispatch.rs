//! Dispatch coordinator.
//!
//! Executes notification intents against the channel set. Each intent runs in
//! its own task: wait for a rate-limit slot, send under a timeout, retry
//! retriable failures with backoff. Intents of one batch run concurrently;
//! one intent's attempts are sequential.
//!
//! A ledger per report remembers which dedup keys were claimed and what
//! happened to them. It lives until the report is resolved.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::{ChannelKind, ChannelSet};
use crate::classifier::Severity;
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::pipeline::retry::{BackoffPolicy, wait_with_cancel};
use crate::pipeline::throttle::Throttle;
use crate::pipeline::types::{
    CycleToken, DedupKey, DispatchAttempt, DispatchOutcome, IntentKind, NotificationIntent,
};
use crate::report::ReportId;

/// Identity and cancellation of the cycle a batch belongs to.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub report_id: ReportId,
    pub cycle: CycleToken,
    pub cancel: CancellationToken,
}

impl CycleContext {
    pub fn new(report_id: ReportId, cycle: CycleToken) -> Self {
        Self {
            report_id,
            cycle,
            cancel: CancellationToken::new(),
        }
    }
}

// ── Ledger ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ReportLedger {
    claimed: HashSet<DedupKey>,
    attempts: Vec<DispatchAttempt>,
}

/// Claimed dedup keys and recorded attempts, per report.
#[derive(Default)]
pub struct DispatchLedger {
    reports: Mutex<HashMap<ReportId, ReportLedger>>,
}

impl DispatchLedger {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ReportId, ReportLedger>> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `key`. `false` if it was already claimed.
    pub fn claim(&self, report_id: ReportId, key: DedupKey) -> bool {
        self.lock().entry(report_id).or_default().claimed.insert(key)
    }

    /// Record a finished attempt. Attempts for a released report are
    /// dropped so its ledger stays gone.
    pub fn record(&self, attempt: DispatchAttempt) -> bool {
        match self.lock().get_mut(&attempt.report_id) {
            Some(ledger) => {
                ledger.attempts.push(attempt);
                true
            }
            None => false,
        }
    }

    pub fn attempts(&self, report_id: ReportId) -> Vec<DispatchAttempt> {
        self.lock()
            .get(&report_id)
            .map(|l| l.attempts.clone())
            .unwrap_or_default()
    }

    /// Claimed keys with no recorded attempt yet.
    pub fn outstanding(&self, report_id: ReportId) -> Vec<DedupKey> {
        let reports = self.lock();
        let Some(ledger) = reports.get(&report_id) else {
            return Vec::new();
        };
        let done: HashSet<DedupKey> = ledger.attempts.iter().map(|a| a.dedup_key).collect();
        ledger
            .claimed
            .iter()
            .filter(|k| !done.contains(k))
            .copied()
            .collect()
    }

    pub fn release(&self, report_id: ReportId) -> bool {
        self.lock().remove(&report_id).is_some()
    }
}

// ── Coordinator ─────────────────────────────────────────────────────

pub struct DispatchCoordinator {
    channels: ChannelSet,
    direct: Throttle,
    broadcast: Throttle,
    backoff: BackoffPolicy,
    send_timeout: Duration,
    ledger: DispatchLedger,
}

/// What one spawned intent is, for reporting before it finishes.
struct Pending {
    key: DedupKey,
    channel: ChannelKind,
    channel_name: String,
    intent: IntentKind,
    audience: String,
    severity: Severity,
    handle: JoinHandle<DispatchAttempt>,
}

/// Intents spawned for one cycle.
pub struct DispatchBatch {
    ctx: CycleContext,
    pending: Vec<Pending>,
    /// Intents skipped because their key was already claimed.
    pub deduplicated: usize,
}

/// Result of waiting on a batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub attempts: Vec<DispatchAttempt>,
    /// Keys still in flight when the deadline passed. Their tasks keep
    /// running and record into the ledger when done.
    pub outstanding: Vec<DedupKey>,
    pub deduplicated: usize,
}

impl DispatchCoordinator {
    pub fn new(channels: ChannelSet, config: DispatchConfig) -> Self {
        Self {
            direct: Throttle::new(channels.direct.name(), config.direct),
            broadcast: Throttle::new(channels.broadcast.name(), config.broadcast),
            channels,
            backoff: BackoffPolicy::new(config.retry),
            send_timeout: config.send_timeout,
            ledger: DispatchLedger::default(),
        }
    }

    pub fn throttle(&self, kind: ChannelKind) -> &Throttle {
        match kind {
            ChannelKind::Direct => &self.direct,
            ChannelKind::Broadcast => &self.broadcast,
        }
    }

    pub fn ledger(&self) -> &DispatchLedger {
        &self.ledger
    }

    pub fn attempts(&self, report_id: ReportId) -> Vec<DispatchAttempt> {
        self.ledger.attempts(report_id)
    }

    /// Drop the ledger of a resolved report.
    pub fn release(&self, report_id: ReportId) {
        if self.ledger.release(report_id) {
            debug!(report_id = %report_id, "Dispatch ledger released");
        }
    }

    /// Claim keys and start one task per non-duplicate intent.
    pub fn spawn(self: &Arc<Self>, ctx: &CycleContext, intents: Vec<NotificationIntent>) -> DispatchBatch {
        let mut batch = DispatchBatch {
            ctx: ctx.clone(),
            pending: Vec::with_capacity(intents.len()),
            deduplicated: 0,
        };

        for intent in intents {
            let key = intent.dedup_key(ctx.cycle);
            if !self.ledger.claim(ctx.report_id, key) {
                debug!(
                    report_id = %ctx.report_id,
                    cycle = %ctx.cycle,
                    dedup_key = %key,
                    channel = %intent.channel,
                    "Intent already dispatched this cycle; skipping"
                );
                batch.deduplicated += 1;
                continue;
            }

            let pending_meta = (
                intent.channel,
                self.channels.get(intent.channel).name().to_string(),
                intent.kind,
                intent.audience().to_string(),
                intent.severity(),
            );
            let coordinator = Arc::clone(self);
            let task_ctx = ctx.clone();
            let handle = tokio::spawn(async move { coordinator.execute(&task_ctx, key, intent).await });

            let (channel, channel_name, kind, audience, severity) = pending_meta;
            batch.pending.push(Pending {
                key,
                channel,
                channel_name,
                intent: kind,
                audience,
                severity,
                handle,
            });
        }
        batch
    }

    /// Dispatch and wait for every intent to reach a terminal outcome.
    pub async fn dispatch(
        self: &Arc<Self>,
        ctx: &CycleContext,
        intents: Vec<NotificationIntent>,
    ) -> Vec<DispatchAttempt> {
        self.spawn(ctx, intents).join_all().await
    }

    async fn execute(&self, ctx: &CycleContext, key: DedupKey, intent: NotificationIntent) -> DispatchAttempt {
        let channel = self.channels.get(intent.channel);
        let throttle = self.throttle(intent.channel);
        let severity = intent.severity();
        let mut delays = self.backoff.delays();
        let mut attempts = 0u32;

        let (outcome, detail) = loop {
            let admitted = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    break (DispatchOutcome::Cancelled, Some("cycle cancelled before send".to_string()));
                }
                admitted = throttle.acquire(severity) => admitted,
            };
            if let Err(shed) = admitted {
                break (DispatchOutcome::Shed, Some(shed.to_string()));
            }

            attempts += 1;
            let result = match tokio::time::timeout(self.send_timeout, channel.send(&intent.notification)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::retriable(
                    channel.name(),
                    format!("send timed out after {:?}", self.send_timeout),
                )),
            };

            match result {
                Ok(delivery) => {
                    let detail = delivery.is_partial().then(|| {
                        format!(
                            "partial delivery; failed recipients: {}",
                            delivery.failed_recipients.join(", ")
                        )
                    });
                    break (DispatchOutcome::Success, detail);
                }
                Err(err) if !err.is_retriable() => {
                    break (DispatchOutcome::PermanentFailure, Some(err.to_string()));
                }
                Err(err) => {
                    let Some(delay) = delays.next() else {
                        break (DispatchOutcome::RetriableFailure, Some(err.to_string()));
                    };
                    warn!(
                        report_id = %ctx.report_id,
                        channel = channel.name(),
                        attempt = attempts,
                        retry_in = ?delay,
                        error = %err,
                        "Send failed; retrying"
                    );
                    if !wait_with_cancel(&ctx.cancel, delay).await {
                        break (DispatchOutcome::Cancelled, Some(err.to_string()));
                    }
                }
            }
        };

        let attempt = DispatchAttempt {
            report_id: ctx.report_id,
            cycle: ctx.cycle,
            dedup_key: key,
            channel: intent.channel,
            channel_name: channel.name().to_string(),
            intent: intent.kind,
            audience: intent.audience().to_string(),
            severity,
            outcome,
            attempts,
            detail,
            recorded_at: Utc::now(),
        };
        log_attempt(&attempt);
        if !self.ledger.record(attempt.clone()) {
            debug!(report_id = %ctx.report_id, dedup_key = %key, "Ledger already released; attempt not kept");
        }
        attempt
    }
}

fn log_attempt(attempt: &DispatchAttempt) {
    match attempt.outcome {
        DispatchOutcome::Success => info!(
            report_id = %attempt.report_id,
            channel = %attempt.channel_name,
            audience = %attempt.audience,
            attempts = attempt.attempts,
            "Notification delivered"
        ),
        outcome => warn!(
            report_id = %attempt.report_id,
            channel = %attempt.channel_name,
            audience = %attempt.audience,
            outcome = %outcome,
            attempts = attempt.attempts,
            detail = attempt.detail.as_deref().unwrap_or(""),
            "Notification not delivered"
        ),
    }
}

impl DispatchBatch {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for every intent, however long it takes.
    pub async fn join_all(self) -> Vec<DispatchAttempt> {
        let ctx = self.ctx;
        let mut attempts = Vec::with_capacity(self.pending.len());
        for p in self.pending {
            let result = p.handle.await;
            attempts.push(match result {
                Ok(attempt) => attempt,
                Err(e) => Self::aborted(&ctx, p.key, p.channel, p.channel_name, p.intent, p.audience, p.severity, e),
            });
        }
        attempts
    }

    /// Wait until `deadline`; whatever is still running is reported as
    /// outstanding and left to finish on its own.
    pub async fn join_until(self, deadline: Instant) -> BatchResult {
        let ctx = self.ctx;
        let mut result = BatchResult {
            deduplicated: self.deduplicated,
            ..BatchResult::default()
        };
        for mut p in self.pending {
            match tokio::time::timeout_at(deadline, &mut p.handle).await {
                Ok(Ok(attempt)) => result.attempts.push(attempt),
                Ok(Err(e)) => result.attempts.push(Self::aborted(
                    &ctx,
                    p.key,
                    p.channel,
                    p.channel_name,
                    p.intent,
                    p.audience,
                    p.severity,
                    e,
                )),
                Err(_) => result.outstanding.push(p.key),
            }
        }
        if !result.outstanding.is_empty() {
            warn!(
                report_id = %ctx.report_id,
                cycle = %ctx.cycle,
                outstanding = result.outstanding.len(),
                "Triage deadline passed with sends in flight; flagged for reconciliation"
            );
        }
        result
    }

    /// A dispatch task that panicked or was aborted counts as a permanent failure.
    #[allow(clippy::too_many_arguments)]
    fn aborted(
        ctx: &CycleContext,
        key: DedupKey,
        channel: ChannelKind,
        channel_name: String,
        intent: IntentKind,
        audience: String,
        severity: Severity,
        error: tokio::task::JoinError,
    ) -> DispatchAttempt {
        warn!(report_id = %ctx.report_id, error = %error, "Dispatch task failed");
        DispatchAttempt {
            report_id: ctx.report_id,
            cycle: ctx.cycle,
            dedup_key: key,
            channel,
            channel_name,
            intent,
            audience,
            severity,
            outcome: DispatchOutcome::PermanentFailure,
            attempts: 0,
            detail: Some(format!("dispatch task failed: {error}")),
            recorded_at: Utc::now(),
        }
    }
}
