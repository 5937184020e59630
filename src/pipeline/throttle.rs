//! Per-channel send rate limiting.
//!
//! A fixed window admits at most `max_per_window` sends. Callers that find
//! the window full wait in a queue ordered by severity (highest first), then
//! arrival. When the queue grows past `max_queue_depth`, the oldest waiter of
//! the lowest severity present is shed.
//!
//! No background task: the window rolls lazily whenever a caller looks at it.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classifier::Severity;
use crate::config::ThrottleConfig;

/// The caller was dropped from a full queue.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("shed from the {channel} rate-limit queue")]
pub struct Shed {
    pub channel: String,
}

/// A queued caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub severity: Severity,
    pub seq: u64,
}

impl Ticket {
    /// Smaller is served first.
    fn service_key(&self) -> (Reverse<Severity>, u64) {
        (Reverse(self.severity), self.seq)
    }

    /// Smaller is shed first.
    fn shed_key(&self) -> (Severity, u64) {
        (self.severity, self.seq)
    }
}

/// Bounded waiting queue with severity-aware shedding.
#[derive(Debug, Default)]
pub struct ShedQueue {
    waiting: Vec<Ticket>,
    shed: HashSet<u64>,
    max_depth: usize,
}

impl ShedQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            waiting: Vec::new(),
            shed: HashSet::new(),
            max_depth,
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Waiters that would be served before `ticket`.
    pub fn ahead_of(&self, ticket: Ticket) -> usize {
        let key = ticket.service_key();
        self.waiting
            .iter()
            .filter(|w| w.seq != ticket.seq && w.service_key() < key)
            .count()
    }

    /// Enqueue. Returns the ticket shed to make room, if any; that may be
    /// `ticket` itself.
    pub fn push(&mut self, ticket: Ticket) -> Option<Ticket> {
        self.waiting.push(ticket);
        if self.waiting.len() <= self.max_depth {
            return None;
        }
        let (idx, _) = self
            .waiting
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.shed_key())?;
        let victim = self.waiting.swap_remove(idx);
        if victim.seq != ticket.seq {
            self.shed.insert(victim.seq);
        }
        Some(victim)
    }

    pub fn remove(&mut self, seq: u64) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|w| w.seq != seq);
        self.shed.remove(&seq);
        self.waiting.len() != before
    }

    /// Consume a shed notice for `seq`.
    pub fn take_shed(&mut self, seq: u64) -> bool {
        self.shed.remove(&seq)
    }
}

struct Window {
    started: Instant,
    used: u32,
    queue: ShedQueue,
    next_seq: u64,
}

pub struct Throttle {
    channel: String,
    config: ThrottleConfig,
    state: Mutex<Window>,
    /// Woken when a waiter is shed so it can return early.
    shed_notify: Notify,
    shed_total: AtomicU64,
}

impl Throttle {
    pub fn new(channel: impl Into<String>, config: ThrottleConfig) -> Self {
        let max_depth = config.max_queue_depth;
        Self {
            channel: channel.into(),
            config,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
                queue: ShedQueue::new(max_depth),
                next_seq: 0,
            }),
            shed_notify: Notify::new(),
            shed_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Callers currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Callers shed since creation.
    pub fn shed_total(&self) -> u64 {
        self.shed_total.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn roll(&self, window: &mut Window, now: Instant) {
        let length = self.config.window;
        let elapsed = now.saturating_duration_since(window.started);
        if elapsed < length {
            return;
        }
        let periods = (elapsed.as_nanos() / length.as_nanos().max(1)).min(u32::MAX as u128) as u32;
        window.started += length * periods;
        window.used = 0;
    }

    /// Wait for a send slot. Dropping the future leaves the queue cleanly.
    pub async fn acquire(&self, severity: Severity) -> Result<(), Shed> {
        let seq = {
            let mut window = self.lock();
            window.next_seq += 1;
            window.next_seq
        };
        let ticket = Ticket { severity, seq };
        let mut guard = WaiterGuard {
            throttle: self,
            seq,
            queued: false,
        };

        loop {
            let notified = self.shed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let window_end = {
                let mut window = self.lock();
                self.roll(&mut window, Instant::now());

                if window.queue.take_shed(seq) {
                    guard.queued = false;
                    return Err(self.shed(severity));
                }

                let free = self.config.max_per_window.saturating_sub(window.used) as usize;
                if window.queue.ahead_of(ticket) < free {
                    window.used += 1;
                    if guard.queued {
                        window.queue.remove(seq);
                        guard.queued = false;
                    }
                    return Ok(());
                }

                if !guard.queued {
                    match window.queue.push(ticket) {
                        Some(victim) if victim.seq == seq => return Err(self.shed(severity)),
                        Some(victim) => {
                            debug!(
                                channel = %self.channel,
                                shed_seq = victim.seq,
                                shed_severity = %victim.severity,
                                "Queue full; shedding waiter"
                            );
                            self.shed_notify.notify_waiters();
                        }
                        None => {}
                    }
                    guard.queued = true;
                }
                window.started + self.config.window
            };

            tokio::select! {
                _ = tokio::time::sleep_until(window_end) => {}
                _ = &mut notified => {}
            }
        }
    }

    fn shed(&self, severity: Severity) -> Shed {
        self.shed_total.fetch_add(1, Ordering::Relaxed);
        warn!(channel = %self.channel, severity = %severity, "Intent shed from rate-limit queue");
        Shed {
            channel: self.channel.clone(),
        }
    }
}

/// Removes an abandoned waiter from the queue.
struct WaiterGuard<'a> {
    throttle: &'a Throttle,
    seq: u64,
    queued: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.queued {
            self.throttle.lock().queue.remove(self.seq);
        }
    }
}
