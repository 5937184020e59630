//! Exponential backoff with jitter for retriable dispatch failures.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: RetryConfig,
}

impl BackoffPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.config.base_delay)
            .with_max_delay(self.config.max_delay)
            .with_factor(self.config.multiplier as f32)
            .with_max_times(self.config.max_attempts.saturating_sub(1) as usize);
        if self.config.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Waits between the sends of one intent: one per allowed retry, then
    /// `None`. Never above `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        let cap = self.config.max_delay;
        self.builder().build().map(move |delay| delay.min(cap))
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancel.
pub async fn wait_with_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
