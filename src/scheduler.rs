//! Background maintenance tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::IncidentStore;

/// A named task that runs every `period` until cancelled.
pub struct PeriodicTask {
    name: &'static str,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`. The first run happens one period after
    /// spawning; a slow tick delays the next one rather than overlapping.
    pub fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            info!(task = name, period_secs = period.as_secs_f64(), "Periodic task started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(task = name, "Periodic task stopped");
        });
        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the task and wait for an in-flight tick to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Deactivate expired alerts every `period`.
///
/// Snapshots already hide expired alerts; the sweep makes the expiry durable
/// and bumps the store version so pollers see the change.
pub fn spawn_alert_sweeper(store: Arc<IncidentStore>, period: Duration) -> PeriodicTask {
    PeriodicTask::every("alert-sweeper", period, move || {
        let store = Arc::clone(&store);
        async move {
            match store.sweep_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Swept expired alerts"),
                Err(e) => warn!(error = %e, "Alert sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::classifier::Severity;
    use crate::store::{MemoryBackend, NewAlert};

    #[tokio::test(start_paused = true)]
    async fn runs_every_period_after_the_first() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let task = PeriodicTask::every("counter", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sweeper_deactivates_expired_alert() {
        let store = Arc::new(IncidentStore::new(Arc::new(MemoryBackend::new())));
        let alert = store
            .create_alert(
                NewAlert {
                    title: "Smoke advisory".into(),
                    description: String::new(),
                    alert_type: None,
                    severity: Severity::Medium,
                    location: None,
                    latitude: None,
                    longitude: None,
                    radius_km: None,
                    expires_at: Some(Utc::now() + chrono::Duration::milliseconds(20)),
                },
                10.0,
            )
            .await
            .unwrap();
        let version = store.version();

        let task = spawn_alert_sweeper(store.clone(), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(150)).await;
        task.shutdown().await;

        assert!(!store.alert(alert.id).await.unwrap().active);
        assert!(store.version() > version);
    }
}
