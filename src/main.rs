use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crisis_triage::api;
use crisis_triage::channels::{
    ChannelKind, ChannelSet, LogChannel, NotificationChannel, SlackChannel, SlackConfig, SmsChannel,
    TwilioConfig,
};
use crisis_triage::classifier::{ClassifierAdapter, Classifier, GeminiClassifier, UnavailableClassifier};
use crisis_triage::config::{ClassifierConfig, DispatchConfig, ServerConfig, TriageConfig};
use crisis_triage::pipeline::{DispatchCoordinator, RoutingPolicy, TriagePipeline};
use crisis_triage::scheduler;
use crisis_triage::store::{IncidentStore, MemoryBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = ServerConfig::from_env()?;

    // ── Logging ─────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer().with_target(false);
    let _log_guard = match server.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "crisis-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    };

    let classifier_config = ClassifierConfig::from_env()?;
    let dispatch_config = DispatchConfig::from_env()?;
    let triage_config = TriageConfig::from_env()?;

    eprintln!("🚨 Crisis Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   HTTP: http://0.0.0.0:{}", server.port);

    // ── Classifier ──────────────────────────────────────────────────────
    let classifier: Arc<dyn Classifier> = match classifier_config.api_key {
        Some(key) => {
            eprintln!("   Classifier: gemini ({})", classifier_config.model);
            Arc::new(GeminiClassifier::new(key, classifier_config.model.clone()))
        }
        None => {
            eprintln!("   Classifier: disabled (GEMINI_API_KEY not set, every report uses the fallback)");
            Arc::new(UnavailableClassifier)
        }
    };

    // ── Channels ────────────────────────────────────────────────────────
    if let Some(parent) = std::path::Path::new(&server.notification_log).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let direct: Arc<dyn NotificationChannel> = match TwilioConfig::from_env() {
        Some(config) => {
            eprintln!("   SMS: twilio");
            Arc::new(SmsChannel::new(config))
        }
        None => {
            eprintln!("   SMS: local log ({})", server.notification_log);
            Arc::new(LogChannel::new(&server.notification_log, ChannelKind::Direct))
        }
    };
    let broadcast: Arc<dyn NotificationChannel> = match SlackConfig::from_env() {
        Some(config) => {
            eprintln!("   Broadcast: slack");
            Arc::new(SlackChannel::new(config))
        }
        None => {
            eprintln!("   Broadcast: local log ({})", server.notification_log);
            Arc::new(LogChannel::new(&server.notification_log, ChannelKind::Broadcast))
        }
    };

    // ── Pipeline ────────────────────────────────────────────────────────
    let store = Arc::new(
        IncidentStore::open(Arc::new(MemoryBackend::new()))
            .await
            .context("opening incident store")?,
    );
    let coordinator = Arc::new(DispatchCoordinator::new(
        ChannelSet::new(direct, broadcast),
        dispatch_config,
    ));
    let sweeper = scheduler::spawn_alert_sweeper(Arc::clone(&store), triage_config.sweep_interval);
    let pipeline = Arc::new(TriagePipeline::new(
        store,
        ClassifierAdapter::new(classifier, classifier_config.timeout),
        RoutingPolicy::default_policy(),
        coordinator,
        triage_config,
    ));

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api::router(pipeline);
    let addr = format!("0.0.0.0:{}", server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "Crisis triage service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("http server")?;

    sweeper.shutdown().await;
    Ok(())
}
