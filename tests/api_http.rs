//! HTTP API integration tests.
//!
//! Each test spins up an Axum server on a random port and drives the real
//! REST contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crisis_triage::api::router;
use crisis_triage::channels::{ChannelKind, ChannelSet, LogChannel};
use crisis_triage::classifier::{
    Classification, ClassificationRequest, Classifier, ClassifierAdapter, Severity,
};
use crisis_triage::config::{DispatchConfig, TriageConfig};
use crisis_triage::error::ClassificationFailure;
use crisis_triage::pipeline::{DispatchCoordinator, RoutingPolicy, TriagePipeline};
use crisis_triage::report::ReportStatus;
use crisis_triage::store::{IncidentStore, MemoryBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Classifies everything as a high-severity flood.
struct StubClassifier;

#[async_trait]
impl Classifier for StubClassifier {
    fn name(&self) -> &str {
        "stub"
    }

    async fn classify(
        &self,
        _request: &ClassificationRequest,
    ) -> Result<Classification, ClassificationFailure> {
        Ok(Classification::new(
            Severity::High,
            "flood",
            0.8,
            vec!["Move to higher ground".into()],
            "15 minutes",
        ))
    }
}

struct Server {
    base: String,
    pipeline: Arc<TriagePipeline>,
    log: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

/// Start an Axum server on a random port.
async fn start_server() -> Server {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("notifications.log");
    let channels = ChannelSet::new(
        Arc::new(LogChannel::new(log.clone(), ChannelKind::Direct)),
        Arc::new(LogChannel::new(log.clone(), ChannelKind::Broadcast)),
    );
    let pipeline = Arc::new(TriagePipeline::new(
        Arc::new(IncidentStore::new(Arc::new(MemoryBackend::new()))),
        ClassifierAdapter::new(Arc::new(StubClassifier), Duration::from_secs(2)),
        RoutingPolicy::default_policy(),
        Arc::new(DispatchCoordinator::new(channels, DispatchConfig::default())),
        TriageConfig::default(),
    ));
    let app = router(Arc::clone(&pipeline));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        base: format!("http://127.0.0.1:{port}"),
        pipeline,
        log,
        _dir: dir,
    }
}

/// Poll until the report reaches `status`.
async fn wait_for_status(server: &Server, id: uuid::Uuid, status: ReportStatus) {
    loop {
        if server.pipeline.store().report(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn report_flows_from_intake_to_map() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/reports", server.base))
            .json(&json!({
                "title": "Street flooding",
                "description": "Water is knee deep on 5th avenue and rising quickly",
                "latitude": 29.76,
                "longitude": -95.37,
                "submitter": "resident-42",
                "contact": "+17135550100"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let receipt: Value = response.json().await.unwrap();
        assert_eq!(receipt["status"], "pending");
        let id: uuid::Uuid = receipt["id"].as_str().unwrap().parse().unwrap();

        wait_for_status(&server, id, ReportStatus::Dispatched).await;

        let snapshot: Value = client
            .get(format!("{}/api/snapshot", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let report = &snapshot["reports"][0];
        assert_eq!(report["severity"], "high");
        assert_eq!(report["status"], "dispatched");
        assert!(report.get("contact").is_none());
        assert!(report.get("submitter").is_none());
        assert_eq!(snapshot["alerts"].as_array().unwrap().len(), 1);

        let log = tokio::fs::read_to_string(&server.log).await.unwrap();
        assert!(log.contains("+17135550100"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn map_feed_skips_reports_without_coordinates() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        for body in [
            json!({ "description": "Smoke smell downtown", "submitter": "a" }),
            json!({ "description": "x".repeat(300), "submitter": "b", "latitude": 1.0, "longitude": 2.0 }),
        ] {
            let response = client
                .post(format!("{}/api/reports", server.base))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 202);
        }

        let reports: Vec<Value> = client
            .get(format!("{}/api/reports", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        let description = reports[0]["description"].as_str().unwrap();
        assert_eq!(description.chars().count(), 103);
        assert!(description.ends_with("..."));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn snapshot_polling_reports_not_modified() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let snapshot: Value = client
            .get(format!("{}/api/snapshot", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let version = snapshot["version"].as_u64().unwrap();

        let response = client
            .get(format!("{}/api/snapshot?since={version}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 304);

        let response = client
            .post(format!("{}/api/shelters", server.base))
            .json(&json!({ "name": "Armory", "capacity": 200 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);

        let response = client
            .get(format!("{}/api/snapshot?since={version}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let snapshot: Value = response.json().await.unwrap();
        assert_eq!(snapshot["shelters"][0]["available"], 200);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shelter_occupancy_endpoints() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let shelter: Value = client
            .post(format!("{}/api/shelters", server.base))
            .json(&json!({ "name": "Lincoln Gym", "capacity": 10, "facilities": ["cots", "water"] }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = shelter["id"].as_str().unwrap().to_string();

        let response = client
            .put(format!("{}/api/shelters/{id}/occupancy", server.base))
            .json(&json!({ "occupancy": 8 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let response = client
            .post(format!("{}/api/shelters/{id}/occupancy/adjust", server.base))
            .json(&json!({ "delta": 3 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let response = client
            .post(format!("{}/api/shelters/{id}/occupancy/adjust", server.base))
            .json(&json!({ "delta": -2 }))
            .send()
            .await
            .unwrap();
        let updated: Value = response.json().await.unwrap();
        assert_eq!(updated["occupancy"], 6);
        assert_eq!(updated["available"], 4);

        let response = client
            .put(format!("{}/api/shelters/{id}/active", server.base))
            .json(&json!({ "active": false }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let shelters: Vec<Value> = client
            .get(format!("{}/api/shelters", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(shelters.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn manual_alert_lifecycle() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/api/alerts", server.base))
            .json(&json!({
                "title": "Evacuation order",
                "description": "Leave zone B now",
                "severity": "critical",
                "latitude": 34.05,
                "longitude": -118.24,
                "radius_km": 5.0
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let alert: Value = response.json().await.unwrap();
        let id = alert["id"].as_str().unwrap().to_string();

        let alerts: Vec<Value> = client
            .get(format!("{}/api/alerts", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);

        let response = client
            .post(format!("{}/api/alerts/{id}/deactivate", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let alerts: Vec<Value> = client
            .get(format!("{}/api/alerts", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(alerts.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn resolve_then_reclassify_conflicts() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let receipt: Value = client
            .post(format!("{}/api/reports", server.base))
            .json(&json!({ "description": "Car crash on the bridge", "submitter": "driver-7" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id: uuid::Uuid = receipt["id"].as_str().unwrap().parse().unwrap();
        wait_for_status(&server, id, ReportStatus::Dispatched).await;

        let response = client
            .post(format!("{}/api/reports/{id}/resolve", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let resolved: Value = response.json().await.unwrap();
        assert_eq!(resolved["status"], "resolved");

        let response = client
            .post(format!("{}/api/reports/{id}/reclassify", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let response = client
            .get(format!("{}/api/reports/{}", server.base, uuid::Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    })
    .await
    .expect("test timed out");
}
