//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "End-to-end bridge runs against the simulated controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use heatlink_common::AppConfig;
use heatlink_core::{
    Backend, BackendError, BackendReply, BridgeOrchestrator, BusEvent, SettingUpdateRequest,
    Snapshot,
};
use heatlink_device::SimulatedTransport;
use heatlink_metrics::BridgeMetrics;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

#[derive(Default)]
struct RecordingBackend {
    replies: Mutex<VecDeque<BackendReply>>,
    bodies: Mutex<Vec<Snapshot>>,
}

impl RecordingBackend {
    fn script(&self, reply: Value) {
        self.replies
            .lock()
            .push_back(serde_json::from_value(reply).unwrap());
    }

    fn bodies(&self) -> Vec<Snapshot> {
        self.bodies.lock().clone()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn post(&self, body: &Snapshot) -> Result<BackendReply, BackendError> {
        self.bodies.lock().push(body.clone());
        Ok(self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(BackendReply::granted))
    }
}

fn bridge_config(dir: &TempDir) -> AppConfig {
    let credentials = dir.path().join("credentials.json");
    std::fs::write(&credentials, r#"{"pumpid": 42, "accesstoken": "tok"}"#).unwrap();
    let toml = format!(
        r#"
        follow_up = []

        [identity]
        identity_file = "{identity}"
        credential_file = "{credentials}"

        [backend]
        url = "http://127.0.0.1:9/api"
        initial_delay = 3
        post_interval = 60

        [network]
        enabled = false

        [schedule]
        primary = {{ getSensorData = 10, getPing = 30 }}
        secondary = {{ getSensorData = 2 }}

        [schedule.error_monitor]
        job = "getPing"

        [[polls]]
        job = "getSensorData"
        section = "sensordata"
        fields = [
            {{ name = "F1", address = 1, kind = "input", encoding = "s16", scale = {{ divisor = 10.0 }} }},
        ]
        "#,
        identity = dir.path().join("pumpid").display(),
        credentials = credentials.display(),
    );
    toml.parse().unwrap()
}

#[tokio::test(start_paused = true)]
async fn bridge_polls_posts_and_shuts_down() {
    let dir = tempdir().unwrap();
    let device = SimulatedTransport::new();
    device.set_input(1, 215).await;
    let backend = Arc::new(RecordingBackend::default());
    let metrics = BridgeMetrics::detached().unwrap();

    let handle = BridgeOrchestrator::new(
        bridge_config(&dir),
        Arc::new(device.clone()),
        backend.clone(),
        42,
    )
    .with_metrics(metrics.clone())
    .start()
    .await
    .unwrap();
    let mut events = handle.bus().subscribe();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        handle.cache().field(Some("sensordata"), "F1"),
        Some(json!(21.5))
    );
    assert_eq!(handle.cache().field(None, "Ping"), Some(json!(0)));

    let bodies = backend.bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["pumpid"], json!(42));
    assert_eq!(bodies[0]["accesstoken"], json!("tok"));
    assert_eq!(bodies[0]["sensordata"]["F1"], json!(21.5));
    assert!(metrics.jobs_serviced("getSensorData") >= 1);

    // Unchanged readings are not re-published.
    let mut published = 0;
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, BusEvent::Snapshot(_)));
        published += 1;
    }
    assert!(published >= 1);
    let publishes = metrics.snapshot_publishes();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(metrics.snapshot_publishes(), publishes);
    assert!(events.try_recv().is_err());

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn remote_setting_is_written_and_confirmed_on_the_next_post() {
    let dir = tempdir().unwrap();
    let device = SimulatedTransport::new();
    let backend = Arc::new(RecordingBackend::default());
    backend.script(json!({
        "Access": "Granted",
        "update": 1,
        "up": {"B4": {"set": 3, "id": 55}, "NOPE": {"set": 1, "id": 56}}
    }));

    let handle = BridgeOrchestrator::new(
        bridge_config(&dir),
        Arc::new(device.clone()),
        backend.clone(),
        42,
    )
    .start()
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(device.holding(4).await, 3);

    let bodies = backend.bodies();
    assert_eq!(bodies.len(), 2, "confirmation should be posted before the next tick");
    assert_eq!(bodies[1]["id"], json!(["55", "E56"]));

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn online_flag_enables_secondary_polling() {
    let dir = tempdir().unwrap();
    let device = SimulatedTransport::new();
    let backend = Arc::new(RecordingBackend::default());
    backend.script(json!({"Access": "Granted", "online": 1}));
    let metrics = BridgeMetrics::detached().unwrap();

    let handle = BridgeOrchestrator::new(
        bridge_config(&dir),
        Arc::new(device),
        backend,
        42,
    )
    .with_metrics(metrics.clone())
    .start()
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let before = metrics.jobs_serviced("getSensorData");
    tokio::time::sleep(Duration::from_secs(8)).await;
    let after = metrics.jobs_serviced("getSensorData");
    assert!(after - before >= 4, "secondary producer should add polls, got {}", after - before);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn local_sentinel_batch_is_acknowledged_on_the_bus() {
    let dir = tempdir().unwrap();
    let device = SimulatedTransport::new();
    let backend = Arc::new(RecordingBackend::default());

    let handle = BridgeOrchestrator::new(
        bridge_config(&dir),
        Arc::new(device.clone()),
        backend,
        42,
    )
    .start()
    .await
    .unwrap();
    let mut events = handle.bus().subscribe();

    let mut request = SettingUpdateRequest::default();
    request.insert("B2", json!(1), "1000");
    handle.bus().submit_settings(request).unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(BusEvent::DeviceAck(ack)) = events.recv().await {
                return ack;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(ack, json!({"id": ["1000"]}));
    assert_eq!(device.holding(2).await, 1);

    handle.shutdown().await.unwrap();
}
