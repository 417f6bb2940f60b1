use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::serve_on;
use crate::clock::ManualClock;
use crate::pipeline::{ControlHandle, RunState};
use crate::progress::ProgressSnapshot;
use crate::state::AppState;
use crate::test_support::{test_governor, START_MS};

async fn start() -> (Arc<AppState>, String, tokio::task::JoinHandle<()>) {
    let clock = Arc::new(ManualClock::starting_at(START_MS));
    let state = Arc::new(AppState::new(
        CancellationToken::new(),
        ControlHandle::new(),
        test_governor(&clock),
        "client-a",
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("addr"));
    let handle = serve_on(state.clone(), listener).await.expect("serve");
    (state, base, handle)
}

async fn get_json(url: &str) -> Value {
    reqwest::get(url)
        .await
        .expect("request")
        .json::<Value>()
        .await
        .expect("json")
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let (state, base, handle) = start().await;

    let health = reqwest::get(format!("{base}/health"))
        .await
        .expect("health")
        .text()
        .await
        .expect("body");
    assert_eq!(health, "Healthy");

    let metrics = reqwest::get(format!("{base}/metrics"))
        .await
        .expect("metrics")
        .text()
        .await
        .expect("body");
    assert!(metrics.contains("worker_build_info"), "{metrics}");

    state.shutdown_token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server stops on shutdown")
        .expect("join");
}

#[tokio::test]
async fn status_reports_progress_and_circuit() {
    let (state, base, _handle) = start().await;

    let before = get_json(&format!("{base}/status")).await;
    assert_eq!(before["owner_id"], "client-a");
    assert_eq!(before["run_state"], "running");
    assert_eq!(before["circuit"]["state"], "closed");
    assert!(before["progress"].is_null());
    assert!(before["queue_depth"].is_null());

    state.progress.send_replace(Some(ProgressSnapshot {
        frontier: 120,
        holes: vec![125, 180],
    }));
    let after = get_json(&format!("{base}/status")).await;
    assert_eq!(after["progress"]["frontier"], 120);
    assert_eq!(after["progress"]["hole_count"], 2);
    state.shutdown_token.cancel();
}

#[tokio::test]
async fn control_endpoint_drives_run_state() {
    let (state, base, _handle) = start().await;
    let client = reqwest::Client::new();

    let paused: Value = client
        .post(format!("{base}/control/pause"))
        .send()
        .await
        .expect("pause")
        .json()
        .await
        .expect("json");
    assert_eq!(paused["run_state"], "paused");
    assert_eq!(state.control.state(), RunState::Paused);

    let bogus = client
        .post(format!("{base}/control/explode"))
        .send()
        .await
        .expect("bogus");
    assert_eq!(bogus.status().as_u16(), 400);

    client
        .post(format!("{base}/control/stop"))
        .send()
        .await
        .expect("stop");
    client
        .post(format!("{base}/control/resume"))
        .send()
        .await
        .expect("resume");
    assert_eq!(state.control.state(), RunState::Stopping);
    state.shutdown_token.cancel();
}
