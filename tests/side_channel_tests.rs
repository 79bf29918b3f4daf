use std::sync::Arc;

use perimeter_deterrent::config::Config;
use perimeter_deterrent::messages::{LoopState, LoopSummary, Severity, StopAck};
use perimeter_deterrent::store::{AlertStore, MemoryStore, SqliteStore};
use perimeter_deterrent::supervisor::{DetectionSupervisor, StartRequest};

use mocks::*;

/// Runs a finite recording to its end and returns the loop summary.
async fn run_to_end(
    config: Config,
    store: Arc<dyn AlertStore>,
    loader: MockLoader,
    camera: MockCamera,
    request: StartRequest,
) -> LoopSummary {
    let supervisor =
        DetectionSupervisor::new(Arc::new(config), store, Arc::new(loader), Arc::new(camera));
    let mut handle = supervisor.start(request).await.unwrap();
    assert_eq!(handle.wait_terminal().await, LoopState::Stopped);

    match supervisor.stop(&handle).await {
        StopAck::Stopped(summary) => summary,
        other => panic!("unexpected stop ack: {:?}", other),
    }
}

fn unreachable_email(config: &mut Config) {
    config.email.enabled = true;
    config.email.smtp_server = "127.0.0.1".to_string();
    config.email.smtp_port = 1;
    config.email.sender_email = "alerts@farm.example".to_string();
    config.email.sender_password = "app-password".to_string();
    config.email.recipient_email = "owner@farm.example".to_string();
    config.email.timeout_secs = 2;
}

fn silent_sound(config: &mut Config) {
    config.sound.enabled = true;
    config.sound.beep_command = Some("definitely-not-a-beeper-binary".to_string());
    config.sound.beep_gap_ms = 0;
    config.sound.cues.clear();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_notify_failure_does_not_affect_records_or_sound() {
    init_test_tracing();
    let mut config = test_config();
    config.detection.alert_cooldown = 0;
    unreachable_email(&mut config);
    silent_sound(&mut config);

    let store = Arc::new(MemoryStore::new());
    let summary = run_to_end(
        config,
        store.clone(),
        MockLoader::seeing(vec![raw("dog", 0.9)]),
        MockCamera::finite(3),
        StartRequest::new("yolov8n.onnx", 0),
    )
    .await;

    assert_eq!(summary.alerts_triggered, 3);
    assert_eq!(summary.channels.dispatched, 9);
    // database and sound succeed for every alert, notify fails for every alert
    assert_eq!(summary.channels.succeeded, 6);
    assert_eq!(summary.channels.failed, 3);
    assert_eq!(store.detections().len(), 3);
    assert_eq!(store.alerts().len(), 3);
    assert!(store.alerts().iter().all(|alert| {
        alert.message == "Dog detected - Alert activated" && alert.alert_type == Severity::Danger
    }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_failure_is_isolated() {
    init_test_tracing();
    let mut config = test_config();
    silent_sound(&mut config);

    let store = Arc::new(FailingStore::default());
    let summary = run_to_end(
        config,
        store.clone(),
        MockLoader::seeing(vec![raw("cat", 0.8), raw("cow", 0.8)]),
        MockCamera::finite(2),
        StartRequest::new("yolov8n.onnx", 0),
    )
    .await;

    assert_eq!(summary.frames_processed, 2);
    assert_eq!(summary.alerts_triggered, 2);
    assert_eq!(summary.channels.failed, 2);
    assert_eq!(summary.channels.succeeded, 2);
    // both writes are attempted once per alert, no retries
    assert_eq!(store.attempts(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exactly_one_record_pair_per_alert_in_sqlite() {
    init_test_tracing();
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("data.db");
    let mut config = test_config();
    config.detection.alert_cooldown = 2;
    unreachable_email(&mut config);

    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let summary = run_to_end(
        config,
        store.clone(),
        MockLoader::seeing(vec![raw("horse", 0.7), raw("sheep", 0.4)]),
        MockCamera::finite(6),
        StartRequest::new("yolov8n.onnx", 0),
    )
    .await;

    // frames at 0..5s, 2s cooldown: alerts at 0, 2 and 4
    assert_eq!(summary.alerts_triggered, 3);
    assert_eq!(store.count_detections().unwrap(), 3);
    assert_eq!(store.count_alerts().unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_categories_cool_down_independently() {
    init_test_tracing();
    let store = Arc::new(MemoryStore::new());
    let summary = run_to_end(
        test_config(),
        store.clone(),
        MockLoader::seeing(vec![raw("dog", 0.9), raw("cat", 0.9), raw("dog", 0.95)]),
        MockCamera::finite(5),
        StartRequest::new("yolov8n.onnx", 0),
    )
    .await;

    assert_eq!(summary.alerts_triggered, 2);
    let mut animals: Vec<String> = store
        .detections()
        .into_iter()
        .map(|record| record.animal_type)
        .collect();
    animals.sort();
    assert_eq!(animals, vec!["Cat", "Dog"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshots_written_for_each_alert() {
    init_test_tracing();
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.detection.save_detection_images = true;
    config.detection.detections_folder = temp_dir.path().join("detections");
    config.detection.alert_cooldown = 0;
    config.overlay.enabled = true;

    let summary = run_to_end(
        config,
        Arc::new(MemoryStore::new()),
        MockLoader::seeing(vec![raw("bear", 0.9)]),
        MockCamera::finite(2),
        StartRequest::new("yolov8n.onnx", 0),
    )
    .await;

    assert_eq!(summary.alerts_triggered, 2);
    assert_eq!(summary.channels.failed, 0);
    let mut names: Vec<String> = std::fs::read_dir(temp_dir.path().join("detections"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["detection_bear_20251126_100000.jpg", "detection_bear_20251126_100001.jpg"]
    );
}
