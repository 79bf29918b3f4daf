use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use perimeter_deterrent::classifier::{Classifier, ClassifierLoader};
use perimeter_deterrent::config::Config;
use perimeter_deterrent::error::DeterrentError;
use perimeter_deterrent::messages::{LoopState, StopAck};
use perimeter_deterrent::source::check_device;
use perimeter_deterrent::store::MemoryStore;
use perimeter_deterrent::supervisor::{shutdown_runtime, DetectionSupervisor, StartRequest};

use mocks::*;

fn supervisor(
    config: Config,
    loader: MockLoader,
    camera: MockCamera,
) -> (DetectionSupervisor, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let supervisor = DetectionSupervisor::new(
        Arc::new(config),
        store.clone(),
        Arc::new(loader),
        Arc::new(camera),
    );
    (supervisor, store)
}

fn request() -> StartRequest {
    StartRequest::new("yolov8n.onnx", 0)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_without_start_is_not_running() {
    init_test_tracing();
    let (supervisor, _) = supervisor(test_config(), MockLoader::default(), MockCamera::default());

    assert_eq!(supervisor.shutdown().await, StopAck::NotRunning);
    assert_eq!(supervisor.shutdown().await, StopAck::NotRunning);
    assert!(!supervisor.is_running().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_twice_is_idempotent() {
    init_test_tracing();
    let camera = MockCamera::endless(Duration::from_millis(5));
    let (supervisor, _) = supervisor(test_config(), MockLoader::default(), camera.clone());

    let handle = supervisor.start(request()).await.unwrap();
    assert_eq!(handle.state(), LoopState::Running);

    assert!(matches!(supervisor.stop(&handle).await, StopAck::Stopped(_)));
    assert_eq!(supervisor.stop(&handle).await, StopAck::NotRunning);
    assert_eq!(handle.state(), LoopState::Stopped);
    assert!(camera.was_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_start_is_rejected_while_running() {
    init_test_tracing();
    let camera = MockCamera::endless(Duration::from_millis(5));
    let (supervisor, _) = supervisor(test_config(), MockLoader::default(), camera);

    let handle = supervisor.start(request()).await.unwrap();
    assert!(matches!(
        supervisor.start(request()).await,
        Err(DeterrentError::AlreadyRunning)
    ));

    supervisor.stop(&handle).await;
    let restarted = supervisor.start(request()).await.unwrap();
    assert_ne!(restarted.id(), handle.id());

    // The old handle no longer controls anything.
    assert_eq!(supervisor.stop(&handle).await, StopAck::NotRunning);
    assert!(matches!(supervisor.stop(&restarted).await, StopAck::Stopped(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_model_load_failure_is_a_startup_error() {
    init_test_tracing();
    let camera = MockCamera::default();
    let (supervisor, _) = supervisor(test_config(), MockLoader::broken(), camera.clone());

    let err = supervisor.start(request()).await.unwrap_err();
    assert!(matches!(err, DeterrentError::ModelLoad { .. }));
    assert!(err.is_startup());
    assert!(!supervisor.is_running().await);
    assert_eq!(camera.opened.load(Ordering::SeqCst), 0);
    assert_eq!(supervisor.shutdown().await, StopAck::NotRunning);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_camera_is_a_startup_error() {
    init_test_tracing();
    let camera = MockCamera {
        unavailable: true,
        ..MockCamera::default()
    };
    let (supervisor, _) = supervisor(test_config(), MockLoader::default(), camera);

    let err = supervisor.start(StartRequest::new("yolov8n.onnx", 7)).await.unwrap_err();
    assert!(matches!(err, DeterrentError::DeviceUnavailable { index: 7, .. }));
    assert!(err.is_startup());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_source_end_stops_loop_and_frees_slot() {
    init_test_tracing();
    let (supervisor, store) = supervisor(
        test_config(),
        MockLoader::seeing(vec![raw("dog", 0.9)]),
        MockCamera::finite(4),
    );

    let mut handle = supervisor.start(request()).await.unwrap();
    assert_eq!(handle.wait_terminal().await, LoopState::Stopped);

    match supervisor.stop(&handle).await {
        StopAck::Stopped(summary) => {
            assert_eq!(summary.frames_processed, 4);
            // 60s cooldown, frames one second apart
            assert_eq!(summary.alerts_triggered, 1);
        }
        other => panic!("unexpected stop ack: {:?}", other),
    }
    assert_eq!(store.detections().len(), 1);

    // The finished run does not block the next one.
    let next = supervisor.start(request()).await.unwrap();
    supervisor.stop(&next).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_finished_run_is_reaped_on_next_start() {
    init_test_tracing();
    let (supervisor, _) = supervisor(test_config(), MockLoader::default(), MockCamera::finite(1));

    let mut first = supervisor.start(request()).await.unwrap();
    assert_eq!(first.wait_terminal().await, LoopState::Stopped);
    assert!(!supervisor.is_running().await);

    let second = supervisor.start(request()).await.unwrap();
    assert_ne!(first.id(), second.id());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stuck_loop_is_abandoned() {
    init_test_tracing();
    let mut config = test_config();
    config.supervisor.stop_timeout_secs = 0;
    config.supervisor.dispatch_grace_secs = 0;
    let camera = MockCamera::endless(Duration::from_secs(2));
    let (supervisor, _) = supervisor(config, MockLoader::default(), camera);

    let handle = supervisor.start(request()).await.unwrap();
    assert_eq!(supervisor.stop(&handle).await, StopAck::Abandoned);
    assert!(!supervisor.is_running().await);
    assert_eq!(supervisor.stop(&handle).await, StopAck::NotRunning);
}

#[test]
fn test_check_device_opens_and_releases() {
    let camera = MockCamera::default();
    check_device(&camera, 0).unwrap();
    assert_eq!(camera.opened.load(Ordering::SeqCst), 1);
    assert!(camera.was_closed());

    let missing = MockCamera {
        unavailable: true,
        ..MockCamera::default()
    };
    assert!(matches!(
        check_device(&missing, 3),
        Err(DeterrentError::DeviceUnavailable { index: 3, .. })
    ));
}

#[test]
fn test_runtime_shutdown_does_not_wait_for_abandoned_loop() {
    init_test_tracing();
    let mut config = test_config();
    config.supervisor.stop_timeout_secs = 0;
    config.supervisor.dispatch_grace_secs = 0;
    let grace = config.supervisor.dispatch_grace();
    let camera = MockCamera::endless(Duration::from_secs(6));
    let (supervisor, _) = supervisor(config, MockLoader::default(), camera);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let ack = runtime.block_on(async {
        let handle = supervisor.start(request()).await.unwrap();
        supervisor.stop(&handle).await
    });
    assert_eq!(ack, StopAck::Abandoned);

    // the loop thread is still inside a six second read
    let started = Instant::now();
    shutdown_runtime(runtime, grace);
    assert!(started.elapsed() < Duration::from_secs(3));
}

struct PanickingLoader;

impl ClassifierLoader for PanickingLoader {
    fn load(&self, _model_path: &Path) -> Result<Box<dyn Classifier>, DeterrentError> {
        panic!("model runtime crashed");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_crash_during_startup_is_reported_and_slot_stays_free() {
    init_test_tracing();
    let store = Arc::new(MemoryStore::new());
    let crashing = DetectionSupervisor::new(
        Arc::new(test_config()),
        store.clone(),
        Arc::new(PanickingLoader),
        Arc::new(MockCamera::default()),
    );

    assert!(matches!(
        crashing.start(request()).await,
        Err(DeterrentError::Other(_))
    ));
    assert!(!crashing.is_running().await);
    assert_eq!(crashing.shutdown().await, StopAck::NotRunning);
}
