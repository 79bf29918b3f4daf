use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::ClassifierLoader;
use crate::config::Config;
use crate::detection_loop::{DetectionLoop, LoopContext};
use crate::error::DeterrentError;
use crate::messages::{LoopState, LoopSummary, StopAck};
use crate::services::channels_from_config;
use crate::source::FrameSourceProvider;
use crate::store::AlertStore;

/// Typed start parameters for one run. Overrides win over the configuration for that run only.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub model_path: PathBuf,
    pub device_index: u32,
    pub sender_override: Option<String>,
    pub recipient_override: Option<String>,
}

impl StartRequest {
    pub fn new(model_path: impl Into<PathBuf>, device_index: u32) -> Self {
        Self {
            model_path: model_path.into(),
            device_index,
            sender_override: None,
            recipient_override: None,
        }
    }

    /// Model and camera from `[detection]`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.detection.model_path.clone(), config.detection.camera_index)
    }

    pub fn with_sender(mut self, sender: Option<String>) -> Self {
        self.sender_override = sender;
        self
    }

    pub fn with_recipient(mut self, recipient: Option<String>) -> Self {
        self.recipient_override = recipient;
        self
    }
}

/// Caller-side view of a started loop.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    id: u64,
    state: watch::Receiver<LoopState>,
}

impl LoopHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Resolves once the loop reaches `Stopped` or `Failed`.
    pub async fn wait_terminal(&mut self) -> LoopState {
        match self.state.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // The loop thread is gone without a final state.
            Err(_) => LoopState::Stopped,
        }
    }
}

struct RunningLoop {
    id: u64,
    cancel: CancellationToken,
    join: JoinHandle<Option<LoopSummary>>,
    state: watch::Receiver<LoopState>,
}

impl RunningLoop {
    fn has_ended(&self) -> bool {
        self.join.is_finished() || self.state.borrow().is_terminal()
    }
}

/// Owns at most one detection loop and its start/stop lifecycle.
pub struct DetectionSupervisor {
    config: Arc<Config>,
    store: Arc<dyn AlertStore>,
    classifier_loader: Arc<dyn ClassifierLoader>,
    source_provider: Arc<dyn FrameSourceProvider>,
    running: Mutex<Option<RunningLoop>>,
    next_id: AtomicU64,
}

impl DetectionSupervisor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn AlertStore>,
        classifier_loader: Arc<dyn ClassifierLoader>,
        source_provider: Arc<dyn FrameSourceProvider>,
    ) -> Self {
        Self {
            config,
            store,
            classifier_loader,
            source_provider,
            running: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawns the loop and returns once it is `Running`, or with the startup error.
    pub async fn start(&self, request: StartRequest) -> Result<LoopHandle, DeterrentError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.has_ended() {
                warn!(
                    target: "supervisor",
                    "Start rejected, loop #{} is still running",
                    current.id
                );
                return Err(DeterrentError::AlreadyRunning);
            }
        }
        if let Some(finished) = running.take() {
            info!(target: "supervisor", "Reaping finished loop #{}", finished.id);
            if let Err(err) = finished.join.await {
                error!(target: "supervisor", "Loop #{} crashed: {}", finished.id, err);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(LoopState::Starting);
        let (init_tx, init_rx) = oneshot::channel::<Result<(), DeterrentError>>();

        let channels = channels_from_config(
            &self.config,
            self.store.clone(),
            request.sender_override.clone(),
            request.recipient_override.clone(),
        );
        let ctx = LoopContext {
            config: self.config.clone(),
            model_path: request.model_path.clone(),
            device_index: request.device_index,
            classifier_loader: self.classifier_loader.clone(),
            source_provider: self.source_provider.clone(),
            channels,
            runtime: Handle::current(),
            cancel: cancel.clone(),
            state: state_tx,
        };

        info!(
            target: "supervisor",
            "Starting loop #{} with model {} on camera {}",
            id,
            request.model_path.display(),
            request.device_index
        );
        let join = tokio::task::spawn_blocking(move || match DetectionLoop::start(ctx) {
            Ok(detection_loop) => {
                if init_tx.send(Ok(())).is_err() {
                    warn!(target: "supervisor", "Start caller went away, running anyway");
                }
                Some(detection_loop.run())
            }
            Err(err) => {
                if let Err(Err(err)) = init_tx.send(Err(err)) {
                    error!(target: "supervisor", "Startup failed with nobody waiting: {}", err);
                }
                None
            }
        });

        match init_rx.await {
            Ok(Ok(())) => {
                *running = Some(RunningLoop {
                    id,
                    cancel,
                    join,
                    state: state_rx.clone(),
                });
                info!(target: "supervisor", "Loop #{} running", id);
                Ok(LoopHandle { id, state: state_rx })
            }
            Ok(Err(err)) => {
                if let Err(join_err) = join.await {
                    error!(target: "supervisor", "Loop #{} crashed: {}", id, join_err);
                }
                error!(target: "supervisor", "Loop #{} failed to start: {}", id, err);
                Err(err)
            }
            Err(_) => {
                let reason = match join.await {
                    Err(join_err) => join_err.to_string(),
                    Ok(_) => "loop thread exited during startup".to_string(),
                };
                error!(target: "supervisor", "Loop #{} died during startup: {}", id, reason);
                Err(DeterrentError::Other(reason))
            }
        }
    }

    /// Stops the loop behind `handle`. Stopping a loop that is not running is a no-op.
    pub async fn stop(&self, handle: &LoopHandle) -> StopAck {
        let mut running = self.running.lock().await;
        match running.take() {
            Some(current) if current.id == handle.id => self.stop_running(current).await,
            other => {
                *running = other;
                StopAck::NotRunning
            }
        }
    }

    /// Stops whatever is running.
    pub async fn shutdown(&self) -> StopAck {
        let current = self.running.lock().await.take();
        match current {
            Some(current) => self.stop_running(current).await,
            None => StopAck::NotRunning,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| !current.has_ended())
    }

    async fn stop_running(&self, mut current: RunningLoop) -> StopAck {
        current.cancel.cancel();
        let timeout = self.config.supervisor.stop_timeout()
            + self.config.supervisor.dispatch_grace();

        match tokio::time::timeout(timeout, &mut current.join).await {
            Ok(Ok(Some(summary))) => {
                info!(target: "supervisor", "Loop #{} stopped", current.id);
                StopAck::Stopped(summary)
            }
            Ok(Ok(None)) => StopAck::NotRunning,
            Ok(Err(err)) => {
                error!(target: "supervisor", "Loop #{} crashed: {}", current.id, err);
                StopAck::Abandoned
            }
            Err(_) => {
                warn!(
                    target: "supervisor",
                    "Loop #{} did not stop within {:?}, abandoning its thread",
                    current.id, timeout
                );
                StopAck::Abandoned
            }
        }
    }
}

/// Shuts down the runtime that owns the supervisor, waiting at most `grace` for blocking
/// work. An abandoned loop thread is left behind instead of holding the process open.
pub fn shutdown_runtime(runtime: Runtime, grace: Duration) {
    debug!(target: "supervisor", "Shutting down runtime, waiting up to {:?}", grace);
    runtime.shutdown_timeout(grace);
}
