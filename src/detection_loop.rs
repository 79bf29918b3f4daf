use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, ClassifierLoader};
use crate::config::Config;
use crate::cooldown::CooldownGate;
use crate::dispatcher::AlertDispatcher;
use crate::error::DeterrentError;
use crate::messages::{AlertEvent, LoopState, LoopSummary};
use crate::services::ChannelType;
use crate::source::{Frame, FrameSource, FrameSourceProvider};
use crate::utils::detection_utils::{to_detection, CandidateFilter};
use crate::utils::image_utils::{resize_for_inference, OverlayRenderer};

/// Everything one run of the loop needs, handed over at spawn time.
pub struct LoopContext {
    pub config: Arc<Config>,
    pub model_path: PathBuf,
    pub device_index: u32,
    pub classifier_loader: Arc<dyn ClassifierLoader>,
    pub source_provider: Arc<dyn FrameSourceProvider>,
    pub channels: Vec<ChannelType>,
    pub runtime: Handle,
    pub cancel: CancellationToken,
    pub state: watch::Sender<LoopState>,
}

/// The sequential read, classify, decide loop. Runs on a blocking thread.
pub struct DetectionLoop {
    config: Arc<Config>,
    source: Box<dyn FrameSource>,
    classifier: Box<dyn Classifier>,
    filter: CandidateFilter,
    gate: CooldownGate,
    dispatcher: AlertDispatcher,
    overlay: Option<OverlayRenderer>,
    cancel: CancellationToken,
    state: watch::Sender<LoopState>,
    frames_processed: u64,
    alerts_triggered: u64,
    skipped_detections: u64,
}

impl DetectionLoop {
    /// Loads the model and opens the device. Returns a loop already in `Running`; either
    /// failure leaves it `Failed`.
    pub fn start(ctx: LoopContext) -> Result<Self, DeterrentError> {
        ctx.state.send_replace(LoopState::Starting);
        let channel_timeout = ctx.config.supervisor.channel_timeout();
        let opened = Self::open(
            ctx.classifier_loader.as_ref(),
            ctx.source_provider.as_ref(),
            &ctx.model_path,
            ctx.device_index,
        );
        match opened {
            Ok((classifier, source)) => {
                ctx.state.send_replace(LoopState::Running);
                Ok(Self::with_parts(
                    ctx.config,
                    source,
                    classifier,
                    AlertDispatcher::new(ctx.channels, ctx.runtime, channel_timeout),
                    ctx.cancel,
                    ctx.state,
                ))
            }
            Err(err) => {
                error!(target: "loop", "Startup failed: {}", err);
                ctx.state.send_replace(LoopState::Failed);
                Err(err)
            }
        }
    }

    fn open(
        classifier_loader: &dyn ClassifierLoader,
        source_provider: &dyn FrameSourceProvider,
        model_path: &Path,
        device_index: u32,
    ) -> Result<(Box<dyn Classifier>, Box<dyn FrameSource>), DeterrentError> {
        let classifier = classifier_loader.load(model_path)?;
        info!(target: "loop", "Model loaded: {} ({})", model_path.display(), classifier.name());
        let source = source_provider.open(device_index)?;
        info!(target: "loop", "Camera {} opened", device_index);
        Ok((classifier, source))
    }

    pub fn with_parts(
        config: Arc<Config>,
        source: Box<dyn FrameSource>,
        classifier: Box<dyn Classifier>,
        dispatcher: AlertDispatcher,
        cancel: CancellationToken,
        state: watch::Sender<LoopState>,
    ) -> Self {
        let overlay = if config.overlay.enabled {
            match OverlayRenderer::new(&config.overlay) {
                Ok(overlay) => Some(overlay),
                Err(err) => {
                    warn!(target: "loop", "Overlay disabled: {}", err);
                    None
                }
            }
        } else {
            None
        };

        Self {
            filter: CandidateFilter::new(
                &config.detection.target_animals,
                config.detection.confidence_threshold,
            ),
            gate: CooldownGate::new(config.detection.alert_cooldown),
            config,
            source,
            classifier,
            dispatcher,
            overlay,
            cancel,
            state,
            frames_processed: 0,
            alerts_triggered: 0,
            skipped_detections: 0,
        }
    }

    fn log_banner(&self) {
        let detection = &self.config.detection;
        info!(target: "loop", "Animal detection running");
        info!(target: "loop", "Target animals: {}", detection.target_animals.join(", "));
        info!(target: "loop", "Confidence threshold: {}", self.filter.threshold());
        info!(target: "loop", "Alert cooldown: {}s", self.gate.cooldown().num_seconds());
        info!(target: "loop", "Sound alerts: {}", enabled(self.config.sound.enabled));
        info!(target: "loop", "Email alerts: {}", enabled(self.config.email.enabled));
    }

    /// Runs until the source fails or the token is cancelled, then stops and summarizes.
    pub fn run(mut self) -> LoopSummary {
        self.state.send_replace(LoopState::Running);
        self.log_banner();

        loop {
            if self.cancel.is_cancelled() {
                info!(target: "loop", "Stop requested");
                break;
            }

            let frame = match self.source.read() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(target: "loop", "Frame source ended: {}", err);
                    break;
                }
            };

            self.process_frame(frame);
            self.dispatcher.reap();
        }

        self.stop()
    }

    fn process_frame(&mut self, mut frame: Frame) {
        self.frames_processed += 1;

        let detection = &self.config.detection;
        let inference_size = (detection.frame_width, detection.frame_height);
        let display_size = frame.image.dimensions();

        let raw_detections = {
            let resized = resize_for_inference(&frame.image, inference_size.0, inference_size.1);
            let inference_frame = resized.as_ref().unwrap_or(&frame.image);
            self.classifier.infer(inference_frame)
        };
        let raw_detections = match raw_detections {
            Ok(raw_detections) => raw_detections,
            Err(err) => {
                warn!(target: "loop", "Skipping frame {}: {}", frame.index, err);
                return;
            }
        };

        let mut detected_labels = Vec::new();
        for raw in &raw_detections {
            if !self.filter.accepts(&raw.label, raw.confidence) {
                continue;
            }

            let candidate = match to_detection(raw, inference_size, display_size, frame.timestamp) {
                Ok(candidate) => candidate,
                Err(err) => {
                    self.skipped_detections += 1;
                    warn!(target: "loop", "Skipping detection in frame {}: {}", frame.index, err);
                    continue;
                }
            };

            if let Some(overlay) = &self.overlay {
                overlay.draw_detection(&mut frame.image, &candidate);
            }
            detected_labels.push(candidate.label.clone());

            if self.gate.should_alert(&candidate.label, frame.timestamp) {
                self.alerts_triggered += 1;
                info!(
                    target: "loop",
                    "ALERT #{}: {} detected with {:.2} confidence",
                    self.alerts_triggered,
                    candidate.label.to_uppercase(),
                    candidate.confidence
                );
                self.dispatcher.dispatch(AlertEvent {
                    sequence: self.alerts_triggered,
                    detection: candidate,
                    snapshot: Some(Arc::new(frame.image.clone())),
                });
            }
        }

        let interval = self.config.detection.status_interval_frames.max(1);
        if self.frames_processed % interval == 0 {
            let channels = self.dispatcher.stats();
            info!(
                target: "loop",
                "Status: {} frames processed, {} alerts sent, {} side-channel tasks in flight, {} failed",
                self.frames_processed,
                self.alerts_triggered,
                self.dispatcher.in_flight(),
                channels.failed
            );
            self.write_preview(&mut frame, &detected_labels);
        }
    }

    fn write_preview(&self, frame: &mut Frame, detected_labels: &[String]) {
        let (Some(overlay), Some(path)) = (&self.overlay, &self.config.overlay.preview_path) else {
            return;
        };
        overlay.draw_status(
            &mut frame.image,
            self.frames_processed,
            self.alerts_triggered,
            detected_labels,
        );
        if let Err(err) = frame.image.save(path) {
            warn!(target: "loop", "Could not write preview {}: {}", path.display(), err);
        } else {
            debug!(target: "loop", "Preview written to {}", path.display());
        }
    }

    fn stop(mut self) -> LoopSummary {
        self.state.send_replace(LoopState::Stopping);
        self.source.close();

        let channels = self.dispatcher.drain(self.config.supervisor.dispatch_grace());
        let summary = LoopSummary {
            frames_processed: self.frames_processed,
            alerts_triggered: self.alerts_triggered,
            skipped_detections: self.skipped_detections,
            channels,
        };

        info!(target: "loop", "Detection stopped");
        info!(target: "loop", "Total frames processed: {}", summary.frames_processed);
        info!(target: "loop", "Total alerts sent: {}", summary.alerts_triggered);
        info!(
            target: "loop",
            "Side-channel tasks: {} dispatched, {} succeeded, {} failed, {} abandoned",
            channels.dispatched, channels.succeeded, channels.failed, channels.abandoned
        );

        self.state.send_replace(LoopState::Stopped);
        summary
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}
