use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned box as `(x1, y1, x2, y2)` pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Raw classifier output, in the coordinates of the frame that was classified.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
}

/// A candidate detection in display-frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub frame_timestamp: DateTime<Utc>,
}

/// A triggered alert handed to the side-channels. Owns its data; never borrows the loop's frame.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub sequence: u64,
    pub detection: Detection,
    pub snapshot: Option<Arc<RgbImage>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Danger,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub user_id: i64,
    pub animal_type: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub user_id: i64,
    pub message: String,
    pub alert_type: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one side-channel action for one alert. Only ever logged and counted.
#[derive(Debug, Clone)]
pub struct AlertChannelResult {
    pub channel: &'static str,
    pub sequence: u64,
    pub label: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Failed)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
            LoopState::Stopped => "stopped",
            LoopState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSummary {
    pub frames_processed: u64,
    pub alerts_triggered: u64,
    pub skipped_detections: u64,
    pub channels: DispatchStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopAck {
    /// Nothing was running for this handle.
    NotRunning,
    Stopped(LoopSummary),
    /// The loop did not acknowledge the stop request within the timeout and was left behind.
    Abandoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(LoopState::Stopped.is_terminal());
        assert!(LoopState::Failed.is_terminal());
        assert!(!LoopState::Running.is_terminal());
        assert!(!LoopState::Stopping.is_terminal());
        assert_eq!(LoopState::Running.to_string(), "running");
    }

    #[test]
    fn test_bounding_box_dimensions() {
        let bbox = BoundingBox::new(10.0, 20.0, 50.0, 80.0);
        assert_eq!(bbox.width(), 40.0);
        assert_eq!(bbox.height(), 60.0);
    }

    #[test]
    fn test_severity_serialization() {
        assert_eq!(Severity::Danger.as_str(), "danger");
        assert_eq!(
            serde_json::to_string(&Severity::Warning).unwrap(),
            "\"warning\""
        );
    }
}
