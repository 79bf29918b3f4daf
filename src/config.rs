use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::DeterrentError;

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub detection: Detection,
    pub camera: Camera,
    pub classifier: Classifier,
    pub email: Email,
    pub sound: Sound,
    pub database: Database,
    pub overlay: Overlay,
    pub supervisor: Supervisor,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Detection {
    pub confidence_threshold: f32,
    /// Seconds between two alerts for the same animal.
    pub alert_cooldown: u64,
    pub camera_index: u32,
    /// Inference frame size. Display frames keep the camera resolution.
    pub frame_width: u32,
    pub frame_height: u32,
    pub save_detection_images: bool,
    pub detections_folder: PathBuf,
    pub target_animals: Vec<String>,
    pub model_path: PathBuf,
    pub location: String,
    pub status_interval_frames: u64,
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            alert_cooldown: 60,
            camera_index: 0,
            frame_width: 640,
            frame_height: 480,
            save_detection_images: true,
            detections_folder: PathBuf::from("detections"),
            target_animals: [
                "bird", "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra",
                "giraffe",
            ]
            .iter()
            .map(|animal| animal.to_string())
            .collect(),
            model_path: PathBuf::from("yolov8n.onnx"),
            location: "Camera Feed".to_string(),
            status_interval_frames: 30,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Camera {
    /// Input URL template, `{index}` is replaced with the device index.
    pub source_url: Option<String>,
}

impl Camera {
    pub fn source_for(&self, device_index: u32) -> String {
        match &self.source_url {
            Some(template) => template.replace("{index}", &device_index.to_string()),
            None => format!("/dev/video{}", device_index),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierBackend {
    Http,
    Tract,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Classifier {
    pub backend: ClassifierBackend,
    pub api_url: String,
    pub health_url: Option<String>,
    pub request_timeout_secs: u64,
    pub class_names: Vec<String>,
    pub iou_threshold: f32,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            backend: ClassifierBackend::Http,
            api_url: "http://127.0.0.1:8000/detect".to_string(),
            health_url: None,
            request_timeout_secs: 10,
            class_names: COCO_CLASS_NAMES.iter().map(|name| name.to_string()).collect(),
            iou_threshold: 0.45,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Email {
    pub enabled: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub sender_email: String,
    pub sender_password: String,
    pub recipient_email: String,
    pub timeout_secs: u64,
}

impl Default for Email {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            sender_email: String::new(),
            sender_password: String::new(),
            recipient_email: String::new(),
            timeout_secs: 10,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Sound {
    pub enabled: bool,
    pub beep_frequency: u32,
    /// Milliseconds per beep.
    pub beep_duration: u64,
    pub beep_count: u32,
    pub beep_gap_ms: u64,
    /// External beeper, invoked as `<cmd> -f <freq> -l <ms>`. Falls back to the terminal bell.
    pub beep_command: Option<String>,
    pub player_command: Vec<String>,
    pub timeout_secs: u64,
    pub cues: HashMap<String, PathBuf>,
}

impl Default for Sound {
    fn default() -> Self {
        let cues = [("cat", "sound/cat.mp3"), ("cow", "sound/cow.mp3"), ("lion", "sound/lion.mp3")]
            .iter()
            .map(|(animal, path)| (animal.to_string(), PathBuf::from(path)))
            .collect();

        Self {
            enabled: true,
            beep_frequency: 1000,
            beep_duration: 500,
            beep_count: 3,
            beep_gap_ms: 200,
            beep_command: None,
            player_command: vec![
                "ffplay".to_string(),
                "-nodisp".to_string(),
                "-autoexit".to_string(),
                "-loglevel".to_string(),
                "quiet".to_string(),
            ],
            timeout_secs: 5,
            cues,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Database {
    pub path: PathBuf,
    pub user_id: i64,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data.db"),
            user_id: 1,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Overlay {
    pub enabled: bool,
    pub line_color: [u8; 3],
    pub text_color: [u8; 3],
    pub status_color: [u8; 3],
    pub line_thickness: u32,
    pub font_path: Option<PathBuf>,
    pub preview_path: Option<PathBuf>,
}

impl Default for Overlay {
    fn default() -> Self {
        Self {
            enabled: true,
            line_color: [255, 0, 0],
            text_color: [255, 255, 255],
            status_color: [0, 255, 0],
            line_thickness: 3,
            font_path: None,
            preview_path: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Supervisor {
    pub stop_timeout_secs: u64,
    pub dispatch_grace_secs: u64,
    pub channel_timeout_secs: u64,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 2,
            dispatch_grace_secs: 5,
            channel_timeout_secs: 15,
        }
    }
}

impl Supervisor {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn dispatch_grace(&self) -> Duration {
        Duration::from_secs(self.dispatch_grace_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DeterrentError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, DeterrentError> {
        let mut config: Config = toml::from_str(contents)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for animal in self.detection.target_animals.iter_mut() {
            *animal = animal.trim().to_lowercase();
        }
        self.sound.cues = std::mem::take(&mut self.sound.cues)
            .into_iter()
            .map(|(animal, path)| (animal.to_lowercase(), path))
            .collect();
    }

    pub fn validate(&self) -> Result<(), DeterrentError> {
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DeterrentError::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.detection.frame_width == 0 || self.detection.frame_height == 0 {
            return Err(DeterrentError::Config(
                "frame_width and frame_height must be non-zero".to_string(),
            ));
        }
        if self.detection.target_animals.is_empty() {
            return Err(DeterrentError::Config(
                "target_animals must name at least one animal".to_string(),
            ));
        }
        if self.sound.player_command.is_empty() {
            return Err(DeterrentError::Config(
                "sound.player_command must name a program".to_string(),
            ));
        }
        Ok(())
    }
}

/// Class names of the stock YOLOv8 COCO model, in output order.
pub const COCO_CLASS_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.detection.confidence_threshold, 0.5);
        assert_eq!(config.detection.alert_cooldown, 60);
        assert_eq!(config.detection.frame_width, 640);
        assert!(config.detection.target_animals.contains(&"giraffe".to_string()));
        assert!(!config.email.enabled);
        assert_eq!(config.sound.beep_count, 3);
        assert_eq!(config.database.user_id, 1);
        assert_eq!(config.classifier.class_names.len(), 80);
    }

    #[test]
    fn test_partial_sections_and_normalization() {
        let config = Config::from_toml(
            r#"
            [detection]
            confidence_threshold = 0.7
            target_animals = [" Dog ", "FOX"]

            [sound.cues]
            Fox = "sound/fox.mp3"

            [email]
            enabled = true
            recipient_email = "farmer@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.detection.confidence_threshold, 0.7);
        assert_eq!(config.detection.alert_cooldown, 60);
        assert_eq!(config.detection.target_animals, vec!["dog", "fox"]);
        assert_eq!(
            config.sound.cues.get("fox"),
            Some(&PathBuf::from("sound/fox.mp3"))
        );
        assert_eq!(config.email.smtp_port, 587);
        assert_eq!(config.email.recipient_email, "farmer@example.com");
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = Config::from_toml("[detection]\nconfidence_threshold = 1.5").unwrap_err();
        assert!(matches!(err, DeterrentError::Config(_)));
        assert!(err.is_startup());
    }

    #[test]
    fn test_empty_target_set_rejected() {
        let err = Config::from_toml("[detection]\ntarget_animals = []").unwrap_err();
        assert!(matches!(err, DeterrentError::Config(_)));
    }

    #[test]
    fn test_camera_source_template() {
        let camera = Camera::default();
        assert_eq!(camera.source_for(2), "/dev/video2");

        let camera = Camera {
            source_url: Some("rtsp://barn.local/stream{index}".to_string()),
        };
        assert_eq!(camera.source_for(1), "rtsp://barn.local/stream1");
    }

    #[test]
    fn test_classifier_backend_parsing() {
        let config = Config::from_toml("[classifier]\nbackend = \"tract\"").unwrap();
        assert_eq!(config.classifier.backend, ClassifierBackend::Tract);
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_toml(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.classifier.backend, ClassifierBackend::Http);
        assert_eq!(config.sound.cues.len(), 3);
        assert_eq!(config.supervisor.channel_timeout(), Duration::from_secs(15));
    }
}
