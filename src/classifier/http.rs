use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, RgbImage};
use reqwest::blocking::{multipart, Client};
use tracing::{debug, info};

use crate::config;
use crate::error::DeterrentError;
use crate::messages::RawDetection;
use crate::utils::detection_utils::DetectionResult;

use super::{ensure_model_readable, Classifier};

/// Posts each frame as a JPEG to a detection API and parses its `DetectionResult` list.
pub struct HttpClassifier {
    client: Client,
    api_url: String,
    model_name: String,
}

impl HttpClassifier {
    pub fn load(settings: &config::Classifier, model_path: &Path) -> Result<Self, DeterrentError> {
        ensure_model_readable(model_path)?;
        let model_load_error = |reason: String| DeterrentError::ModelLoad {
            path: model_path.display().to_string(),
            reason,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|err| model_load_error(err.to_string()))?;

        if let Some(health_url) = &settings.health_url {
            client
                .get(health_url)
                .send()
                .and_then(|response| response.error_for_status())
                .map_err(|err| {
                    model_load_error(format!("detector at {} is not healthy: {}", health_url, err))
                })?;
            info!(target: "classifier", "Detector at {} is healthy", health_url);
        }

        let model_name = model_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            client,
            api_url: settings.api_url.clone(),
            model_name,
        })
    }
}

fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>, DeterrentError> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(frame.clone()).write_to(&mut buffer, ImageFormat::Jpeg)?;
    Ok(buffer.into_inner())
}

impl Classifier for HttpClassifier {
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<RawDetection>, DeterrentError> {
        let bytes = encode_jpeg(frame)?;
        let part = multipart::Part::bytes(bytes)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(|err| DeterrentError::Inference(err.to_string()))?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model_name.clone());

        let results: Vec<DetectionResult> = self
            .client
            .post(&self.api_url)
            .multipart(form)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|err| DeterrentError::Inference(format!("Detector request failed: {}", err)))?;

        debug!(target: "classifier", "Detector returned {} objects", results.len());
        Ok(results.into_iter().map(RawDetection::from).collect())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
