use std::path::Path;

use image::RgbImage;
use tracing::info;

use crate::config;
use crate::error::DeterrentError;
use crate::messages::RawDetection;

mod http;
#[cfg(feature = "backend-tract")]
mod tract;

pub use http::HttpClassifier;
#[cfg(feature = "backend-tract")]
pub use tract::TractClassifier;

/// A loaded detection model. Boxes come back in the coordinates of the frame passed in.
pub trait Classifier {
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<RawDetection>, DeterrentError>;

    fn name(&self) -> &'static str;
}

/// Loads a classifier for one run. Called on the loop thread, so the model itself need not
/// be `Send`.
pub trait ClassifierLoader: Send + Sync {
    fn load(&self, model_path: &Path) -> Result<Box<dyn Classifier>, DeterrentError>;
}

/// Picks the backend named in `[classifier]`.
#[derive(Debug, Clone)]
pub struct ConfiguredClassifierLoader {
    settings: config::Classifier,
    input_size: (u32, u32),
}

impl ConfiguredClassifierLoader {
    pub fn new(settings: config::Classifier, input_size: (u32, u32)) -> Self {
        Self {
            settings,
            input_size,
        }
    }
}

impl ClassifierLoader for ConfiguredClassifierLoader {
    fn load(&self, model_path: &Path) -> Result<Box<dyn Classifier>, DeterrentError> {
        info!(
            target: "classifier",
            "Loading {:?} classifier with model {}",
            self.settings.backend,
            model_path.display()
        );
        match self.settings.backend {
            config::ClassifierBackend::Http => {
                Ok(Box::new(HttpClassifier::load(&self.settings, model_path)?))
            }
            #[cfg(feature = "backend-tract")]
            config::ClassifierBackend::Tract => Ok(Box::new(TractClassifier::load(
                &self.settings,
                model_path,
                self.input_size,
            )?)),
            #[cfg(not(feature = "backend-tract"))]
            config::ClassifierBackend::Tract => {
                let _ = self.input_size;
                Err(DeterrentError::ModelLoad {
                    path: model_path.display().to_string(),
                    reason: "built without the backend-tract feature".to_string(),
                })
            }
        }
    }
}

pub(crate) fn ensure_model_readable(model_path: &Path) -> Result<(), DeterrentError> {
    let metadata = std::fs::metadata(model_path).map_err(|err| DeterrentError::ModelLoad {
        path: model_path.display().to_string(),
        reason: err.to_string(),
    })?;
    if !metadata.is_file() {
        return Err(DeterrentError::ModelLoad {
            path: model_path.display().to_string(),
            reason: "not a regular file".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_model_load_error() {
        let loader = ConfiguredClassifierLoader::new(config::Classifier::default(), (640, 480));
        let err = match loader.load(Path::new("/nonexistent/yolov8n.onnx")) {
            Err(err) => err,
            Ok(_) => panic!("missing model must not load"),
        };
        assert!(matches!(err, DeterrentError::ModelLoad { .. }));
        assert!(err.is_startup());
    }

    #[test]
    fn test_directory_is_not_a_model() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ensure_model_readable(temp_dir.path()),
            Err(DeterrentError::ModelLoad { .. })
        ));
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn test_tract_backend_requires_feature() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = temp_dir.path().join("model.onnx");
        std::fs::write(&model, b"onnx").unwrap();

        let settings = config::Classifier {
            backend: config::ClassifierBackend::Tract,
            ..config::Classifier::default()
        };
        let loader = ConfiguredClassifierLoader::new(settings, (640, 480));
        assert!(matches!(
            loader.load(&model),
            Err(DeterrentError::ModelLoad { .. })
        ));
    }
}
