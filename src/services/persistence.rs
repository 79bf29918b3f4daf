use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::DeterrentError;
use crate::messages::{AlertEvent, Severity};
use crate::store::AlertStore;
use crate::utils::detection_utils::capitalize;

use super::AlertChannel;

/// Writes one DetectionRecord and one AlertRecord per triggered alert. Never retries.
#[derive(Clone)]
pub struct StoreChannel {
    store: Arc<dyn AlertStore>,
    user_id: i64,
    location: String,
}

impl StoreChannel {
    pub fn new(store: Arc<dyn AlertStore>, user_id: i64, location: impl Into<String>) -> Self {
        Self {
            store,
            user_id,
            location: location.into(),
        }
    }
}

#[async_trait]
impl AlertChannel for StoreChannel {
    async fn deliver(&self, alert: &AlertEvent) -> Result<(), DeterrentError> {
        let store = self.store.clone();
        let user_id = self.user_id;
        let location = self.location.clone();
        let animal_type = capitalize(&alert.detection.label);
        let message = format!("{} detected - Alert activated", animal_type);
        let timestamp = alert.detection.frame_timestamp;

        tokio::task::spawn_blocking(move || -> Result<(), DeterrentError> {
            // Both writes are attempted even when the first one fails.
            let detection = store.record_detection(user_id, &animal_type, &location, timestamp);
            let alert = store.record_alert(user_id, &message, Severity::Danger, timestamp);

            match (&detection, &alert) {
                (Ok(detection_id), Ok(alert_id)) => {
                    info!(
                        "Stored {} detection #{} and alert #{}",
                        animal_type, detection_id, alert_id
                    );
                }
                _ => {
                    if let Err(err) = &detection {
                        error!("Could not store {} detection record: {}", animal_type, err);
                    }
                    if let Err(err) = &alert {
                        error!("Could not store {} alert record: {}", animal_type, err);
                    }
                }
            }

            detection?;
            alert?;
            Ok(())
        })
        .await
        .map_err(|err| DeterrentError::Other(format!("Database task failed: {}", err)))?
    }

    fn name(&self) -> &'static str {
        "database"
    }
}
