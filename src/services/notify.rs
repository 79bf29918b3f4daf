use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::DeterrentError;
use crate::messages::AlertEvent;
use crate::utils::image_utils::save_snapshot;

use super::{AlertChannel, EmailService};

/// Saves the annotated snapshot and emails it. The email goes out even when saving fails.
#[derive(Clone)]
pub struct NotifyChannel {
    snapshot_folder: Option<PathBuf>,
    email: Option<EmailService>,
}

impl NotifyChannel {
    pub fn new(snapshot_folder: Option<PathBuf>, email: Option<EmailService>) -> Self {
        Self {
            snapshot_folder,
            email,
        }
    }

    async fn save(&self, alert: &AlertEvent) -> Option<PathBuf> {
        let folder = self.snapshot_folder.clone()?;
        let snapshot = alert.snapshot.clone()?;
        let label = alert.detection.label.clone();
        let timestamp = alert.detection.frame_timestamp;

        let saved = tokio::task::spawn_blocking(move || {
            save_snapshot(&snapshot, &folder, &label, timestamp)
        })
        .await;

        match saved {
            Ok(Ok(path)) => Some(path),
            Ok(Err(err)) => {
                warn!("Could not save detection image for {}: {}", alert.detection.label, err);
                None
            }
            Err(err) => {
                warn!("Snapshot task failed: {}", err);
                None
            }
        }
    }
}

#[async_trait]
impl AlertChannel for NotifyChannel {
    async fn deliver(&self, alert: &AlertEvent) -> Result<(), DeterrentError> {
        let image_path = self.save(alert).await;

        match &self.email {
            Some(email) => email.send_alert(&alert.detection, image_path.as_deref()).await,
            None => {
                debug!("Email disabled, alert #{} not mailed", alert.sequence);
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "notify"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::messages::{BoundingBox, Detection};
    use chrono::{TimeZone, Utc};
    use image::RgbImage;
    use std::sync::Arc;

    fn alert(snapshot: Option<Arc<RgbImage>>) -> AlertEvent {
        AlertEvent {
            sequence: 4,
            detection: Detection {
                label: "horse".to_string(),
                confidence: 0.77,
                bounding_box: BoundingBox::new(1.0, 1.0, 5.0, 5.0),
                frame_timestamp: Utc.with_ymd_and_hms(2025, 11, 26, 10, 30, 0).unwrap(),
            },
            snapshot,
        }
    }

    #[tokio::test]
    async fn test_snapshot_saved_without_email() {
        let temp_dir = tempfile::tempdir().unwrap();
        let channel = NotifyChannel::new(Some(temp_dir.path().to_path_buf()), None);

        channel
            .deliver(&alert(Some(Arc::new(RgbImage::new(32, 24)))))
            .await
            .unwrap();

        assert!(temp_dir
            .path()
            .join("detection_horse_20251126_103000.jpg")
            .exists());
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_not_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let channel = NotifyChannel::new(Some(temp_dir.path().to_path_buf()), None);
        assert!(channel.deliver(&alert(None)).await.is_ok());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_email_failure_is_reported() {
        let email = EmailService::new(
            config::Email {
                enabled: true,
                smtp_server: "127.0.0.1".to_string(),
                smtp_port: 1,
                sender_email: "alerts@farm.example".to_string(),
                sender_password: "secret".to_string(),
                recipient_email: "owner@farm.example".to_string(),
                timeout_secs: 2,
            },
            "Camera Feed",
        );
        let channel = NotifyChannel::new(None, Some(email));
        assert!(channel.deliver(&alert(None)).await.is_err());
    }
}
