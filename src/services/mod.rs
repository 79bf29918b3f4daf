use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::store::AlertStore;

mod email;
mod generic;
mod notify;
mod persistence;
mod sound;

pub use email::{EmailService, SMTP_PRESETS};
pub use generic::{AlertChannel, ChannelType};
pub use notify::NotifyChannel;
pub use persistence::StoreChannel;
pub use sound::SoundChannel;

/// Builds the side-channels for one run. The overrides apply to this run only.
pub fn channels_from_config(
    config: &Config,
    store: Arc<dyn AlertStore>,
    sender_override: Option<String>,
    recipient_override: Option<String>,
) -> Vec<ChannelType> {
    let mut channels: Vec<ChannelType> = vec![
        StoreChannel::new(store, config.database.user_id, config.detection.location.clone()).into(),
        SoundChannel::new(config.sound.clone()).into(),
    ];

    let snapshot_folder = config
        .detection
        .save_detection_images
        .then(|| config.detection.detections_folder.clone());
    let email = config.email.enabled.then(|| {
        EmailService::new(config.email.clone(), config.detection.location.clone())
            .with_sender_override(sender_override)
            .with_recipient_override(recipient_override)
    });
    if let Some(email) = &email {
        info!(target: "dispatch", "Email alerts go to {}", email.recipient());
    }
    if snapshot_folder.is_some() || email.is_some() {
        channels.push(NotifyChannel::new(snapshot_folder, email).into());
    }

    channels
}
