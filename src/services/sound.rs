use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config;
use crate::error::DeterrentError;
use crate::messages::AlertEvent;

use super::AlertChannel;

/// Audible deterrent: a per-animal cue when one is mapped and present, otherwise a beep sequence.
#[derive(Clone)]
pub struct SoundChannel {
    settings: Arc<config::Sound>,
}

impl SoundChannel {
    pub fn new(settings: config::Sound) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    /// The cue file for an animal, if one is mapped and exists on disk.
    pub fn cue_for(&self, label: &str) -> Option<PathBuf> {
        self.settings
            .cues
            .get(&label.to_lowercase())
            .filter(|path| path.exists())
            .cloned()
    }

    async fn play_cue(&self, label: &str, cue: &PathBuf) -> Result<(), DeterrentError> {
        let (program, args) = self
            .settings
            .player_command
            .split_first()
            .ok_or_else(|| DeterrentError::Config("sound.player_command is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(cue)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let timeout = Duration::from_secs(self.settings.timeout_secs);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    return Err(DeterrentError::Other(format!(
                        "{} exited with {}",
                        program, status
                    )));
                }
                info!("Played sound alert for {}: {}", label, cue.display());
                Ok(())
            }
            Err(_) => {
                // The cue is audible by now; a player that never exits is cut off.
                debug!("Sound player for {} still running after {:?}, stopping it", label, timeout);
                child.kill().await?;
                Ok(())
            }
        }
    }

    async fn beep(&self) -> Result<(), DeterrentError> {
        let duration = Duration::from_millis(self.settings.beep_duration);
        let gap = Duration::from_millis(self.settings.beep_gap_ms);

        for _ in 0..self.settings.beep_count {
            match &self.settings.beep_command {
                Some(program) => {
                    let result = Command::new(program)
                        .arg("-f")
                        .arg(self.settings.beep_frequency.to_string())
                        .arg("-l")
                        .arg(self.settings.beep_duration.to_string())
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .kill_on_drop(true)
                        .status()
                        .await;

                    match result {
                        Ok(_) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                            warn!(
                                "Sound alert not available on this platform ({} not found)",
                                program
                            );
                            return Ok(());
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                None => {
                    if ring_terminal_bell().is_err() {
                        warn!("Sound alert not available on this platform");
                        return Ok(());
                    }
                    tokio::time::sleep(duration).await;
                }
            }
            tokio::time::sleep(gap).await;
        }

        info!("Sound alert played (beep x{})", self.settings.beep_count);
        Ok(())
    }
}

fn ring_terminal_bell() -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    stderr.write_all(b"\x07")?;
    stderr.flush()
}

#[async_trait]
impl AlertChannel for SoundChannel {
    async fn deliver(&self, alert: &AlertEvent) -> Result<(), DeterrentError> {
        if !self.settings.enabled {
            return Ok(());
        }

        let label = &alert.detection.label;
        if let Some(cue) = self.cue_for(label) {
            match self.play_cue(label, &cue).await {
                Ok(()) => return Ok(()),
                Err(err) => warn!(
                    "Could not play {}: {}, falling back to beep",
                    cue.display(),
                    err
                ),
            }
        }

        self.beep().await
    }

    fn name(&self) -> &'static str {
        "sound"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{BoundingBox, Detection};
    use chrono::Utc;

    fn alert(label: &str) -> AlertEvent {
        AlertEvent {
            sequence: 1,
            detection: Detection {
                label: label.to_string(),
                confidence: 0.9,
                bounding_box: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                frame_timestamp: Utc::now(),
            },
            snapshot: None,
        }
    }

    #[test]
    fn test_cue_lookup_requires_existing_asset() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cow = temp_dir.path().join("cow.mp3");
        std::fs::write(&cow, b"not really audio").unwrap();

        let mut settings = config::Sound::default();
        settings.cues.insert("cow".to_string(), cow.clone());
        settings
            .cues
            .insert("lion".to_string(), temp_dir.path().join("missing.mp3"));
        let channel = SoundChannel::new(settings);

        assert_eq!(channel.cue_for("Cow"), Some(cow));
        assert_eq!(channel.cue_for("lion"), None);
        assert_eq!(channel.cue_for("dog"), None);
    }

    #[tokio::test]
    async fn test_disabled_sound_is_noop() {
        let settings = config::Sound {
            enabled: false,
            ..config::Sound::default()
        };
        let channel = SoundChannel::new(settings);
        assert!(channel.deliver(&alert("dog")).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_beeper_is_not_an_error() {
        let settings = config::Sound {
            beep_command: Some("definitely-not-a-beeper-binary".to_string()),
            beep_count: 2,
            beep_gap_ms: 0,
            cues: Default::default(),
            ..config::Sound::default()
        };
        let channel = SoundChannel::new(settings);
        assert!(channel.deliver(&alert("dog")).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_player_falls_back_to_beep() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cat = temp_dir.path().join("cat.mp3");
        std::fs::write(&cat, b"meow").unwrap();

        let mut settings = config::Sound {
            player_command: vec!["definitely-not-a-player-binary".to_string()],
            beep_command: Some("definitely-not-a-beeper-binary".to_string()),
            beep_gap_ms: 0,
            ..config::Sound::default()
        };
        settings.cues.insert("cat".to_string(), cat);
        let channel = SoundChannel::new(settings);

        assert!(channel.deliver(&alert("cat")).await.is_ok());
    }
}
