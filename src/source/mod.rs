use chrono::{DateTime, Utc};
use image::RgbImage;
use tracing::info;

use crate::error::DeterrentError;

mod ffmpeg;

pub use self::ffmpeg::{FfmpegSource, FfmpegSourceProvider};

/// One captured display frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: DateTime<Utc>,
    pub index: u64,
}

/// An opened capture device.
pub trait FrameSource {
    /// Next frame. An error means end of stream or an I/O failure; the loop stops on it.
    fn read(&mut self) -> Result<Frame, DeterrentError>;

    /// Releases the device. Safe to call more than once.
    fn close(&mut self);
}

/// Opens capture devices by index. Called on the loop thread.
pub trait FrameSourceProvider: Send + Sync {
    fn open(&self, device_index: u32) -> Result<Box<dyn FrameSource>, DeterrentError>;
}

/// Opens a device and releases it again without reading.
pub fn check_device(
    provider: &dyn FrameSourceProvider,
    device_index: u32,
) -> Result<(), DeterrentError> {
    let mut source = provider.open(device_index)?;
    source.close();
    info!(target: "source", "Camera {} is working", device_index);
    Ok(())
}
