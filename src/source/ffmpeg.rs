use chrono::Utc;
use ffmpeg_next as ffmpeg;
use ffmpeg::codec::context::Context as CodecContext;
use ffmpeg::format::Pixel;
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{Context as ScalingContext, Flags};
use ffmpeg::util::frame::video::Video;
use image::RgbImage;
use tracing::{debug, error, info};

use crate::config;
use crate::error::DeterrentError;

use super::{Frame, FrameSource, FrameSourceProvider};

/// Opens cameras and streams through FFmpeg, using `[camera].source_url` to name the input.
#[derive(Debug, Clone, Default)]
pub struct FfmpegSourceProvider {
    camera: config::Camera,
}

impl FfmpegSourceProvider {
    pub fn new(camera: config::Camera) -> Self {
        Self { camera }
    }
}

impl FrameSourceProvider for FfmpegSourceProvider {
    fn open(&self, device_index: u32) -> Result<Box<dyn FrameSource>, DeterrentError> {
        let url = self.camera.source_for(device_index);
        match FfmpegSource::open(&url) {
            Ok(source) => Ok(Box::new(source)),
            Err(err) => {
                error!(target: "source", "Failed to open {}: {}", url, err);
                Err(DeterrentError::DeviceUnavailable {
                    index: device_index,
                    reason: format!("{}: {}", url, err),
                })
            }
        }
    }
}

/// A decoded video input producing RGB24 frames.
pub struct FfmpegSource {
    url: String,
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: ScalingContext,
    frame_index: u64,
    eof_sent: bool,
}

fn open_input(url: &str) -> Result<ffmpeg::format::context::Input, ffmpeg::Error> {
    if url.starts_with("/dev/video") {
        ffmpeg::device::register_all();
        let v4l2 = ffmpeg::device::input::video().find(|format| format.name().contains("v4l2"));
        if let Some(format) = v4l2 {
            return ffmpeg::format::open(&url, &format).map(|context| context.input());
        }
    }
    ffmpeg::format::input(&url)
}

impl FfmpegSource {
    pub fn open(url: &str) -> Result<Self, DeterrentError> {
        ffmpeg::init()?;
        ffmpeg::log::set_level(ffmpeg::log::Level::Quiet);

        info!(target: "source", "Opening FFmpeg input {}", url);
        let input = open_input(url)?;

        let input_stream = input
            .streams()
            .best(Type::Video)
            .ok_or_else(|| {
                DeterrentError::Other(format!("Could not find video stream in {}", url))
            })?;
        let stream_index = input_stream.index();

        let decoder = CodecContext::from_parameters(input_stream.parameters())?
            .decoder()
            .video()?;

        let scaler = ScalingContext::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            Flags::BILINEAR,
        )?;

        info!(target: "source", "Opened {} ({}x{})", url, decoder.width(), decoder.height());

        Ok(Self {
            url: url.to_string(),
            input: Some(input),
            stream_index,
            decoder,
            scaler,
            frame_index: 0,
            eof_sent: false,
        })
    }

    fn next_decoded(&mut self) -> Result<Video, DeterrentError> {
        let mut decoded = Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(decoded);
            }
            if self.eof_sent {
                return Err(DeterrentError::FrameRead(format!(
                    "{} reached end of stream",
                    self.url
                )));
            }

            let input = self
                .input
                .as_mut()
                .ok_or_else(|| DeterrentError::FrameRead(format!("{} is closed", self.url)))?;

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder.send_packet(&packet).map_err(|err| {
                        DeterrentError::FrameRead(format!("decoder rejected packet: {}", err))
                    })?;
                }
                Err(ffmpeg::Error::Eof) => {
                    debug!(target: "source", "{} exhausted, flushing decoder", self.url);
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                }
                Err(err) => {
                    return Err(DeterrentError::FrameRead(format!("{}: {}", self.url, err)));
                }
            }
        }
    }
}

/// Copies the RGB plane row by row, dropping stride padding.
fn video_to_image(frame: &Video) -> Result<RgbImage, DeterrentError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = data
            .get(start..start + row_bytes)
            .ok_or_else(|| DeterrentError::FrameRead("frame row is out of bounds".to_string()))?;
        pixels.extend_from_slice(line);
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| DeterrentError::FrameRead("frame buffer size mismatch".to_string()))
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> Result<Frame, DeterrentError> {
        let decoded = self.next_decoded()?;
        let mut rgb_frame = Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .map_err(|err| DeterrentError::FrameRead(format!("Failed to scale frame: {}", err)))?;

        self.frame_index += 1;
        Ok(Frame {
            image: video_to_image(&rgb_frame)?,
            timestamp: Utc::now(),
            index: self.frame_index,
        })
    }

    fn close(&mut self) {
        if self.input.take().is_some() {
            info!(target: "source", "Closed {} after {} frames", self.url, self.frame_index);
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}
