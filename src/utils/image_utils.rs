use std::path::{Path, PathBuf};

use ab_glyph::{FontArc, PxScale};
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::config;
use crate::error::DeterrentError;
use crate::messages::Detection;

/// Downscales (or upscales) a display frame to the inference size. Returns `None` when the
/// frame already has that size so callers can classify it directly.
pub fn resize_for_inference(image: &RgbImage, width: u32, height: u32) -> Option<RgbImage> {
    if image.width() == width && image.height() == height {
        return None;
    }
    Some(image::imageops::resize(image, width, height, FilterType::Triangle))
}

/// Font used when `[overlay].font_path` is unset or unreadable.
const DEFAULT_FONT: &[u8] = include_bytes!("../DejaVuSans.ttf");

/// Draws detection boxes and the status lines onto display frames.
pub struct OverlayRenderer {
    font: FontArc,
    line_color: Rgb<u8>,
    text_color: Rgb<u8>,
    status_color: Rgb<u8>,
    line_thickness: u32,
}

impl OverlayRenderer {
    pub fn new(settings: &config::Overlay) -> Result<Self, DeterrentError> {
        let font = match &settings.font_path {
            Some(path) => load_font(path).or_else(|err| {
                warn!(
                    "Could not load overlay font {}: {}. Using the built-in font.",
                    path.display(),
                    err
                );
                FontArc::try_from_slice(DEFAULT_FONT)
            })?,
            None => FontArc::try_from_slice(DEFAULT_FONT)?,
        };

        Ok(Self {
            font,
            line_color: Rgb(settings.line_color),
            text_color: Rgb(settings.text_color),
            status_color: Rgb(settings.status_color),
            line_thickness: settings.line_thickness.max(1),
        })
    }

    pub fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let (image_width, image_height) = image.dimensions();
        if image_width == 0 || image_height == 0 {
            return;
        }

        let bbox = detection.bounding_box;
        let box_x = (bbox.x1.max(0.0) as u32).min(image_width - 1);
        let box_y = (bbox.y1.max(0.0) as u32).min(image_height - 1);
        let box_x2 = (bbox.x2.max(0.0) as u32).min(image_width - 1);
        let box_y2 = (bbox.y2.max(0.0) as u32).min(image_height - 1);
        let box_width = box_x2.saturating_sub(box_x).max(1);
        let box_height = box_y2.saturating_sub(box_y).max(1);

        for i in 0..self.line_thickness {
            if 2 * i >= box_width || 2 * i >= box_height {
                break;
            }
            draw_hollow_rect_mut(
                image,
                Rect::at(box_x as i32 + i as i32, box_y as i32 + i as i32)
                    .of_size(box_width - 2 * i, box_height - 2 * i),
                self.line_color,
            );
        }

        let font = &self.font;
        let label = format!("{} {:.2}", detection.label.to_uppercase(), detection.confidence);
        let scale = PxScale { x: 22.0, y: 22.0 };
        let text = text_size(scale, font, &label);
        let padding = 5;
        let label_height = text.1 + 2 * padding;

        // Caption above the box, or inside its top edge when the box touches the frame top.
        let label_y = if label_height < box_y {
            box_y - label_height
        } else {
            box_y
        };
        draw_filled_rect_mut(
            image,
            Rect::at(box_x as i32, label_y as i32).of_size(text.0 + 2 * padding, label_height),
            self.line_color,
        );
        draw_text_mut(
            image,
            self.text_color,
            (box_x + padding) as i32,
            (label_y + padding) as i32,
            scale,
            font,
            &label,
        );
    }

    pub fn draw_status(
        &self,
        image: &mut RgbImage,
        frame_count: u64,
        alert_count: u64,
        detected: &[String],
    ) {
        let font = &self.font;
        let scale = PxScale { x: 20.0, y: 20.0 };
        let status = format!("Frame: {} | Alerts: {}", frame_count, alert_count);
        draw_text_mut(image, self.status_color, 10, 10, scale, font, &status);

        if !detected.is_empty() {
            let names: Vec<String> = detected.iter().map(|name| name.to_uppercase()).collect();
            let alert_text = format!("DETECTED: {}", names.join(", "));
            draw_text_mut(image, self.line_color, 10, 40, scale, font, &alert_text);
        }
    }
}

fn load_font(path: &Path) -> Result<FontArc, DeterrentError> {
    let bytes = std::fs::read(path)?;
    Ok(FontArc::try_from_vec(bytes)?)
}

/// `detection_<label>_<YYYYmmdd_HHMMSS>.jpg`
pub fn snapshot_file_name(label: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "detection_{}_{}.jpg",
        label.to_lowercase().replace(char::is_whitespace, "_"),
        timestamp.format("%Y%m%d_%H%M%S")
    )
}

/// Writes a snapshot into `folder`, creating it on demand, and returns the written path.
pub fn save_snapshot(
    image: &RgbImage,
    folder: &Path,
    label: &str,
    timestamp: DateTime<Utc>,
) -> Result<PathBuf, DeterrentError> {
    std::fs::create_dir_all(folder)?;
    let path = folder.join(snapshot_file_name(label, timestamp));
    image.save(&path)?;
    info!("Detection image saved: {}", path.display());
    Ok(path)
}
