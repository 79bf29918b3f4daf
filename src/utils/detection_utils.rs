use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DeterrentError;
use crate::messages::{BoundingBox, Detection, RawDetection};

/// Wire format of the detection API: one entry per detected object.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DetectionResult {
    #[serde(deserialize_with = "deserialize_box")]
    pub r#box: [f32; 4],
    #[serde(deserialize_with = "float_to_u32")]
    pub cls: u32,
    pub cls_name: String,
    pub conf: f32,
}

fn float_to_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let f = f32::deserialize(deserializer)?;
    Ok(f as u32)
}

fn deserialize_box<'de, D>(deserializer: D) -> Result<[f32; 4], D::Error>
where
    D: Deserializer<'de>,
{
    let vec: Vec<f32> = Vec::deserialize(deserializer)?;
    if vec.len() != 4 {
        return Err(serde::de::Error::invalid_length(
            vec.len(),
            &"a box of four coordinates",
        ));
    }
    Ok([vec[0], vec[1], vec[2], vec[3]])
}

impl From<DetectionResult> for RawDetection {
    fn from(result: DetectionResult) -> Self {
        RawDetection {
            label: result.cls_name,
            confidence: result.conf,
            bounding_box: BoundingBox::new(
                result.r#box[0],
                result.r#box[1],
                result.r#box[2],
                result.r#box[3],
            ),
        }
    }
}

/// Target-category and confidence filter deciding which raw detections are candidates.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    targets: HashSet<String>,
    threshold: f32,
}

impl CandidateFilter {
    pub fn new<I, S>(targets: I, threshold: f32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            targets: targets
                .into_iter()
                .map(|target| target.as_ref().to_lowercase())
                .collect(),
            threshold,
        }
    }

    /// Strictly greater than the threshold; a confidence equal to it is not a candidate.
    pub fn accepts(&self, label: &str, confidence: f32) -> bool {
        self.targets.contains(&label.to_lowercase()) && confidence > self.threshold
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Maps a box from a resized frame of size `from` back onto the original frame of size `to`.
pub fn rescale_box(bbox: BoundingBox, from: (u32, u32), to: (u32, u32)) -> BoundingBox {
    let scale_x = to.0 as f32 / from.0 as f32;
    let scale_y = to.1 as f32 / from.1 as f32;
    BoundingBox {
        x1: bbox.x1 * scale_x,
        y1: bbox.y1 * scale_y,
        x2: bbox.x2 * scale_x,
        y2: bbox.y2 * scale_y,
    }
}

/// Turns a raw classifier output into a display-frame candidate.
pub fn to_detection(
    raw: &RawDetection,
    inference_size: (u32, u32),
    display_size: (u32, u32),
    frame_timestamp: DateTime<Utc>,
) -> Result<Detection, DeterrentError> {
    let bbox = raw.bounding_box;
    let coords = [bbox.x1, bbox.y1, bbox.x2, bbox.y2];
    if coords.iter().any(|c| !c.is_finite() || *c < 0.0) {
        return Err(DeterrentError::InvalidDetection(format!(
            "{} has non-finite or negative coordinates {:?}",
            raw.label, coords
        )));
    }
    if bbox.x2 < bbox.x1 || bbox.y2 < bbox.y1 {
        return Err(DeterrentError::InvalidDetection(format!(
            "{} has inverted box {:?}",
            raw.label, coords
        )));
    }
    if inference_size.0 == 0 || inference_size.1 == 0 {
        return Err(DeterrentError::InvalidDetection(
            "inference frame has zero size".to_string(),
        ));
    }

    Ok(Detection {
        label: raw.label.to_lowercase(),
        confidence: raw.confidence,
        bounding_box: rescale_box(bbox, inference_size, display_size),
        frame_timestamp,
    })
}

/// "dog" -> "Dog"
pub fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}
