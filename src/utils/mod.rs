pub mod detection_utils;
pub mod image_utils;
