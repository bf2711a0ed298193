//! Face detection backends.
//!
//! Both backends run via ONNX Runtime on a letterboxed 640×640 input and
//! return detections in source-image pixel coordinates, sorted by confidence.

mod retinaface;
mod scrfd;

pub use retinaface::RetinaFaceDetector;
pub use scrfd::ScrfdDetector;

use crate::types::Detection;
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub(crate) const DETECTOR_INPUT_SIZE: usize = 640;
pub(crate) const CONFIDENCE_THRESHOLD: f32 = 0.5;
pub(crate) const NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image has zero area")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detector over decoded RGB images.
pub trait FaceDetector: Send {
    /// Detect faces, returning boxes sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Selectable detector model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorBackend {
    #[default]
    RetinaFace,
    Scrfd,
}

impl DetectorBackend {
    pub fn name(&self) -> &'static str {
        match self {
            DetectorBackend::RetinaFace => "retinaface",
            DetectorBackend::Scrfd => "scrfd",
        }
    }

    /// File name of the ONNX model for this backend inside the model directory.
    pub fn model_file(&self) -> &'static str {
        match self {
            DetectorBackend::RetinaFace => "retinaface_r50.onnx",
            DetectorBackend::Scrfd => "det_10g.onnx",
        }
    }

    /// Load this backend's model from `model_dir`.
    pub fn load(&self, model_dir: &Path) -> Result<Box<dyn FaceDetector>, DetectorError> {
        let path = model_dir.join(self.model_file());
        let path = path.to_string_lossy();
        Ok(match self {
            DetectorBackend::RetinaFace => Box::new(RetinaFaceDetector::load(&path)?),
            DetectorBackend::Scrfd => Box::new(ScrfdDetector::load(&path)?),
        })
    }
}

impl std::fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retinaface" => Ok(DetectorBackend::RetinaFace),
            "scrfd" => Ok(DetectorBackend::Scrfd),
            "opencv" | "ssd" | "dlib" | "mtcnn" | "fastmtcnn" | "mediapipe" | "yolov8"
            | "yunet" | "centerface" => Err(format!(
                "detector backend {s} is not available (supported: retinaface, scrfd)"
            )),
            other => Err(format!("unknown detector backend: {other}")),
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
pub(crate) struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl LetterboxInfo {
    /// Map a point from letterboxed input space back to the source image.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Resize `image` to fit a `size`×`size` canvas (aspect preserved, centered)
/// and write it into a NCHW tensor.
///
/// `normalize` maps an (R, G, B) pixel to the three channel values in tensor
/// order; padding is filled with `normalize(pad)`.
pub(crate) fn letterbox_tensor(
    image: &RgbImage,
    size: usize,
    pad: [u8; 3],
    normalize: impl Fn([u8; 3]) -> [f32; 3],
) -> Result<(Array4<f32>, LetterboxInfo), DetectorError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(DetectorError::EmptyImage);
    }

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let resized = image::imageops::resize(
        image,
        new_w as u32,
        new_h as u32,
        image::imageops::FilterType::Triangle,
    );

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;
    let pad_value = normalize(pad);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let inside = y >= pad_y_start
                && y < pad_y_start + new_h
                && x >= pad_x_start
                && x < pad_x_start + new_w;
            let values = if inside {
                let p = resized.get_pixel((x - pad_x_start) as u32, (y - pad_y_start) as u32);
                normalize(p.0)
            } else {
                pad_value
            };
            for (c, v) in values.into_iter().enumerate() {
                tensor[[0, c, y, x]] = v;
            }
        }
    }

    Ok((tensor, LetterboxInfo { scale, pad_x, pad_y }))
}

/// Sort by descending confidence.
pub(crate) fn sort_by_confidence(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Non-Maximum Suppression: remove overlapping detections.
pub(crate) fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    sort_by_confidence(&mut detections);

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Compute Intersection-over-Union between two detections.
pub(crate) fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_w = (x2 - x1).max(0.0);
    let inter_h = (y2 - y1).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = a.width * a.height;
    let area_b = b.width * b.height;
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
