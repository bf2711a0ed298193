//! Adapter from a [`FaceDetector`] to per-file face records.

use crate::detector::{DetectorError, FaceDetector};
use crate::store::{ImageStore, StoreError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionFailure {
    #[error(transparent)]
    Decode(#[from] StoreError),
    #[error("detector failed: {0}")]
    Detector(#[from] DetectorError),
}

/// Runs the detector and tags each face with the image it came from.
pub struct FaceDetectionAdapter {
    detector: Box<dyn FaceDetector>,
    store: ImageStore,
}

impl FaceDetectionAdapter {
    pub fn new(detector: Box<dyn FaceDetector>) -> Self {
        Self {
            detector,
            store: ImageStore::new(),
        }
    }

    /// Decode `path` and detect faces in it.
    pub fn detect(&mut self, path: &Path) -> Result<Vec<DetectedFace>, DetectionFailure> {
        let image = self.store.try_load(path)?;
        self.detect_in(path, &image)
    }

    /// Detect faces in an already decoded image.
    ///
    /// Degenerate detections (non-positive size) are dropped here; boxes that
    /// only overhang the image edge are left for the cropper to clamp.
    pub fn detect_in(&mut self, path: &Path, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionFailure> {
        let detections = self.detector.detect(image)?;
        let total = detections.len();

        let faces: Vec<DetectedFace> = detections
            .into_iter()
            .map(|d| DetectedFace {
                bbox: d.to_bounding_box(),
                confidence: d.confidence,
                source: path.to_path_buf(),
            })
            .filter(|f| f.bbox.w > 0 && f.bbox.h > 0)
            .collect();

        if faces.len() != total {
            tracing::debug!(
                path = %path.display(),
                dropped = total - faces.len(),
                "dropped zero-size detections"
            );
        }

        Ok(faces)
    }
}
