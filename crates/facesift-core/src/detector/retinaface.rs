//! RetinaFace face detector via ONNX Runtime.
//!
//! Prior-box (SSD-style) decoding with center/size variances, five-point
//! landmark decoding, and NMS post-processing. Expects the common
//! PyTorch export with `loc` [1, N, 4], `conf` [1, N, 2] (softmaxed) and
//! `landms` [1, N, 10] outputs.

use super::{
    letterbox_tensor, nms, sort_by_confidence, DetectorError, FaceDetector, LetterboxInfo,
    CONFIDENCE_THRESHOLD, DETECTOR_INPUT_SIZE, NMS_THRESHOLD,
};
use crate::types::Detection;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// Per-channel BGR means subtracted from the input.
const RETINAFACE_MEAN_BGR: [f32; 3] = [104.0, 117.0, 123.0];
const RETINAFACE_STEPS: [usize; 3] = [8, 16, 32];
const RETINAFACE_MIN_SIZES: [[f32; 2]; 3] = [[16.0, 32.0], [64.0, 128.0], [256.0, 512.0]];
const CENTER_VARIANCE: f32 = 0.1;
const SIZE_VARIANCE: f32 = 0.2;

/// Output tensor indices: (loc, conf, landms).
type OutputIndices = (usize, usize, usize);

/// Prior box in normalized input coordinates (center x/y, width, height).
#[derive(Debug, Clone, Copy, PartialEq)]
struct PriorBox {
    cx: f32,
    cy: f32,
    w: f32,
    h: f32,
}

/// RetinaFace-based face detector.
pub struct RetinaFaceDetector {
    session: Session,
    input_size: usize,
    priors: Vec<PriorBox>,
    output_indices: OutputIndices,
}

impl RetinaFaceDetector {
    /// Load the RetinaFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded RetinaFace model"
        );

        if output_names.len() < 3 {
            return Err(DetectorError::InferenceFailed(format!(
                "RetinaFace model requires 3 outputs (loc/conf/landms), got {}",
                output_names.len()
            )));
        }

        let output_indices = discover_output_indices(&output_names);
        let priors = generate_priors(DETECTOR_INPUT_SIZE);
        tracing::debug!(?output_indices, priors = priors.len(), "RetinaFace output mapping");

        Ok(Self {
            session,
            input_size: DETECTOR_INPUT_SIZE,
            priors,
            output_indices,
        })
    }
}

impl FaceDetector for RetinaFaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        // Pad with the mean so padding normalizes to zero.
        let (input, letterbox) = letterbox_tensor(image, self.input_size, [123, 117, 104], |[r, g, b]| {
            [
                f32::from(b) - RETINAFACE_MEAN_BGR[0],
                f32::from(g) - RETINAFACE_MEAN_BGR[1],
                f32::from(r) - RETINAFACE_MEAN_BGR[2],
            ]
        })?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (loc_idx, conf_idx, landms_idx) = self.output_indices;
        let (_, loc) = outputs[loc_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("loc: {e}")))?;
        let (_, conf) = outputs[conf_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("conf: {e}")))?;
        let (_, landms) = outputs[landms_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("landms: {e}")))?;

        if loc.len() != self.priors.len() * 4 || conf.len() != self.priors.len() * 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "prior count mismatch: {} priors, loc has {} values, conf has {}",
                self.priors.len(),
                loc.len(),
                conf.len()
            )));
        }

        let detections = decode(
            loc,
            conf,
            landms,
            &self.priors,
            self.input_size,
            &letterbox,
            CONFIDENCE_THRESHOLD,
        );

        let mut result = nms(detections, NMS_THRESHOLD);
        sort_by_confidence(&mut result);
        tracing::debug!(faces = result.len(), "RetinaFace detection complete");

        Ok(result)
    }
}

/// Map output tensors by name ("loc"/"conf"/"landms" or "bbox"/"score"/"landmark"
/// variants), falling back to positional [0]=loc, [1]=conf, [2]=landms.
fn discover_output_indices(names: &[String]) -> OutputIndices {
    let find = |candidates: &[&str]| -> Option<usize> {
        names.iter().position(|n| {
            let n = n.to_ascii_lowercase();
            candidates.iter().any(|c| n == *c)
        })
    };

    match (
        find(&["loc", "bbox", "boxes"]),
        find(&["conf", "score", "scores", "confidence"]),
        find(&["landms", "landmark", "landmarks"]),
    ) {
        (Some(loc), Some(conf), Some(landms)) => (loc, conf, landms),
        _ => {
            tracing::info!(?names, "RetinaFace: output names not recognized, using positional mapping");
            (0, 1, 2)
        }
    }
}

/// Generate prior boxes for a square input, in the order the network emits them:
/// stride-major, then row, column, and min size.
fn generate_priors(input_size: usize) -> Vec<PriorBox> {
    let size = input_size as f32;
    let mut priors = Vec::new();

    for (&step, min_sizes) in RETINAFACE_STEPS.iter().zip(RETINAFACE_MIN_SIZES.iter()) {
        let fmap = input_size.div_ceil(step);
        for i in 0..fmap {
            for j in 0..fmap {
                for &min_size in min_sizes {
                    priors.push(PriorBox {
                        cx: (j as f32 + 0.5) * step as f32 / size,
                        cy: (i as f32 + 0.5) * step as f32 / size,
                        w: min_size / size,
                        h: min_size / size,
                    });
                }
            }
        }
    }

    priors
}

/// Decode prior-relative regressions into source-image detections.
fn decode(
    loc: &[f32],
    conf: &[f32],
    landms: &[f32],
    priors: &[PriorBox],
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let size = input_size as f32;
    let mut detections = Vec::new();

    for (i, prior) in priors.iter().enumerate() {
        let score = conf.get(i * 2 + 1).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let l = &loc[i * 4..i * 4 + 4];
        let cx = prior.cx + l[0] * CENTER_VARIANCE * prior.w;
        let cy = prior.cy + l[1] * CENTER_VARIANCE * prior.h;
        let w = prior.w * (l[2] * SIZE_VARIANCE).exp();
        let h = prior.h * (l[3] * SIZE_VARIANCE).exp();

        let (x1, y1) = letterbox.unmap((cx - w / 2.0) * size, (cy - h / 2.0) * size);
        let (x2, y2) = letterbox.unmap((cx + w / 2.0) * size, (cy + h / 2.0) * size);

        let off = i * 10;
        let landmarks = (off + 9 < landms.len()).then(|| {
            std::array::from_fn(|k| {
                let lx = prior.cx + landms[off + k * 2] * CENTER_VARIANCE * prior.w;
                let ly = prior.cy + landms[off + k * 2 + 1] * CENTER_VARIANCE * prior.h;
                letterbox.unmap(lx * size, ly * size)
            })
        });

        detections.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_count_640() {
        // (80² + 40² + 20²) cells × 2 sizes
        let priors = generate_priors(640);
        assert_eq!(priors.len(), (6400 + 1600 + 400) * 2);
    }

    #[test]
    fn test_prior_layout() {
        let priors = generate_priors(640);
        assert_eq!(priors[0], PriorBox { cx: 4.0 / 640.0, cy: 4.0 / 640.0, w: 16.0 / 640.0, h: 16.0 / 640.0 });
        assert_eq!(priors[1].w, 32.0 / 640.0);
        assert_eq!(priors[1].cx, priors[0].cx);
        // Third prior moves one column right.
        assert!((priors[2].cx - 12.0 / 640.0).abs() < 1e-7);
        // First prior of the stride-32 level.
        let p = priors[(6400 + 1600) * 2];
        assert!((p.cx - 16.0 / 640.0).abs() < 1e-7);
        assert!((p.w - 256.0 / 640.0).abs() < 1e-7);
    }

    #[test]
    fn test_decode_zero_regression_returns_prior() {
        let priors = vec![PriorBox { cx: 0.5, cy: 0.5, w: 0.25, h: 0.25 }];
        let loc = [0.0f32; 4];
        let conf = [0.1f32, 0.9];
        let landms = [0.0f32; 10];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };

        let dets = decode(&loc, &conf, &landms, &priors, 640, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 240.0).abs() < 1e-3, "x = {}", d.x);
        assert!((d.y - 240.0).abs() < 1e-3, "y = {}", d.y);
        assert!((d.width - 160.0).abs() < 1e-3);
        assert!((d.height - 160.0).abs() < 1e-3);
        let lms = d.landmarks.unwrap();
        assert!((lms[4].0 - 320.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_respects_letterbox_and_threshold() {
        let priors = vec![
            PriorBox { cx: 0.5, cy: 0.5, w: 0.25, h: 0.25 },
            PriorBox { cx: 0.1, cy: 0.1, w: 0.05, h: 0.05 },
        ];
        let loc = [0.0f32; 8];
        let conf = [0.1f32, 0.9, 0.6, 0.4];
        let landms = [0.0f32; 20];
        // 1280x640 source → scale 0.5, 160px vertical padding.
        let letterbox = LetterboxInfo { scale: 0.5, pad_x: 0.0, pad_y: 160.0 };

        let dets = decode(&loc, &conf, &landms, &priors, 640, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].x - 480.0).abs() < 1e-3, "x = {}", dets[0].x);
        assert!((dets[0].y - 160.0).abs() < 1e-3, "y = {}", dets[0].y);
        assert!((dets[0].width - 320.0).abs() < 1e-3);
    }

    #[test]
    fn test_discover_output_indices() {
        let named: Vec<String> = ["landms", "loc", "conf"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&named), (1, 2, 0));

        let numeric: Vec<String> = ["587", "588", "589"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&numeric), (0, 1, 2));
    }
}
