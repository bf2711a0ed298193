use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Integer face rectangle in source-image pixel space, origin top-left.
///
/// Detectors may report boxes that hang off the image edge; use
/// [`clamp`](Self::clamp) before slicing pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Clip the box to a `width` × `height` image.
    ///
    /// The result is the intersection of the box with the image rectangle, so
    /// the far edges stay where the detector put them. Returns `None` when
    /// nothing of the box remains inside the image.
    pub fn clamp(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let (width, height) = (i64::from(width), i64::from(height));
        let x0 = i64::from(self.x).max(0);
        let y0 = i64::from(self.y).max(0);
        let x1 = (i64::from(self.x) + i64::from(self.w)).min(width);
        let y1 = (i64::from(self.y) + i64::from(self.h)).min(height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        // Every value is bounded by the u32 image size and by the i32 inputs.
        Some(BoundingBox {
            x: x0 as i32,
            y: y0 as i32,
            w: (x1 - x0) as i32,
            h: (y1 - y0) as i32,
        })
    }

    pub fn area(&self) -> i64 {
        i64::from(self.w.max(0)) * i64::from(self.h.max(0))
    }
}

/// Raw detector output in floating-point pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl Detection {
    /// Round to the integer pixel grid. No clamping is applied here.
    pub fn to_bounding_box(&self) -> BoundingBox {
        BoundingBox {
            x: self.x.round() as i32,
            y: self.y.round() as i32,
            w: self.width.round() as i32,
            h: self.height.round() as i32,
        }
    }
}

/// A detected face tied to the image it was found in.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub source: PathBuf,
}

/// A face crop that has been written to disk.
#[derive(Debug, Clone, Serialize)]
pub struct CroppedFace {
    /// 1-based, incremented only after a successful save.
    pub sequence: u32,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Detector confidence for the face this crop came from.
    pub confidence: f32,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, floored at zero.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).max(0.0)
    }
}

/// One ranked candidate returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityRow {
    pub candidate: PathBuf,
    /// Lower = more similar. Never negative.
    pub distance: f32,
    /// Cut-off the engine applied when producing this row.
    pub threshold: f32,
    /// Face region inside the candidate image, if the engine located one.
    pub target: Option<BoundingBox>,
}

/// Flat similarity table, always ordered ascending by distance.
///
/// Rows with equal distance keep the order the engine reported them in.
#[derive(Debug, Clone, Default)]
pub struct SimilarityTable {
    rows: Vec<SimilarityRow>,
}

impl SimilarityTable {
    pub fn from_rows(mut rows: Vec<SimilarityRow>) -> Self {
        // Stable: ties keep their ranked order.
        rows.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Self { rows }
    }

    pub fn rows(&self) -> &[SimilarityRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep only rows whose candidate satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&Path) -> bool) {
        self.rows.retain(|row| keep(&row.candidate));
    }

    pub fn into_rows(self) -> Vec<SimilarityRow> {
        self.rows
    }
}

/// How accepted matches are collapsed before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Grouping {
    /// One result per crop file.
    #[default]
    PerImage,
    /// One result per crop directory, i.e. per source photo.
    PerDirectory,
}

impl Grouping {
    /// Grouping key for a candidate path.
    pub fn key<'a>(&self, candidate: &'a Path) -> &'a Path {
        match self {
            Grouping::PerImage => candidate,
            Grouping::PerDirectory => candidate.parent().unwrap_or(candidate),
        }
    }
}

impl std::str::FromStr for Grouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "per-image" | "image" => Ok(Grouping::PerImage),
            "per-directory" | "directory" | "dir" => Ok(Grouping::PerDirectory),
            other => Err(format!("unknown grouping: {other} (expected per-image or per-directory)")),
        }
    }
}

/// A similarity row that passed threshold filtering and deduplication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub candidate: PathBuf,
    pub distance: f32,
    pub threshold: f32,
}

impl From<SimilarityRow> for MatchResult {
    fn from(row: SimilarityRow) -> Self {
        Self {
            candidate: row.candidate,
            distance: row.distance,
            threshold: row.threshold,
        }
    }
}
