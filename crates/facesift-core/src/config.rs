use crate::detector::DetectorBackend;
use crate::selector::DEFAULT_SIMILARITY_THRESHOLD;
use crate::types::Grouping;
use crate::walk;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Directory (under a person's crop directory) that batch runs publish into.
pub const PUBLISHED_DIR_NAME: &str = "all_detected_faces";

/// Default root for face crops, relative to the working directory.
pub const DEFAULT_CROPPED_ROOT: &str = "cropped-face-db";

/// Settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Matches must have a distance strictly below this.
    pub similarity_threshold: f32,
    pub grouping: Grouping,
    /// Image every candidate face is compared against. Required.
    pub reference_image: PathBuf,
    pub detector_backend: DetectorBackend,
    pub cropped_root: PathBuf,
    /// Image extensions to walk, without the dot. Case-insensitive.
    pub extensions: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            grouping: Grouping::default(),
            reference_image: PathBuf::new(),
            detector_backend: DetectorBackend::default(),
            cropped_root: PathBuf::from(DEFAULT_CROPPED_ROOT),
            extensions: walk::default_extensions(),
        }
    }
}

impl PipelineConfig {
    pub fn new(reference_image: impl Into<PathBuf>) -> Self {
        Self {
            reference_image: reference_image.into(),
            ..Self::default()
        }
    }
}

/// Default model directory: `$FACESIFT_MODEL_DIR`, else
/// `$XDG_DATA_HOME/facesift/models`, else `~/.local/share/facesift/models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACESIFT_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facesift/models")
}
