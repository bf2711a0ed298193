//! facesift-core: find the faces most similar to a reference face.
//!
//! Walks a photo directory, crops every detected face to disk, searches the
//! crops for the reference face and publishes the best matches. Detection
//! (RetinaFace or SCRFD) and recognition (ArcFace) run on ONNX Runtime.

pub mod alignment;
pub mod config;
pub mod crop;
pub mod detection;
pub mod detector;
pub mod index;
pub mod pipeline;
pub mod recognizer;
pub mod search;
pub mod selector;
pub mod similarity;
pub mod store;
pub mod types;
pub mod walk;

pub use config::{default_model_dir, PipelineConfig, PUBLISHED_DIR_NAME};
pub use detector::{DetectorBackend, FaceDetector};
pub use pipeline::{DirectoryPipeline, PipelineError, RunReport, Stage};
pub use search::{EmbeddingSearch, EngineOutput, SearchError, SearchOptions, SimilarityEngine};
pub use types::{BoundingBox, Detection, Embedding, Grouping, MatchResult, SimilarityRow, SimilarityTable};
