//! Similarity search over a directory of face crops.
//!
//! [`SimilarityEngine`] is the seam the pipeline searches through.
//! [`EmbeddingSearch`] implements it with the detector + ArcFace recognizer
//! and a [`RepresentationIndex`] cached inside the corpus directory.

use crate::detector::{DetectorBackend, DetectorError, FaceDetector};
use crate::index::{CorpusFile, RepresentationIndex};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_FILE};
use crate::store::{ImageStore, StoreError};
use crate::types::{BoundingBox, Embedding, SimilarityRow};
use crate::walk;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cosine-distance cut applied by the engine before ranking.
pub const DEFAULT_ENGINE_THRESHOLD: f32 = 0.68;

const RECOGNITION_MODEL_NAME: &str = "arcface";

#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Query(#[from] StoreError),
    #[error("no face detected in query image {0}")]
    NoQueryFace(PathBuf),
    #[error("corpus directory {path} is unreadable: {source}")]
    CorpusUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no indexable face crops in {0}")]
    EmptyCorpus(PathBuf),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Raw engine result: either a single ranked table, or one table per face
/// found in the query image.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    Table(Vec<SimilarityRow>),
    Tables(Vec<Vec<SimilarityRow>>),
}

/// Ranks the images in a corpus directory by similarity to a query image.
pub trait SimilarityEngine {
    fn find(&mut self, query: &Path, corpus: &Path) -> Result<EngineOutput, SearchError>;
}

/// Tuning for [`EmbeddingSearch`].
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub engine_threshold: f32,
    /// Directory names inside the corpus that are never indexed.
    pub skip_dirs: Vec<String>,
    pub extensions: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            engine_threshold: DEFAULT_ENGINE_THRESHOLD,
            skip_dirs: Vec::new(),
            extensions: walk::default_extensions(),
        }
    }
}

/// Embedding-based search engine with a persisted per-corpus index.
pub struct EmbeddingSearch {
    detector: Box<dyn FaceDetector>,
    recognizer: FaceRecognizer,
    backend: DetectorBackend,
    options: SearchOptions,
    store: ImageStore,
}

impl EmbeddingSearch {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        recognizer: FaceRecognizer,
        backend: DetectorBackend,
        options: SearchOptions,
    ) -> Self {
        Self {
            detector,
            recognizer,
            backend,
            options,
            store: ImageStore::new(),
        }
    }

    /// Load the detector and ArcFace models from `model_dir`.
    pub fn load(backend: DetectorBackend, model_dir: &Path, options: SearchOptions) -> Result<Self, SearchError> {
        let detector = backend.load(model_dir)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE).to_string_lossy())?;
        Ok(Self::new(detector, recognizer, backend, options))
    }

    /// One embedding per face detected in the query image.
    fn embed_query(&mut self, query: &Path) -> Result<Vec<Embedding>, SearchError> {
        let image = self.store.try_load(query)?;
        let faces = self.detector.detect(&image)?;
        if faces.is_empty() {
            return Err(SearchError::NoQueryFace(query.to_path_buf()));
        }
        tracing::debug!(path = %query.display(), faces = faces.len(), "embedding query faces");

        faces
            .iter()
            .map(|face| self.recognizer.extract(&image, face).map_err(SearchError::from))
            .collect()
    }

    /// Embed a corpus crop. Uses the most confident detected face; a crop the
    /// detector finds nothing in is embedded whole.
    fn embed_candidate(&mut self, path: &Path) -> Option<(Embedding, Option<BoundingBox>)> {
        let image = self.store.load(path)?;
        let face = match self.detector.detect(&image) {
            Ok(faces) => faces.into_iter().next(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "detector failed on corpus image");
                None
            }
        };

        let result = match &face {
            Some(face) => self
                .recognizer
                .extract(&image, face)
                .map(|e| (e, face.to_bounding_box().clamp(image.width(), image.height()))),
            None => self
                .recognizer
                .extract_whole(&image)
                .map(|e| (e, Some(BoundingBox::new(0, 0, image.width() as i32, image.height() as i32)))),
        };

        match result {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to embed corpus image");
                None
            }
        }
    }

    fn corpus_files(&self, corpus: &Path) -> Result<Vec<CorpusFile>, SearchError> {
        std::fs::read_dir(corpus).map_err(|source| SearchError::CorpusUnreadable {
            path: corpus.to_path_buf(),
            source,
        })?;

        let skip = &self.options.skip_dirs;
        let images = walk::list_images(corpus, &self.options.extensions, |dir| {
            dir.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| skip.iter().any(|s| s == n))
        });

        Ok(images
            .iter()
            .filter_map(|path| match CorpusFile::read(corpus, path) {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable corpus file");
                    None
                }
            })
            .collect())
    }

    /// Load, reconcile, and (if changed) persist the corpus index.
    fn refresh_index(&mut self, corpus: &Path) -> Result<RepresentationIndex, SearchError> {
        let files = self.corpus_files(corpus)?;
        let index_path = corpus.join(RepresentationIndex::file_name(RECOGNITION_MODEL_NAME, self.backend.name()));
        let mut index = RepresentationIndex::open(&index_path, RECOGNITION_MODEL_NAME, self.backend.name());

        let stats = index.reconcile(&files, |file| self.embed_candidate(&file.path));
        tracing::info!(
            corpus = %corpus.display(),
            representations = index.entries.len(),
            reused = stats.reused,
            embedded = stats.embedded,
            removed = stats.removed,
            skipped = stats.skipped,
            "corpus index ready"
        );

        if stats.changed() {
            if let Err(e) = index.write(&index_path) {
                tracing::warn!(error = %e, "could not persist representation index");
            }
        }

        if index.entries.is_empty() {
            return Err(SearchError::EmptyCorpus(corpus.to_path_buf()));
        }
        Ok(index)
    }
}

impl SimilarityEngine for EmbeddingSearch {
    fn find(&mut self, query: &Path, corpus: &Path) -> Result<EngineOutput, SearchError> {
        let index = self.refresh_index(corpus)?;
        let queries = self.embed_query(query)?;

        Ok(EngineOutput::Tables(
            queries
                .iter()
                .map(|q| rank(q, &index, corpus, self.options.engine_threshold))
                .collect(),
        ))
    }
}

/// Rank every index entry against `query`, ascending by cosine distance,
/// dropping entries above `threshold`.
pub fn rank(query: &Embedding, index: &RepresentationIndex, corpus: &Path, threshold: f32) -> Vec<SimilarityRow> {
    let mut rows: Vec<SimilarityRow> = index
        .entries
        .iter()
        .map(|rep| SimilarityRow {
            candidate: rep.path.split('/').fold(corpus.to_path_buf(), |p, c| p.join(c)),
            distance: query.cosine_distance(&rep.embedding),
            threshold,
            target: rep.target,
        })
        .filter(|row| row.distance <= threshold)
        .collect();

    rows.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Representation;

    fn rep(path: &str, values: Vec<f32>) -> Representation {
        Representation {
            path: path.to_string(),
            hash: String::new(),
            embedding: Embedding { values, model_version: None },
            target: None,
        }
    }

    #[test]
    fn test_rank_orders_and_filters() {
        let mut index = RepresentationIndex::new("arcface", "retinaface");
        index.entries = vec![
            rep("a.jpg/1.png", vec![0.0, 1.0]),  // distance 1.0
            rep("a.jpg/2.png", vec![1.0, 0.1]),  // ~0.005
            rep("b.jpg/1.png", vec![1.0, 0.6]),  // ~0.14
        ];
        let query = Embedding { values: vec![1.0, 0.0], model_version: None };
        let corpus = Path::new("/out/alice");

        let rows = rank(&query, &index, corpus, DEFAULT_ENGINE_THRESHOLD);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].candidate, corpus.join("a.jpg").join("2.png"));
        assert_eq!(rows[1].candidate, corpus.join("b.jpg").join("1.png"));
        assert!(rows[0].distance < rows[1].distance);
        assert!(rows.iter().all(|r| r.threshold == DEFAULT_ENGINE_THRESHOLD));
    }

    #[test]
    fn test_rank_empty_index() {
        let index = RepresentationIndex::new("arcface", "retinaface");
        let query = Embedding { values: vec![1.0], model_version: None };
        assert!(rank(&query, &index, Path::new("/c"), 0.68).is_empty());
    }
}
