//! Batch orchestration: walk, detect, crop, save, then match and publish.
//!
//! Failures are contained at the smallest unit that owns them. A bad face
//! is skipped, a bad image is recorded in the [`RunReport`] and the walk
//! moves on, and a failed similarity search counts as "no matches". Only
//! configuration problems found before any work starts end a run early.

use crate::config::{PipelineConfig, PUBLISHED_DIR_NAME};
use crate::crop;
use crate::detection::FaceDetectionAdapter;
use crate::detector::FaceDetector;
use crate::search::SimilarityEngine;
use crate::selector;
use crate::similarity::SimilarityAdapter;
use crate::store::{ImageStore, StoreError};
use crate::types::{CroppedFace, MatchResult};
use crate::walk;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Run-fatal errors. Everything else is logged and recorded in the report.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("reference image {0} does not exist")]
    MissingReference(PathBuf),
    #[error("reference image is unreadable: {0}")]
    UnreadableReference(#[source] StoreError),
    #[error("input image {0} does not exist")]
    MissingImage(PathBuf),
    #[error("cannot read directory {path}: {source}")]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("similarity threshold must be a finite number, got {0}")]
    InvalidThreshold(f32),
}

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Decode,
    Detect,
    Crop,
    Save,
    Match,
    Publish,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageFailure {
    pub path: PathBuf,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedMatch {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub distance: f32,
}

/// Summary of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub images_seen: usize,
    /// Images that contributed at least one saved crop.
    pub images_with_faces: usize,
    pub crops_saved: usize,
    /// Every crop written, in save order.
    pub crops: Vec<CroppedFace>,
    pub failures: Vec<ImageFailure>,
    pub matches: Vec<PublishedMatch>,
}

impl RunReport {
    fn fail(&mut self, path: &Path, stage: Stage, reason: impl ToString) {
        self.failures.push(ImageFailure {
            path: path.to_path_buf(),
            stage,
            reason: reason.to_string(),
        });
    }
}

/// Finds the crops most similar to the configured reference image.
pub struct DirectoryPipeline {
    config: PipelineConfig,
    detection: FaceDetectionAdapter,
    similarity: SimilarityAdapter,
    store: ImageStore,
}

impl DirectoryPipeline {
    pub fn new(config: PipelineConfig, detector: Box<dyn FaceDetector>, engine: Box<dyn SimilarityEngine>) -> Self {
        Self {
            config,
            detection: FaceDetectionAdapter::new(detector),
            similarity: SimilarityAdapter::new(engine),
            store: ImageStore::new(),
        }
    }

    /// Single-image mode.
    ///
    /// Crops every face in `image` into `{cropped_root}/{person}/{file}/`,
    /// searches those crops, and copies the best accepted one to
    /// `{cropped_root}/{person}/cropped_{file}`.
    pub fn run_image(&mut self, image: &Path) -> Result<RunReport, PipelineError> {
        self.check_config()?;
        if !image.is_file() {
            return Err(PipelineError::MissingImage(image.to_path_buf()));
        }

        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let person_root = self
            .config
            .cropped_root
            .join(person_name(image.parent().unwrap_or(Path::new("."))));
        let crop_dir = person_root.join(&file_name);

        let mut report = RunReport::default();
        let crops = self.process_image(image, &crop_dir, &mut report);
        if crops.is_empty() {
            return Ok(report);
        }

        let written: HashSet<PathBuf> = crops.into_iter().map(|c| c.path).collect();
        let matches = self.match_corpus(&crop_dir, &written, &mut report);
        if let Some(best) = matches.first() {
            let destination = person_root.join(format!("cropped_{file_name}"));
            self.publish(best, &destination, &mut report);
        }
        Ok(report)
    }

    /// Directory-batch mode.
    ///
    /// Crops every image under `root`, then runs one search over
    /// `{cropped_root}/{person}` and publishes each accepted match into its
    /// `all_detected_faces` directory.
    pub fn run_directory(&mut self, root: &Path) -> Result<RunReport, PipelineError> {
        self.check_config()?;
        std::fs::read_dir(root).map_err(|source| PipelineError::UnreadableRoot {
            path: root.to_path_buf(),
            source,
        })?;

        let person_root = self.config.cropped_root.join(person_name(root));
        let exclusions = Exclusions::new(&self.config);
        let images = walk::list_images(root, &self.config.extensions, |dir| exclusions.is_cropped_root(dir));
        tracing::info!(root = %root.display(), images = images.len(), "processing directory");

        let mut report = RunReport::default();
        let mut written = HashSet::new();
        for image in &images {
            if exclusions.is_reference(image) {
                tracing::debug!(path = %image.display(), "skipping reference image");
                continue;
            }
            let crop_dir = person_root.join(crop_dir_name(root, image));
            written.extend(self.process_image(image, &crop_dir, &mut report).into_iter().map(|c| c.path));
        }

        // All crops are on disk before the corpus is searched.
        if written.is_empty() {
            tracing::info!(root = %root.display(), "no crops to match");
            return Ok(report);
        }

        let matches = self.match_corpus(&person_root, &written, &mut report);
        if matches.is_empty() {
            return Ok(report);
        }

        let publish_dir = person_root.join(PUBLISHED_DIR_NAME);
        if let Err(e) = self.store.ensure_directory(&publish_dir) {
            tracing::error!(error = %e, "cannot create publish directory");
            report.fail(&publish_dir, Stage::Publish, e);
            return Ok(report);
        }
        for m in &matches {
            let destination = publish_dir.join(published_name(&person_root, &m.candidate));
            self.publish(m, &destination, &mut report);
        }

        tracing::info!(
            images = report.images_seen,
            crops = report.crops_saved,
            published = report.matches.len(),
            failures = report.failures.len(),
            "run complete"
        );
        Ok(report)
    }

    fn check_config(&self) -> Result<(), PipelineError> {
        let threshold = self.config.similarity_threshold;
        if !threshold.is_finite() {
            return Err(PipelineError::InvalidThreshold(threshold));
        }
        let reference = &self.config.reference_image;
        if !reference.is_file() {
            return Err(PipelineError::MissingReference(reference.clone()));
        }
        self.store
            .try_load(reference)
            .map_err(PipelineError::UnreadableReference)?;
        Ok(())
    }

    /// Detect, crop and save the faces of one image. Returns the crops written.
    fn process_image(&mut self, path: &Path, crop_dir: &Path, report: &mut RunReport) -> Vec<CroppedFace> {
        report.images_seen += 1;

        let image = match self.store.try_load(path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable image");
                report.fail(path, Stage::Decode, e);
                return Vec::new();
            }
        };

        let faces = match self.detection.detect_in(path, &image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "face detection failed");
                report.fail(path, Stage::Detect, e);
                return Vec::new();
            }
        };
        if faces.is_empty() {
            tracing::info!(path = %path.display(), "no faces detected");
            return Vec::new();
        }

        let mut saved = Vec::new();
        let mut sequence = 0u32;
        let mut failed_stage = Stage::Crop;
        for face in &faces {
            let buffer = match crop::crop(&image, face.bbox) {
                Ok(buffer) => buffer,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping face");
                    continue;
                }
            };

            // Created lazily so images without usable faces leave nothing behind.
            if let Err(e) = self.store.ensure_directory(crop_dir) {
                tracing::error!(error = %e, "cannot create crop directory");
                report.fail(path, Stage::Save, e);
                return Vec::new();
            }

            let out = crop_dir.join(format!("{}.png", sequence + 1));
            if self.store.save(&out, &buffer) {
                sequence += 1;
                tracing::debug!(
                    path = %out.display(),
                    sequence,
                    width = buffer.width(),
                    height = buffer.height(),
                    confidence = face.confidence,
                    "saved face crop"
                );
                saved.push(CroppedFace {
                    sequence,
                    path: out,
                    width: buffer.width(),
                    height: buffer.height(),
                    confidence: face.confidence,
                });
            } else {
                failed_stage = Stage::Save;
            }
        }

        if saved.is_empty() {
            tracing::warn!(path = %path.display(), faces = faces.len(), "no faces saved");
            report.fail(path, failed_stage, "no faces saved");
        } else {
            tracing::info!(path = %path.display(), faces = faces.len(), crops = saved.len(), "cropped faces");
            report.images_with_faces += 1;
            report.crops_saved += saved.len();
            report.crops.extend(saved.iter().cloned());
        }
        saved
    }

    /// Search `corpus` for the reference face and select the accepted matches.
    ///
    /// Only crops in `written` are eligible; files left over from earlier runs
    /// are ignored.
    fn match_corpus(&mut self, corpus: &Path, written: &HashSet<PathBuf>, report: &mut RunReport) -> Vec<MatchResult> {
        let mut table = match self.similarity.find(&self.config.reference_image, corpus) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, "treating failed search as no matches");
                report.fail(corpus, Stage::Match, e);
                return Vec::new();
            }
        };

        let total = table.len();
        table.retain(|candidate| written.contains(candidate));
        if table.len() != total {
            tracing::debug!(ignored = total - table.len(), "ignoring crops from earlier runs");
        }

        let matches = selector::select(&table, self.config.similarity_threshold, self.config.grouping);
        if matches.is_empty() {
            tracing::info!(corpus = %corpus.display(), "no similar faces found");
        } else {
            tracing::info!(corpus = %corpus.display(), matches = matches.len(), "similar faces found");
        }
        matches
    }

    fn publish(&self, m: &MatchResult, destination: &Path, report: &mut RunReport) {
        let Some(image) = self.store.load(&m.candidate) else {
            report.fail(&m.candidate, Stage::Publish, "matched crop could not be loaded");
            return;
        };

        match self.store.try_save(destination, &image) {
            Ok(()) => {
                tracing::info!(
                    source = %m.candidate.display(),
                    destination = %destination.display(),
                    distance = m.distance,
                    "published match"
                );
                report.matches.push(PublishedMatch {
                    source: m.candidate.clone(),
                    destination: destination.to_path_buf(),
                    distance: m.distance,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to publish match");
                report.fail(&m.candidate, Stage::Publish, e);
            }
        }
    }
}

/// Paths the directory walk must not treat as candidates.
struct Exclusions {
    cropped_root: Option<PathBuf>,
    reference: Option<PathBuf>,
}

impl Exclusions {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            cropped_root: std::fs::canonicalize(&config.cropped_root).ok(),
            reference: std::fs::canonicalize(&config.reference_image).ok(),
        }
    }

    fn is_cropped_root(&self, dir: &Path) -> bool {
        self.cropped_root.is_some() && std::fs::canonicalize(dir).ok() == self.cropped_root
    }

    fn is_reference(&self, file: &Path) -> bool {
        self.reference.is_some() && std::fs::canonicalize(file).ok() == self.reference
    }
}

/// Name of the directory holding `dir`'s images, used to group crops by person.
fn person_name(dir: &Path) -> String {
    let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
    std::fs::canonicalize(dir)
        .unwrap_or_else(|_| dir.to_path_buf())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

/// Crop directory for `image`, relative to the person's crop root. Nested
/// source directories are kept so equal file names never share a directory.
fn crop_dir_name(root: &Path, image: &Path) -> PathBuf {
    image
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| image.file_name().map(PathBuf::from).unwrap_or_default())
}

/// Flat file name for a published crop: its path under the person's crop root
/// joined with `-`, e.g. `a.jpg/1.png` becomes `a.jpg-1.png`.
///
/// The source file keeps its extension so `a.jpg` and `a.png` in the same
/// directory publish under different names.
fn published_name(person_root: &Path, candidate: &Path) -> String {
    candidate
        .strip_prefix(person_root)
        .unwrap_or(candidate)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("-")
}
