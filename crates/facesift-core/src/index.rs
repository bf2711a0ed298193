//! Persisted face representations for a crop corpus.
//!
//! The index lives inside the corpus directory and is keyed by each file's
//! path relative to the corpus plus a SHA-256 of its bytes, so unchanged crops
//! are not re-embedded across runs. Missing or unreadable index files are
//! rebuilt from scratch.

use crate::types::{BoundingBox, Embedding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("index {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One embedded corpus file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Representation {
    /// Path relative to the corpus root, `/`-separated.
    pub path: String,
    pub hash: String,
    pub embedding: Embedding,
    pub target: Option<BoundingBox>,
}

/// A corpus file as seen on disk during reconciliation.
#[derive(Debug, Clone)]
pub struct CorpusFile {
    pub relative: String,
    pub path: PathBuf,
    pub hash: String,
}

impl CorpusFile {
    /// Describe `path` (inside `root`) and hash its contents.
    pub fn read(root: &Path, path: &Path) -> Result<Self, IndexError> {
        let bytes = std::fs::read(path).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            relative: relative_key(root, path),
            path: path.to_path_buf(),
            hash: format!("{:x}", Sha256::digest(&bytes)),
        })
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub reused: usize,
    pub embedded: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl ReconcileStats {
    pub fn changed(&self) -> bool {
        self.embedded > 0 || self.removed > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepresentationIndex {
    pub version: u32,
    pub model: String,
    pub detector: String,
    pub built_at: DateTime<Utc>,
    pub entries: Vec<Representation>,
}

impl RepresentationIndex {
    pub fn new(model: &str, detector: &str) -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            model: model.to_string(),
            detector: detector.to_string(),
            built_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    /// Index file name for a model/detector pair.
    pub fn file_name(model: &str, detector: &str) -> String {
        format!("representations_{model}_{detector}.json")
    }

    /// Read an index file. `Ok(None)` if it does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>, IndexError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(IndexError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| IndexError::Malformed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Load the index for `model`/`detector`, or start an empty one when the
    /// file is missing, unreadable, or was built by something else.
    pub fn open(path: &Path, model: &str, detector: &str) -> Self {
        match Self::read(path) {
            Ok(Some(index))
                if index.version == INDEX_FORMAT_VERSION
                    && index.model == model
                    && index.detector == detector =>
            {
                tracing::debug!(path = %path.display(), entries = index.entries.len(), "loaded representation index");
                index
            }
            Ok(Some(_)) => {
                tracing::warn!(path = %path.display(), "representation index is for a different model, rebuilding");
                Self::new(model, detector)
            }
            Ok(None) => Self::new(model, detector),
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable representation index");
                Self::new(model, detector)
            }
        }
    }

    /// Write the index atomically (temp file + rename).
    pub fn write(&self, path: &Path) -> Result<(), IndexError> {
        let io_err = |source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string(self).map_err(|source| IndexError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    /// Bring the index in line with `files`.
    ///
    /// Entries whose path and hash still match are kept. New or modified files
    /// are passed to `embed`; a `None` from `embed` leaves the file out of the
    /// index. Entries for files no longer present are dropped.
    pub fn reconcile<F>(&mut self, files: &[CorpusFile], mut embed: F) -> ReconcileStats
    where
        F: FnMut(&CorpusFile) -> Option<(Embedding, Option<BoundingBox>)>,
    {
        let mut previous: HashMap<String, Representation> = self
            .entries
            .drain(..)
            .map(|r| (r.path.clone(), r))
            .collect();
        let mut stats = ReconcileStats::default();

        for file in files {
            match previous.remove(&file.relative) {
                Some(rep) if rep.hash == file.hash => {
                    stats.reused += 1;
                    self.entries.push(rep);
                    continue;
                }
                // Modified since last run: the old entry is replaced below.
                Some(_) => stats.removed += 1,
                None => {}
            }

            match embed(file) {
                Some((embedding, target)) => {
                    stats.embedded += 1;
                    self.entries.push(Representation {
                        path: file.relative.clone(),
                        hash: file.hash.clone(),
                        embedding,
                        target,
                    });
                }
                None => stats.skipped += 1,
            }
        }

        stats.removed += previous.len();
        if stats.changed() {
            self.built_at = Utc::now();
        }
        stats
    }
}

/// `/`-separated path of `path` relative to `root`.
pub fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: f32) -> Embedding {
        Embedding { values: vec![v, 1.0 - v], model_version: None }
    }

    fn file(rel: &str, hash: &str) -> CorpusFile {
        CorpusFile {
            relative: rel.to_string(),
            path: PathBuf::from("/corpus").join(rel),
            hash: hash.to_string(),
        }
    }

    #[test]
    fn test_reconcile_reuses_unchanged_entries() {
        let mut index = RepresentationIndex::new("arcface", "retinaface");
        let files = vec![file("a.jpg/1.png", "h1"), file("b.jpg/1.png", "h2")];

        let first = index.reconcile(&files, |_| Some((emb(0.5), None)));
        assert_eq!(first, ReconcileStats { reused: 0, embedded: 2, removed: 0, skipped: 0 });

        let mut calls = 0;
        let second = index.reconcile(&files, |_| {
            calls += 1;
            Some((emb(0.1), None))
        });
        assert_eq!(calls, 0);
        assert!(!second.changed());
        assert_eq!(second.reused, 2);
    }

    #[test]
    fn test_reconcile_refreshes_modified_and_drops_removed() {
        let mut index = RepresentationIndex::new("arcface", "retinaface");
        index.reconcile(&[file("a", "h1"), file("b", "h2")], |_| Some((emb(0.5), None)));

        let stats = index.reconcile(&[file("a", "changed"), file("c", "h3")], |f| {
            (f.relative != "c").then(|| (emb(0.9), None))
        });
        assert_eq!(stats.embedded, 1);
        assert_eq!(stats.removed, 2); // stale "a" and vanished "b"
        assert_eq!(stats.skipped, 1);
        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.entries[0].hash, "changed");
    }

    #[test]
    fn test_write_then_open_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(RepresentationIndex::file_name("arcface", "scrfd"));

        let mut index = RepresentationIndex::new("arcface", "scrfd");
        index.reconcile(&[file("x/1.png", "h")], |_| Some((emb(0.3), Some(BoundingBox::new(1, 2, 3, 4)))));
        index.write(&path).unwrap();

        let reopened = RepresentationIndex::open(&path, "arcface", "scrfd");
        assert_eq!(reopened.entries.len(), 1);
        assert_eq!(reopened.entries[0].target, Some(BoundingBox::new(1, 2, 3, 4)));

        // A different detector does not reuse the entries.
        assert!(RepresentationIndex::open(&path, "arcface", "retinaface").entries.is_empty());
    }

    #[test]
    fn test_open_corrupt_index_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("representations_arcface_scrfd.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(RepresentationIndex::read(&path), Err(IndexError::Malformed { .. })));
        assert!(RepresentationIndex::open(&path, "arcface", "scrfd").entries.is_empty());
    }

    #[test]
    fn test_corpus_file_hash_and_key() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a.jpg");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("1.png");
        std::fs::write(&path, b"abc").unwrap();

        let f = CorpusFile::read(tmp.path(), &path).unwrap();
        assert_eq!(f.relative, "a.jpg/1.png");
        assert_eq!(
            f.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
