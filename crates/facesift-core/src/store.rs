//! Image load/save and output directory management.
//!
//! Failures here never abort a run: the `try_*` methods report them as
//! [`StoreError`], and the plain methods log and degrade to `None`/`false`.

use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to save image {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Filesystem access for image buffers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageStore;

impl ImageStore {
    pub fn new() -> Self {
        Self
    }

    /// Decode an image file into 8-bit RGB.
    pub fn try_load(&self, path: &Path) -> Result<RgbImage, StoreError> {
        image::open(path)
            .map(|img| img.to_rgb8())
            .map_err(|source| StoreError::Decode {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Load an image, logging and returning `None` on failure.
    pub fn load(&self, path: &Path) -> Option<RgbImage> {
        match self.try_load(path) {
            Ok(img) => Some(img),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load image");
                None
            }
        }
    }

    /// Encode an image; the format follows the file extension.
    pub fn try_save(&self, path: &Path, image: &RgbImage) -> Result<(), StoreError> {
        image.save(path).map_err(|source| StoreError::Save {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save an image, logging the outcome. Returns whether the file was written.
    pub fn save(&self, path: &Path, image: &RgbImage) -> bool {
        match self.try_save(path, image) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "saved image");
                true
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to save image");
                false
            }
        }
    }

    /// Create `path` and its parents if missing. Succeeds if it already exists,
    /// including when another worker creates it concurrently.
    pub fn ensure_directory(&self, path: &Path) -> Result<(), StoreError> {
        if path.is_dir() {
            return Ok(());
        }
        tracing::info!(path = %path.display(), "directory did not exist, creating");
        std::fs::create_dir_all(path).map_err(|source| StoreError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
    }
}
