//! Recursive image discovery.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions recognized as images when none are configured.
pub const DEFAULT_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

pub fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

/// Case-insensitive extension check. `extensions` are given without the dot.
pub fn has_image_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

/// List image files under `root`, sorted for a stable processing order.
///
/// Directories for which `prune` returns true are not descended into.
/// Unreadable entries are logged and skipped.
pub fn list_images(root: &Path, extensions: &[String], prune: impl Fn(&Path) -> bool) -> Vec<PathBuf> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !(entry.file_type().is_dir() && prune(entry.path())));

    let mut images = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if entry.file_type().is_file() && has_image_extension(entry.path(), extensions) {
            images.push(entry.into_path());
        }
    }

    images.sort();
    images
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_has_image_extension_case_insensitive() {
        let exts = default_extensions();
        assert!(has_image_extension(Path::new("a/B.JPG"), &exts));
        assert!(has_image_extension(Path::new("a/b.Jpeg"), &exts));
        assert!(!has_image_extension(Path::new("a/b.txt"), &exts));
        assert!(!has_image_extension(Path::new("a/jpg"), &exts));
        assert!(!has_image_extension(Path::new("a/representations.json"), &exts));
    }

    #[test]
    fn test_list_images_recurses_sorted_and_prunes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::create_dir_all(root.join("skip.me")).unwrap();
        for f in ["b.png", "a.JPG", "notes.txt", "sub/c.jpeg", "sub/deeper/d.webp", "skip.me/e.png"] {
            fs::write(root.join(f), b"").unwrap();
        }

        let found = list_images(root, &default_extensions(), |p| {
            p.file_name().is_some_and(|n| n == "skip.me")
        });
        let rel: Vec<_> = found
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rel, ["a.JPG", "b.png", "sub/c.jpeg", "sub/deeper/d.webp"]);
    }
}
