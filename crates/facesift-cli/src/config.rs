use anyhow::{bail, Context, Result};
use clap::Args;
use facesift_core::search::DEFAULT_ENGINE_THRESHOLD;
use facesift_core::{default_model_dir, DetectorBackend, Grouping, PipelineConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Flags that override the config file and environment.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Reference face image every candidate is compared against
    #[arg(short, long, global = true, value_name = "IMAGE")]
    pub reference: Option<PathBuf>,

    /// Accept matches with a distance strictly below this (default 0.6)
    #[arg(short, long, global = true)]
    pub threshold: Option<f32>,

    /// Collapse matches per crop (per-image) or per source photo (per-directory)
    #[arg(short, long, global = true)]
    pub grouping: Option<Grouping>,

    /// Face detector: retinaface or scrfd
    #[arg(short, long, global = true)]
    pub detector: Option<DetectorBackend>,

    /// Root directory for face crops (default cropped-face-db)
    #[arg(long, global = true, value_name = "DIR")]
    pub cropped_root: Option<PathBuf>,

    /// Directory holding the ONNX models
    #[arg(long, global = true, value_name = "DIR")]
    pub model_dir: Option<PathBuf>,

    /// Cosine distance cut applied by the search engine (default 0.68)
    #[arg(long, global = true)]
    pub engine_threshold: Option<f32>,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// Contents of a `--config` TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    similarity_threshold: Option<f32>,
    grouping: Option<Grouping>,
    reference_image: Option<PathBuf>,
    detector_backend: Option<String>,
    cropped_root: Option<PathBuf>,
    extensions: Option<Vec<String>>,
    model_dir: Option<PathBuf>,
    engine_threshold: Option<f32>,
    log_file: Option<PathBuf>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug)]
pub struct Settings {
    pub pipeline: PipelineConfig,
    pub model_dir: PathBuf,
    pub engine_threshold: f32,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    /// Layer defaults, the config file, `FACESIFT_*` variables (read through
    /// `env`) and flags, in increasing precedence.
    pub fn resolve(flags: &Overrides, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Settings {
            pipeline: PipelineConfig::default(),
            model_dir: PathBuf::new(),
            engine_threshold: DEFAULT_ENGINE_THRESHOLD,
            log_file: None,
        };

        if let Some(path) = &flags.config {
            settings.apply_file(load_file(path)?)?;
        }
        settings.apply_env(&env)?;
        settings.apply_flags(flags);

        if settings.model_dir.as_os_str().is_empty() {
            settings.model_dir = default_model_dir();
        }
        if settings.pipeline.reference_image.as_os_str().is_empty() {
            bail!("no reference image: pass --reference or set FACESIFT_REFERENCE_IMAGE");
        }
        check_threshold("similarity threshold", settings.pipeline.similarity_threshold)?;
        check_threshold("engine threshold", settings.engine_threshold)?;
        Ok(settings)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        let p = &mut self.pipeline;
        if let Some(v) = file.similarity_threshold {
            p.similarity_threshold = v;
        }
        if let Some(v) = file.grouping {
            p.grouping = v;
        }
        if let Some(v) = file.reference_image {
            p.reference_image = v;
        }
        if let Some(v) = file.detector_backend {
            p.detector_backend = parse_backend(&v)?;
        }
        if let Some(v) = file.cropped_root {
            p.cropped_root = v;
        }
        if let Some(v) = file.extensions {
            p.extensions = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.engine_threshold {
            self.engine_threshold = v;
        }
        if file.log_file.is_some() {
            self.log_file = file.log_file;
        }
        Ok(())
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<()> {
        let p = &mut self.pipeline;
        if let Some(v) = env_parse(env, "FACESIFT_SIMILARITY_THRESHOLD")? {
            p.similarity_threshold = v;
        }
        if let Some(v) = env_parse(env, "FACESIFT_GROUPING")? {
            p.grouping = v;
        }
        if let Some(v) = env_parse(env, "FACESIFT_DETECTOR_BACKEND")? {
            p.detector_backend = v;
        }
        if let Some(v) = env_parse(env, "FACESIFT_ENGINE_THRESHOLD")? {
            self.engine_threshold = v;
        }
        if let Some(v) = env("FACESIFT_REFERENCE_IMAGE") {
            p.reference_image = PathBuf::from(v);
        }
        if let Some(v) = env("FACESIFT_CROPPED_ROOT") {
            p.cropped_root = PathBuf::from(v);
        }
        if let Some(v) = env("FACESIFT_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACESIFT_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    fn apply_flags(&mut self, flags: &Overrides) {
        let p = &mut self.pipeline;
        if let Some(v) = flags.threshold {
            p.similarity_threshold = v;
        }
        if let Some(v) = flags.grouping {
            p.grouping = v;
        }
        if let Some(v) = flags.detector {
            p.detector_backend = v;
        }
        if let Some(v) = &flags.reference {
            p.reference_image = v.clone();
        }
        if let Some(v) = &flags.cropped_root {
            p.cropped_root = v.clone();
        }
        if let Some(v) = &flags.model_dir {
            self.model_dir = v.clone();
        }
        if let Some(v) = flags.engine_threshold {
            self.engine_threshold = v;
        }
        if let Some(v) = &flags.log_file {
            self.log_file = Some(v.clone());
        }
    }
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

/// Distance cuts must be finite and non-negative.
fn check_threshold(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        bail!("{name} must be a non-negative number, got {value}");
    }
    Ok(())
}

fn parse_backend(value: &str) -> Result<DetectorBackend> {
    DetectorBackend::from_str(value).map_err(anyhow::Error::msg)
}

/// Parse an environment variable, naming it in the error if the value is bad.
fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn with_reference() -> Overrides {
        Overrides {
            reference: Some(PathBuf::from("ref.jpg")),
            ..Overrides::default()
        }
    }

    #[test]
    fn test_defaults() {
        let s = Settings::resolve(&with_reference(), no_env).unwrap();
        assert_eq!(s.pipeline.similarity_threshold, 0.6);
        assert_eq!(s.pipeline.grouping, Grouping::PerImage);
        assert_eq!(s.pipeline.detector_backend, DetectorBackend::RetinaFace);
        assert_eq!(s.pipeline.cropped_root, PathBuf::from("cropped-face-db"));
        assert_eq!(s.engine_threshold, DEFAULT_ENGINE_THRESHOLD);
        assert!(!s.model_dir.as_os_str().is_empty());
        assert!(s.log_file.is_none());
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        let err = Settings::resolve(&Overrides::default(), no_env).unwrap_err();
        assert!(err.to_string().contains("reference"));
    }

    #[test]
    fn test_file_then_env_then_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("facesift.toml");
        std::fs::write(
            &path,
            r#"
similarity_threshold = 0.5
grouping = "per-directory"
reference_image = "file-ref.jpg"
detector_backend = "scrfd"
cropped_root = "crops"
model_dir = "/models/file"
engine_threshold = 0.7
"#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = [
            ("FACESIFT_SIMILARITY_THRESHOLD", "0.45"),
            ("FACESIFT_MODEL_DIR", "/models/env"),
        ]
        .into_iter()
        .collect();
        let flags = Overrides {
            config: Some(path),
            threshold: Some(0.4),
            ..Overrides::default()
        };

        let s = Settings::resolve(&flags, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.pipeline.similarity_threshold, 0.4);
        assert_eq!(s.model_dir, PathBuf::from("/models/env"));
        assert_eq!(s.pipeline.grouping, Grouping::PerDirectory);
        assert_eq!(s.pipeline.detector_backend, DetectorBackend::Scrfd);
        assert_eq!(s.pipeline.reference_image, PathBuf::from("file-ref.jpg"));
        assert_eq!(s.pipeline.cropped_root, PathBuf::from("crops"));
        assert_eq!(s.engine_threshold, 0.7);
    }

    #[test]
    fn test_unavailable_backend_in_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("facesift.toml");
        std::fs::write(&path, "detector_backend = \"opencv\"\n").unwrap();
        let flags = Overrides {
            config: Some(path),
            ..with_reference()
        };
        let err = Settings::resolve(&flags, no_env).unwrap_err();
        assert!(err.to_string().contains("not available"), "{err}");
    }

    #[test]
    fn test_unknown_key_in_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("facesift.toml");
        std::fs::write(&path, "treshold = 0.5\n").unwrap();
        let flags = Overrides {
            config: Some(path),
            ..with_reference()
        };
        assert!(Settings::resolve(&flags, no_env).is_err());
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let err = Settings::resolve(&with_reference(), |k| {
            (k == "FACESIFT_GROUPING").then(|| "sideways".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("FACESIFT_GROUPING"), "{err}");
    }

    #[test]
    fn test_engine_threshold_must_be_finite() {
        let err = Settings::resolve(&with_reference(), |k| {
            (k == "FACESIFT_ENGINE_THRESHOLD").then(|| "NaN".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("engine threshold"), "{err}");

        let flags = Overrides {
            engine_threshold: Some(f32::NAN),
            ..with_reference()
        };
        let err = Settings::resolve(&flags, no_env).unwrap_err();
        assert!(err.to_string().contains("engine threshold"), "{err}");
    }

    #[test]
    fn test_negative_engine_threshold_in_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("facesift.toml");
        std::fs::write(&path, "engine_threshold = -0.1\n").unwrap();
        let flags = Overrides {
            config: Some(path),
            ..with_reference()
        };
        let err = Settings::resolve(&flags, no_env).unwrap_err();
        assert!(err.to_string().contains("engine threshold"), "{err}");
    }
}
