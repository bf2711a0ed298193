use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facesift_core::{
    DirectoryPipeline, EmbeddingSearch, RunReport, SearchOptions, PUBLISHED_DIR_NAME,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{Overrides, Settings};

#[derive(Parser)]
#[command(
    name = "facesift",
    version,
    about = "Find the faces most similar to a reference face across a photo directory"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: Overrides,

    /// Print the run report as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Crop the faces of one image and publish the closest as cropped_<name>
    Image {
        /// Image to process
        path: PathBuf,
    },
    /// Crop every image under a person directory and publish all close matches
    Dir {
        /// Directory to walk recursively
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(&cli.overrides, |key| std::env::var(key).ok())?;
    init_logging(settings.log_file.as_deref())?;

    let backend = settings.pipeline.detector_backend;
    tracing::info!(
        detector = %backend,
        model_dir = %settings.model_dir.display(),
        threshold = settings.pipeline.similarity_threshold,
        grouping = ?settings.pipeline.grouping,
        "facesift starting"
    );

    let options = SearchOptions {
        engine_threshold: settings.engine_threshold,
        skip_dirs: vec![PUBLISHED_DIR_NAME.to_string()],
        extensions: settings.pipeline.extensions.clone(),
    };
    let search = EmbeddingSearch::load(backend, &settings.model_dir, options)
        .with_context(|| format!("loading models from {}", settings.model_dir.display()))?;
    let detector = backend
        .load(&settings.model_dir)
        .with_context(|| format!("loading {backend} detector"))?;

    let mut pipeline = DirectoryPipeline::new(settings.pipeline, detector, Box::new(search));
    let report = match &cli.command {
        Commands::Image { path } => pipeline.run_image(path)?,
        Commands::Dir { path } => pipeline.run_directory(path)?,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

/// Console logging filtered by `RUST_LOG` (default `info`), optionally
/// mirrored without colour to `log_file`.
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!(
        "{} images, {} with faces, {} crops saved, {} matches published, {} failures",
        report.images_seen,
        report.images_with_faces,
        report.crops_saved,
        report.matches.len(),
        report.failures.len()
    );
    for m in &report.matches {
        println!("  {:.4}  {}", m.distance, m.destination.display());
    }
    for f in &report.failures {
        println!("  failed ({:?}): {}: {}", f.stage, f.path.display(), f.reason);
    }
}
