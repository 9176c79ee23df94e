use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::types::CropRegion;
use facematch_core::{
    decode_image, ComparisonPipeline, ComparisonResult, ComparisonStatus, DetectorService,
    ExtractedFace, ImageSource, PipelineEvent, ScrfdModel,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facematch", about = "Compare an ID document photo against a profile photo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify that both photos show the same person
    Compare {
        /// Identity document photo
        #[arg(long)]
        id: PathBuf,
        /// Profile photo
        #[arg(long)]
        profile: PathBuf,
        /// Write the extracted face crops into this directory
        #[arg(long)]
        save_faces: Option<PathBuf>,
        /// Skip the ID photo quality gate
        #[arg(long)]
        skip_quality: bool,
        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run the ID photo quality gate on an image
    Quality {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List the faces the detector finds in an image
    Detect { image: PathBuf },
}

#[derive(Serialize)]
struct Report {
    status: ComparisonStatus,
    confidence: f64,
    threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_face: Option<CropRegion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile_face: Option<CropRegion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Report {
    fn new(result: &ComparisonResult, threshold: f64) -> Self {
        Self {
            status: result.status,
            confidence: result.confidence,
            threshold,
            id_face: result.id_face.as_ref().map(ExtractedFace::region),
            profile_face: result.profile_face.as_ref().map(ExtractedFace::region),
            error: result.error.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Compare {
            id,
            profile,
            save_faces,
            skip_quality,
            json,
        } => {
            compare(
                &config,
                &id,
                &profile,
                save_faces.as_deref(),
                skip_quality || config.skip_quality,
                json,
            )
            .await
        }
        Commands::Quality { image, json } => quality(&image, json).await,
        Commands::Detect { image } => detect(&config, &image).await,
    }
}

fn build_pipeline(config: &Config) -> ComparisonPipeline {
    let model = ScrfdModel::new(config.scrfd_model_path(), config.scrfd_config());
    let detector = Arc::new(DetectorService::new(Arc::new(model)));
    ComparisonPipeline::new(detector, config.pipeline_config())
}

async fn compare(
    config: &Config,
    id: &Path,
    profile: &Path,
    save_faces: Option<&Path>,
    skip_quality: bool,
    json: bool,
) -> Result<ExitCode> {
    let pipeline = build_pipeline(config);

    let id_image = decode_image(ImageSource::Path(id.to_path_buf()))
        .await
        .with_context(|| format!("failed to read ID photo {}", id.display()))?;

    if skip_quality {
        tracing::info!("ID photo quality gate skipped");
    } else if let Err(rejected) = pipeline.submit_quality_check(&id_image).into_result() {
        eprintln!("ID photo rejected: {rejected}");
        return Ok(ExitCode::from(1));
    }

    let printer = spawn_event_printer(&pipeline);
    let timeout = Duration::from_secs(config.timeout_secs);
    let result = pipeline
        .run_comparison_until(
            id_image,
            ImageSource::Path(profile.to_path_buf()),
            tokio::time::sleep(timeout),
        )
        .await;
    printer.abort();

    if let Some(dir) = save_faces {
        save_face_crops(&result, dir)?;
    }

    if json {
        let report = Report::new(&result, config.match_threshold);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_result(&result, config.match_threshold);
    }

    Ok(match result.status {
        ComparisonStatus::Match => ExitCode::SUCCESS,
        ComparisonStatus::NoMatch => ExitCode::from(1),
        _ => ExitCode::from(2),
    })
}

/// Print progress and notifications to stderr while a comparison runs.
fn spawn_event_printer(pipeline: &ComparisonPipeline) -> tokio::task::JoinHandle<()> {
    let mut events = pipeline.subscribe_events();
    let mut progress = pipeline.subscribe_progress();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = progress.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *progress.borrow_and_update();
                    if state.status == ComparisonStatus::Processing {
                        eprintln!(
                            "[{}/4] {}",
                            state.step.number(),
                            state.step.label()
                        );
                    }
                }
                event = events.recv() => match event {
                    Ok(PipelineEvent::ModelLoading) => eprintln!("Loading facial recognition model..."),
                    Ok(PipelineEvent::ModelLoaded) => eprintln!("Facial recognition model loaded"),
                    Ok(PipelineEvent::MultipleFaces { which, count }) => {
                        eprintln!("warning: {count} faces detected in {which} image, using the largest face");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn print_result(result: &ComparisonResult, threshold: f64) {
    match result.status {
        ComparisonStatus::Match => println!(
            "Faces match! Identity verified. (similarity {:.1}%, threshold {:.0}%)",
            result.confidence * 100.0,
            threshold * 100.0
        ),
        ComparisonStatus::NoMatch => println!(
            "Faces do not match. Identity could not be verified. (similarity {:.1}%, threshold {:.0}%)",
            result.confidence * 100.0,
            threshold * 100.0
        ),
        _ => println!(
            "Facial recognition failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn save_face_crops(result: &ComparisonResult, dir: &Path) -> Result<()> {
    let crops = [
        ("id_face.png", result.id_face.as_ref()),
        ("profile_face.png", result.profile_face.as_ref()),
    ];
    if crops.iter().all(|(_, face)| face.is_none()) {
        return Ok(());
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    for (name, face) in crops {
        if let Some(face) = face {
            let path = dir.join(name);
            face.save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "saved face crop");
        }
    }
    Ok(())
}

async fn quality(image: &Path, json: bool) -> Result<ExitCode> {
    let img = decode_image(ImageSource::Path(image.to_path_buf()))
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;
    let assessment = facematch_core::quality::assess(&img);

    if json {
        println!("{}", serde_json::to_string_pretty(&assessment)?);
    } else if assessment.is_acceptable {
        println!("OK: {}x{} image passed the quality check", img.width(), img.height());
    } else {
        println!(
            "Rejected: {}",
            assessment.reason.as_deref().unwrap_or("poor image quality")
        );
    }

    Ok(if assessment.is_acceptable {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

async fn detect(config: &Config, image: &Path) -> Result<ExitCode> {
    let img = decode_image(ImageSource::Path(image.to_path_buf()))
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;

    let model = ScrfdModel::new(config.scrfd_model_path(), config.scrfd_config());
    let detector = DetectorService::new(Arc::new(model));
    let handle = detector
        .ensure_loaded()
        .await
        .context("failed to load face detection model")?;
    let faces = detector.detect(&img, &handle).await?;

    println!("{}", serde_json::to_string_pretty(&faces)?);
    Ok(if faces.is_empty() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
