use anyhow::{bail, Context, Result};
use clap::Parser;
use kata_extract::{
    load_estimator, open_video, spawn_walker, ExtractConfig, FrameSource, FrameWalker,
    PoseEstimator,
};
use kata_pose::PoseDocument;
use kata_storage::config::{ExistingDataPolicy, Strategy};
use kata_storage::logging::init_tracing;
use kata_storage::{
    Database, IngestOutcome, IngestRequest, IngestionEngine, Resolution, VideoCatalog,
};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::info;

#[derive(Parser)]
#[command(name = "kata-extract")]
#[command(about = "Extract per-frame body landmarks from a martial-arts video")]
struct Cli {
    /// Video file to process
    source: PathBuf,

    /// Write the Pose Document to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Ingest into the configured database
    #[arg(short, long)]
    database: bool,

    /// Video name to resolve (defaults to the source file stem)
    #[arg(long)]
    name: Option<String>,

    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    #[arg(long, value_enum)]
    on_existing: Option<ExistingDataPolicy>,

    /// Media path or URL stored on the video row
    #[arg(long)]
    media_url: Option<String>,

    /// Pose model file (overrides extraction.model.path)
    #[arg(long)]
    model: Option<PathBuf>,
}

type Walker = FrameWalker<Box<dyn FrameSource>, Box<dyn PoseEstimator>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ExtractConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    if let Some(strategy) = cli.strategy {
        config.ingestion.strategy = strategy;
    }
    if let Some(on_existing) = cli.on_existing {
        config.ingestion.on_existing = on_existing;
    }
    if let Some(model) = &cli.model {
        config.extraction.model.path = Some(model.clone());
    }

    config
        .extraction
        .validate()
        .context("Invalid configuration")?;
    if cli.database {
        config.validate_storage().context("Invalid configuration")?;
    }

    let walker = open_walker(&cli.source, &config)?;
    info!(
        source = %cli.source.display(),
        fps = walker.fps(),
        advertised_frames = ?walker.advertised_frames(),
        "Extraction started"
    );

    let filename = cli
        .source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.source.display().to_string());

    let media_url = cli.media_url.clone();
    let capacity = config.extraction.channel_capacity;

    match (cli.output.clone(), cli.database) {
        (output, false) => {
            let output = output.unwrap_or_else(|| default_output_path(&cli.source));
            let document = extract_document(walker, filename).await?;
            write_document(&document, &output)?;
        }
        (Some(output), true) => {
            let document = extract_document(walker, filename).await?;
            write_document(&document, &output)?;
            with_database(&cli, &config, |engine, resolution| async move {
                engine
                    .ingest_document(resolution.video_id, &document, media_url.as_deref())
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await?;
        }
        (None, true) => {
            with_database(&cli, &config, |engine, resolution| async move {
                let request = IngestRequest {
                    video_id: resolution.video_id,
                    fps: walker.fps(),
                    media_url,
                };
                let (frames, handle) = spawn_walker(walker, capacity);
                let outcome = engine.ingest_stream(request, frames).await;
                let stats = handle.await.context("Frame walker panicked")?;
                info!(
                    frames = stats.frames,
                    detected = stats.detected,
                    decode_failures = stats.decode_failures,
                    estimator_failures = stats.estimator_failures,
                    "Extraction finished"
                );
                Ok::<_, anyhow::Error>(outcome?)
            })
            .await?;
        }
    }

    Ok(())
}

fn open_walker(source: &Path, config: &ExtractConfig) -> Result<Walker> {
    let frames = open_video(source, &config.extraction)
        .with_context(|| format!("Failed to open {}", source.display()))?;
    let estimator =
        load_estimator(&config.extraction.model).context("Failed to load pose model")?;

    Ok(FrameWalker::new(
        frames,
        estimator,
        config.extraction.decode_failure_policy,
    )?)
}

/// `<stem>_pose_data.json` in the working directory
fn default_output_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    PathBuf::from(format!("{stem}_pose_data.json"))
}

async fn extract_document(walker: Walker, filename: String) -> Result<PoseDocument> {
    let (document, stats) = tokio::task::spawn_blocking(move || walker.collect_document(filename))
        .await
        .context("Frame walker panicked")??;

    info!(
        frames = stats.frames,
        detected = stats.detected,
        decode_failures = stats.decode_failures,
        estimator_failures = stats.estimator_failures,
        "Extraction finished"
    );
    Ok(document)
}

fn write_document(document: &PoseDocument, output: &Path) -> Result<()> {
    document
        .write_to(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} frames ({} with pose) to {}",
        document.frames.len(),
        document.detected_frames(),
        output.display()
    );
    Ok(())
}

/// Connect, resolve the video, and run one ingestion. Ctrl+C abandons the
/// run, which rolls its transaction back.
async fn with_database<F, Fut>(cli: &Cli, config: &ExtractConfig, ingest: F) -> Result<()>
where
    F: FnOnce(IngestionEngine, Resolution) -> Fut,
    Fut: std::future::Future<Output = Result<IngestOutcome>>,
{
    let database = Database::connect(&config.database)
        .await
        .context("Failed to connect to database")?;

    if config.database.run_migrations {
        database
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let result = async {
        let catalog = VideoCatalog::new(&database, config.catalog.clone());
        let candidate = cli.name.clone().unwrap_or_else(|| {
            cli.source
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        let resolution = catalog
            .resolve(&candidate, &cli.source.display().to_string())
            .await
            .context("Failed to resolve video")?;

        let engine = IngestionEngine::new(&database, config.ingestion.clone())?;

        let outcome = tokio::select! {
            outcome = ingest(engine, resolution) => outcome.context("Ingestion failed")?,
            _ = signal::ctrl_c() => bail!("Interrupted, ingestion rolled back"),
        };

        match outcome {
            IngestOutcome::Written(report) => println!(
                "Video {}: {} frames ({} with pose), {} keypoints, strategy {:?}",
                report.video_id,
                report.frames,
                report.detected_frames,
                report.keypoints,
                report.strategy
            ),
            IngestOutcome::Skipped {
                video_id,
                existing_sequences,
            } => println!("Video {video_id}: skipped, {existing_sequences} sequences already stored"),
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    database.close().await;
    result
}
