use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kata_pose::PoseDocument;
use kata_storage::config::{ExistingDataPolicy, StorageConfig, Strategy};
use kata_storage::logging::init_tracing;
use kata_storage::{Database, IngestOutcome, IngestionEngine, PoseReader, VideoCatalog, VideoId};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kata-storage")]
#[command(about = "Pose data catalog and ingestion utility")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Ingest a Pose Document file
    Ingest {
        /// Pose Document (JSON) path
        document: PathBuf,
        /// Video name to resolve (defaults to the document's file stem)
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,
        #[arg(long, value_enum)]
        on_existing: Option<ExistingDataPolicy>,
        /// Source media path or URL to store on the video
        #[arg(long)]
        media_url: Option<String>,
    },
    /// List videos with their pose coverage
    Videos,
    /// Show the column definitions of a table
    Columns {
        table: String,
    },
    /// Write a video's stored pose data as a Pose Document
    Export {
        video_id: VideoId,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = StorageConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging);

    if let Commands::Ingest {
        strategy,
        on_existing,
        ..
    } = &cli.command
    {
        if let Some(strategy) = strategy {
            config.ingestion.strategy = *strategy;
        }
        if let Some(on_existing) = on_existing {
            config.ingestion.on_existing = *on_existing;
        }
    }

    config.validate().context("Invalid configuration")?;

    let database = Database::connect(&config.database)
        .await
        .context("Failed to connect to database")?;

    if config.database.run_migrations || matches!(cli.command, Commands::Migrate) {
        database
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let result = run(cli.command, &config, &database).await;
    database.close().await;
    result
}

async fn run(command: Commands, config: &StorageConfig, database: &Database) -> Result<()> {
    let catalog = VideoCatalog::new(database, config.catalog.clone());

    match command {
        Commands::Migrate => {
            info!("Database is up to date");
        }

        Commands::Ingest {
            document,
            name,
            media_url,
            ..
        } => {
            ingest_file(&document, name, media_url, config, database, &catalog).await?;
        }

        Commands::Videos => {
            let videos = catalog.list_videos().await?;
            if videos.is_empty() {
                println!("No videos in catalog");
                return Ok(());
            }

            println!(
                "{:>5}  {:<32} {:<12} {:<12} {:>9} {:>10}",
                "ID", "NAME", "CATEGORY", "DIFFICULTY", "FRAMES", "SECONDS"
            );
            for video in videos {
                println!(
                    "{:>5}  {:<32} {:<12} {:<12} {:>9} {:>10.2}",
                    video.id,
                    video.name,
                    video.category,
                    video.difficulty,
                    video.sequence_count,
                    video.max_timestamp
                );
            }
        }

        Commands::Columns { table } => {
            let columns = catalog.table_columns(&table).await?;
            println!("{table}:");
            for column in columns {
                let null = if column.nullable { "NULL" } else { "NOT NULL" };
                println!("  {:<20} {:<28} {}", column.name, column.data_type, null);
            }
        }

        Commands::Export { video_id, output } => {
            let reader = PoseReader::new(database);
            let document = reader
                .export_document(video_id)
                .await
                .with_context(|| format!("Failed to export video {video_id}"))?;
            document
                .write_to(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;

            info!(
                video_id,
                frames = document.frames.len(),
                path = %output.display(),
                "Pose document exported"
            );
        }
    }

    Ok(())
}

async fn ingest_file(
    path: &Path,
    name: Option<String>,
    media_url: Option<String>,
    config: &StorageConfig,
    database: &Database,
    catalog: &VideoCatalog,
) -> Result<()> {
    let document = PoseDocument::read_from(path)
        .with_context(|| format!("Failed to read pose document {}", path.display()))?;

    if let Err(e) = document.validate() {
        warn!(error = %e, "Pose document failed validation, ingesting by frame position");
    }

    let candidate = name.unwrap_or_else(|| {
        Path::new(&document.video_info.filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| document.video_info.filename.clone())
    });

    let resolution = catalog
        .resolve(&candidate, &document.video_info.filename)
        .await
        .context("Failed to resolve video")?;

    let engine = IngestionEngine::new(database, config.ingestion.clone())?;

    let outcome = tokio::select! {
        outcome = engine.ingest_document(resolution.video_id, &document, media_url.as_deref()) => {
            outcome.context("Ingestion failed")?
        }
        _ = signal::ctrl_c() => {
            bail!("Interrupted, ingestion rolled back");
        }
    };

    match outcome {
        IngestOutcome::Written(report) => {
            println!(
                "Video {}: {} frames ({} with pose), {} keypoints, strategy {:?}",
                report.video_id,
                report.frames,
                report.detected_frames,
                report.keypoints,
                report.strategy
            );
        }
        IngestOutcome::Skipped {
            video_id,
            existing_sequences,
        } => {
            println!("Video {video_id}: skipped, {existing_sequences} sequences already stored");
        }
    }

    Ok(())
}
