use async_trait::async_trait;
use kata_pose::{
    DocumentError, FrameRecord, Keypoint, PoseDocument, PoseDocumentBuilder, BODY_LANDMARK_COUNT,
};
use kata_storage::config::{CatalogConfig, DatabaseConfig, IngestionConfig};
use kata_storage::ingestion::BatchStats;
use kata_storage::{
    Database, ExistingDataPolicy, IngestError, IngestOutcome, IngestRequest, IngestionEngine,
    NormalizedWriter, PoseReader, SequenceWriter, Strategy, VideoCatalog, VideoId,
};
use sqlx::AnyConnection;
use std::sync::atomic::{AtomicUsize, Ordering};

async fn setup() -> (Database, VideoId) {
    let database = Database::connect(&DatabaseConfig::with_url("sqlite::memory:"))
        .await
        .unwrap();
    database.run_migrations().await.unwrap();

    let catalog = VideoCatalog::new(&database, CatalogConfig::default());
    let video_id = catalog
        .resolve("Taegeuk 3 Sam Jang", "taegeuk-3.mp4")
        .await
        .unwrap()
        .video_id;

    (database, video_id)
}

fn config(strategy: Strategy, batch_size: usize, on_existing: ExistingDataPolicy) -> IngestionConfig {
    IngestionConfig {
        strategy,
        batch_size,
        on_existing,
    }
}

fn engine(database: &Database, strategy: Strategy, batch_size: usize) -> IngestionEngine {
    IngestionEngine::new(
        database,
        config(strategy, batch_size, ExistingDataPolicy::Replace),
    )
    .unwrap()
}

fn body(frame: u64, offset: f64) -> Vec<Keypoint> {
    (0..BODY_LANDMARK_COUNT)
        .map(|i| {
            let v = offset + frame as f64 * 0.001 + i as f64 * 0.01;
            Keypoint::from_index(i, v, 1.0 - v, -v / 3.0, 0.5 + v / 4.0)
        })
        .collect()
}

/// Every third frame has no pose
fn document(frames: u64, offset: f64) -> PoseDocument {
    let fps = 30.0;
    let mut builder = PoseDocumentBuilder::new("taegeuk-3.mp4", fps);
    for n in 0..frames {
        let ts = n as f64 / fps;
        if n % 3 == 2 {
            builder.push(FrameRecord::undetected(n, ts));
        } else {
            builder.push(FrameRecord::new(n, ts, body(n, offset)));
        }
    }
    builder.finish()
}

async fn count(database: &Database, sql: &str, video_id: VideoId) -> i64 {
    let (count,): (i64,) = sqlx::query_as(sql)
        .bind(video_id)
        .fetch_one(database.pool())
        .await
        .unwrap();
    count
}

async fn sequences(database: &Database, video_id: VideoId) -> i64 {
    count(
        database,
        "SELECT CAST(COUNT(*) AS BIGINT) FROM pose_sequences WHERE video_id = $1",
        video_id,
    )
    .await
}

async fn keypoints(database: &Database, video_id: VideoId) -> i64 {
    count(
        database,
        "SELECT CAST(COUNT(*) AS BIGINT) FROM pose_keypoints k \
         JOIN pose_sequences s ON s.id = k.sequence_id WHERE s.video_id = $1",
        video_id,
    )
    .await
}

async fn all_keypoints(database: &Database) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT CAST(COUNT(*) AS BIGINT) FROM pose_keypoints")
        .fetch_one(database.pool())
        .await
        .unwrap();
    count
}

async fn frame_numbers(database: &Database, video_id: VideoId) -> Vec<i64> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT frame_number FROM pose_sequences WHERE video_id = $1 ORDER BY frame_number",
    )
    .bind(video_id)
    .fetch_all(database.pool())
    .await
    .unwrap();
    rows.into_iter().map(|(n,)| n).collect()
}

fn written(outcome: IngestOutcome) -> kata_storage::IngestReport {
    match outcome {
        IngestOutcome::Written(report) => report,
        other => panic!("expected a written run, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let (database, video_id) = setup().await;
    let engine = engine(&database, Strategy::Normalized, 4);
    let doc = document(10, 0.1);

    let first = written(engine.ingest_document(video_id, &doc, None).await.unwrap());
    assert_eq!(first.frames, 10);
    assert_eq!(first.replaced_sequences, 0);
    let once = (sequences(&database, video_id).await, keypoints(&database, video_id).await);

    let second = written(engine.ingest_document(video_id, &doc, None).await.unwrap());
    assert_eq!(second.replaced_sequences, 10);
    assert_eq!(second.replaced_keypoints, first.keypoints);
    let twice = (sequences(&database, video_id).await, keypoints(&database, video_id).await);

    assert_eq!(once, twice);
    assert_eq!(once, (10, 7 * BODY_LANDMARK_COUNT as i64));
    assert_eq!(all_keypoints(&database).await, 7 * BODY_LANDMARK_COUNT as i64);
}

#[tokio::test]
async fn test_frame_numbers_are_contiguous() {
    let (database, video_id) = setup().await;
    let engine = engine(&database, Strategy::Normalized, 3);

    let mut doc = document(8, 0.0);
    // Array position wins over whatever the records claim
    for (i, frame) in doc.frames.iter_mut().enumerate() {
        frame.frame_number = 100 + 10 * i as u64;
    }

    engine.ingest_document(video_id, &doc, None).await.unwrap();
    assert_eq!(frame_numbers(&database, video_id).await, (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_undetected_frames_have_no_keypoints() {
    for strategy in [Strategy::Normalized, Strategy::Denormalized] {
        let (database, video_id) = setup().await;
        engine(&database, strategy, 5)
            .ingest_document(video_id, &document(9, 0.2), None)
            .await
            .unwrap();

        let orphaned = count(
            &database,
            "SELECT CAST(COUNT(*) AS BIGINT) FROM pose_keypoints k \
             JOIN pose_sequences s ON s.id = k.sequence_id \
             WHERE s.video_id = $1 AND NOT s.pose_detected",
            video_id,
        )
        .await;
        assert_eq!(orphaned, 0);

        let frames = PoseReader::new(&database).frames(video_id, None).await.unwrap();
        for frame in frames.iter().filter(|f| !f.pose_detected) {
            assert!(frame.keypoints.is_empty());
        }
        assert_eq!(frames.iter().filter(|f| !f.pose_detected).count(), 3);
    }
}

#[tokio::test]
async fn test_denormalized_blobs() {
    let (database, video_id) = setup().await;
    let doc = document(7, 0.3);
    let report = written(
        engine(&database, Strategy::Denormalized, 2)
            .ingest_document(video_id, &doc, None)
            .await
            .unwrap(),
    );
    assert_eq!(report.strategy, Strategy::Denormalized);
    assert_eq!(report.batches, 4);

    assert_eq!(sequences(&database, video_id).await, 7);
    assert_eq!(keypoints(&database, video_id).await, 0);

    let (blob,): (String,) = sqlx::query_as(
        "SELECT keypoints_blob FROM pose_sequences WHERE video_id = $1 AND frame_number = 2",
    )
    .bind(video_id)
    .fetch_one(database.pool())
    .await
    .unwrap();
    assert_eq!(blob, "[]");

    let exported = PoseReader::new(&database)
        .export_document(video_id)
        .await
        .unwrap();
    assert_eq!(exported.frames, doc.frames);
    assert_eq!(exported.video_info.total_frames, 7);
}

#[tokio::test]
async fn test_strategies_read_back_identically() {
    let doc = document(6, 0.05);
    let mut read_back = Vec::new();

    for strategy in [Strategy::Normalized, Strategy::Denormalized] {
        let (database, video_id) = setup().await;
        engine(&database, strategy, 1000)
            .ingest_document(video_id, &doc, None)
            .await
            .unwrap();
        read_back.push(
            PoseReader::new(&database)
                .export_document(video_id)
                .await
                .unwrap(),
        );
    }

    assert_eq!(read_back[0], read_back[1]);
    assert_eq!(read_back[0].frames, doc.frames);
}

#[tokio::test]
async fn test_switching_strategy_leaves_no_orphans() {
    let (database, video_id) = setup().await;
    engine(&database, Strategy::Normalized, 100)
        .ingest_document(video_id, &document(6, 0.0), None)
        .await
        .unwrap();
    assert!(all_keypoints(&database).await > 0);

    engine(&database, Strategy::Denormalized, 100)
        .ingest_document(video_id, &document(6, 0.0), None)
        .await
        .unwrap();
    assert_eq!(all_keypoints(&database).await, 0);
    assert_eq!(sequences(&database, video_id).await, 6);
}

#[tokio::test]
async fn test_stream_failure_keeps_previous_data() {
    let (database, video_id) = setup().await;
    let engine = engine(&database, Strategy::Normalized, 2);
    let reader = PoseReader::new(&database);

    let old = document(10, 0.1);
    engine.ingest_document(video_id, &old, None).await.unwrap();
    let before = reader.frames(video_id, None).await.unwrap();

    // Five good frames (two full batches flushed), then the source breaks
    let new = document(12, 0.4);
    let items: Vec<Result<FrameRecord, std::io::Error>> = new.frames[..5]
        .iter()
        .cloned()
        .map(Ok)
        .chain(std::iter::once(Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decoder crashed",
        ))))
        .collect();

    let request = IngestRequest {
        video_id,
        fps: 30.0,
        media_url: None,
    };
    let err = engine
        .ingest_stream(request, futures::stream::iter(items))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Source(_)));

    assert_eq!(reader.frames(video_id, None).await.unwrap(), before);
    assert_eq!(sequences(&database, video_id).await, 10);
    assert_eq!(keypoints(&database, video_id).await, 7 * BODY_LANDMARK_COUNT as i64);
}

/// Normalized writer that fails on a chosen batch
struct FailingWriter {
    inner: NormalizedWriter,
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl SequenceWriter for FailingWriter {
    fn strategy(&self) -> Strategy {
        Strategy::Normalized
    }

    async fn write_batch(
        &self,
        conn: &mut AnyConnection,
        video_id: VideoId,
        fps: f64,
        frames: &[FrameRecord],
    ) -> Result<BatchStats, IngestError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(IngestError::Database(sqlx::Error::Protocol(
                "connection reset".to_string(),
            )));
        }
        self.inner.write_batch(conn, video_id, fps, frames).await
    }
}

#[tokio::test]
async fn test_store_failure_mid_batch_rolls_back() {
    let (database, video_id) = setup().await;
    let reader = PoseReader::new(&database);

    let old = document(6, 0.1);
    engine(&database, Strategy::Normalized, 100)
        .ingest_document(video_id, &old, None)
        .await
        .unwrap();

    let failing = IngestionEngine::with_writer(
        &database,
        config(Strategy::Normalized, 3, ExistingDataPolicy::Replace),
        Box::new(FailingWriter {
            inner: NormalizedWriter::new(3),
            fail_on: 3,
            calls: AtomicUsize::new(0),
        }),
    )
    .unwrap();

    let err = failing
        .ingest_document(video_id, &document(20, 0.6), None)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Database(sqlx::Error::Protocol(_))));

    let frames = reader.frames(video_id, None).await.unwrap();
    assert_eq!(frames, old.frames);
}

#[tokio::test]
async fn test_inconsistent_frame_aborts_run() {
    let (database, video_id) = setup().await;
    let engine = engine(&database, Strategy::Normalized, 2);
    engine
        .ingest_document(video_id, &document(4, 0.0), None)
        .await
        .unwrap();

    let mut bad = document(6, 0.2);
    bad.frames[4].pose_detected = false;

    let err = engine.ingest_document(video_id, &bad, None).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::InconsistentFrame { frame_number: 4, .. }
    ));
    assert_eq!(sequences(&database, video_id).await, 4);
}

#[tokio::test]
async fn test_mixed_cardinality_rolls_back() {
    let (database, video_id) = setup().await;
    let engine = engine(&database, Strategy::Normalized, 2);
    let old = document(6, 0.1);
    engine.ingest_document(video_id, &old, None).await.unwrap();

    // Frames 0..2 are flushed before frame 3 turns up with a 17-point body
    let mut mixed = document(9, 0.5);
    mixed.frames[3].keypoints.truncate(17);

    let err = engine.ingest_document(video_id, &mixed, None).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::InconsistentFrame {
            frame_number: 3,
            source: DocumentError::KeypointCardinality {
                expected: 33,
                actual: 17,
                ..
            },
        }
    ));

    assert_eq!(sequences(&database, video_id).await, 6);
    assert_eq!(keypoints(&database, video_id).await, 4 * BODY_LANDMARK_COUNT as i64);
    let frames = PoseReader::new(&database).frames(video_id, None).await.unwrap();
    assert_eq!(frames, old.frames);
}

#[tokio::test]
async fn test_non_finite_keypoint_rolls_back() {
    let (database, video_id) = setup().await;
    let engine = engine(&database, Strategy::Normalized, 100);
    engine
        .ingest_document(video_id, &document(3, 0.0), None)
        .await
        .unwrap();

    let mut doc = document(6, 0.2);
    doc.frames[4].keypoints[0].z = f64::NAN;

    let err = engine.ingest_document(video_id, &doc, None).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::InconsistentFrame {
            frame_number: 4,
            source: DocumentError::NonFiniteKeypoint { .. },
        }
    ));
    assert_eq!(sequences(&database, video_id).await, 3);
}

#[tokio::test]
async fn test_renumbered_frames_get_position_timestamps() {
    let (database, video_id) = setup().await;

    // A snapshot cut from the middle of a longer run
    let frames: Vec<FrameRecord> = (40..44u64)
        .map(|n| FrameRecord::new(n, n as f64 / 30.0, body(n, 0.0)))
        .collect();
    let request = IngestRequest {
        video_id,
        fps: 30.0,
        media_url: None,
    };
    engine(&database, Strategy::Denormalized, 100)
        .ingest_stream(
            request,
            futures::stream::iter(frames.into_iter().map(Ok::<_, std::io::Error>)),
        )
        .await
        .unwrap();

    let stored = PoseReader::new(&database).frames(video_id, None).await.unwrap();
    assert_eq!(stored.len(), 4);
    for (i, frame) in stored.iter().enumerate() {
        assert_eq!(frame.frame_number, i as u64);
        assert!((frame.timestamp - i as f64 / 30.0).abs() < 1e-12);
    }
}

#[tokio::test]
async fn test_readback_without_media_url() {
    let (database, video_id) = setup().await;
    let catalog = VideoCatalog::new(&database, CatalogConfig::default());

    let video = catalog.get_video(video_id).await.unwrap().unwrap();
    assert_eq!(video.media_url, None);
    assert_eq!(video.thumbnail_url, None);

    for strategy in [Strategy::Normalized, Strategy::Denormalized] {
        engine(&database, strategy, 100)
            .ingest_document(video_id, &document(5, 0.0), None)
            .await
            .unwrap();

        let reader = PoseReader::new(&database);
        let frames = reader.frames(video_id, None).await.unwrap();
        assert_eq!(frames.len(), 5);
        assert!(frames[2].keypoints.is_empty());

        let frame = reader.pose_at(video_id, 0.0, 0.01).await.unwrap().unwrap();
        assert_eq!(frame.keypoints.len(), BODY_LANDMARK_COUNT);

        let exported = reader.export_document(video_id).await.unwrap();
        assert_eq!(exported.video_info.filename, "Taegeuk 3 Sam Jang");
        assert_eq!(exported.frames, frames);
    }
}

#[tokio::test]
async fn test_skip_policy() {
    let (database, video_id) = setup().await;
    let skipping = IngestionEngine::new(
        &database,
        config(Strategy::Normalized, 100, ExistingDataPolicy::Skip),
    )
    .unwrap();

    // Nothing stored yet, so skip still writes
    let report = written(
        skipping
            .ingest_document(video_id, &document(5, 0.0), None)
            .await
            .unwrap(),
    );
    assert_eq!(report.frames, 5);

    let outcome = skipping
        .ingest_document(video_id, &document(9, 0.3), None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        IngestOutcome::Skipped {
            video_id,
            existing_sequences: 5
        }
    );
    assert_eq!(sequences(&database, video_id).await, 5);
}

#[tokio::test]
async fn test_video_row_updated() {
    let (database, video_id) = setup().await;
    let catalog = VideoCatalog::new(&database, CatalogConfig::default());

    engine(&database, Strategy::Normalized, 100)
        .ingest_document(video_id, &document(45, 0.0), Some("/videos/taegeuk-3.mp4"))
        .await
        .unwrap();

    let video = catalog.get_video(video_id).await.unwrap().unwrap();
    assert!((video.duration_seconds - 1.5).abs() < 1e-9);
    assert_eq!(video.media_url.as_deref(), Some("/videos/taegeuk-3.mp4"));

    let exported = PoseReader::new(&database)
        .export_document(video_id)
        .await
        .unwrap();
    assert_eq!(exported.video_info.filename, "taegeuk-3.mp4");
}

#[tokio::test]
async fn test_unknown_video_and_bad_fps() {
    let (database, _) = setup().await;
    let engine = engine(&database, Strategy::Normalized, 10);

    let err = engine
        .ingest_document(9999, &document(2, 0.0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::UnknownVideo(9999)));

    let mut doc = document(2, 0.0);
    doc.video_info.fps = 0.0;
    let err = engine.ingest_document(1, &doc, None).await.unwrap_err();
    assert!(matches!(err, IngestError::InvalidFrameRate(_)));
}

#[tokio::test]
async fn test_invalid_batch_size_rejected() {
    let (database, _) = setup().await;
    let result = IngestionEngine::new(
        &database,
        config(Strategy::Normalized, 0, ExistingDataPolicy::Replace),
    );
    assert!(matches!(result, Err(IngestError::Config(_))));
}

#[tokio::test]
async fn test_pose_at_and_frame_range() {
    let (database, video_id) = setup().await;
    engine(&database, Strategy::Normalized, 100)
        .ingest_document(video_id, &document(30, 0.0), None)
        .await
        .unwrap();
    let reader = PoseReader::new(&database);

    // 0.3s is frame 9, which has a pose
    let frame = reader.pose_at(video_id, 0.301, 0.02).await.unwrap().unwrap();
    assert_eq!(frame.frame_number, 9);
    assert_eq!(frame.keypoints.len(), BODY_LANDMARK_COUNT);

    // Frame 2 has no pose, nearest detected within tolerance is 1 or 3
    let frame = reader
        .pose_at(video_id, 2.0 / 30.0, 0.04)
        .await
        .unwrap()
        .unwrap();
    assert!(frame.frame_number == 1 || frame.frame_number == 3);

    assert!(reader.pose_at(video_id, 5.0, 0.1).await.unwrap().is_none());

    let range = reader.frames(video_id, Some(10..14)).await.unwrap();
    let numbers: Vec<u64> = range.iter().map(|f| f.frame_number).collect();
    assert_eq!(numbers, vec![10, 11, 12, 13]);
    assert_eq!(range[0].keypoints.len(), BODY_LANDMARK_COUNT);
    assert!(!range[1].pose_detected);
    assert!(range[1].keypoints.is_empty());
}
