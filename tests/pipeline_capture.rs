use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zone_occupancy::{
    pipeline::PipelineSettings, polygon_from_pairs, BBox, Detection, ErrorKind,
    FilesystemObjectStore, FrameOutcome, ObjectStore, PersistenceWriter, PipelineOrchestrator,
    RecordStore, SnapshotRef, SnapshotSink, SqliteStore, TrackedFrame, TrackerNamespace, VecSource,
    Zone, ZoneKey, ZoneRegistry, ZoneStore,
};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Fails exactly one put: the `nth` one (1-based) to arrive.
struct OneFailingStore {
    puts: AtomicUsize,
    nth: usize,
}

impl ObjectStore for OneFailingStore {
    fn put_object(&self, _: &str, _: &str, _: &[u8], _: &str) -> Result<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.nth {
            return Err(anyhow!("object store timed out"));
        }
        Ok(())
    }

    fn presigned_get_url(&self, bucket: &str, path: &str, _: Duration) -> Result<String> {
        Ok(format!("https://objects.test/{}/{}", bucket, path))
    }
}

fn person(x1: i32, y1: i32, x2: i32, y2: i32, id: u64) -> Detection {
    Detection::person(BBox::new(x1, y1, x2, y2).unwrap(), 0.85, id).unwrap()
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        bucket: "synapsis".into(),
        capture_interval: Duration::from_secs(5),
        refresh_interval: Duration::from_secs(10),
        upload_workers: 3,
    }
}

/// Opens a fresh database with `plaza/gate` (40x40 square) loaded.
fn setup(dir: &tempfile::TempDir) -> Result<(SqliteStore, ZoneRegistry<SqliteStore>)> {
    let db_path = dir.path().join("occupancy.db");
    let store = SqliteStore::open(db_path.to_str().unwrap(), TIMEOUT)?;
    let mut registry = ZoneRegistry::new(store.reopen(TIMEOUT)?);
    registry.set(Zone::new(
        "plaza",
        "gate",
        polygon_from_pairs(&[[0, 0], [40, 0], [40, 40], [0, 40]]),
    )?)?;
    registry.refresh("plaza", &["gate".to_string()])?;
    Ok((store, registry))
}

#[test]
fn tick_with_zero_detections_writes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (store, registry) = setup(&dir)?;
    let mut check = store.reopen(TIMEOUT)?;
    let before = (check.count_people()?, check.latest_count()?.is_some());

    let objects = Arc::new(FilesystemObjectStore::new(dir.path().join("snaps"), "file:///snaps", "k")?);
    let writer = PersistenceWriter::new(store, TrackerNamespace::ProcessStart(1));
    let t0 = Instant::now();
    let mut orch = PipelineOrchestrator::new(
        registry.cell(),
        writer,
        SnapshotSink::new(objects, Duration::from_secs(60)),
        settings(),
        t0,
    );
    let empty = TrackedFrame::new(0, vec![]).with_image(RgbImage::new(64, 64));
    match orch.process_frame(&empty, t0 + Duration::from_secs(5)) {
        FrameOutcome::Captured { summary, .. } => assert_eq!(summary.count_records, 0),
        other => panic!("expected a capture tick, got {:?}", other),
    }

    assert_eq!(before, (0, false));
    assert_eq!(check.count_people()?, 0);
    assert!(check.latest_count()?.is_none());
    Ok(())
}

#[test]
fn one_failed_upload_of_three_still_writes_three_people() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (store, registry) = setup(&dir)?;
    let mut check = store.reopen(TIMEOUT)?;

    let objects = Arc::new(OneFailingStore {
        puts: AtomicUsize::new(0),
        nth: 2,
    });
    let writer = PersistenceWriter::new(store, TrackerNamespace::ProcessStart(1_700_000_000_000));
    let t0 = Instant::now();
    let mut orch = PipelineOrchestrator::new(
        registry.cell(),
        writer,
        SnapshotSink::new(objects, Duration::from_secs(60)),
        settings(),
        t0,
    );
    let frame = TrackedFrame::new(
        0,
        vec![
            person(2, 2, 10, 20, 1),
            person(12, 4, 20, 30, 2),
            person(45, 45, 60, 63, 3),
        ],
    )
    .with_image(RgbImage::new(64, 64));

    orch.process_frame(&frame, t0 + Duration::from_secs(5));

    assert_eq!(check.count_people()?, 3);
    let count = check.latest_count()?.expect("count record");
    assert_eq!(count.in_count, 2);
    assert_eq!(count.out_count, 1);
    assert_eq!(count.in_people_ids.len() + count.out_people_ids.len(), 3);
    assert_eq!(count.out_tracker_keys, vec!["1700000000000_3"]);

    let mut ids = count.in_people_ids.clone();
    ids.extend(&count.out_people_ids);
    let people = check.get_people(&ids)?;
    assert_eq!(people.len(), 3, "every referenced person record resolves");
    let failed = people.iter().filter(|p| p.snapshot.is_failed()).count();
    let uploaded = people.iter().filter(|p| p.snapshot.url().is_some()).count();
    assert_eq!(failed, 1);
    assert_eq!(uploaded, 2);
    Ok(())
}

#[test]
fn refresh_outage_keeps_cached_zones() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (_store, mut registry) = setup(&dir)?;
    let before = registry.snapshot();

    let err = registry
        .refresh("plaza", &["gate".to_string(), "lobby".to_string()])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(registry.snapshot(), before);
    assert_eq!(registry.snapshot().zones().len(), 1);
    Ok(())
}

#[test]
fn polygon_round_trips_through_sqlite() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut store, _registry) = setup(&dir)?;
    let zone = store
        .find_zone(&ZoneKey::new("plaza", "gate"))?
        .ok_or_else(|| anyhow!("zone missing"))?;
    assert_eq!(
        zone.polygon,
        polygon_from_pairs(&[[0, 0], [40, 0], [40, 40], [0, 40]])
    );
    Ok(())
}

#[test]
fn run_stops_between_frames() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (store, registry) = setup(&dir)?;
    let objects = Arc::new(FilesystemObjectStore::new(dir.path().join("snaps"), "file:///snaps", "k")?);
    let writer = PersistenceWriter::new(store, TrackerNamespace::Run("test-run".into()));
    let mut orch = PipelineOrchestrator::new(
        registry.cell(),
        writer,
        SnapshotSink::new(objects, Duration::from_secs(60)),
        settings(),
        Instant::now(),
    );

    let frames = (0..5)
        .map(|i| TrackedFrame::new(i, vec![person(2, 2, 10, 20, 1)]))
        .collect();
    let mut source = VecSource::new(frames);
    let stop = AtomicBool::new(false);
    let stats = orch.run(&mut source, &stop)?;
    assert_eq!(stats.frames, 5);

    let mut more = VecSource::new(vec![TrackedFrame::new(9, vec![])]);
    stop.store(true, Ordering::SeqCst);
    let stats = orch.run(&mut more, &stop)?;
    assert_eq!(stats.frames, 5, "no frame is read once stop is set");
    orch.shutdown()?;
    Ok(())
}

#[test]
fn snapshots_land_in_the_filesystem_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (store, registry) = setup(&dir)?;
    let mut check = store.reopen(TIMEOUT)?;
    let objects = Arc::new(FilesystemObjectStore::new(dir.path().join("snaps"), "file:///snaps", "k")?);
    let writer = PersistenceWriter::new(store, TrackerNamespace::ProcessStart(5));
    let t0 = Instant::now();
    let mut orch = PipelineOrchestrator::new(
        registry.cell(),
        writer,
        SnapshotSink::new(objects.clone(), Duration::from_secs(60)),
        settings(),
        t0,
    );
    let frame = TrackedFrame::new(0, vec![person(2, 2, 10, 20, 1)]).with_image(RgbImage::new(64, 64));
    orch.process_frame(&frame, t0 + Duration::from_secs(5));

    let count = check.latest_count()?.expect("count record");
    let people = check.get_people(&count.in_people_ids)?;
    let SnapshotRef::Uploaded { url, object_path } = &people[0].snapshot else {
        panic!("expected an uploaded snapshot, got {:?}", people[0].snapshot);
    };
    assert!(object_path.starts_with("plaza/gate/"));
    let file = objects.verify_presigned_url(url, zone_occupancy::now_s()?)?;
    assert_eq!(image::open(file)?.width(), 8);
    Ok(())
}
