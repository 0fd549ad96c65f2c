//! Per-frame orchestration.
//!
//! ```text
//!   WAITING --frame, zones loaded--> EVALUATING --capture due--> CAPTURING
//!      ^                                  |                          |
//!      +-------------- not due -----------+---- tick done/failed ----+
//! ```
//!
//! With an empty zone snapshot the orchestrator stays in WAITING and does no
//! containment work. Capture failures are logged and never end the loop.

use anyhow::Result;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::containment::{partition, ContainmentPartition};
use crate::ingest::{DetectionSource, TrackedFrame};
use crate::persist::{CaptureTickInput, PersistenceWriter, TickDetection};
use crate::schedule::CaptureScheduler;
use crate::snapshot::SnapshotSink;
use crate::storage::RecordStore;
use crate::zones::{RefreshHandle, SnapshotCell, ZoneSnapshot};
use crate::{now_ms, Detection, ObjectClass, RecordId, SnapshotRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Waiting,
    Evaluating,
    Capturing,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub bucket: String,
    pub capture_interval: Duration,
    pub refresh_interval: Duration,
    pub upload_workers: usize,
}

/// Containment result for one zone on one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneCount {
    pub zone_id: RecordId,
    pub area_name: String,
    pub in_count: usize,
    pub out_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub count_records: usize,
    pub person_records: usize,
    pub failed_snapshots: usize,
    pub failed_zones: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No zones loaded; nothing evaluated.
    NoZones,
    Evaluated(Vec<ZoneCount>),
    Captured {
        counts: Vec<ZoneCount>,
        summary: TickSummary,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub frames_without_zones: u64,
    pub capture_ticks: u64,
    pub count_records: u64,
    pub person_records: u64,
    pub failed_snapshots: u64,
    pub failed_zone_writes: u64,
}

pub struct PipelineOrchestrator<S: RecordStore> {
    cell: SnapshotCell,
    writer: PersistenceWriter<S>,
    sink: SnapshotSink,
    settings: PipelineSettings,
    capture: CaptureScheduler,
    refresh: CaptureScheduler,
    refresher: Option<RefreshHandle>,
    state: PipelineState,
    last_empty_warning: Option<Instant>,
    stats: RunStats,
}

impl<S: RecordStore> PipelineOrchestrator<S> {
    /// Both timers start at `start`; the first capture is due one interval later.
    pub fn new(
        cell: SnapshotCell,
        writer: PersistenceWriter<S>,
        sink: SnapshotSink,
        settings: PipelineSettings,
        start: Instant,
    ) -> Self {
        Self {
            cell,
            writer,
            sink,
            capture: CaptureScheduler::new(settings.capture_interval, start),
            refresh: CaptureScheduler::new(settings.refresh_interval, start),
            settings,
            refresher: None,
            state: PipelineState::Waiting,
            last_empty_warning: None,
            stats: RunStats::default(),
        }
    }

    /// Posts a refresh request to `handle` each time the refresh timer fires.
    pub fn with_refresher(mut self, handle: RefreshHandle) -> Self {
        self.refresher = Some(handle);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn writer_mut(&mut self) -> &mut PersistenceWriter<S> {
        &mut self.writer
    }

    /// Consumes frames until end of stream or until `stop` is set. `stop` is
    /// checked between frames only, so a tick in progress always finishes.
    pub fn run(&mut self, source: &mut dyn DetectionSource, stop: &AtomicBool) -> Result<RunStats> {
        while !stop.load(Ordering::SeqCst) {
            let Some(frame) = source.next_frame()? else {
                log::info!("detection stream ended");
                break;
            };
            self.process_frame(&frame, Instant::now());
        }
        Ok(self.stats.clone())
    }

    /// Stops the background refresher, if any.
    pub fn shutdown(mut self) -> Result<RunStats> {
        if let Some(handle) = self.refresher.take() {
            handle.stop()?;
        }
        Ok(self.stats)
    }

    pub fn process_frame(&mut self, frame: &TrackedFrame, now: Instant) -> FrameOutcome {
        self.stats.frames += 1;
        if self.refresh.poll(now) {
            if let Some(handle) = &self.refresher {
                handle.request();
            }
        }

        let snapshot = self.cell.load();
        if snapshot.is_empty() {
            self.state = PipelineState::Waiting;
            self.stats.frames_without_zones += 1;
            self.warn_no_zones(now);
            return FrameOutcome::NoZones;
        }

        self.state = PipelineState::Evaluating;
        let people: Vec<Detection> = frame
            .detections
            .iter()
            .filter(|d| d.class == ObjectClass::Person)
            .cloned()
            .collect();
        let partitions: Vec<ContainmentPartition> = snapshot
            .zones()
            .iter()
            .map(|zone| partition(&zone.polygon, &people))
            .collect();
        let counts = zone_counts(&snapshot, &partitions);
        for count in &counts {
            log::debug!(
                "frame {}: zone `{}` in {} out {}",
                frame.index,
                count.area_name,
                count.in_count,
                count.out_count
            );
        }

        if !self.capture.poll(now) {
            self.state = PipelineState::Waiting;
            return FrameOutcome::Evaluated(counts);
        }

        self.state = PipelineState::Capturing;
        let started = Instant::now();
        let summary = self.capture_tick(frame, &snapshot, &people, &partitions);
        self.state = PipelineState::Waiting;

        self.stats.capture_ticks += 1;
        self.stats.count_records += summary.count_records as u64;
        self.stats.person_records += summary.person_records as u64;
        self.stats.failed_snapshots += summary.failed_snapshots as u64;
        self.stats.failed_zone_writes += summary.failed_zones as u64;
        log::info!(
            "capture tick at frame {}: {} count record(s), {} person record(s), {} failed snapshot(s), {} failed zone(s) in {:?}",
            frame.index,
            summary.count_records,
            summary.person_records,
            summary.failed_snapshots,
            summary.failed_zones,
            started.elapsed()
        );
        FrameOutcome::Captured { counts, summary }
    }

    fn warn_no_zones(&mut self, now: Instant) {
        let due = self
            .last_empty_warning
            .map_or(true, |last| now.saturating_duration_since(last) >= self.settings.refresh_interval);
        if due {
            log::warn!("zone snapshot is empty; waiting for a successful zone refresh");
            self.last_empty_warning = Some(now);
        }
    }

    fn capture_tick(
        &mut self,
        frame: &TrackedFrame,
        snapshot: &ZoneSnapshot,
        detections: &[Detection],
        partitions: &[ContainmentPartition],
    ) -> TickSummary {
        let mut summary = TickSummary::default();
        let timestamp_ms = match now_ms() {
            Ok(ts) => ts,
            Err(err) => {
                log::error!("capture tick skipped: clock error: {}", err);
                summary.failed_zones = partitions.len();
                return summary;
            }
        };

        // Every (zone, detection) pair gets its own snapshot, inside first.
        let mut jobs = Vec::new();
        for (zone, part) in snapshot.zones().iter().zip(partitions) {
            for &idx in part.inside.iter().chain(part.outside.iter()) {
                jobs.push(UploadJob {
                    area_name: &zone.area_name,
                    detection: &detections[idx],
                });
            }
        }
        let refs = upload_all(
            &self.sink,
            &self.settings.bucket,
            snapshot.location(),
            frame.image.as_deref(),
            &jobs,
            self.settings.upload_workers,
        );
        summary.failed_snapshots = refs.iter().filter(|r| r.is_failed()).count();

        let mut refs = refs.into_iter();
        for (zone, part) in snapshot.zones().iter().zip(partitions) {
            let mut take = |indices: &[usize]| -> Vec<TickDetection> {
                indices
                    .iter()
                    .map(|&idx| TickDetection {
                        detection: detections[idx].clone(),
                        snapshot: refs.next().unwrap_or(SnapshotRef::NotCaptured),
                    })
                    .collect()
            };
            let inside = take(&part.inside);
            let outside = take(&part.outside);
            let Some(zone_id) = zone.id else {
                log::error!("zone `{}` has no persisted id; tick skipped for it", zone.area_name);
                summary.failed_zones += 1;
                continue;
            };
            let person_count = inside.len() + outside.len();
            let input = CaptureTickInput {
                zone_id,
                inside,
                outside,
                timestamp_ms,
            };
            match self.writer.write_capture_tick(input) {
                Ok(Some(_)) => {
                    summary.count_records += 1;
                    summary.person_records += person_count;
                }
                Ok(None) => {}
                Err(err) => {
                    log::error!("capture tick for zone `{}` aborted: {}", zone.area_name, err);
                    summary.failed_zones += 1;
                }
            }
        }
        summary
    }
}

fn zone_counts(snapshot: &ZoneSnapshot, partitions: &[ContainmentPartition]) -> Vec<ZoneCount> {
    snapshot
        .zones()
        .iter()
        .zip(partitions)
        .map(|(zone, part)| ZoneCount {
            zone_id: zone.id.unwrap_or_default(),
            area_name: zone.area_name.clone(),
            in_count: part.inside.len(),
            out_count: part.outside.len(),
        })
        .collect()
}

struct UploadJob<'a> {
    area_name: &'a str,
    detection: &'a Detection,
}

/// Runs every job on at most `workers` threads and returns results in job
/// order. Returns only once every job has finished or failed.
fn upload_all(
    sink: &SnapshotSink,
    bucket: &str,
    location: &str,
    image: Option<&RgbImage>,
    jobs: &[UploadJob<'_>],
    workers: usize,
) -> Vec<SnapshotRef> {
    let Some(image) = image else {
        return jobs.iter().map(|_| SnapshotRef::NotCaptured).collect();
    };
    let next = &AtomicUsize::new(0);
    let mut results: Vec<Option<SnapshotRef>> = vec![None; jobs.len()];
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..workers.clamp(1, jobs.len().max(1)) {
            handles.push(scope.spawn(move || {
                let mut done = Vec::new();
                loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(job) = jobs.get(i) else { break };
                    let snapshot = sink.capture(
                        bucket,
                        location,
                        job.area_name,
                        Some(image),
                        &job.detection.bbox,
                    );
                    done.push((i, snapshot));
                }
                done
            }));
        }
        for handle in handles {
            match handle.join() {
                Ok(done) => {
                    for (i, snapshot) in done {
                        results[i] = Some(snapshot);
                    }
                }
                Err(_) => log::error!("snapshot upload worker panicked"),
            }
        }
    });
    results
        .into_iter()
        .map(|r| {
            r.unwrap_or_else(|| SnapshotRef::Failed {
                reason: "upload worker panicked".to_string(),
            })
        })
        .collect()
}
