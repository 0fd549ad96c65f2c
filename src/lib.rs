//! Zone Occupancy Pipeline
//!
//! This crate turns a stream of tracked person detections into a persisted
//! occupancy log: per-zone inside/outside counts, person snapshot crops and
//! queryable aggregates.
//!
//! # Architecture
//!
//! Data flows one way per frame:
//!
//! 1. **ZoneRegistry** (`zones`): current polygon zones, hot-reloaded by atomic swap.
//! 2. **ContainmentEvaluator** (`containment`): inside/outside partition per zone.
//! 3. **CaptureScheduler** (`schedule`): fixed-cadence gate for the expensive path.
//! 4. **SnapshotSink** (`snapshot`): best-effort crop upload per detection.
//! 5. **PersistenceWriter** (`persist`): PersonRecords + one CountRecord per zone per tick.
//! 6. **PipelineOrchestrator** (`pipeline`): the per-frame state machine.
//!
//! The detector/tracker, video decoding and annotation are external; `ingest`
//! only parses their output. `api` is a thin HTTP façade over zone CRUD and
//! the count read side (`stats`).

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod containment;
pub mod error;
pub mod ingest;
pub mod persist;
pub mod pipeline;
pub mod schedule;
pub mod snapshot;
pub mod stats;
pub mod storage;
pub mod zones;

pub use containment::{partition, ContainmentPartition};
pub use error::{ErrorKind, OccupancyError, OccupancyResult};
pub use ingest::{DetectionSource, JsonLinesSource, TrackedFrame, VecSource};
pub use persist::{CaptureTickInput, PersistenceWriter, TickDetection};
pub use pipeline::{FrameOutcome, PipelineOrchestrator, PipelineSettings, PipelineState};
pub use schedule::CaptureScheduler;
pub use snapshot::{FilesystemObjectStore, ObjectStore, SnapshotSink};
pub use stats::{CountPage, CountQuery};
pub use storage::{InMemoryStore, RecordStore, SqliteStore, ZoneStore};
pub use zones::{SnapshotCell, ZoneRegistry, ZoneSnapshot};

/// Store-assigned identifier for zones, person records and count records.
pub type RecordId = i64;

// -------------------- Time --------------------

pub fn now_ms() -> Result<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64)
}

pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- SQLite connections --------------------

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:zone_occupancy_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

/// Opens a connection with `busy_timeout` as the per-call store timeout.
pub(crate) fn open_db_connection(db_path: &str, timeout: Duration) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path)?
    };
    conn.busy_timeout(timeout)?;
    Ok(conn)
}

// -------------------- Zones --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 2]", into = "[i32; 2]")]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<[i32; 2]> for Point {
    fn from(p: [i32; 2]) -> Self {
        Self { x: p[0], y: p[1] }
    }
}

impl From<Point> for [i32; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Builds a polygon from `[x, y]` pairs, the bulk-import and façade format.
pub fn polygon_from_pairs(pairs: &[[i32; 2]]) -> Vec<Point> {
    pairs.iter().copied().map(Point::from).collect()
}

pub const MIN_POLYGON_POINTS: usize = 3;

pub fn validate_polygon(polygon: &[Point]) -> OccupancyResult<()> {
    if polygon.len() < MIN_POLYGON_POINTS {
        return Err(OccupancyError::invalid_input(format!(
            "polygon needs at least {} points, got {}",
            MIN_POLYGON_POINTS,
            polygon.len()
        )));
    }
    Ok(())
}

/// Location and area names are local identifiers, also used as object path
/// segments, so they are restricted to `[A-Za-z0-9_-]{1,64}`.
pub fn validate_name(kind: &str, name: &str) -> OccupancyResult<()> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static name pattern")
    });
    if !re.is_match(name) {
        return Err(OccupancyError::invalid_input(format!(
            "{} `{}` must match ^[A-Za-z0-9_-]{{1,64}}$",
            kind, name
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneKey {
    pub location: String,
    pub area_name: String,
}

impl ZoneKey {
    pub fn new(location: &str, area_name: &str) -> Self {
        Self {
            location: location.to_string(),
            area_name: area_name.to_string(),
        }
    }

    pub fn validate(&self) -> OccupancyResult<()> {
        validate_name("location", &self.location)?;
        validate_name("area_name", &self.area_name)
    }
}

impl std::fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}` at location `{}`", self.area_name, self.location)
    }
}

/// A named polygon within a location. `id` is assigned by the store on
/// insert and never changes afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub location: String,
    pub area_name: String,
    pub polygon: Vec<Point>,
    pub updated_at_ms: i64,
}

impl Zone {
    /// Unpersisted zone, validated and stamped with the current time.
    pub fn new(location: &str, area_name: &str, polygon: Vec<Point>) -> OccupancyResult<Self> {
        let zone = Self {
            id: None,
            location: location.to_string(),
            area_name: area_name.to_string(),
            polygon,
            updated_at_ms: now_ms().map_err(|e| OccupancyError::server(e.to_string()))?,
        };
        zone.validate()?;
        Ok(zone)
    }

    pub fn key(&self) -> ZoneKey {
        ZoneKey::new(&self.location, &self.area_name)
    }

    pub fn validate(&self) -> OccupancyResult<()> {
        self.key().validate()?;
        validate_polygon(&self.polygon)
    }
}

// -------------------- Detections --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[i32; 4]", into = "[i32; 4]")]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> OccupancyResult<Self> {
        if x1 >= x2 || y1 >= y2 {
            return Err(OccupancyError::invalid_input(format!(
                "bbox [{}, {}, {}, {}] must satisfy x1 < x2 and y1 < y2",
                x1, y1, x2, y2
            )));
        }
        Ok(Self { x1, y1, x2, y2 })
    }

    /// Containment anchor: bottom-center of the box (where a person stands).
    /// Historical counts depend on this choice; do not change it.
    pub fn anchor(&self) -> (f64, f64) {
        ((self.x1 as f64 + self.x2 as f64) / 2.0, self.y2 as f64)
    }

    pub fn width(&self) -> u32 {
        (self.x2 - self.x1) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1) as u32
    }
}

impl TryFrom<[i32; 4]> for BBox {
    type Error = OccupancyError;

    fn try_from(b: [i32; 4]) -> Result<Self, Self::Error> {
        BBox::new(b[0], b[1], b[2], b[3])
    }
}

impl From<BBox> for [i32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Person,
    Other,
}

impl ObjectClass {
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "person" | "0" => ObjectClass::Person,
            _ => ObjectClass::Other,
        }
    }
}

/// One tracked object in one frame, as produced by the detector+tracker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class: ObjectClass,
    pub tracker_id: u64,
}

impl Detection {
    pub fn person(bbox: BBox, confidence: f32, tracker_id: u64) -> OccupancyResult<Self> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(OccupancyError::invalid_input(format!(
                "confidence {} out of [0, 1]",
                confidence
            )));
        }
        Ok(Self {
            bbox,
            confidence,
            class: ObjectClass::Person,
            tracker_id,
        })
    }
}

// -------------------- Composite tracker keys --------------------

/// Namespaces collaborator tracker IDs, which restart from zero with every
/// process, so keys from different runs never collide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerNamespace {
    /// `"<program start epoch ms>_<tracker id>"`.
    ProcessStart(i64),
    /// `"<run id>_<tracker id>"`.
    Run(String),
}

impl TrackerNamespace {
    pub fn from_process_start() -> Result<Self> {
        Ok(TrackerNamespace::ProcessStart(now_ms()?))
    }

    pub fn composite_key(&self, tracker_id: u64) -> String {
        match self {
            TrackerNamespace::ProcessStart(epoch_ms) => format!("{}_{}", epoch_ms, tracker_id),
            TrackerNamespace::Run(run_id) => format!("{}_{}", run_id, tracker_id),
        }
    }
}

// -------------------- Records --------------------

/// Outcome of the snapshot step for one detection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SnapshotRef {
    Uploaded { url: String, object_path: String },
    /// An upload was attempted and failed.
    Failed { reason: String },
    /// No pixels were available for this frame; nothing was attempted.
    NotCaptured,
}

impl SnapshotRef {
    pub fn is_failed(&self) -> bool {
        matches!(self, SnapshotRef::Failed { .. })
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            SnapshotRef::Uploaded { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// One detection captured at one tick. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub confidence: f32,
    pub bbox: BBox,
    pub tracker_key: String,
    pub snapshot: SnapshotRef,
    pub timestamp_ms: i64,
}

/// One zone at one capture tick. Append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    pub zone_id: RecordId,
    pub in_count: u32,
    pub out_count: u32,
    pub in_people_ids: Vec<RecordId>,
    pub out_people_ids: Vec<RecordId>,
    pub in_tracker_keys: Vec<String>,
    pub out_tracker_keys: Vec<String>,
    /// Informational: PersonRecords sharing each "in" key at write time.
    pub in_occurrences: BTreeMap<String, u64>,
    pub timestamp_ms: i64,
}
