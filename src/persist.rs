//! Capture-tick write path: PersonRecords first, then the one CountRecord
//! that references them.
//!
//! A CountRecord is only written after every PersonRecord it references has
//! been stored. If the bulk person insert fails the tick is aborted, and any
//! snapshot already uploaded for it is logged as orphaned.

use std::collections::BTreeMap;

use crate::storage::RecordStore;
use crate::{
    CountRecord, Detection, OccupancyError, OccupancyResult, PersonRecord, RecordId, SnapshotRef,
    TrackerNamespace,
};

/// A detection together with the outcome of its snapshot attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct TickDetection {
    pub detection: Detection,
    pub snapshot: SnapshotRef,
}

/// Everything one zone contributes to one capture tick.
#[derive(Clone, Debug)]
pub struct CaptureTickInput {
    pub zone_id: RecordId,
    pub inside: Vec<TickDetection>,
    pub outside: Vec<TickDetection>,
    /// Shared by every record written for this tick.
    pub timestamp_ms: i64,
}

impl CaptureTickInput {
    pub fn is_empty(&self) -> bool {
        self.inside.is_empty() && self.outside.is_empty()
    }
}

pub struct PersistenceWriter<S: RecordStore> {
    store: S,
    namespace: TrackerNamespace,
}

impl<S: RecordStore> PersistenceWriter<S> {
    pub fn new(store: S, namespace: TrackerNamespace) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &TrackerNamespace {
        &self.namespace
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Writes one tick for one zone. An empty tick writes nothing and
    /// returns `Ok(None)`.
    pub fn write_capture_tick(
        &mut self,
        input: CaptureTickInput,
    ) -> OccupancyResult<Option<CountRecord>> {
        if input.is_empty() {
            log::debug!("zone {}: empty capture tick, nothing written", input.zone_id);
            return Ok(None);
        }

        let in_len = input.inside.len();
        let people: Vec<PersonRecord> = input
            .inside
            .iter()
            .chain(input.outside.iter())
            .map(|tick| PersonRecord {
                confidence: tick.detection.confidence,
                bbox: tick.detection.bbox,
                tracker_key: self.namespace.composite_key(tick.detection.tracker_id),
                snapshot: tick.snapshot.clone(),
                timestamp_ms: input.timestamp_ms,
            })
            .collect();

        let ids = match self.store.insert_people(&people) {
            Ok(ids) if ids.len() == people.len() => ids,
            Ok(ids) => {
                log_orphans(input.zone_id, None, &people);
                return Err(OccupancyError::server(format!(
                    "person insert returned {} ids for {} records",
                    ids.len(),
                    people.len()
                )));
            }
            Err(err) => {
                log::error!(
                    "zone {}: person insert failed, aborting capture tick: {:#}",
                    input.zone_id,
                    err
                );
                log_orphans(input.zone_id, None, &people);
                return Err(OccupancyError::server(format!(
                    "person insert failed: {:#}",
                    err
                )));
            }
        };

        let (in_people, out_people) = people.split_at(in_len);
        let (in_ids, out_ids) = ids.split_at(in_len);
        let in_tracker_keys: Vec<String> =
            in_people.iter().map(|p| p.tracker_key.clone()).collect();
        let out_tracker_keys: Vec<String> =
            out_people.iter().map(|p| p.tracker_key.clone()).collect();

        let mut in_occurrences = BTreeMap::new();
        for key in &in_tracker_keys {
            if in_occurrences.contains_key(key) {
                continue;
            }
            match self.store.count_people_with_tracker_key(key) {
                Ok(n) => {
                    in_occurrences.insert(key.clone(), n);
                }
                Err(err) => log::warn!("occurrence lookup for {} failed: {:#}", key, err),
            }
        }

        let mut record = CountRecord {
            id: None,
            zone_id: input.zone_id,
            in_count: in_len as u32,
            out_count: (people.len() - in_len) as u32,
            in_people_ids: in_ids.to_vec(),
            out_people_ids: out_ids.to_vec(),
            in_tracker_keys,
            out_tracker_keys,
            in_occurrences,
            timestamp_ms: input.timestamp_ms,
        };
        let id = self.store.insert_count(&record).map_err(|err| {
            log::error!(
                "zone {}: count insert failed after {} person record(s) were stored: {:#}",
                input.zone_id,
                ids.len(),
                err
            );
            log_orphans(input.zone_id, Some(ids.as_slice()), &people);
            OccupancyError::upstream(err)
        })?;
        record.id = Some(id);
        log::debug!(
            "zone {}: count {} written (in {}, out {})",
            record.zone_id,
            id,
            record.in_count,
            record.out_count
        );
        Ok(Some(record))
    }
}

fn log_orphans(zone_id: RecordId, ids: Option<&[RecordId]>, people: &[PersonRecord]) {
    for line in orphan_report(zone_id, ids, people) {
        log::warn!("{}", line);
    }
}

/// One line per orphan. With `ids`, the person records exist but no count
/// references them; without, only uploaded snapshots are left behind.
fn orphan_report(
    zone_id: RecordId,
    ids: Option<&[RecordId]>,
    people: &[PersonRecord],
) -> Vec<String> {
    match ids {
        Some(ids) => ids
            .iter()
            .zip(people)
            .map(|(id, person)| match &person.snapshot {
                SnapshotRef::Uploaded { object_path, .. } => format!(
                    "zone {}: orphaned person record {} ({}) with snapshot {}",
                    zone_id, id, person.tracker_key, object_path
                ),
                _ => format!(
                    "zone {}: orphaned person record {} ({})",
                    zone_id, id, person.tracker_key
                ),
            })
            .collect(),
        None => people
            .iter()
            .filter_map(|person| match &person.snapshot {
                SnapshotRef::Uploaded { url, object_path } => Some(format!(
                    "zone {}: orphaned snapshot {} for {} (no person record written): {}",
                    zone_id, object_path, person.tracker_key, url
                )),
                _ => None,
            })
            .collect(),
    }
}
