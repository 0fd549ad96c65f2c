use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::{
    open_db_connection, shared_memory_uri, CountRecord, OccupancyError, PersonRecord, Point,
    RecordId, Zone, ZoneKey,
};

/// Zone definitions, keyed by `(location, area_name)`.
pub trait ZoneStore: Send {
    fn insert_zone(&mut self, zone: &Zone) -> Result<RecordId>;

    /// Returns false when no zone matched the key.
    fn update_zone_polygon(
        &mut self,
        key: &ZoneKey,
        polygon: &[Point],
        updated_at_ms: i64,
    ) -> Result<bool>;

    /// Returns false when no zone matched the key.
    fn delete_zone(&mut self, key: &ZoneKey) -> Result<bool>;

    fn find_zone(&mut self, key: &ZoneKey) -> Result<Option<Zone>>;

    fn zone_exists(&mut self, key: &ZoneKey) -> Result<bool>;

    /// Ordered by location, then area name.
    fn list_zones(&mut self, location: Option<&str>) -> Result<Vec<Zone>>;
}

fn duplicate_zone(zone: &Zone) -> OccupancyError {
    OccupancyError::already_exists(format!("area {} already exists", zone.key()))
}

/// Inclusive timestamp bounds for count queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountFilter {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl CountFilter {
    fn matches(&self, timestamp_ms: i64) -> bool {
        self.start_ms.map_or(true, |start| timestamp_ms >= start)
            && self.end_ms.map_or(true, |end| timestamp_ms <= end)
    }
}

/// Append-only person and count log.
pub trait RecordStore: Send {
    /// All-or-nothing bulk insert; ids are returned in input order.
    fn insert_people(&mut self, people: &[PersonRecord]) -> Result<Vec<RecordId>>;

    /// Records in the same order as `ids`; unknown ids are skipped.
    fn get_people(&mut self, ids: &[RecordId]) -> Result<Vec<PersonRecord>>;

    fn count_people_with_tracker_key(&mut self, tracker_key: &str) -> Result<u64>;

    fn count_people(&mut self) -> Result<u64>;

    fn insert_count(&mut self, count: &CountRecord) -> Result<RecordId>;

    /// Newest first.
    fn find_counts(
        &mut self,
        filter: &CountFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<CountRecord>>;

    fn count_counts(&mut self, filter: &CountFilter) -> Result<u64>;

    fn latest_count(&mut self) -> Result<Option<CountRecord>>;
}

// -------------------- SQLite --------------------

pub struct SqliteStore {
    conn: Connection,
    db_path: String,
}

impl SqliteStore {
    /// Opens (and migrates) the database. `":memory:"` becomes a shared-cache
    /// URI so sibling handles from `reopen` see the same data.
    pub fn open(db_path: &str, timeout: Duration) -> Result<Self> {
        let db_path = if db_path == ":memory:" {
            shared_memory_uri()
        } else {
            db_path.to_string()
        };
        let conn = open_db_connection(&db_path, timeout)?;
        let mut store = Self { conn, db_path };
        store.ensure_schema()?;
        Ok(store)
    }

    /// A second connection to the same database, for another thread.
    pub fn reopen(&self, timeout: Duration) -> Result<Self> {
        Self::open(&self.db_path, timeout)
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS areas (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              location TEXT NOT NULL,
              area_name TEXT NOT NULL,
              polygon_json TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS people (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_ms INTEGER NOT NULL,
              tracker_key TEXT NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS counts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              zone_id INTEGER NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              in_count INTEGER NOT NULL,
              out_count INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_areas_key ON areas(location, area_name);
            CREATE INDEX IF NOT EXISTS idx_people_tracker ON people(tracker_key);
            CREATE INDEX IF NOT EXISTS idx_counts_timestamp ON counts(timestamp_ms);
            "#,
        )?;
        Ok(())
    }

    fn zone_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode_zone(raw: (i64, String, String, String, i64)) -> Result<Zone> {
        let (id, location, area_name, polygon_json, updated_at_ms) = raw;
        let polygon: Vec<Point> = serde_json::from_str(&polygon_json)
            .map_err(|e| anyhow!("corrupt areas.polygon_json for id {}: {}", id, e))?;
        Ok(Zone {
            id: Some(id),
            location,
            area_name,
            polygon,
            updated_at_ms,
        })
    }

    fn decode_count(id: i64, payload: &str) -> Result<CountRecord> {
        let mut record: CountRecord = serde_json::from_str(payload)
            .map_err(|e| anyhow!("corrupt counts.payload_json for id {}: {}", id, e))?;
        record.id = Some(id);
        Ok(record)
    }
}

impl ZoneStore for SqliteStore {
    fn insert_zone(&mut self, zone: &Zone) -> Result<RecordId> {
        let polygon_json = serde_json::to_string(&zone.polygon)?;
        let inserted = self.conn.execute(
            r#"
            INSERT INTO areas(location, area_name, polygon_json, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![zone.location, zone.area_name, polygon_json, zone.updated_at_ms],
        );
        match inserted {
            Ok(_) => Ok(self.conn.last_insert_rowid()),
            // Another writer won the race for the unique (location, area_name) pair.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(duplicate_zone(zone).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn update_zone_polygon(
        &mut self,
        key: &ZoneKey,
        polygon: &[Point],
        updated_at_ms: i64,
    ) -> Result<bool> {
        let polygon_json = serde_json::to_string(polygon)?;
        let changed = self.conn.execute(
            "UPDATE areas SET polygon_json = ?1, updated_at_ms = ?2 WHERE location = ?3 AND area_name = ?4",
            params![polygon_json, updated_at_ms, key.location, key.area_name],
        )?;
        Ok(changed > 0)
    }

    fn delete_zone(&mut self, key: &ZoneKey) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM areas WHERE location = ?1 AND area_name = ?2",
            params![key.location, key.area_name],
        )?;
        Ok(changed > 0)
    }

    fn find_zone(&mut self, key: &ZoneKey) -> Result<Option<Zone>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, location, area_name, polygon_json, updated_at_ms FROM areas WHERE location = ?1 AND area_name = ?2",
                params![key.location, key.area_name],
                Self::zone_from_row,
            )
            .optional()?;
        raw.map(Self::decode_zone).transpose()
    }

    fn zone_exists(&mut self, key: &ZoneKey) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM areas WHERE location = ?1 AND area_name = ?2",
            params![key.location, key.area_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_zones(&mut self, location: Option<&str>) -> Result<Vec<Zone>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, location, area_name, polygon_json, updated_at_ms FROM areas
            WHERE (?1 IS NULL OR location = ?1)
            ORDER BY location ASC, area_name ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![location], Self::zone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(Self::decode_zone).collect()
    }
}

impl RecordStore for SqliteStore {
    fn insert_people(&mut self, people: &[PersonRecord]) -> Result<Vec<RecordId>> {
        let tx = self.conn.transaction()?;
        let mut ids = Vec::with_capacity(people.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO people(timestamp_ms, tracker_key, payload_json) VALUES (?1, ?2, ?3)",
            )?;
            for person in people {
                let payload_json = serde_json::to_string(person)?;
                stmt.execute(params![person.timestamp_ms, person.tracker_key, payload_json])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn get_people(&mut self, ids: &[RecordId]) -> Result<Vec<PersonRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM people WHERE id = ?1")?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let payload: Option<String> = stmt
                .query_row(params![id], |row| row.get(0))
                .optional()?;
            if let Some(payload) = payload {
                let person = serde_json::from_str(&payload)
                    .map_err(|e| anyhow!("corrupt people.payload_json for id {}: {}", id, e))?;
                out.push(person);
            }
        }
        Ok(out)
    }

    fn count_people_with_tracker_key(&mut self, tracker_key: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM people WHERE tracker_key = ?1",
            params![tracker_key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_people(&mut self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM people", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn insert_count(&mut self, count: &CountRecord) -> Result<RecordId> {
        let mut payload = count.clone();
        payload.id = None;
        let payload_json = serde_json::to_string(&payload)?;
        self.conn.execute(
            r#"
            INSERT INTO counts(zone_id, timestamp_ms, in_count, out_count, payload_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                count.zone_id,
                count.timestamp_ms,
                count.in_count,
                count.out_count,
                payload_json
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn find_counts(
        &mut self,
        filter: &CountFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<CountRecord>> {
        let payloads = {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT id, payload_json FROM counts
                WHERE (?1 IS NULL OR timestamp_ms >= ?1) AND (?2 IS NULL OR timestamp_ms <= ?2)
                ORDER BY timestamp_ms DESC, id DESC
                LIMIT ?3 OFFSET ?4
                "#,
            )?;
            let rows = stmt.query_map(
                params![filter.start_ms, filter.end_ms, limit as i64, skip as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        payloads
            .iter()
            .map(|(id, payload)| Self::decode_count(*id, payload))
            .collect()
    }

    fn count_counts(&mut self, filter: &CountFilter) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM counts WHERE (?1 IS NULL OR timestamp_ms >= ?1) AND (?2 IS NULL OR timestamp_ms <= ?2)",
            params![filter.start_ms, filter.end_ms],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn latest_count(&mut self) -> Result<Option<CountRecord>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, payload_json FROM counts ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, payload)| Self::decode_count(id, &payload))
            .transpose()
    }
}

// -------------------- In-memory --------------------

#[derive(Debug, Default)]
struct InMemoryState {
    zones: Vec<Zone>,
    people: Vec<(RecordId, PersonRecord)>,
    counts: Vec<CountRecord>,
    next_id: RecordId,
    unavailable: bool,
    fail_person_inserts: bool,
    fail_count_inserts: bool,
    fail_count_inserts_for_zone: Option<RecordId>,
}

impl InMemoryState {
    fn next_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

/// Clonable in-memory store; clones share state. Faults can be injected to
/// simulate an unreachable backend or failing writes.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    pub fn fail_person_inserts(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_person_inserts = fail;
        }
    }

    pub fn fail_count_inserts(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_count_inserts = fail;
        }
    }

    /// Fails count inserts for one zone only.
    pub fn fail_count_inserts_for_zone(&self, zone_id: Option<RecordId>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_count_inserts_for_zone = zone_id;
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?;
        if state.unavailable {
            return Err(anyhow!("in-memory store unavailable"));
        }
        Ok(state)
    }
}

impl ZoneStore for InMemoryStore {
    fn insert_zone(&mut self, zone: &Zone) -> Result<RecordId> {
        let mut state = self.state()?;
        if state
            .zones
            .iter()
            .any(|z| z.location == zone.location && z.area_name == zone.area_name)
        {
            return Err(duplicate_zone(zone).into());
        }
        let id = state.next_id();
        let mut stored = zone.clone();
        stored.id = Some(id);
        state.zones.push(stored);
        Ok(id)
    }

    fn update_zone_polygon(
        &mut self,
        key: &ZoneKey,
        polygon: &[Point],
        updated_at_ms: i64,
    ) -> Result<bool> {
        let mut state = self.state()?;
        let Some(zone) = state
            .zones
            .iter_mut()
            .find(|z| z.location == key.location && z.area_name == key.area_name)
        else {
            return Ok(false);
        };
        zone.polygon = polygon.to_vec();
        zone.updated_at_ms = updated_at_ms;
        Ok(true)
    }

    fn delete_zone(&mut self, key: &ZoneKey) -> Result<bool> {
        let mut state = self.state()?;
        let before = state.zones.len();
        state
            .zones
            .retain(|z| !(z.location == key.location && z.area_name == key.area_name));
        Ok(state.zones.len() < before)
    }

    fn find_zone(&mut self, key: &ZoneKey) -> Result<Option<Zone>> {
        let state = self.state()?;
        Ok(state
            .zones
            .iter()
            .find(|z| z.location == key.location && z.area_name == key.area_name)
            .cloned())
    }

    fn zone_exists(&mut self, key: &ZoneKey) -> Result<bool> {
        Ok(self.find_zone(key)?.is_some())
    }

    fn list_zones(&mut self, location: Option<&str>) -> Result<Vec<Zone>> {
        let state = self.state()?;
        let mut zones: Vec<Zone> = state
            .zones
            .iter()
            .filter(|z| location.map_or(true, |loc| z.location == loc))
            .cloned()
            .collect();
        zones.sort_by(|a, b| {
            (a.location.as_str(), a.area_name.as_str())
                .cmp(&(b.location.as_str(), b.area_name.as_str()))
        });
        Ok(zones)
    }
}

impl RecordStore for InMemoryStore {
    fn insert_people(&mut self, people: &[PersonRecord]) -> Result<Vec<RecordId>> {
        let mut state = self.state()?;
        if state.fail_person_inserts {
            return Err(anyhow!("injected failure: people bulk insert"));
        }
        let mut ids = Vec::with_capacity(people.len());
        for person in people {
            let id = state.next_id();
            state.people.push((id, person.clone()));
            ids.push(id);
        }
        Ok(ids)
    }

    fn get_people(&mut self, ids: &[RecordId]) -> Result<Vec<PersonRecord>> {
        let state = self.state()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .people
                    .iter()
                    .find(|(pid, _)| pid == id)
                    .map(|(_, p)| p.clone())
            })
            .collect())
    }

    fn count_people_with_tracker_key(&mut self, tracker_key: &str) -> Result<u64> {
        let state = self.state()?;
        Ok(state
            .people
            .iter()
            .filter(|(_, p)| p.tracker_key == tracker_key)
            .count() as u64)
    }

    fn count_people(&mut self) -> Result<u64> {
        Ok(self.state()?.people.len() as u64)
    }

    fn insert_count(&mut self, count: &CountRecord) -> Result<RecordId> {
        let mut state = self.state()?;
        if state.fail_count_inserts || state.fail_count_inserts_for_zone == Some(count.zone_id) {
            return Err(anyhow!("injected failure: count insert"));
        }
        let id = state.next_id();
        let mut stored = count.clone();
        stored.id = Some(id);
        state.counts.push(stored);
        Ok(id)
    }

    fn find_counts(
        &mut self,
        filter: &CountFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<CountRecord>> {
        let state = self.state()?;
        let mut matching: Vec<&CountRecord> = state
            .counts
            .iter()
            .filter(|c| filter.matches(c.timestamp_ms))
            .collect();
        matching.sort_by(|a, b| (b.timestamp_ms, b.id).cmp(&(a.timestamp_ms, a.id)));
        Ok(matching
            .into_iter()
            .skip(skip as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn count_counts(&mut self, filter: &CountFilter) -> Result<u64> {
        let state = self.state()?;
        Ok(state
            .counts
            .iter()
            .filter(|c| filter.matches(c.timestamp_ms))
            .count() as u64)
    }

    fn latest_count(&mut self) -> Result<Option<CountRecord>> {
        Ok(self.find_counts(&CountFilter::default(), 0, 1)?.into_iter().next())
    }
}
