//! Zone registry: persisted zone CRUD plus the in-memory snapshot the frame
//! loop reads.
//!
//! The snapshot is an immutable `Arc<ZoneSnapshot>` behind a `SnapshotCell`.
//! A refresh builds a complete new snapshot off-lock and swaps the pointer;
//! the lock is never held across a store call. Readers clone the `Arc` and
//! keep evaluating against it even if a newer snapshot lands meanwhile.

use std::sync::{Arc, RwLock};

use crate::storage::ZoneStore;
use crate::{now_ms, validate_name, OccupancyError, OccupancyResult, Point, Zone, ZoneKey};

pub mod refresher;
pub mod seed;

pub use refresher::{spawn_refresher, RefreshHandle};
pub use seed::{import_zones, load_seed_file, parse_seed, ImportReport, SeedFormat};

/// Immutable set of zones for one location, as of one refresh.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoneSnapshot {
    location: String,
    zones: Vec<Zone>,
    refreshed_at_ms: i64,
}

impl ZoneSnapshot {
    pub fn new(location: &str, zones: Vec<Zone>, refreshed_at_ms: i64) -> Self {
        Self {
            location: location.to_string(),
            zones,
            refreshed_at_ms,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn refreshed_at_ms(&self) -> i64 {
        self.refreshed_at_ms
    }

    pub fn find(&self, area_name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.area_name == area_name)
    }
}

/// Shared pointer slot for the current snapshot. Clones share the slot.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCell {
    inner: Arc<RwLock<Arc<ZoneSnapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<ZoneSnapshot> {
        // A poisoned lock still holds a complete snapshot; the swap is a
        // single pointer store.
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn store(&self, snapshot: Arc<ZoneSnapshot>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

pub struct ZoneRegistry<S: ZoneStore> {
    store: S,
    cell: SnapshotCell,
}

impl<S: ZoneStore> ZoneRegistry<S> {
    pub fn new(store: S) -> Self {
        Self::with_cell(store, SnapshotCell::new())
    }

    /// Registry publishing into an existing cell (e.g. one the frame loop reads).
    pub fn with_cell(store: S, cell: SnapshotCell) -> Self {
        Self { store, cell }
    }

    pub fn cell(&self) -> SnapshotCell {
        self.cell.clone()
    }

    pub fn snapshot(&self) -> Arc<ZoneSnapshot> {
        self.cell.load()
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Re-fetches one zone per requested area and swaps the snapshot in.
    ///
    /// All-or-nothing: a missing area (`NotFound`) or a store failure
    /// (`UpstreamUnavailable`) leaves the previous snapshot published.
    pub fn refresh(
        &mut self,
        location: &str,
        area_names: &[String],
    ) -> OccupancyResult<Arc<ZoneSnapshot>> {
        validate_name("location", location)?;
        if area_names.is_empty() {
            return Err(OccupancyError::invalid_input(
                "refresh requires at least one area",
            ));
        }
        let mut zones = Vec::with_capacity(area_names.len());
        let mut missing = Vec::new();
        for area in area_names {
            let key = ZoneKey::new(location, area);
            key.validate()?;
            match self.store.find_zone(&key).map_err(OccupancyError::upstream)? {
                Some(zone) if zone.id.is_some() => zones.push(zone),
                Some(_) => {
                    return Err(OccupancyError::server(format!(
                        "zone {} has no persisted id",
                        key
                    )))
                }
                None => missing.push(area.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(OccupancyError::not_found(format!(
                "areas [{}] not found at location `{}`",
                missing.join(", "),
                location
            )));
        }
        let refreshed_at_ms = now_ms().map_err(|e| OccupancyError::server(e.to_string()))?;
        let snapshot = Arc::new(ZoneSnapshot::new(location, zones, refreshed_at_ms));
        self.cell.store(snapshot.clone());
        Ok(snapshot)
    }

    /// Creates a zone. Fails with `AlreadyExists` when the pair is taken.
    pub fn set(&mut self, zone: Zone) -> OccupancyResult<Zone> {
        zone.validate()?;
        let key = zone.key();
        if self.store.zone_exists(&key).map_err(OccupancyError::upstream)? {
            return Err(OccupancyError::already_exists(format!(
                "area {} already exists",
                key
            )));
        }
        let id = self
            .store
            .insert_zone(&zone)
            .map_err(OccupancyError::from_store)?;
        log::info!("zone {} created (id {})", key, id);
        Ok(Zone {
            id: Some(id),
            ..zone
        })
    }

    /// Replaces the polygon of an existing zone. Never creates one.
    pub fn update(&mut self, key: &ZoneKey, polygon: Vec<Point>) -> OccupancyResult<Zone> {
        key.validate()?;
        crate::validate_polygon(&polygon)?;
        let updated_at_ms = now_ms().map_err(|e| OccupancyError::server(e.to_string()))?;
        let matched = self
            .store
            .update_zone_polygon(key, &polygon, updated_at_ms)
            .map_err(OccupancyError::upstream)?;
        if !matched {
            return Err(OccupancyError::not_found(format!("area {} not found", key)));
        }
        log::info!("zone {} updated", key);
        self.get(key)
    }

    pub fn delete(&mut self, key: &ZoneKey) -> OccupancyResult<()> {
        key.validate()?;
        let deleted = self
            .store
            .delete_zone(key)
            .map_err(OccupancyError::upstream)?;
        if !deleted {
            return Err(OccupancyError::not_found(format!("area {} not found", key)));
        }
        log::info!("zone {} deleted", key);
        Ok(())
    }

    pub fn get(&mut self, key: &ZoneKey) -> OccupancyResult<Zone> {
        key.validate()?;
        self.store
            .find_zone(key)
            .map_err(OccupancyError::upstream)?
            .ok_or_else(|| OccupancyError::not_found(format!("area {} not found", key)))
    }

    pub fn list(&mut self, location: Option<&str>) -> OccupancyResult<Vec<Zone>> {
        if let Some(location) = location {
            validate_name("location", location)?;
        }
        self.store
            .list_zones(location)
            .map_err(OccupancyError::upstream)
    }

    /// Area names at a location; empty when the location has none.
    pub fn area_names(&mut self, location: &str) -> OccupancyResult<Vec<String>> {
        Ok(self
            .list(Some(location))?
            .into_iter()
            .map(|z| z.area_name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::{polygon_from_pairs, ErrorKind};

    fn square() -> Vec<Point> {
        polygon_from_pairs(&[[0, 0], [10, 0], [10, 10], [0, 10]])
    }

    fn zone(area: &str) -> Zone {
        Zone::new("plaza", area, square()).unwrap()
    }

    #[test]
    fn set_twice_is_already_exists() {
        let mut registry = ZoneRegistry::new(InMemoryStore::new());
        let created = registry.set(zone("gate")).unwrap();
        assert!(created.id.is_some());
        let err = registry.set(zone("gate")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    /// Sees no existing zones, like a writer that lost a race to another
    /// process between the existence check and the insert.
    struct StaleReads(InMemoryStore);

    impl ZoneStore for StaleReads {
        fn insert_zone(&mut self, zone: &Zone) -> anyhow::Result<crate::RecordId> {
            self.0.insert_zone(zone)
        }
        fn update_zone_polygon(
            &mut self,
            key: &ZoneKey,
            polygon: &[Point],
            updated_at_ms: i64,
        ) -> anyhow::Result<bool> {
            self.0.update_zone_polygon(key, polygon, updated_at_ms)
        }
        fn delete_zone(&mut self, key: &ZoneKey) -> anyhow::Result<bool> {
            self.0.delete_zone(key)
        }
        fn find_zone(&mut self, key: &ZoneKey) -> anyhow::Result<Option<Zone>> {
            self.0.find_zone(key)
        }
        fn zone_exists(&mut self, _: &ZoneKey) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn list_zones(&mut self, location: Option<&str>) -> anyhow::Result<Vec<Zone>> {
            self.0.list_zones(location)
        }
    }

    #[test]
    fn concurrent_duplicate_insert_is_already_exists() {
        let shared = InMemoryStore::new();
        ZoneRegistry::new(shared.clone()).set(zone("gate")).unwrap();
        let mut racing = ZoneRegistry::new(StaleReads(shared));
        let err = racing.set(zone("gate")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn update_and_delete_never_created_are_not_found() {
        let mut registry = ZoneRegistry::new(InMemoryStore::new());
        let key = ZoneKey::new("plaza", "gaet");
        assert_eq!(
            registry.update(&key, square()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(registry.delete(&key).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(registry.list(None).unwrap().is_empty(), "update must not upsert");
    }

    #[test]
    fn refresh_swaps_in_a_new_snapshot() {
        let mut registry = ZoneRegistry::new(InMemoryStore::new());
        registry.set(zone("gate")).unwrap();
        registry.set(zone("lobby")).unwrap();
        let before = registry.snapshot();
        assert!(before.is_empty());

        let areas = vec!["gate".to_string(), "lobby".to_string()];
        let snap = registry.refresh("plaza", &areas).unwrap();
        assert_eq!(snap.zones().len(), 2);
        assert_eq!(registry.snapshot().zones().len(), 2);
        assert!(before.is_empty(), "old readers keep their snapshot");
    }

    #[test]
    fn refresh_with_missing_area_keeps_previous_snapshot() {
        let mut registry = ZoneRegistry::new(InMemoryStore::new());
        registry.set(zone("gate")).unwrap();
        registry.refresh("plaza", &["gate".to_string()]).unwrap();

        let err = registry
            .refresh("plaza", &["gate".to_string(), "lobby".to_string()])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("lobby"));
        assert_eq!(registry.snapshot().zones().len(), 1);
    }

    #[test]
    fn refresh_during_outage_keeps_previous_snapshot() {
        let store = InMemoryStore::new();
        let mut registry = ZoneRegistry::new(store.clone());
        registry.set(zone("gate")).unwrap();
        let good = registry.refresh("plaza", &["gate".to_string()]).unwrap();

        store.set_unavailable(true);
        let err = registry.refresh("plaza", &["gate".to_string()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert_eq!(*registry.snapshot(), *good);
    }

    #[test]
    fn area_names_lists_location_only() {
        let mut registry = ZoneRegistry::new(InMemoryStore::new());
        registry.set(zone("gate")).unwrap();
        registry
            .set(Zone::new("station", "platform", square()).unwrap())
            .unwrap();
        assert_eq!(registry.area_names("plaza").unwrap(), vec!["gate".to_string()]);
        assert!(registry.area_names("nowhere").unwrap().is_empty());
    }
}
