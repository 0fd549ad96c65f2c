//! Bulk zone import from a definition file.
//!
//! The file maps location names to ordered `{name, polygon}` entries:
//!
//! ```json
//! { "kepatihan": [ { "name": "depan_gerbang_masuk",
//!                    "polygon": [[735, 721], [1389, 682], [1757, 804], [891, 902]] } ] }
//! ```
//!
//! TOML files use the same shape (`[[kepatihan]]` tables).

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::ZoneRegistry;
use crate::storage::ZoneStore;
use crate::{polygon_from_pairs, ErrorKind, OccupancyError, OccupancyResult, Zone, ZoneKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedFormat {
    Json,
    Toml,
}

impl SeedFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => SeedFormat::Toml,
            _ => SeedFormat::Json,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    name: String,
    polygon: Vec<[i32; 2]>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub created: Vec<ZoneKey>,
    /// Already present; left untouched.
    pub skipped: Vec<ZoneKey>,
}

/// Parses and validates every entry. Nothing is written here, so a bad entry
/// anywhere in the file rejects the whole import.
pub fn parse_seed(raw: &str, format: SeedFormat) -> OccupancyResult<Vec<Zone>> {
    let parsed: BTreeMap<String, Vec<SeedEntry>> = match format {
        SeedFormat::Json => serde_json::from_str(raw)
            .map_err(|e| OccupancyError::invalid_input(format!("invalid zone file: {}", e)))?,
        SeedFormat::Toml => toml::from_str(raw)
            .map_err(|e| OccupancyError::invalid_input(format!("invalid zone file: {}", e)))?,
    };
    let mut zones = Vec::new();
    for (location, entries) in parsed {
        for entry in entries {
            let zone = Zone::new(&location, &entry.name, polygon_from_pairs(&entry.polygon))
                .map_err(|e| {
                    OccupancyError::invalid_input(format!(
                        "zone `{}` at `{}`: {}",
                        entry.name,
                        location,
                        e.message()
                    ))
                })?;
            zones.push(zone);
        }
    }
    Ok(zones)
}

pub fn load_seed_file(path: &Path) -> OccupancyResult<Vec<Zone>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        OccupancyError::invalid_input(format!("failed to read {}: {}", path.display(), e))
    })?;
    parse_seed(&raw, SeedFormat::from_path(path))
}

pub fn import_zones<S: ZoneStore>(
    registry: &mut ZoneRegistry<S>,
    zones: Vec<Zone>,
) -> OccupancyResult<ImportReport> {
    let mut report = ImportReport::default();
    for zone in zones {
        let key = zone.key();
        match registry.set(zone) {
            Ok(_) => report.created.push(key),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                log::info!("zone {} already present, skipping", key);
                report.skipped.push(key);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    const SEED_JSON: &str = r#"{
        "kepatihan": [
            {"name": "depan_gerbang_masuk", "polygon": [[735, 721], [1389, 682], [1757, 804], [891, 902]]}
        ],
        "dewi_sartika": [
            {"name": "area1", "polygon": [[0, 0], [10, 0], [10, 10]]},
            {"name": "area2", "polygon": [[5, 5], [15, 5], [15, 15]]}
        ]
    }"#;

    #[test]
    fn json_seed_imports_and_skips_existing() {
        let mut registry = ZoneRegistry::new(InMemoryStore::new());
        let zones = parse_seed(SEED_JSON, SeedFormat::Json).unwrap();
        assert_eq!(zones.len(), 3);
        let first = import_zones(&mut registry, zones.clone()).unwrap();
        assert_eq!(first.created.len(), 3);
        let second = import_zones(&mut registry, zones).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.skipped.len(), 3);

        let gate = registry
            .get(&ZoneKey::new("kepatihan", "depan_gerbang_masuk"))
            .unwrap();
        assert_eq!(
            gate.polygon,
            polygon_from_pairs(&[[735, 721], [1389, 682], [1757, 804], [891, 902]])
        );
    }

    #[test]
    fn toml_seed_is_accepted() {
        let raw = r#"
            [[plaza]]
            name = "gate"
            polygon = [[0, 0], [10, 0], [10, 10], [0, 10]]
        "#;
        let zones = parse_seed(raw, SeedFormat::Toml).unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].key(), ZoneKey::new("plaza", "gate"));
    }

    #[test]
    fn invalid_entry_rejects_whole_file() {
        let raw = r#"{"plaza": [
            {"name": "gate", "polygon": [[0, 0], [10, 0], [10, 10]]},
            {"name": "lobby", "polygon": [[0, 0], [10, 0]]}
        ]}"#;
        let err = parse_seed(raw, SeedFormat::Json).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.message().contains("lobby"));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(SeedFormat::from_path(Path::new("zones.TOML")), SeedFormat::Toml);
        assert_eq!(SeedFormat::from_path(Path::new("zones.json")), SeedFormat::Json);
    }
}
