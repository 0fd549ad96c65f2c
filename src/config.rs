use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "occupancy.db";
const DEFAULT_LOCATION: &str = "kepatihan";
const DEFAULT_AREA: &str = "depan_gerbang_masuk";
const DEFAULT_CAPTURE_INTERVAL_SECS: u64 = 5;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
const DEFAULT_SNAPSHOT_ROOT: &str = "snapshots";
const DEFAULT_SNAPSHOT_BUCKET: &str = "synapsis";
const DEFAULT_URL_TTL_SECS: u64 = 60 * 60 * 24 * 7;
const MAX_URL_TTL_SECS: u64 = 60 * 60 * 24 * 365;
const DEFAULT_UPLOAD_WORKERS: usize = 4;
const MAX_UPLOAD_WORKERS: usize = 32;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_STARTUP_REFRESH_ATTEMPTS: u32 = 3;
const DEFAULT_STARTUP_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_INPUT: &str = "-";

/// Development-only signing secret. Rejected when `OCCUPANCY_STRICT=1`.
pub const DEV_SIGNING_SECRET: &str = "zone-occupancy-dev-signing-secret";

#[derive(Debug, Deserialize, Default)]
struct OccupancyConfigFile {
    db_path: Option<String>,
    location: Option<String>,
    areas: Option<Vec<String>>,
    capture_interval_secs: Option<u64>,
    refresh_interval_secs: Option<u64>,
    snapshots: Option<SnapshotConfigFile>,
    upload_workers: Option<usize>,
    store_timeout_ms: Option<u64>,
    startup_refresh_attempts: Option<u32>,
    startup_retry_delay_ms: Option<u64>,
    api: Option<ApiConfigFile>,
    input: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SnapshotConfigFile {
    root: Option<PathBuf>,
    bucket: Option<String>,
    url_ttl_secs: Option<u64>,
    base_url: Option<String>,
    signing_secret: Option<String>,
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub location: String,
    pub areas: Vec<String>,
    pub capture_interval: Duration,
    pub refresh_interval: Duration,
    pub snapshots: SnapshotSettings,
    pub upload_workers: usize,
    pub store_timeout: Duration,
    pub startup_refresh_attempts: u32,
    pub startup_retry_delay: Duration,
    pub api: ApiSettings,
    /// Path to a JSON-lines detection stream, or `-` for stdin.
    pub input: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub root: PathBuf,
    pub bucket: String,
    pub url_ttl: Duration,
    pub base_url: String,
    pub signing_secret: String,
    /// Remote object store endpoint; only used with `object-store-http`.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub enabled: bool,
}

impl PipelineConfig {
    pub fn load() -> Result<Self> {
        let file_cfg = load_config_file()?;
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.resolve_base_url()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: OccupancyConfigFile) -> Result<Self> {
        let snapshots = file.snapshots.unwrap_or_default();
        let root = snapshots
            .root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_ROOT));
        // Empty until `resolve_base_url`, which runs after env overrides.
        let base_url = snapshots.base_url.unwrap_or_default();
        let snapshots = SnapshotSettings {
            base_url,
            root,
            bucket: snapshots
                .bucket
                .unwrap_or_else(|| DEFAULT_SNAPSHOT_BUCKET.to_string()),
            url_ttl: Duration::from_secs(snapshots.url_ttl_secs.unwrap_or(DEFAULT_URL_TTL_SECS)),
            signing_secret: snapshots
                .signing_secret
                .unwrap_or_else(|| DEV_SIGNING_SECRET.to_string()),
            endpoint: snapshots.endpoint,
        };
        let api = ApiSettings {
            addr: file
                .api
                .as_ref()
                .and_then(|api| api.addr.clone())
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            enabled: file.api.and_then(|api| api.enabled).unwrap_or(false),
        };
        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            location: file
                .location
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            areas: file
                .areas
                .unwrap_or_else(|| vec![DEFAULT_AREA.to_string()]),
            capture_interval: Duration::from_secs(
                file.capture_interval_secs
                    .unwrap_or(DEFAULT_CAPTURE_INTERVAL_SECS),
            ),
            refresh_interval: Duration::from_secs(
                file.refresh_interval_secs
                    .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
            ),
            snapshots,
            upload_workers: file.upload_workers.unwrap_or(DEFAULT_UPLOAD_WORKERS),
            store_timeout: Duration::from_millis(
                file.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
            startup_refresh_attempts: file
                .startup_refresh_attempts
                .unwrap_or(DEFAULT_STARTUP_REFRESH_ATTEMPTS),
            startup_retry_delay: Duration::from_millis(
                file.startup_retry_delay_ms
                    .unwrap_or(DEFAULT_STARTUP_RETRY_DELAY_MS),
            ),
            api,
            input: file.input.unwrap_or_else(|| DEFAULT_INPUT.to_string()),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_non_empty("OCCUPANCY_DB_PATH") {
            self.db_path = path;
        }
        if let Some(location) = env_non_empty("OCCUPANCY_LOCATION") {
            self.location = location;
        }
        if let Ok(areas) = std::env::var("OCCUPANCY_AREAS") {
            let parsed = split_csv(&areas);
            if !parsed.is_empty() {
                self.areas = parsed;
            }
        }
        if let Some(secs) = env_u64("OCCUPANCY_CAPTURE_INTERVAL_SECS")? {
            self.capture_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("OCCUPANCY_REFRESH_INTERVAL_SECS")? {
            self.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(root) = env_non_empty("OCCUPANCY_SNAPSHOT_ROOT") {
            self.snapshots.root = PathBuf::from(root);
        }
        if let Some(base_url) = env_non_empty("OCCUPANCY_SNAPSHOT_BASE_URL") {
            self.snapshots.base_url = base_url;
        }
        if let Some(bucket) = env_non_empty("OCCUPANCY_SNAPSHOT_BUCKET") {
            self.snapshots.bucket = bucket;
        }
        if let Some(secret) = env_non_empty("OCCUPANCY_SNAPSHOT_SECRET") {
            self.snapshots.signing_secret = secret;
        }
        if let Some(workers) = env_u64("OCCUPANCY_UPLOAD_WORKERS")? {
            self.upload_workers = workers as usize;
        }
        if let Some(addr) = env_non_empty("OCCUPANCY_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(input) = env_non_empty("OCCUPANCY_INPUT") {
            self.input = input;
        }
        Ok(())
    }

    /// Defaults `base_url` to a `file://` URL of the absolute snapshot root.
    fn resolve_base_url(&mut self) -> Result<()> {
        if !self.snapshots.base_url.trim().is_empty() {
            return Ok(());
        }
        let root = std::path::absolute(&self.snapshots.root).map_err(|e| {
            anyhow!(
                "cannot resolve snapshot root {}: {}",
                self.snapshots.root.display(),
                e
            )
        })?;
        let root = root.to_string_lossy();
        let root = root.trim_end_matches('/');
        self.snapshots.base_url = if root.starts_with('/') {
            format!("file://{}", root)
        } else {
            format!("file:///{}", root.replace('\\', "/"))
        };
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture_interval.is_zero() {
            return Err(anyhow!("capture_interval_secs must be greater than zero"));
        }
        if self.refresh_interval.is_zero() {
            return Err(anyhow!("refresh_interval_secs must be greater than zero"));
        }
        crate::validate_name("location", &self.location)?;
        if self.areas.is_empty() {
            return Err(anyhow!("at least one area must be configured"));
        }
        for area in &self.areas {
            crate::validate_name("area_name", area)?;
        }
        if self.upload_workers == 0 || self.upload_workers > MAX_UPLOAD_WORKERS {
            return Err(anyhow!(
                "upload_workers must be within 1..={}",
                MAX_UPLOAD_WORKERS
            ));
        }
        crate::validate_name("snapshot bucket", &self.snapshots.bucket)?;
        if self.snapshots.url_ttl.is_zero() || self.snapshots.url_ttl.as_secs() > MAX_URL_TTL_SECS {
            return Err(anyhow!(
                "snapshots.url_ttl_secs must be within 1..={}",
                MAX_URL_TTL_SECS
            ));
        }
        if self.snapshots.signing_secret.trim().is_empty() {
            return Err(anyhow!("snapshots.signing_secret must not be empty"));
        }
        if strict_mode() && self.snapshots.signing_secret == DEV_SIGNING_SECRET {
            return Err(anyhow!(
                "OCCUPANCY_STRICT=1 requires a non-default snapshots.signing_secret"
            ));
        }
        if self.startup_refresh_attempts == 0 {
            return Err(anyhow!("startup_refresh_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Settings for the façade-only daemon.
#[derive(Debug, Clone)]
pub struct ApiServiceConfig {
    pub db_path: String,
    pub api_addr: String,
    pub store_timeout: Duration,
}

impl ApiServiceConfig {
    pub fn load() -> Result<Self> {
        let file = load_config_file()?.unwrap_or_default();
        let mut cfg = Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            store_timeout: Duration::from_millis(
                file.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
            ),
        };
        if let Some(path) = env_non_empty("OCCUPANCY_DB_PATH") {
            cfg.db_path = path;
        }
        if let Some(addr) = env_non_empty("OCCUPANCY_API_ADDR") {
            cfg.api_addr = addr;
        }
        Ok(cfg)
    }
}

fn load_config_file() -> Result<Option<OccupancyConfigFile>> {
    match std::env::var("OCCUPANCY_CONFIG").ok().as_deref() {
        Some(path) => Ok(Some(read_config_file(Path::new(path))?)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<OccupancyConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn strict_mode() -> bool {
    matches!(std::env::var("OCCUPANCY_STRICT").as_deref(), Ok("1"))
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match env_non_empty(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", key)),
        None => Ok(None),
    }
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_csv_trims_and_drops_empty_entries() {
        assert_eq!(
            split_csv(" gate, ,lobby ,"),
            vec!["gate".to_string(), "lobby".to_string()]
        );
    }

    #[test]
    fn defaults_match_deployment() -> Result<()> {
        let mut cfg = PipelineConfig::from_file(OccupancyConfigFile::default())?;
        cfg.resolve_base_url()?;
        cfg.validate()?;
        assert_eq!(cfg.location, "kepatihan");
        assert_eq!(cfg.areas, vec!["depan_gerbang_masuk".to_string()]);
        assert_eq!(cfg.capture_interval, Duration::from_secs(5));
        assert_eq!(cfg.refresh_interval, Duration::from_secs(10));
        assert_eq!(cfg.snapshots.url_ttl.as_secs(), 604_800);
        let expected = std::env::current_dir()?.join("snapshots");
        assert_eq!(
            cfg.snapshots.base_url,
            format!("file://{}", expected.display())
        );
        assert!(!cfg.api.enabled);
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_interval_and_bad_workers() -> Result<()> {
        let mut cfg = PipelineConfig::from_file(OccupancyConfigFile::default())?;
        cfg.capture_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::from_file(OccupancyConfigFile::default())?;
        cfg.upload_workers = MAX_UPLOAD_WORKERS + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::from_file(OccupancyConfigFile::default())?;
        cfg.areas = vec!["../etc".into()];
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::from_file(OccupancyConfigFile::default())?;
        cfg.snapshots.url_ttl = Duration::from_secs(u64::MAX);
        assert!(cfg.validate().is_err());
        Ok(())
    }
}
