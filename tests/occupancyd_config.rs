use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use zone_occupancy::config::{ApiServiceConfig, PipelineConfig, DEV_SIGNING_SECRET};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "OCCUPANCY_CONFIG",
        "OCCUPANCY_DB_PATH",
        "OCCUPANCY_LOCATION",
        "OCCUPANCY_AREAS",
        "OCCUPANCY_CAPTURE_INTERVAL_SECS",
        "OCCUPANCY_REFRESH_INTERVAL_SECS",
        "OCCUPANCY_SNAPSHOT_ROOT",
        "OCCUPANCY_SNAPSHOT_BUCKET",
        "OCCUPANCY_SNAPSHOT_BASE_URL",
        "OCCUPANCY_SNAPSHOT_SECRET",
        "OCCUPANCY_UPLOAD_WORKERS",
        "OCCUPANCY_API_ADDR",
        "OCCUPANCY_INPUT",
        "OCCUPANCY_STRICT",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "db_path": "occupancy_prod.db",
            "location": "dewi_sartika",
            "areas": ["area1", "area2"],
            "capture_interval_secs": 3,
            "snapshots": {
                "root": "/var/lib/occupancy/snapshots",
                "bucket": "people",
                "url_ttl_secs": 3600,
                "base_url": "https://cdn.example.net/snaps",
                "signing_secret": "from-file"
            },
            "upload_workers": 8,
            "api": {
                "addr": "0.0.0.0:9000",
                "enabled": true
            },
            "input": "/run/detections.jsonl"
        }"#,
    );

    std::env::set_var("OCCUPANCY_CONFIG", file.path());
    std::env::set_var("OCCUPANCY_AREAS", "area3, area4");
    std::env::set_var("OCCUPANCY_REFRESH_INTERVAL_SECS", "30");
    std::env::set_var("OCCUPANCY_SNAPSHOT_SECRET", "from-env");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "occupancy_prod.db");
    assert_eq!(cfg.location, "dewi_sartika");
    assert_eq!(cfg.areas, vec!["area3", "area4"]);
    assert_eq!(cfg.capture_interval, Duration::from_secs(3));
    assert_eq!(cfg.refresh_interval, Duration::from_secs(30));
    assert_eq!(cfg.snapshots.bucket, "people");
    assert_eq!(cfg.snapshots.url_ttl, Duration::from_secs(3600));
    assert_eq!(cfg.snapshots.base_url, "https://cdn.example.net/snaps");
    assert_eq!(cfg.snapshots.signing_secret, "from-env");
    assert_eq!(cfg.upload_workers, 8);
    assert_eq!(cfg.api.addr, "0.0.0.0:9000");
    assert!(cfg.api.enabled);
    assert_eq!(cfg.input, "/run/detections.jsonl");

    let api = ApiServiceConfig::load().expect("load api config");
    assert_eq!(api.db_path, "occupancy_prod.db");
    assert_eq!(api.api_addr, "0.0.0.0:9000");

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("OCCUPANCY_CAPTURE_INTERVAL_SECS", "soon");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("OCCUPANCY_UPLOAD_WORKERS", "0");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("OCCUPANCY_LOCATION", "kepatihan/../../etc");
    assert!(PipelineConfig::load().is_err());
    clear_env();
}

#[test]
fn strict_mode_rejects_development_secret() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("defaults load");
    assert_eq!(cfg.snapshots.signing_secret, DEV_SIGNING_SECRET);

    std::env::set_var("OCCUPANCY_STRICT", "1");
    assert!(PipelineConfig::load().is_err());
    std::env::set_var("OCCUPANCY_SNAPSHOT_SECRET", "a-real-secret");
    assert!(PipelineConfig::load().is_ok());

    clear_env();
}

#[test]
fn snapshot_base_url_follows_the_final_root() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"snapshots": {"root": "/var/lib/occupancy/snapshots"}}"#);
    std::env::set_var("OCCUPANCY_CONFIG", file.path());
    std::env::set_var("OCCUPANCY_SNAPSHOT_ROOT", "/data/snaps");
    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.snapshots.root, std::path::PathBuf::from("/data/snaps"));
    assert_eq!(cfg.snapshots.base_url, "file:///data/snaps");

    std::env::set_var("OCCUPANCY_SNAPSHOT_ROOT", "relative/snaps");
    let cfg = PipelineConfig::load().expect("load config");
    let expected = std::env::current_dir().unwrap().join("relative/snaps");
    assert_eq!(cfg.snapshots.base_url, format!("file://{}", expected.display()));

    std::env::set_var("OCCUPANCY_SNAPSHOT_BASE_URL", "https://cdn.example.net/snaps");
    let cfg = PipelineConfig::load().expect("load config");
    assert_eq!(cfg.snapshots.base_url, "https://cdn.example.net/snaps");

    clear_env();
}
