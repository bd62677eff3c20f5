//! Config error-message, validation, and atomic-write-safety integration tests.
//! Storage: ~/.ferry/config.yaml

use assert_fs::prelude::*;
use ferry_core::{
    config::{self, SyncConfig},
    ConfigError, NodeName, ShareName, SourceRegistry,
};
use predicates::prelude::predicate;
use rstest::rstest;
use std::fs;

fn sample() -> SyncConfig {
    SyncConfig::new(
        "orion",
        "/data/orion",
        vec![NodeName::from("node-01"), NodeName::from("node-02")],
        vec![ShareName::from("d")],
    )
}

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ConfigNotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("config not found"));
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".ferry/config.yaml")
        .write_binary(b": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"), "must contain file path, got: {err}");
}

#[test]
fn load_rejects_semantically_invalid_config() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".ferry/config.yaml")
        .write_str("project_name: orion\ndestination_root: /data\nnodes: []\nshares: [d]\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    assert!(err.to_string().contains("node"));
}

// ---------------------------------------------------------------------------
// 2. Validation
// ---------------------------------------------------------------------------

#[rstest]
#[case("empty_project", |c: &mut SyncConfig| c.project_name = " ".into(), "project_name")]
#[case("no_shares", |c: &mut SyncConfig| c.shares.clear(), "share")]
#[case("dup_node", |c: &mut SyncConfig| c.nodes.push(NodeName::from("NODE-01")), "duplicate node")]
#[case("zero_threads", |c: &mut SyncConfig| c.max_parallelism = 0, "max_parallelism")]
#[case("zero_idle", |c: &mut SyncConfig| c.idle_timeout_minutes = 0, "idle_timeout")]
#[case("bad_template", |c: &mut SyncConfig| c.source_template = "/mnt/{node}".into(), "{share}")]
#[case("zero_quorum", |c: &mut SyncConfig| c.expected_sources = Some(0), "expected_sources")]
fn validation_rejects(
    #[case] label: &str,
    #[case] mutate: fn(&mut SyncConfig),
    #[case] needle: &str,
) {
    let mut cfg = sample();
    mutate(&mut cfg);
    let err = cfg.validate().unwrap_err();
    assert!(
        err.to_string().contains(needle),
        "[{label}] expected '{needle}' in: {err}"
    );
}

#[test]
fn sample_config_is_valid() {
    sample().validate().expect("valid");
}

#[test]
fn huge_minute_and_megabyte_values_saturate() {
    let mut cfg = sample();
    cfg.idle_timeout_minutes = u64::MAX;
    cfg.overdue_capture_minutes = u64::MAX / 2;
    cfg.safety_margin_mb = u64::MAX;
    cfg.hard_floor_mb = u64::MAX;
    cfg.validate().expect("valid");

    assert_eq!(cfg.idle_timeout(), std::time::Duration::from_secs(u64::MAX));
    assert_eq!(cfg.overdue_capture_age(), std::time::Duration::from_secs(u64::MAX));
    assert_eq!(cfg.safety_margin_bytes(), u64::MAX);
    assert_eq!(cfg.hard_floor_bytes(), u64::MAX);
}

// ---------------------------------------------------------------------------
// 3. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_creates_config_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &sample()).expect("save");
    home.child(".ferry/config.yaml").assert(predicate::path::exists());
    home.child(".ferry/config.yaml.tmp").assert(predicate::path::missing());
}

#[test]
fn mid_write_crash_leaves_original_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let path = config::save_at(home.path(), &sample()).expect("save");
    let original_bytes = fs::read(&path).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    let tmp = path.with_file_name("config.yaml.tmp");
    fs::write(&tmp, b"CRASH - INCOMPLETE WRITE").expect("write crash tmp");

    assert_eq!(original_bytes, fs::read(&path).expect("read after crash"));
    let loaded = config::load_at(home.path()).expect("load after crash");
    assert_eq!(loaded, sample());
}

// ---------------------------------------------------------------------------
// 4. Registry built from config
// ---------------------------------------------------------------------------

#[test]
fn registry_from_config_covers_every_pair() {
    let registry = SourceRegistry::from_config(&sample());
    assert_eq!(registry.len(), 2);
    let keys: Vec<String> = registry
        .discover(&sample().project_name)
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(keys, ["node-01/d", "node-02/d"]);
}
