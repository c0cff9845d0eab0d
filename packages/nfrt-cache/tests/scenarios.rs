//! Black-box scenario tests against a temporary store directory, exercising
//! the crate purely through its public API.

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use nfrt_cache::{AnnotatedValue, CacheKey, RestoreOutcome, SimpleOutputSpec};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

struct Node {
    outputs: BTreeMap<String, SimpleOutputSpec>,
}

impl nfrt_cache::Node for Node {
    type Output = SimpleOutputSpec;

    fn id(&self) -> &str {
        "scenario-node"
    }

    fn outputs(&self) -> &BTreeMap<String, SimpleOutputSpec> {
        &self.outputs
    }
}

fn jar_node() -> Node {
    Node { outputs: BTreeMap::from([("out".to_string(), SimpleOutputSpec::new(".jar"))]) }
}

fn components(pairs: &[(&str, &str)]) -> BTreeMap<String, AnnotatedValue> {
    pairs.iter().map(|(k, v)| (k.to_string(), AnnotatedValue::new(*v))).collect()
}

#[test]
fn s2_key_round_trips_through_json_file() {
    let dir = tempdir().unwrap();
    let key = CacheKey::new(
        "build",
        BTreeMap::from([
            ("src".to_string(), AnnotatedValue::with_annotation("deadbeef", "/tmp/s")),
            ("opt".to_string(), AnnotatedValue::new("O2")),
        ]),
    )
    .unwrap();

    let path = dir.path().join("key.json");
    fs::write(&path, key.to_json_pretty().unwrap()).unwrap();
    let contents = fs::read_to_string(&path).unwrap();
    let back = CacheKey::from_json_str(&contents).unwrap();

    assert_eq!(key, back);
    assert_eq!(back.components()["src"].annotation.as_deref(), Some("/tmp/s"));
}

#[test]
fn s3_publish_then_restore_is_a_hit_with_advanced_mtime() {
    let dir = tempdir().unwrap();
    let store = nfrt_cache::Store::new(dir.path());
    let node = jar_node();
    let key = CacheKey::new("build", components(&[("src", "deadbeef")])).unwrap();

    let scratch = dir.path().join("scratch.jar");
    fs::write(&scratch, b"P").unwrap();
    let mut produced = BTreeMap::from([("out".to_string(), scratch)]);
    store.publish(&node, &key, &mut produced).unwrap();

    let marker_path = store.layout().marker_path(&key);
    let mtime_after_publish = fs::metadata(&marker_path).unwrap().modified().unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let mut out = BTreeMap::new();
    let outcome = store.restore(&node, &key, &mut out).unwrap();
    assert_eq!(outcome, RestoreOutcome::Hit);
    assert_eq!(fs::read_to_string(&out["out"]).unwrap(), "P");

    let mtime_after_restore = fs::metadata(&marker_path).unwrap().modified().unwrap();
    assert!(mtime_after_restore >= mtime_after_publish);
}

#[test]
fn s4_deleting_an_output_after_publish_is_a_reported_miss() {
    let dir = tempdir().unwrap();
    let store = nfrt_cache::Store::new(dir.path());
    let node = jar_node();
    let key = CacheKey::new("build", components(&[("src", "cafebabe")])).unwrap();

    let scratch = dir.path().join("scratch.jar");
    fs::write(&scratch, b"P").unwrap();
    let mut produced = BTreeMap::from([("out".to_string(), scratch)]);
    store.publish(&node, &key, &mut produced).unwrap();
    fs::remove_file(&produced["out"]).unwrap();

    let mut out = BTreeMap::new();
    let outcome = store.restore(&node, &key, &mut out).unwrap();
    assert_eq!(outcome, RestoreOutcome::MissIncomplete);
    assert!(out.is_empty());
}

#[test]
fn s5_age_eviction_deletes_only_the_old_key() {
    let dir = tempdir().unwrap();
    let store = nfrt_cache::Store::new(dir.path());
    let node = jar_node();

    let old_key = CacheKey::new("build", components(&[("src", "old")])).unwrap();
    let fresh_key = CacheKey::new("build", components(&[("src", "fresh")])).unwrap();

    for key in [&old_key, &fresh_key] {
        let scratch = dir.path().join(format!("{}.jar", key.hash_value()));
        fs::write(&scratch, b"P").unwrap();
        let mut produced = BTreeMap::from([("out".to_string(), scratch)]);
        store.publish(&node, key, &mut produced).unwrap();
    }

    let old_marker = store.layout().marker_path(&old_key);
    let old_output = store.layout().output_path(&old_key, "out", ".jar").unwrap();
    let backdated = filetime::FileTime::from_system_time(
        std::time::SystemTime::now() - Duration::from_secs(40 * 24 * 3600),
    );
    filetime::set_file_mtime(&old_marker, backdated).unwrap();
    filetime::set_file_mtime(&old_output, backdated).unwrap();

    let maintenance = nfrt_cache::Maintenance::new(
        dir.path(),
        nfrt_cache::MaintenanceConfig::default().with_max_age_hours(744),
    );
    let report = maintenance.clean_up_all().unwrap();

    assert_eq!(report.keys_expired, 1);
    assert!(!old_marker.exists());
    assert!(!old_output.exists());
    assert!(store.marker_exists(&fresh_key));
}

#[test]
fn s6_size_eviction_starts_with_the_largest_group() {
    let dir = tempdir().unwrap();
    let store = nfrt_cache::Store::new(dir.path());
    let node = jar_node();

    let make = |label: &str, size: usize| {
        let key = CacheKey::new("build", components(&[("src", label)])).unwrap();
        let scratch = dir.path().join(format!("{label}.jar"));
        fs::write(&scratch, vec![0u8; size]).unwrap();
        let mut produced = BTreeMap::from([("out".to_string(), scratch)]);
        store.publish(&node, &key, &mut produced).unwrap();
        key
    };

    // Marker files add their own few hundred bytes of JSON, so groups are
    // spaced out enough that evicting only the single largest group (and no
    // more) is still sufficient to cross back under `max_size_bytes`.
    let big = make("big", 600);
    let medium = make("medium", 100);
    let small = make("small", 50);

    let maintenance = nfrt_cache::Maintenance::new(
        dir.path(),
        nfrt_cache::MaintenanceConfig::default().with_max_size_bytes(700),
    );
    let report = maintenance.clean_up_all().unwrap();

    assert!(!store.marker_exists(&big));
    assert!(store.marker_exists(&medium));
    assert!(store.marker_exists(&small));
    assert!(report.entries_evicted >= 2);
}

#[test]
fn s7_diagnostics_rank_closest_candidate_first() {
    let dir = tempdir().unwrap();
    let store = nfrt_cache::Store::new(dir.path()).with_diagnostics_enabled(true);
    let node = jar_node();

    let close = CacheKey::new("build", components(&[("x", "1"), ("y", "3"), ("z", "4")])).unwrap();
    let far =
        CacheKey::new("build", components(&[("x", "9"), ("y", "9"), ("w", "9")])).unwrap();
    for key in [&close, &far] {
        let scratch = dir.path().join(format!("{}.jar", key.hash_value()));
        fs::write(&scratch, b"P").unwrap();
        let mut produced = BTreeMap::from([("out".to_string(), scratch)]);
        store.publish(&node, key, &mut produced).unwrap();
    }

    let missing = CacheKey::new("build", components(&[("x", "1"), ("y", "2")])).unwrap();
    let mut out = BTreeMap::new();
    let (outcome, report) = store.restore_with_diagnostics(&node, &missing, &mut out).unwrap();
    assert_eq!(outcome, RestoreOutcome::Miss);

    let report = report.expect("diagnostics report present on miss");
    let best = report.best().expect("at least one same-type candidate");
    assert_eq!(best.delta_count, 2);
    assert!(best.filename.contains(&close.hash_value()[..8]));
}

#[test]
fn interrupted_publish_never_yields_a_hit() {
    let dir = tempdir().unwrap();
    let store = nfrt_cache::Store::new(dir.path());
    let node = jar_node();
    let key = CacheKey::new("build", components(&[("src", "partial")])).unwrap();

    // Simulate a crash between renaming the output and writing the marker:
    // the output exists but the marker never gets written.
    fs::create_dir_all(store.layout().intermediate_results_dir()).unwrap();
    let final_path = store.layout().output_path(&key, "out", ".jar").unwrap();
    fs::write(&final_path, b"P").unwrap();

    let mut out = BTreeMap::new();
    let outcome = store.restore(&node, &key, &mut out).unwrap();
    assert_eq!(outcome, RestoreOutcome::Miss);
}
