// tests/state_files.rs
mod common;

use common::{config_in, item, MockFetcher, Reply};
use scout_patrol::config::load_config_from;
use scout_patrol::{Overrides, Patrol, PatrolError, PlanOptions, SourceKind, Tier};
use std::fs;

#[test]
fn config_loads_from_toml_and_json() {
    let dir = tempfile::tempdir().unwrap();

    let p_toml = dir.path().join("patrol.toml");
    fs::write(
        &p_toml,
        r#"
state_dir = "/var/lib/patrol"

[schedule]
keywords_per_run = 4
group_widths = { "account:tier2_ai" = 2 }

[fetch]
concurrency = 40
base_url = "http://gateway.local"

[maintain]
protected_tiers = ["core"]
demote_group = "bench"
"#,
    )
    .unwrap();
    let cfg = load_config_from(&p_toml).unwrap();
    assert_eq!(cfg.state_dir.to_str(), Some("/var/lib/patrol"));
    assert_eq!(cfg.schedule.keywords_per_run, 4);
    assert_eq!(cfg.schedule.group_widths.get("account:tier2_ai"), Some(&2));
    assert_eq!(cfg.fetch.concurrency, 8);
    assert_eq!(cfg.maintain.demote_group, "bench");

    let p_json = dir.path().join("patrol.json");
    fs::write(&p_json, r#"{"discovery":{"enabled":false,"ttl_days":0}}"#).unwrap();
    let cfg = load_config_from(&p_json).unwrap();
    assert!(!cfg.discovery.enabled);
    assert_eq!(cfg.discovery.ttl_days, 1);
    assert_eq!(cfg.schedule.accounts_per_run, 6);

    let bad = dir.path().join("broken.toml");
    fs::write(&bad, "[schedule\nkeywords_per_run = ").unwrap();
    assert!(load_config_from(&bad).is_err());
}

#[tokio::test]
async fn every_store_lands_in_its_own_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path());
    cfg.discovery.min_engagement = 10.0;
    let mut p = Patrol::open(cfg).unwrap();
    p.add_source(SourceKind::Keyword, "rust async", Tier::CORE, Overrides::default())
        .unwrap();
    p.add_source(SourceKind::Account, "@karpathy", Tier::tier2("ai"), Overrides::default())
        .unwrap();

    let f = MockFetcher::new();
    f.push("rust async", Reply::Items(vec![item("p1", "42", 50.0)]));
    p.run_patrol(&f, PlanOptions::default()).await.unwrap();

    for name in [
        "watchlist.toml",
        "metrics.json",
        "rotation.json",
        "seen.json",
        "discovery.json",
    ] {
        assert!(dir.path().join(name).exists(), "{name} missing");
    }
    assert!(!dir.path().join("patrol.lock").exists());

    let wl = fs::read_to_string(dir.path().join("watchlist.toml")).unwrap();
    assert!(wl.contains(r#"id = "karpathy""#));
    assert!(wl.contains(r#"tier = "tier2_ai""#));

    let seen: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("seen.json")).unwrap()).unwrap();
    assert_eq!(seen["keyword"], serde_json::json!(["p1"]));
}

#[test]
fn corrupt_store_fails_open_with_store_name() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("metrics.json"), "{ not json").unwrap();
    let err = Patrol::open(config_in(dir.path())).err().unwrap();
    match err {
        PatrolError::PersistenceFailure { store, .. } => assert_eq!(store, "metrics"),
        other => panic!("unexpected {other:?}"),
    }
}
