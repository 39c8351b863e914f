// tests/maintain_scenarios.rs
mod common;

use std::collections::HashMap;

use common::{config_in, item, MapResolver, MockFetcher, Reply};
use scout_patrol::discovery::ResolutionOutcome;
use scout_patrol::maintain::{Action, Rule};
use scout_patrol::store::RunLock;
use scout_patrol::{Overrides, Patrol, PatrolError, PlanOptions, SourceKey, SourceKind, Tier};

async fn runs(p: &mut Patrol, f: &MockFetcher, n: usize) {
    for _ in 0..n {
        p.run_patrol(f, PlanOptions::default()).await.unwrap();
    }
}

#[tokio::test]
async fn silent_account_is_flagged_for_removal() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = Patrol::open(config_in(dir.path())).unwrap();
    p.add_source(SourceKind::Account, "acct_42", Tier::tier2("ai"), Overrides::default())
        .unwrap();

    // One hit, then nine empty runs: hit rate 10%, trailing misses 9.
    let f = MockFetcher::new();
    f.push("acct_42", Reply::Items(vec![item("only", "acct_42", 40.0)]));
    runs(&mut p, &f, 10).await;

    let recs = p.analyze();
    assert_eq!(recs.len(), 1);
    let r = &recs[0];
    assert_eq!(r.key, SourceKey::account("acct_42"));
    assert_eq!(r.rule, Rule::SilentAccount);
    assert_eq!(r.action, Action::Remove);
    assert!(!r.protected);
    assert_eq!(r.sample.total_runs, 10);
    assert_eq!(r.sample.hits, 1);

    // No run in between: same answer.
    assert_eq!(p.analyze(), recs);
    assert!(p.health().needs_maintain);
}

#[tokio::test]
async fn inefficient_keyword_then_removed_with_its_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_in(dir.path());
    let mut p = Patrol::open(cfg.clone()).unwrap();
    p.add_source(SourceKind::Keyword, "old topic", Tier::TRENDING, Overrides::default())
        .unwrap();

    let f = MockFetcher::new();
    f.push("old topic", Reply::Items(vec![item("o1", "u1", 2.0)]));
    f.push("old topic", Reply::Items(vec![]));
    f.push("old topic", Reply::Items(vec![item("o2", "u2", 2.0)]));
    runs(&mut p, &f, 6).await;

    let m = p.metrics().get(&SourceKey::keyword("old topic")).unwrap();
    assert_eq!(m.total_runs, 6);
    assert!(m.avg_result_count < 0.4);

    let recs = p.analyze();
    assert!(recs
        .iter()
        .any(|r| r.key.id == "old topic" && r.rule == Rule::InefficientKeyword));

    p.remove_source(SourceKind::Keyword, "old topic", false).unwrap();
    assert!(p
        .watchlist()
        .list(SourceKind::Keyword)
        .iter()
        .all(|s| s.id != "old topic"));
    assert!(p.metrics().get(&SourceKey::keyword("old topic")).is_none());

    let reopened = Patrol::open(cfg).unwrap();
    assert!(!reopened.watchlist().contains(SourceKind::Keyword, "old topic"));
    assert!(reopened
        .metrics()
        .get(&SourceKey::keyword("old topic"))
        .is_none());
}

#[tokio::test]
async fn discovered_author_resolves_to_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path());
    cfg.discovery.min_engagement = 500.0;
    let mut p = Patrol::open(cfg).unwrap();
    p.add_source(SourceKind::Keyword, "agents", Tier::CORE, Overrides::default())
        .unwrap();

    let f = MockFetcher::new();
    f.push("agents", Reply::Items(vec![item("v1", "998877", 620.0)]));
    runs(&mut p, &f, 1).await;
    assert!(p.discovery().contains("998877"));

    let resolver = MapResolver(HashMap::from([(
        "998877".to_string(),
        "new_voice".to_string(),
    )]));
    let out = p.resolve_discoveries(&resolver, 1).await.unwrap();
    assert_eq!(out.len(), 1);
    match &out[0].outcome {
        ResolutionOutcome::Resolved { handle, proposal } => {
            assert_eq!(handle, "new_voice");
            let prop = proposal.as_ref().unwrap();
            assert_eq!(prop.tier, Tier::tier2("discovered"));
            assert_eq!(prop.engagement, 620.0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!p.discovery().contains("998877"));
    // Proposal only: nothing was added.
    assert!(!p.watchlist().contains(SourceKind::Account, "new_voice"));
}

#[tokio::test]
async fn unresolvable_author_stays_queued() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path());
    cfg.discovery.min_engagement = 100.0;
    let mut p = Patrol::open(cfg).unwrap();
    p.add_source(SourceKind::Keyword, "agents", Tier::CORE, Overrides::default())
        .unwrap();
    let f = MockFetcher::new();
    f.push("agents", Reply::Items(vec![item("v1", "123", 900.0)]));
    runs(&mut p, &f, 1).await;

    let out = p
        .resolve_discoveries(&MapResolver(HashMap::new()), 5)
        .await
        .unwrap();
    assert!(matches!(out[0].outcome, ResolutionOutcome::Failed { .. }));
    assert_eq!(p.discovery().get("123").unwrap().attempts, 1);
}

#[tokio::test]
async fn protected_sources_are_reported_but_never_applied() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = Patrol::open(config_in(dir.path())).unwrap();
    p.add_source(SourceKind::Keyword, "anchor", Tier::CORE, Overrides::default())
        .unwrap();
    p.add_source(SourceKind::Account, "boss", Tier::TIER1, Overrides::default())
        .unwrap();
    p.add_source(SourceKind::Account, "ghost", Tier::tier2("ai"), Overrides::default())
        .unwrap();

    let f = MockFetcher::new();
    for i in 0..6 {
        f.push("boss", Reply::Items(vec![item(&format!("b{i}"), "boss", 1.0)]));
    }
    runs(&mut p, &f, 6).await;

    let resolver = MapResolver(HashMap::new());
    let report = p.maintain(&resolver, true).await.unwrap();

    let by_id = |id: &str| {
        report
            .recommendations
            .iter()
            .find(|r| r.key.id == id)
            .cloned()
            .unwrap()
    };
    let anchor = by_id("anchor");
    assert!(anchor.protected);
    assert_eq!(anchor.rule, Rule::InefficientKeyword);
    let boss = by_id("boss");
    assert!(boss.protected);
    assert_eq!(boss.rule, Rule::LowQuality);
    assert_eq!(by_id("ghost").rule, Rule::SilentAccount);

    let applied: Vec<&str> = report.applied.iter().map(|r| r.key.id.as_str()).collect();
    assert_eq!(applied, vec!["ghost"]);
    assert!(p.watchlist().contains(SourceKind::Keyword, "anchor"));
    assert_eq!(p.watchlist().tier_of(SourceKind::Account, "boss"), Some(&Tier::TIER1));
    assert!(!p.watchlist().contains(SourceKind::Account, "ghost"));

    let h = p.health();
    assert!(!h.needs_maintain);
    assert!(!h.maintain_overdue);
    assert!(h.last_maintain_at.is_some());

    let err = p
        .remove_source(SourceKind::Keyword, "anchor", false)
        .unwrap_err();
    assert!(matches!(err, PatrolError::ProtectedTier { .. }));
    p.remove_source(SourceKind::Keyword, "anchor", true).unwrap();
}

#[tokio::test]
async fn unprotected_tier1_is_demoted_on_apply() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path());
    cfg.maintain.protected_tiers = vec![Tier::CORE];
    let mut p = Patrol::open(cfg).unwrap();
    p.add_source(SourceKind::Account, "meh", Tier::TIER1, Overrides::default())
        .unwrap();
    p.add_source(SourceKind::Account, "star", Tier::tier2("ai"), Overrides::default())
        .unwrap();

    let f = MockFetcher::new();
    for i in 0..3 {
        f.push("meh", Reply::Items(vec![item(&format!("m{i}"), "meh", 2.0)]));
        f.push("star", Reply::Items(vec![item(&format!("s{i}"), "star", 900.0)]));
    }
    runs(&mut p, &f, 3).await;

    let report = p.maintain(&MapResolver(HashMap::new()), true).await.unwrap();
    let star = report
        .recommendations
        .iter()
        .find(|r| r.key.id == "star")
        .unwrap();
    assert_eq!(star.action, Action::Promote { to: Tier::TIER1 });
    assert_eq!(report.applied.len(), 1);
    assert_eq!(
        p.watchlist().tier_of(SourceKind::Account, "meh"),
        Some(&Tier::tier2("demoted"))
    );
    assert_eq!(
        p.watchlist().tier_of(SourceKind::Account, "star"),
        Some(&Tier::tier2("ai"))
    );
}

#[tokio::test]
async fn resolve_waits_for_a_running_patrol() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config_in(dir.path());
    cfg.discovery.min_engagement = 100.0;
    let mut p = Patrol::open(cfg).unwrap();
    p.add_source(SourceKind::Keyword, "agents", Tier::CORE, Overrides::default())
        .unwrap();
    let f = MockFetcher::new();
    f.push("agents", Reply::Items(vec![item("v1", "555", 900.0)]));
    runs(&mut p, &f, 1).await;

    let resolver = MapResolver(HashMap::from([("555".to_string(), "someone".to_string())]));
    let held = RunLock::acquire(dir.path()).unwrap();
    let err = p.resolve_discoveries(&resolver, 5).await.unwrap_err();
    assert!(matches!(err, PatrolError::RunInProgress(_)));
    assert!(p.discovery().contains("555"));

    drop(held);
    let out = p.resolve_discoveries(&resolver, 5).await.unwrap();
    assert_eq!(out.len(), 1);
    assert!(!p.discovery().contains("555"));
}

#[tokio::test]
async fn maintain_lists_strong_keywords_without_acting() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = Patrol::open(config_in(dir.path())).unwrap();
    p.add_source(SourceKind::Keyword, "agents", Tier::TRENDING, Overrides::default())
        .unwrap();

    let f = MockFetcher::new();
    f.push("agents", Reply::Items(vec![item("g1", "1", 400.0)]));
    f.push("agents", Reply::Items(vec![item("g2", "2", 300.0)]));
    runs(&mut p, &f, 2).await;

    let report = p.maintain(&MapResolver(HashMap::new()), true).await.unwrap();
    assert_eq!(report.strong_keywords.len(), 1);
    assert_eq!(report.strong_keywords[0].id, "agents");
    assert_eq!(report.strong_keywords[0].avg_engagement, 350.0);
    assert!(report.recommendations.is_empty());
    assert!(report.applied.is_empty());
    assert_eq!(
        p.watchlist().tier_of(SourceKind::Keyword, "agents"),
        Some(&Tier::TRENDING)
    );
}
