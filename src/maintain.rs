//! # Maintenance Engine
//!
//! Rule-based classification over the per-source statistics, plus the
//! read-only health and status views.
//!
//! Rules are evaluated per source in a fixed precedence, first match wins:
//!
//! 1. silent account → remove
//! 2. low quality in an always-poll tier → demote
//! 3. high quality in a `tier2_*` group → promote to `tier1`
//! 4. inefficient keyword → remove
//!
//! Protected sources still produce findings, tagged `protected`, but are never
//! part of the auto-apply set. Strong keywords ([`strong_keywords`]) are listed
//! for information only and never turn into recommendations. [`analyze`] reads
//! only, so two calls without an intervening run return the same list.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{MaintainConfig, ScheduleConfig};
use crate::dedup::SeenLedger;
use crate::discovery::{DiscoveryQueue, Proposal, Resolution};
use crate::rotation::{select_for_run, PlanOptions, RotationState};
use crate::source::{FixedTier, SourceKey, SourceKind, Tier};
use crate::stats::{MetricRecord, MetricsStore};
use crate::watchlist::Watchlist;

pub const SILENT_MIN_RUNS: u64 = 5;
pub const SILENT_CONSECUTIVE_MISSES: u64 = 5;
pub const SILENT_MAX_HIT_RATE: f64 = 0.20;
pub const DEMOTE_MAX_ENGAGEMENT: f64 = 10.0;
pub const PROMOTE_MIN_ENGAGEMENT: f64 = 500.0;
pub const QUALITY_MIN_RUNS: u64 = 3;
pub const KEYWORD_MIN_RUNS: u64 = 5;
pub const KEYWORD_MIN_AVG_RESULTS: f64 = 1.0;
pub const STRONG_KEYWORD_MIN_RUNS: u64 = 2;
pub const STRONG_KEYWORD_MIN_ENGAGEMENT: f64 = 200.0;

/// Tunable thresholds for the classification rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintainThresholds {
    pub silent_min_runs: u64,
    pub silent_consecutive_misses: u64,
    /// Silent only when `hits / total_runs` is strictly below this.
    pub silent_max_hit_rate: f64,
    pub demote_max_engagement: f64,
    pub promote_min_engagement: f64,
    /// Minimum runs before demote/promote may fire.
    pub quality_min_runs: u64,
    pub keyword_min_runs: u64,
    pub keyword_min_avg_results: f64,
    pub strong_keyword_min_runs: u64,
    pub strong_keyword_min_engagement: f64,
}

impl Default for MaintainThresholds {
    fn default() -> Self {
        Self {
            silent_min_runs: SILENT_MIN_RUNS,
            silent_consecutive_misses: SILENT_CONSECUTIVE_MISSES,
            silent_max_hit_rate: SILENT_MAX_HIT_RATE,
            demote_max_engagement: DEMOTE_MAX_ENGAGEMENT,
            promote_min_engagement: PROMOTE_MIN_ENGAGEMENT,
            quality_min_runs: QUALITY_MIN_RUNS,
            keyword_min_runs: KEYWORD_MIN_RUNS,
            keyword_min_avg_results: KEYWORD_MIN_AVG_RESULTS,
            strong_keyword_min_runs: STRONG_KEYWORD_MIN_RUNS,
            strong_keyword_min_engagement: STRONG_KEYWORD_MIN_ENGAGEMENT,
        }
    }
}

impl MaintainThresholds {
    pub fn sanitized(mut self) -> Self {
        self.silent_max_hit_rate = self.silent_max_hit_rate.clamp(0.0, 1.0);
        self.silent_min_runs = self.silent_min_runs.max(1);
        self.silent_consecutive_misses = self.silent_consecutive_misses.max(1);
        self.quality_min_runs = self.quality_min_runs.max(1);
        self.keyword_min_runs = self.keyword_min_runs.max(1);
        self.strong_keyword_min_runs = self.strong_keyword_min_runs.max(1);
        if self.promote_min_engagement < self.demote_max_engagement {
            self.promote_min_engagement = self.demote_max_engagement;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Remove,
    Demote { to: Tier },
    Promote { to: Tier },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    SilentAccount,
    LowQuality,
    HighQuality,
    InefficientKeyword,
}

/// Statistics backing a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub total_runs: u64,
    pub hits: u64,
    pub engagement_samples: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub key: SourceKey,
    pub tier: Tier,
    pub action: Action,
    pub rule: Rule,
    pub protected: bool,
    pub sample: Sample,
    pub detail: String,
}

impl Recommendation {
    /// Removals and demotions of unprotected sources.
    pub fn auto_applicable(&self) -> bool {
        !self.protected && !matches!(self.action, Action::Promote { .. })
    }
}

fn demote_target(tier: &Tier, demote_group: &str) -> Option<Tier> {
    match tier {
        Tier::Fixed(FixedTier::Tier1) => Some(Tier::tier2(demote_group)),
        Tier::Fixed(FixedTier::Core) => Some(Tier::TRENDING),
        _ => None,
    }
}

fn classify(
    kind: SourceKind,
    tier: &Tier,
    m: &MetricRecord,
    th: &MaintainThresholds,
    demote_group: &str,
) -> Option<(Rule, Action, String)> {
    if kind == SourceKind::Account
        && m.total_runs >= th.silent_min_runs
        && m.consecutive_misses >= th.silent_consecutive_misses
        && m.hit_rate() < th.silent_max_hit_rate
    {
        return Some((
            Rule::SilentAccount,
            Action::Remove,
            format!(
                "{} consecutive misses, hit rate {:.0}% over {} runs",
                m.consecutive_misses,
                m.hit_rate() * 100.0,
                m.total_runs
            ),
        ));
    }

    if m.total_runs >= th.quality_min_runs {
        if let Some(to) = demote_target(tier, demote_group) {
            if m.engagement_samples > 0 && m.avg_engagement < th.demote_max_engagement {
                return Some((
                    Rule::LowQuality,
                    Action::Demote { to: to.clone() },
                    format!(
                        "avg engagement {:.1} < {}, move {tier} -> {to}",
                        m.avg_engagement, th.demote_max_engagement
                    ),
                ));
            }
        }
        if matches!(tier, Tier::Dynamic(_)) && m.avg_engagement > th.promote_min_engagement {
            return Some((
                Rule::HighQuality,
                Action::Promote { to: Tier::TIER1 },
                format!(
                    "avg engagement {:.1} > {}, move {tier} -> tier1",
                    m.avg_engagement, th.promote_min_engagement
                ),
            ));
        }
    }

    if kind == SourceKind::Keyword
        && m.total_runs >= th.keyword_min_runs
        && m.avg_result_count < th.keyword_min_avg_results
    {
        return Some((
            Rule::InefficientKeyword,
            Action::Remove,
            format!(
                "avg {:.2} new results per run over {} runs",
                m.avg_result_count, m.total_runs
            ),
        ));
    }
    None
}

/// Classify every tracked source that has statistics, keywords first, each
/// kind in watchlist order.
pub fn analyze(
    watchlist: &Watchlist,
    metrics: &MetricsStore,
    thresholds: &MaintainThresholds,
    demote_group: &str,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    for kind in SourceKind::ALL {
        for src in watchlist.list(kind) {
            let key = SourceKey::new(kind, src.id.clone());
            let Some(m) = metrics.get(&key) else {
                continue;
            };
            if let Some((rule, action, detail)) =
                classify(kind, &src.tier, m, thresholds, demote_group)
            {
                out.push(Recommendation {
                    protected: watchlist.is_protected(&src.tier),
                    tier: src.tier.clone(),
                    key,
                    action,
                    rule,
                    sample: Sample {
                        total_runs: m.total_runs,
                        hits: m.hits,
                        engagement_samples: m.engagement_samples,
                    },
                    detail,
                });
            }
        }
    }
    out
}

/// A keyword that keeps producing results with high engagement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrongKeyword {
    pub id: String,
    pub tier: Tier,
    pub total_runs: u64,
    pub avg_result_count: f64,
    pub avg_engagement: f64,
}

/// Keywords clearing both the result floor and the engagement bar, best
/// first.
pub fn strong_keywords(
    watchlist: &Watchlist,
    metrics: &MetricsStore,
    th: &MaintainThresholds,
) -> Vec<StrongKeyword> {
    let mut out: Vec<StrongKeyword> = watchlist
        .list(SourceKind::Keyword)
        .iter()
        .filter_map(|src| {
            let m = metrics.get(&SourceKey::keyword(src.id.clone()))?;
            let strong = m.total_runs >= th.strong_keyword_min_runs
                && m.avg_result_count >= th.keyword_min_avg_results
                && m.avg_engagement > th.strong_keyword_min_engagement;
            strong.then(|| StrongKeyword {
                id: src.id.clone(),
                tier: src.tier.clone(),
                total_runs: m.total_runs,
                avg_result_count: m.avg_result_count,
                avg_engagement: m.avg_engagement,
            })
        })
        .collect();
    out.sort_by(|a, b| b.avg_engagement.total_cmp(&a.avg_engagement));
    out
}

/// Execute the auto-applicable subset. Removal also drops the metric record.
/// Returns what was actually applied.
pub fn apply_recommendations(
    watchlist: &mut Watchlist,
    metrics: &mut MetricsStore,
    recs: &[Recommendation],
) -> Vec<Recommendation> {
    let mut applied = Vec::new();
    for rec in recs.iter().filter(|r| r.auto_applicable()) {
        let res = match &rec.action {
            Action::Remove => watchlist
                .remove(rec.key.kind, &rec.key.id, false)
                .map(|_| {
                    metrics.remove(&rec.key);
                }),
            Action::Demote { to } => watchlist
                .set_tier(rec.key.kind, &rec.key.id, to.clone())
                .map(|_| ()),
            Action::Promote { .. } => continue,
        };
        match res {
            Ok(()) => {
                tracing::info!(
                    target: "maintain",
                    source = %rec.key,
                    rule = ?rec.rule,
                    "applied recommendation"
                );
                applied.push(rec.clone());
            }
            Err(e) => tracing::warn!(
                target: "maintain",
                source = %rec.key,
                error = %e,
                "skipping recommendation"
            ),
        }
    }
    applied
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub recommendations: Vec<Recommendation>,
    pub applied: Vec<Recommendation>,
    /// Informational, never applied.
    pub strong_keywords: Vec<StrongKeyword>,
    pub resolutions: Vec<Resolution>,
    pub proposals: Vec<Proposal>,
    /// Discovery entries dropped by TTL.
    pub pruned: Vec<String>,
}

/// Borrowed view over the five stores for the read-only reports.
#[derive(Clone, Copy)]
pub struct Snapshot<'a> {
    pub watchlist: &'a Watchlist,
    pub metrics: &'a MetricsStore,
    pub rotation: &'a RotationState,
    pub seen: &'a SeenLedger,
    pub discovery: &'a DiscoveryQueue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub total_accounts: usize,
    pub tier1_accounts: usize,
    pub rotating_accounts: usize,
    pub total_keywords: usize,
    /// Share of accounts polled at least once.
    pub data_coverage: f64,
    /// Mean `avg_engagement` over polled accounts.
    pub avg_engagement: f64,
    pub unresolved_discoveries: usize,
    pub seen_items: usize,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_maintain_at: Option<DateTime<Utc>>,
    pub needs_maintain: bool,
    pub maintain_overdue: bool,
}

pub fn health(
    snap: Snapshot<'_>,
    thresholds: &MaintainThresholds,
    maintain: &MaintainConfig,
    now: DateTime<Utc>,
) -> HealthReport {
    let accounts = snap.watchlist.list(SourceKind::Account);
    let polled: Vec<&MetricRecord> = accounts
        .iter()
        .filter_map(|s| snap.metrics.get(&SourceKey::account(s.id.clone())))
        .filter(|m| m.total_runs > 0)
        .collect();

    let data_coverage = if accounts.is_empty() {
        0.0
    } else {
        polled.len() as f64 / accounts.len() as f64
    };
    let avg_engagement = if polled.is_empty() {
        0.0
    } else {
        polled.iter().map(|m| m.avg_engagement).sum::<f64>() / polled.len() as f64
    };

    let needs_maintain = analyze(snap.watchlist, snap.metrics, thresholds, &maintain.demote_group)
        .iter()
        .any(|r| !r.protected);
    let last_maintain_at = snap.metrics.last_maintain_at;
    let maintain_overdue = match last_maintain_at {
        None => true,
        Some(t) => now - t >= Duration::days(maintain.interval_days),
    };

    HealthReport {
        total_accounts: accounts.len(),
        tier1_accounts: accounts.iter().filter(|s| s.tier == Tier::TIER1).count(),
        rotating_accounts: accounts.iter().filter(|s| !s.tier.is_always_poll()).count(),
        total_keywords: snap.watchlist.len(SourceKind::Keyword),
        data_coverage,
        avg_engagement,
        unresolved_discoveries: snap.discovery.len(),
        seen_items: snap.seen.total_len(),
        last_run_at: snap.rotation.last_run_at,
        last_maintain_at,
        needs_maintain,
        maintain_overdue,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub size: usize,
    pub next_start: usize,
    pub width: usize,
    pub next_slice: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopAccount {
    pub id: String,
    pub tier: Tier,
    pub avg_engagement: f64,
    pub total_runs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Source count per `kind:tier`.
    pub tiers: BTreeMap<String, usize>,
    pub groups: Vec<GroupStatus>,
    pub top_accounts: Vec<TopAccount>,
}

const TOP_ACCOUNTS: usize = 10;

pub fn status(snap: Snapshot<'_>, schedule: &ScheduleConfig) -> StatusReport {
    let mut tiers = BTreeMap::new();
    for kind in SourceKind::ALL {
        for s in snap.watchlist.list(kind) {
            *tiers
                .entry(crate::rotation::group_name(kind, &s.tier))
                .or_insert(0usize) += 1;
        }
    }

    let plan = select_for_run(snap.watchlist, snap.rotation, schedule, PlanOptions::default());
    let groups = plan
        .slices
        .into_iter()
        .map(|s| GroupStatus {
            group: s.group,
            size: s.group_size,
            next_start: s.start,
            width: s.width,
            next_slice: s.members.into_iter().map(|k| k.id).collect(),
        })
        .collect();

    let mut top_accounts: Vec<TopAccount> = snap
        .watchlist
        .list(SourceKind::Account)
        .iter()
        .filter_map(|s| {
            let m = snap.metrics.get(&SourceKey::account(s.id.clone()))?;
            (m.total_runs > 0).then(|| TopAccount {
                id: s.id.clone(),
                tier: s.tier.clone(),
                avg_engagement: m.avg_engagement,
                total_runs: m.total_runs,
            })
        })
        .collect();
    top_accounts.sort_by(|a, b| {
        b.avg_engagement
            .total_cmp(&a.avg_engagement)
            .then_with(|| a.id.cmp(&b.id))
    });
    top_accounts.truncate(TOP_ACCOUNTS);

    StatusReport {
        tiers,
        groups,
        top_accounts,
    }
}
