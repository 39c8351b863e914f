//! # Patrol
//!
//! [`Patrol`] owns the five stores for one state directory and exposes the
//! operations an outer CLI or scheduler drives: a budgeted run, maintenance,
//! the read-only reports and the watchlist mutation surface.
//!
//! Runs are not reentrant. [`Patrol::run_patrol`], [`Patrol::maintain`] and
//! [`Patrol::resolve_discoveries`] hold `patrol.lock` in the state directory
//! for their whole duration, so a second overlapping invocation fails with
//! `RunInProgress` instead of interleaving writes to the stores.
//! [`Patrol::search`] touches no store and takes no lock.

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::time::{timeout, Duration, Instant};

use crate::config::PatrolConfig;
use crate::dedup::SeenLedger;
use crate::discovery::{self, DiscoveryQueue, Proposal, Resolution, ResolutionOutcome};
use crate::error::{PatrolError, Result};
use crate::fetch::{build_query, effective_excludes, IdentityResolver, SourceFetcher};
use crate::maintain::{
    self, HealthReport, MaintenanceReport, Recommendation, Snapshot, StatusReport,
};
use crate::rotation::{select_for_run, PlanOptions, RotationState};
use crate::source::{
    matches_exclude, Item, Overrides, Source, SourceKey, SourceKind, SourceQuery, Tier,
};
use crate::stats::MetricsStore;
use crate::store::{
    RunLock, DISCOVERY_FILE, METRICS_FILE, ROTATION_FILE, SEEN_FILE, WATCHLIST_FILE,
};
use crate::telemetry::ensure_metrics_described;
use crate::watchlist::Watchlist;

/// File locations of the stores under one state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub watchlist: PathBuf,
    pub metrics: PathBuf,
    pub rotation: PathBuf,
    pub seen: PathBuf,
    pub discovery: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            watchlist: dir.join(WATCHLIST_FILE),
            metrics: dir.join(METRICS_FILE),
            rotation: dir.join(ROTATION_FILE),
            seen: dir.join(SEEN_FILE),
            discovery: dir.join(DISCOVERY_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Hit { new_items: usize },
    Miss,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub key: SourceKey,
    /// Rotating group the source was polled for; `None` for always-poll tiers.
    pub group: Option<String>,
    pub outcome: SourceOutcome,
    pub fetched: usize,
    pub duplicates: usize,
    pub excluded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoundItem {
    pub source: SourceKey,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub full_sweep: bool,
    /// Per-source outcomes in plan order.
    pub sources: Vec<SourceReport>,
    pub items: Vec<FoundItem>,
    /// Groups whose cursor moved.
    pub advanced: Vec<String>,
    /// Groups kept in place because a slice member failed.
    pub held: Vec<String>,
    pub discovered: Vec<String>,
}

impl RunReport {
    pub fn count(&self, pred: impl Fn(&SourceOutcome) -> bool) -> usize {
        self.sources.iter().filter(|s| pred(&s.outcome)).count()
    }
}

type FetchResult = std::result::Result<Vec<Item>, String>;

pub struct Patrol {
    config: PatrolConfig,
    paths: StatePaths,
    watchlist: Watchlist,
    metrics: MetricsStore,
    rotation: RotationState,
    seen: SeenLedger,
    discovery: DiscoveryQueue,
}

impl Patrol {
    /// Load every store from `config.state_dir`; missing files start empty.
    pub fn open(config: PatrolConfig) -> Result<Self> {
        let paths = StatePaths::new(&config.state_dir);
        let watchlist = Watchlist::load(&paths.watchlist, config.maintain.protection())
            .map_err(|e| PatrolError::persistence("watchlist", e))?;
        let metrics =
            MetricsStore::load(&paths.metrics).map_err(|e| PatrolError::persistence("metrics", e))?;
        let rotation = RotationState::load(&paths.rotation)
            .map_err(|e| PatrolError::persistence("rotation", e))?;
        let seen = SeenLedger::load(&paths.seen).map_err(|e| PatrolError::persistence("seen", e))?;
        let discovery = DiscoveryQueue::load(&paths.discovery)
            .map_err(|e| PatrolError::persistence("discovery", e))?;
        tracing::debug!(
            target: "patrol",
            dir = %paths.dir.display(),
            keywords = watchlist.len(SourceKind::Keyword),
            accounts = watchlist.len(SourceKind::Account),
            "stores loaded"
        );
        Ok(Self {
            config,
            paths,
            watchlist,
            metrics,
            rotation,
            seen,
            discovery,
        })
    }

    pub fn config(&self) -> &PatrolConfig {
        &self.config
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn watchlist(&self) -> &Watchlist {
        &self.watchlist
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn rotation(&self) -> &RotationState {
        &self.rotation
    }

    pub fn seen(&self) -> &SeenLedger {
        &self.seen
    }

    pub fn discovery(&self) -> &DiscoveryQueue {
        &self.discovery
    }

    fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            watchlist: &self.watchlist,
            metrics: &self.metrics,
            rotation: &self.rotation,
            seen: &self.seen,
            discovery: &self.discovery,
        }
    }

    /// Execute one budgeted run.
    ///
    /// Fetches fan out up to `fetch.concurrency`; results are then applied in
    /// plan order (exclude filter, ledger dedup, metrics, discovery capture).
    /// Metrics, ledger and discovery queue are flushed before any cursor moves,
    /// so a persistence failure leaves every cursor where it was.
    pub async fn run_patrol(
        &mut self,
        fetcher: &dyn SourceFetcher,
        options: PlanOptions,
    ) -> Result<RunReport> {
        ensure_metrics_described();
        let _lock = RunLock::acquire(&self.paths.dir)?;
        let started_at = Utc::now();

        let plan = select_for_run(&self.watchlist, &self.rotation, &self.config.schedule, options);
        let group_of: HashMap<&SourceKey, &str> = plan
            .slices
            .iter()
            .flat_map(|s| s.members.iter().map(move |k| (k, s.group.as_str())))
            .collect();

        let mut jobs: Vec<(SourceQuery, Vec<String>)> = Vec::with_capacity(plan.len());
        for key in plan.sources() {
            let Some(src) = self.watchlist.get(key.kind, &key.id) else {
                continue;
            };
            jobs.push((
                build_query(key.kind, src, &self.config.filters),
                effective_excludes(src, &self.config.filters),
            ));
        }
        tracing::info!(
            target: "patrol",
            sources = jobs.len(),
            always = plan.always.len(),
            groups = plan.slices.len(),
            full_sweep = plan.full_sweep,
            fetcher = fetcher.name(),
            "patrol run started"
        );

        let results = self.fetch_all(fetcher, &jobs).await;

        let mut report = RunReport {
            started_at,
            finished_at: started_at,
            full_sweep: plan.full_sweep,
            sources: Vec::with_capacity(jobs.len()),
            items: Vec::new(),
            advanced: Vec::new(),
            held: Vec::new(),
            discovered: Vec::new(),
        };
        let mut failed_groups: BTreeSet<&str> = BTreeSet::new();

        for ((query, excludes), result) in jobs.iter().zip(results) {
            let key = &query.key;
            let group = group_of.get(key).copied();
            match result {
                Ok(fetched) => {
                    let fetched_n = fetched.len();
                    let mut excluded = 0usize;
                    let mut duplicates = 0usize;
                    let mut fresh = Vec::new();
                    for it in fetched {
                        if matches_exclude(&it.text, excludes) {
                            excluded += 1;
                            continue;
                        }
                        if self.seen.is_new(key.kind, &it.id) {
                            self.seen.record(key.kind, &it.id);
                            fresh.push(it);
                        } else {
                            duplicates += 1;
                        }
                    }
                    self.metrics.record_run(key, &fresh);
                    let found = self.discovery.observe(
                        key,
                        &fresh,
                        &self.watchlist,
                        &self.config.discovery,
                        Utc::now(),
                    );
                    counter!("patrol_discoveries_total").increment(found.len() as u64);
                    counter!("patrol_duplicates_total").increment(duplicates as u64);
                    counter!("patrol_excluded_total").increment(excluded as u64);
                    counter!("patrol_new_items_total").increment(fresh.len() as u64);
                    report.discovered.extend(found);

                    let outcome = if fresh.is_empty() {
                        counter!("patrol_sources_polled_total", "outcome" => "miss").increment(1);
                        SourceOutcome::Miss
                    } else {
                        counter!("patrol_sources_polled_total", "outcome" => "hit").increment(1);
                        SourceOutcome::Hit {
                            new_items: fresh.len(),
                        }
                    };
                    tracing::debug!(
                        target: "patrol",
                        source = %key,
                        fetched = fetched_n,
                        new = fresh.len(),
                        duplicates,
                        excluded,
                        "source polled"
                    );
                    report.items.extend(fresh.into_iter().map(|item| FoundItem {
                        source: key.clone(),
                        item,
                    }));
                    report.sources.push(SourceReport {
                        key: key.clone(),
                        group: group.map(str::to_string),
                        outcome,
                        fetched: fetched_n,
                        duplicates,
                        excluded,
                    });
                }
                Err(message) => {
                    let err = PatrolError::FetchFailure {
                        source_label: key.to_string(),
                        message: message.clone(),
                    };
                    tracing::warn!(target: "patrol", "{err}");
                    counter!("patrol_fetch_errors_total").increment(1);
                    counter!("patrol_sources_polled_total", "outcome" => "error").increment(1);
                    self.metrics.record_failure(key);
                    if let Some(g) = group {
                        failed_groups.insert(g);
                    }
                    report.sources.push(SourceReport {
                        key: key.clone(),
                        group: group.map(str::to_string),
                        outcome: SourceOutcome::Error { message },
                        fetched: 0,
                        duplicates: 0,
                        excluded: 0,
                    });
                }
            }
        }

        self.metrics
            .save(&self.paths.metrics)
            .map_err(|e| PatrolError::persistence("metrics", e))?;
        self.seen
            .save(&self.paths.seen)
            .map_err(|e| PatrolError::persistence("seen", e))?;
        self.discovery
            .save(&self.paths.discovery)
            .map_err(|e| PatrolError::persistence("discovery", e))?;

        if !plan.full_sweep {
            for slice in &plan.slices {
                if slice.group_size == 0 {
                    continue;
                }
                if self.config.schedule.retry_failed_slices
                    && failed_groups.contains(slice.group.as_str())
                {
                    report.held.push(slice.group.clone());
                    continue;
                }
                self.rotation
                    .advance(&slice.group, slice.width, slice.group_size);
                report.advanced.push(slice.group.clone());
            }
        }
        let finished_at = Utc::now();
        self.rotation.last_run_at = Some(finished_at);
        self.rotation
            .save(&self.paths.rotation)
            .map_err(|e| PatrolError::persistence("rotation", e))?;

        report.finished_at = finished_at;
        counter!("patrol_runs_total").increment(1);
        gauge!("patrol_last_run_ts").set(finished_at.timestamp() as f64);
        for kind in SourceKind::ALL {
            gauge!("patrol_watchlist_sources", "kind" => kind.as_str())
                .set(self.watchlist.len(kind) as f64);
        }
        tracing::info!(
            target: "patrol",
            hits = report.count(|o| matches!(o, SourceOutcome::Hit { .. })),
            misses = report.count(|o| matches!(o, SourceOutcome::Miss)),
            errors = report.count(|o| matches!(o, SourceOutcome::Error { .. })),
            new_items = report.items.len(),
            held = report.held.len(),
            "patrol run finished"
        );
        Ok(report)
    }

    /// Fetch every job with bounded fan-out; results come back in job order.
    async fn fetch_all(
        &self,
        fetcher: &dyn SourceFetcher,
        jobs: &[(SourceQuery, Vec<String>)],
    ) -> Vec<FetchResult> {
        let per_fetch = Duration::from_secs(self.config.fetch.timeout_secs);
        let deadline = Instant::now() + Duration::from_secs(self.config.fetch.run_timeout_secs);

        let mut indexed: Vec<(usize, FetchResult)> = stream::iter(jobs.iter().enumerate())
            .map(|(i, (query, _))| async move {
                let budget = per_fetch.min(deadline.saturating_duration_since(Instant::now()));
                if budget.is_zero() {
                    return (i, Err("run deadline exceeded".to_string()));
                }
                let res = match timeout(budget, fetcher.fetch(query)).await {
                    Ok(Ok(items)) => Ok(items),
                    Ok(Err(e)) => Err(format!("{e:#}")),
                    Err(_) => Err(format!("timed out after {}ms", budget.as_millis())),
                };
                (i, res)
            })
            .buffer_unordered(self.config.fetch.concurrency.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, r)| r).collect()
    }

    pub fn analyze(&self) -> Vec<Recommendation> {
        maintain::analyze(
            &self.watchlist,
            &self.metrics,
            &self.config.thresholds,
            &self.config.maintain.demote_group,
        )
    }

    pub fn health(&self) -> HealthReport {
        maintain::health(
            self.snapshot(),
            &self.config.thresholds,
            &self.config.maintain,
            Utc::now(),
        )
    }

    pub fn status(&self) -> StatusReport {
        maintain::status(self.snapshot(), &self.config.schedule)
    }

    /// Analyze, resolve pending discoveries, prune stale ones and, when
    /// `apply` is set, execute the auto-applicable recommendations.
    pub async fn maintain(
        &mut self,
        resolver: &dyn IdentityResolver,
        apply: bool,
    ) -> Result<MaintenanceReport> {
        ensure_metrics_described();
        let _lock = RunLock::acquire(&self.paths.dir)?;
        let now = Utc::now();

        let recommendations = self.analyze();
        for r in &recommendations {
            counter!("maintain_recommendations_total", "rule" => rule_label(r)).increment(1);
        }

        let resolutions = if self.config.discovery.enabled {
            self.resolve_pending(resolver, self.config.discovery.resolve_batch)
                .await
        } else {
            Vec::new()
        };
        let proposals = proposals_of(&resolutions);
        let pruned = self
            .discovery
            .prune_expired(self.config.discovery.ttl_days, now);

        let strong_keywords = maintain::strong_keywords(
            &self.watchlist,
            &self.metrics,
            &self.config.thresholds,
        );

        let applied = if apply {
            maintain::apply_recommendations(
                &mut self.watchlist,
                &mut self.metrics,
                &recommendations,
            )
        } else {
            Vec::new()
        };
        counter!("maintain_applied_total").increment(applied.len() as u64);
        if !applied.is_empty() {
            self.watchlist
                .save(&self.paths.watchlist)
                .map_err(|e| PatrolError::persistence("watchlist", e))?;
        }

        self.metrics.last_maintain_at = Some(now);
        self.metrics
            .save(&self.paths.metrics)
            .map_err(|e| PatrolError::persistence("metrics", e))?;
        self.discovery
            .save(&self.paths.discovery)
            .map_err(|e| PatrolError::persistence("discovery", e))?;

        tracing::info!(
            target: "maintain",
            recommendations = recommendations.len(),
            applied = applied.len(),
            resolved = proposals.len(),
            pruned = pruned.len(),
            "maintenance finished"
        );
        Ok(MaintenanceReport {
            recommendations,
            applied,
            strong_keywords,
            resolutions,
            proposals,
            pruned,
        })
    }

    /// Resolve up to `max_batch` queued authors and persist the queue.
    pub async fn resolve_discoveries(
        &mut self,
        resolver: &dyn IdentityResolver,
        max_batch: usize,
    ) -> Result<Vec<Resolution>> {
        let _lock = RunLock::acquire(&self.paths.dir)?;
        let out = self.resolve_pending(resolver, max_batch).await;
        self.discovery
            .save(&self.paths.discovery)
            .map_err(|e| PatrolError::persistence("discovery", e))?;
        Ok(out)
    }

    /// Ad-hoc keyword search through the configured query filters and global
    /// excludes, best engagement first. Nothing is recorded in any store.
    pub async fn search(&self, fetcher: &dyn SourceFetcher, keyword: &str) -> Result<Vec<Item>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(PatrolError::EmptyId {
                kind: SourceKind::Keyword,
            });
        }
        let src = Source {
            id: keyword.to_string(),
            tier: Tier::CUSTOM,
            created_at: Utc::now(),
            overrides: Overrides::default(),
        };
        let query = build_query(SourceKind::Keyword, &src, &self.config.filters);
        let excludes = effective_excludes(&src, &self.config.filters);
        let per_fetch = Duration::from_secs(self.config.fetch.timeout_secs);

        let fetched = match timeout(per_fetch, fetcher.fetch(&query)).await {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                return Err(PatrolError::FetchFailure {
                    source_label: query.key.to_string(),
                    message: format!("{e:#}"),
                })
            }
            Err(_) => {
                return Err(PatrolError::FetchFailure {
                    source_label: query.key.to_string(),
                    message: format!("timed out after {}ms", per_fetch.as_millis()),
                })
            }
        };
        let mut items: Vec<Item> = fetched
            .into_iter()
            .filter(|it| !matches_exclude(&it.text, &excludes))
            .collect();
        items.sort_by(|a, b| b.engagement_score.total_cmp(&a.engagement_score));
        tracing::info!(
            target: "patrol",
            query = %query.query,
            items = items.len(),
            "ad-hoc search"
        );
        Ok(items)
    }

    async fn resolve_pending(
        &mut self,
        resolver: &dyn IdentityResolver,
        max_batch: usize,
    ) -> Vec<Resolution> {
        let out = discovery::resolve_discoveries(
            &mut self.discovery,
            &self.watchlist,
            resolver,
            max_batch,
            &self.config.discovery.propose_group,
        )
        .await;
        for r in &out {
            let result = match r.outcome {
                ResolutionOutcome::Resolved { .. } => "resolved",
                ResolutionOutcome::Failed { .. } => "failed",
            };
            counter!("maintain_resolutions_total", "result" => result).increment(1);
        }
        out
    }

    pub fn add_source(
        &mut self,
        kind: SourceKind,
        id: &str,
        tier: Tier,
        overrides: Overrides,
    ) -> Result<Source> {
        let src = self.watchlist.add(kind, id, tier, overrides)?;
        self.save_watchlist()?;
        tracing::info!(
            target: "patrol",
            kind = %kind,
            id = %src.id,
            tier = %src.tier,
            "source added"
        );
        Ok(src)
    }

    /// Remove a source together with its metric record.
    pub fn remove_source(&mut self, kind: SourceKind, id: &str, force: bool) -> Result<Source> {
        let src = self.watchlist.remove(kind, id, force)?;
        self.metrics.remove(&SourceKey::new(kind, src.id.clone()));
        self.save_watchlist()?;
        self.metrics
            .save(&self.paths.metrics)
            .map_err(|e| PatrolError::persistence("metrics", e))?;
        tracing::info!(target: "patrol", kind = %kind, id = %src.id, force, "source removed");
        Ok(src)
    }

    /// Returns `false` when the source already had `tier`.
    pub fn set_tier(&mut self, kind: SourceKind, id: &str, tier: Tier) -> Result<bool> {
        let changed = self.watchlist.set_tier(kind, id, tier)?;
        if changed {
            self.save_watchlist()?;
        }
        Ok(changed)
    }

    pub fn set_overrides(
        &mut self,
        kind: SourceKind,
        id: &str,
        overrides: Overrides,
    ) -> Result<()> {
        self.watchlist.set_overrides(kind, id, overrides)?;
        self.save_watchlist()
    }

    fn save_watchlist(&self) -> Result<()> {
        self.watchlist
            .save(&self.paths.watchlist)
            .map_err(|e| PatrolError::persistence("watchlist", e))
    }
}

fn rule_label(r: &Recommendation) -> &'static str {
    use crate::maintain::Rule;
    match r.rule {
        Rule::SilentAccount => "silent_account",
        Rule::LowQuality => "low_quality",
        Rule::HighQuality => "high_quality",
        Rule::InefficientKeyword => "inefficient_keyword",
    }
}

fn proposals_of(resolutions: &[Resolution]) -> Vec<Proposal> {
    resolutions
        .iter()
        .filter_map(|r| match &r.outcome {
            ResolutionOutcome::Resolved {
                proposal: Some(p), ..
            } => Some(p.clone()),
            _ => None,
        })
        .collect()
}

