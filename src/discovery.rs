//! # Discovery Queue
//!
//! Untracked authors surfaced by high-engagement items. Entries are keyed by
//! the raw (numeric) author id and wait until a maintenance pass resolves them
//! to a handle. A resolved handle is only *proposed* as a new source; adding it
//! stays a caller decision.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::DiscoveryConfig;
use crate::error::PatrolError;
use crate::fetch::IdentityResolver;
use crate::source::{normalize_id, Item, SourceKey, SourceKind, Tier};
use crate::store;
use crate::watchlist::Watchlist;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub first_seen: DateTime<Utc>,
    /// Engagement of the item that triggered the discovery.
    pub engagement: f64,
    /// Label of the source whose results surfaced the author.
    pub via: String,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryQueue {
    #[serde(default)]
    entries: BTreeMap<String, DiscoveryEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    pub kind: SourceKind,
    pub id: String,
    pub tier: Tier,
    pub engagement: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved {
        handle: String,
        /// `None` when the handle is already tracked.
        proposal: Option<Proposal>,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub raw_id: String,
    pub outcome: ResolutionOutcome,
}

impl DiscoveryQueue {
    pub fn load(path: &Path) -> Result<Self> {
        store::load_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        store::save_atomic(path, self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, raw_id: &str) -> bool {
        self.entries.contains_key(raw_id)
    }

    pub fn get(&self, raw_id: &str) -> Option<&DiscoveryEntry> {
        self.entries.get(raw_id)
    }

    /// Queue `raw_id` unless already present. Returns whether it was added.
    pub fn enqueue(
        &mut self,
        raw_id: &str,
        engagement: f64,
        via: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if raw_id.trim().is_empty() || self.entries.contains_key(raw_id) {
            return false;
        }
        self.entries.insert(
            raw_id.to_string(),
            DiscoveryEntry {
                first_seen: now,
                engagement,
                via: via.to_string(),
                attempts: 0,
            },
        );
        true
    }

    /// Inspect one source's new items and queue qualifying untracked authors.
    pub fn observe(
        &mut self,
        via: &SourceKey,
        items: &[Item],
        watchlist: &Watchlist,
        cfg: &DiscoveryConfig,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        if !cfg.enabled {
            return Vec::new();
        }
        let mut added = Vec::new();
        for it in items {
            let author = normalize_id(SourceKind::Account, &it.author_id);
            if author.is_empty()
                || it.engagement_score < cfg.min_engagement
                || (via.kind == SourceKind::Account && author == via.id)
                || watchlist.contains(SourceKind::Account, &author)
            {
                continue;
            }
            if self.enqueue(&author, it.engagement_score, &via.to_string(), now) {
                tracing::info!(
                    target: "patrol",
                    author = %author,
                    engagement = it.engagement_score,
                    via = %via,
                    "discovered untracked author"
                );
                added.push(author);
            }
        }
        self.enforce_bound(cfg.max_entries);
        added
    }

    /// Drop the oldest entries beyond `max`. Returns the dropped ids.
    pub fn enforce_bound(&mut self, max: usize) -> Vec<String> {
        if self.entries.len() <= max {
            return Vec::new();
        }
        let excess = self.entries.len() - max;
        let dropped: Vec<String> = self
            .oldest(excess)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        for id in &dropped {
            self.entries.remove(id);
        }
        dropped
    }

    /// Up to `n` entries, oldest first (ties broken by id).
    pub fn oldest(&self, n: usize) -> Vec<(String, DiscoveryEntry)> {
        let mut all: Vec<(String, DiscoveryEntry)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.1.first_seen.cmp(&b.1.first_seen).then_with(|| a.0.cmp(&b.0)));
        all.truncate(n);
        all
    }

    pub fn take(&mut self, raw_id: &str) -> Option<DiscoveryEntry> {
        self.entries.remove(raw_id)
    }

    fn mark_failed(&mut self, raw_id: &str) {
        if let Some(e) = self.entries.get_mut(raw_id) {
            e.attempts += 1;
        }
    }

    /// Remove entries first seen more than `ttl_days` ago.
    pub fn prune_expired(&mut self, ttl_days: i64, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - Duration::days(ttl_days);
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.first_seen < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }
}

/// Resolve up to `max_batch` of the oldest entries through `resolver`.
///
/// Resolved entries leave the queue; failed ones stay with `attempts` bumped.
pub async fn resolve_discoveries(
    queue: &mut DiscoveryQueue,
    watchlist: &Watchlist,
    resolver: &dyn IdentityResolver,
    max_batch: usize,
    propose_group: &str,
) -> Vec<Resolution> {
    let mut out = Vec::new();
    for (raw_id, entry) in queue.oldest(max_batch) {
        let outcome = match resolver.resolve(&raw_id).await {
            Ok(Some(handle)) => {
                let handle = normalize_id(SourceKind::Account, &handle);
                queue.take(&raw_id);
                let proposal = (!watchlist.contains(SourceKind::Account, &handle)).then(|| {
                    Proposal {
                        kind: SourceKind::Account,
                        id: handle.clone(),
                        tier: Tier::tier2(propose_group),
                        engagement: entry.engagement,
                    }
                });
                tracing::info!(
                    target: "maintain",
                    raw_id = %raw_id,
                    handle = %handle,
                    "resolved discovered author"
                );
                ResolutionOutcome::Resolved { handle, proposal }
            }
            Ok(None) => {
                queue.mark_failed(&raw_id);
                let err = PatrolError::ResolutionFailed {
                    raw_id: raw_id.clone(),
                    message: "no such user".to_string(),
                };
                tracing::warn!(target: "maintain", "{err}");
                ResolutionOutcome::Failed {
                    message: err.to_string(),
                }
            }
            Err(e) => {
                queue.mark_failed(&raw_id);
                let err = PatrolError::ResolutionFailed {
                    raw_id: raw_id.clone(),
                    message: format!("{e:#}"),
                };
                tracing::warn!(target: "maintain", "{err}");
                ResolutionOutcome::Failed {
                    message: err.to_string(),
                }
            }
        };
        out.push(Resolution { raw_id, outcome });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Overrides, Protection};
    use async_trait::async_trait;

    struct FixedResolver;

    #[async_trait]
    impl IdentityResolver for FixedResolver {
        async fn resolve(&self, raw_id: &str) -> anyhow::Result<Option<String>> {
            match raw_id {
                "1" => Ok(Some("@one".to_string())),
                "2" => Ok(None),
                "3" => Ok(Some("tracked".to_string())),
                _ => anyhow::bail!("gateway down"),
            }
        }
    }

    fn item(author: &str, score: f64) -> Item {
        Item {
            id: format!("post-{author}-{score}"),
            author_id: author.into(),
            engagement_score: score,
            timestamp: Utc::now(),
            text: String::new(),
            url: None,
        }
    }

    fn watchlist() -> Watchlist {
        let mut wl = Watchlist::new(Protection::default());
        wl.add(SourceKind::Account, "tracked", Tier::tier2("ai"), Overrides::default())
            .unwrap();
        wl
    }

    #[test]
    fn observe_skips_tracked_low_and_self_authored() {
        let mut q = DiscoveryQueue::default();
        let cfg = DiscoveryConfig::default();
        let wl = watchlist();
        let via = SourceKey::account("tracked");
        let added = q.observe(
            &via,
            &[
                item("tracked", 5000.0),
                item("55", 10.0),
                item("66", 1200.0),
                item("66", 1500.0),
            ],
            &wl,
            &cfg,
            Utc::now(),
        );
        assert_eq!(added, vec!["66".to_string()]);
        assert_eq!(q.get("66").unwrap().engagement, 1200.0);
    }

    #[test]
    fn bound_and_ttl_drop_oldest() {
        let mut q = DiscoveryQueue::default();
        let t0 = Utc::now() - Duration::days(30);
        for i in 0..5 {
            q.enqueue(&i.to_string(), 1.0, "x", t0 + Duration::days(i));
        }
        assert_eq!(q.enforce_bound(3), vec!["0".to_string(), "1".to_string()]);
        let pruned = q.prune_expired(14, Utc::now());
        assert_eq!(pruned.len(), 3);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn resolution_outcomes_update_queue() {
        let mut q = DiscoveryQueue::default();
        let now = Utc::now();
        for (i, id) in ["1", "2", "3", "4"].iter().enumerate() {
            q.enqueue(id, 900.0, "keyword:x", now + Duration::seconds(i as i64));
        }
        let wl = watchlist();
        let res = resolve_discoveries(&mut q, &wl, &FixedResolver, 10, "discovered").await;
        assert_eq!(res.len(), 4);
        match &res[0].outcome {
            ResolutionOutcome::Resolved { handle, proposal } => {
                assert_eq!(handle, "one");
                assert_eq!(proposal.as_ref().unwrap().tier, Tier::tier2("discovered"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(res[1].outcome, ResolutionOutcome::Failed { .. }));
        assert!(matches!(
            res[2].outcome,
            ResolutionOutcome::Resolved { proposal: None, .. }
        ));
        assert!(matches!(res[3].outcome, ResolutionOutcome::Failed { .. }));
        assert!(!q.contains("1") && !q.contains("3"));
        assert_eq!(q.get("2").unwrap().attempts, 1);
        assert_eq!(q.get("4").unwrap().attempts, 1);
    }
}
