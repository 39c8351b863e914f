//! # Source Statistics
//!
//! One [`MetricRecord`] per polled source, updated once per run. Averages are
//! plain running means, `avg' = avg + (x - avg) / n`, so they never need the
//! raw history.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::source::{Item, SourceKey, SourceKind};
use crate::store;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricRecord {
    /// Runs that returned at least one new item.
    pub hits: u64,
    /// Runs that returned nothing new (fetch failures included).
    pub misses: u64,
    /// Length of the current trailing run of misses.
    pub consecutive_misses: u64,
    pub total_runs: u64,
    pub avg_engagement: f64,
    /// Number of items folded into `avg_engagement`.
    pub engagement_samples: u64,
    /// Keywords only: mean new items per run.
    pub avg_result_count: f64,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

fn fold(avg: f64, x: f64, n: u64) -> f64 {
    if n == 0 {
        return avg;
    }
    avg + (x - avg) / n as f64
}

impl MetricRecord {
    pub fn hit_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            self.hits as f64 / self.total_runs as f64
        }
    }

    /// Fold one run's post-dedup items into the record.
    pub fn record(&mut self, kind: SourceKind, items: &[Item], now: DateTime<Utc>) {
        self.total_runs += 1;
        self.last_polled_at = Some(now);

        if items.is_empty() {
            self.misses += 1;
            self.consecutive_misses += 1;
        } else {
            self.hits += 1;
            self.consecutive_misses = 0;
            self.last_active_at = Some(now);
            for it in items {
                self.engagement_samples += 1;
                self.avg_engagement =
                    fold(self.avg_engagement, it.engagement_score, self.engagement_samples);
            }
        }

        if kind == SourceKind::Keyword {
            self.avg_result_count =
                fold(self.avg_result_count, items.len() as f64, self.total_runs);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsStore {
    #[serde(default)]
    keywords: BTreeMap<String, MetricRecord>,
    #[serde(default)]
    accounts: BTreeMap<String, MetricRecord>,
    #[serde(default)]
    pub last_maintain_at: Option<DateTime<Utc>>,
}

impl MetricsStore {
    pub fn load(path: &Path) -> Result<Self> {
        store::load_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        store::save_atomic(path, self)
    }

    fn map(&self, kind: SourceKind) -> &BTreeMap<String, MetricRecord> {
        match kind {
            SourceKind::Keyword => &self.keywords,
            SourceKind::Account => &self.accounts,
        }
    }

    fn map_mut(&mut self, kind: SourceKind) -> &mut BTreeMap<String, MetricRecord> {
        match kind {
            SourceKind::Keyword => &mut self.keywords,
            SourceKind::Account => &mut self.accounts,
        }
    }

    pub fn get(&self, key: &SourceKey) -> Option<&MetricRecord> {
        self.map(key.kind).get(&key.id)
    }

    pub fn record_run(&mut self, key: &SourceKey, items: &[Item]) -> &MetricRecord {
        self.record_run_at(key, items, Utc::now())
    }

    pub fn record_run_at(
        &mut self,
        key: &SourceKey,
        items: &[Item],
        now: DateTime<Utc>,
    ) -> &MetricRecord {
        let rec = self.map_mut(key.kind).entry(key.id.clone()).or_default();
        rec.record(key.kind, items, now);
        rec
    }

    /// A failed or timed-out fetch counts as a miss.
    pub fn record_failure(&mut self, key: &SourceKey) -> &MetricRecord {
        self.record_run_at(key, &[], Utc::now())
    }

    pub fn remove(&mut self, key: &SourceKey) -> Option<MetricRecord> {
        self.map_mut(key.kind).remove(&key.id)
    }

    pub fn iter(&self, kind: SourceKind) -> impl Iterator<Item = (&String, &MetricRecord)> {
        self.map(kind).iter()
    }

    pub fn len(&self, kind: SourceKind) -> usize {
        self.map(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.accounts.is_empty()
    }
}
