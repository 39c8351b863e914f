//! # Seen-ID Ledger
//!
//! Bounded history of item ids already reported, one FIFO partition per
//! source kind so that id spaces of keyword search and account timelines never
//! suppress each other. Each partition holds at most [`LEDGER_CAPACITY`] ids;
//! recording an id that is already present does not refresh its position.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::Path;

use crate::source::SourceKind;
use crate::store;

pub const LEDGER_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
struct Partition {
    order: VecDeque<String>,
    index: HashSet<String>,
    cap: usize,
}

impl Partition {
    fn with_capacity(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            index: HashSet::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    fn from_ids(ids: Vec<String>, cap: usize) -> Self {
        let mut p = Self::with_capacity(cap);
        for id in ids {
            p.record(id);
        }
        p
    }

    fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    fn record(&mut self, id: String) -> bool {
        if self.index.contains(&id) {
            return false;
        }
        self.index.insert(id.clone());
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.index.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    keyword: Vec<String>,
    #[serde(default)]
    account: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "LedgerFile", into = "LedgerFile")]
pub struct SeenLedger {
    keyword: Partition,
    account: Partition,
}

impl Default for SeenLedger {
    fn default() -> Self {
        Self::with_capacity(LEDGER_CAPACITY)
    }
}

impl From<LedgerFile> for SeenLedger {
    fn from(f: LedgerFile) -> Self {
        Self {
            keyword: Partition::from_ids(f.keyword, LEDGER_CAPACITY),
            account: Partition::from_ids(f.account, LEDGER_CAPACITY),
        }
    }
}

impl From<SeenLedger> for LedgerFile {
    fn from(l: SeenLedger) -> Self {
        Self {
            keyword: l.keyword.order.into_iter().collect(),
            account: l.account.order.into_iter().collect(),
        }
    }
}

impl SeenLedger {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            keyword: Partition::with_capacity(cap),
            account: Partition::with_capacity(cap),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        store::load_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        store::save_atomic(path, self)
    }

    fn partition(&self, kind: SourceKind) -> &Partition {
        match kind {
            SourceKind::Keyword => &self.keyword,
            SourceKind::Account => &self.account,
        }
    }

    fn partition_mut(&mut self, kind: SourceKind) -> &mut Partition {
        match kind {
            SourceKind::Keyword => &mut self.keyword,
            SourceKind::Account => &mut self.account,
        }
    }

    pub fn is_new(&self, kind: SourceKind, item_id: &str) -> bool {
        !self.partition(kind).contains(item_id)
    }

    /// Append `item_id`, evicting the oldest entry past capacity.
    /// Returns `false` when the id was already present.
    pub fn record(&mut self, kind: SourceKind, item_id: &str) -> bool {
        self.partition_mut(kind).record(item_id.to_string())
    }

    pub fn len(&self, kind: SourceKind) -> usize {
        self.partition(kind).order.len()
    }

    pub fn total_len(&self) -> usize {
        self.keyword.order.len() + self.account.order.len()
    }

    /// Oldest surviving id of a partition.
    pub fn oldest(&self, kind: SourceKind) -> Option<&str> {
        self.partition(kind).order.front().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_eviction_keeps_last_distinct_inserts() {
        let mut l = SeenLedger::default();
        for i in 0..1_234 {
            l.record(SourceKind::Keyword, &format!("p{i}"));
            assert!(l.len(SourceKind::Keyword) <= LEDGER_CAPACITY);
        }
        assert_eq!(l.len(SourceKind::Keyword), LEDGER_CAPACITY);
        assert_eq!(l.oldest(SourceKind::Keyword), Some("p734"));
        assert!(l.is_new(SourceKind::Keyword, "p733"));
        assert!(!l.is_new(SourceKind::Keyword, "p1233"));
    }

    #[test]
    fn rerecording_does_not_refresh_position() {
        let mut l = SeenLedger::with_capacity(3);
        assert!(l.record(SourceKind::Account, "a"));
        l.record(SourceKind::Account, "b");
        assert!(!l.record(SourceKind::Account, "a"));
        l.record(SourceKind::Account, "c");
        l.record(SourceKind::Account, "d");
        assert!(l.is_new(SourceKind::Account, "a"));
        assert_eq!(l.oldest(SourceKind::Account), Some("b"));
    }

    #[test]
    fn partitions_are_independent() {
        let mut l = SeenLedger::default();
        l.record(SourceKind::Keyword, "123");
        assert!(!l.is_new(SourceKind::Keyword, "123"));
        assert!(l.is_new(SourceKind::Account, "123"));
    }

    #[test]
    fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("seen.json");
        let mut l = SeenLedger::default();
        for i in 0..600 {
            l.record(SourceKind::Account, &i.to_string());
        }
        l.save(&p).unwrap();
        let back = SeenLedger::load(&p).unwrap();
        assert_eq!(back.len(SourceKind::Account), LEDGER_CAPACITY);
        assert_eq!(back.oldest(SourceKind::Account), Some("100"));
        assert!(!back.is_new(SourceKind::Account, "599"));
        assert!(back.is_new(SourceKind::Account, "99"));
    }
}
