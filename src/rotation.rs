//! # Rotation Scheduler
//!
//! Decides which sources a run polls. Always-poll tiers (`core`, `tier1`) are
//! queried every run. Every other tier forms a rotating group, one per
//! `(kind, tier)`, that contributes a slice of `K` members starting at its
//! cursor. A slice never wraps: the last slice of a cycle is simply shorter.
//!
//! Cursors move only through [`RotationState::advance`], which the patrol run
//! calls after its results are on disk, so a crashed run retries the same slice.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::ScheduleConfig;
use crate::source::{SourceKey, SourceKind, Tier};
use crate::store;
use crate::watchlist::Watchlist;

/// Stable name of a rotating group, e.g. `account:tier2_ai`.
pub fn group_name(kind: SourceKind, tier: &Tier) -> String {
    format!("{kind}:{tier}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    #[serde(default)]
    cursors: BTreeMap<String, usize>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl RotationState {
    pub fn load(path: &Path) -> Result<Self> {
        store::load_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        store::save_atomic(path, self)
    }

    /// Raw persisted cursor (may exceed the current group size).
    pub fn cursor(&self, group: &str) -> usize {
        self.cursors.get(group).copied().unwrap_or(0)
    }

    pub fn set_cursor(&mut self, group: &str, cursor: usize) {
        self.cursors.insert(group.to_string(), cursor);
    }

    /// Effective slice start for a group of `size` members.
    pub fn start_for(&self, group: &str, size: usize) -> usize {
        if size == 0 {
            0
        } else {
            self.cursor(group) % size
        }
    }

    /// Move `group` forward by `width`, modulo `size`.
    pub fn advance(&mut self, group: &str, width: usize, size: usize) {
        if size == 0 {
            return;
        }
        let next = (self.start_for(group, size) + width) % size;
        self.cursors.insert(group.to_string(), next);
    }

    pub fn cursors(&self) -> &BTreeMap<String, usize> {
        &self.cursors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    #[default]
    All,
    KeywordsOnly,
    AccountsOnly,
}

impl RunScope {
    pub fn includes(&self, kind: SourceKind) -> bool {
        match self {
            RunScope::All => true,
            RunScope::KeywordsOnly => kind == SourceKind::Keyword,
            RunScope::AccountsOnly => kind == SourceKind::Account,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    pub scope: RunScope,
    /// Poll every member of every group and leave all cursors in place.
    pub full_sweep: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSlice {
    pub group: String,
    pub kind: SourceKind,
    pub tier: Tier,
    pub start: usize,
    pub width: usize,
    pub group_size: usize,
    pub members: Vec<SourceKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SelectionPlan {
    pub always: Vec<SourceKey>,
    pub slices: Vec<GroupSlice>,
    pub full_sweep: bool,
}

impl SelectionPlan {
    /// Every selected source: always-poll first, then slices in group order.
    pub fn sources(&self) -> impl Iterator<Item = &SourceKey> {
        self.always
            .iter()
            .chain(self.slices.iter().flat_map(|s| s.members.iter()))
    }

    pub fn len(&self) -> usize {
        self.always.len() + self.slices.iter().map(|s| s.members.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-run width of a group: explicit override, then cycle target, then kind default.
pub fn width_for(schedule: &ScheduleConfig, kind: SourceKind, group: &str, size: usize) -> usize {
    if let Some(w) = schedule.group_widths.get(group) {
        return (*w).max(1);
    }
    if let Some(runs) = schedule.target_cycle_runs.filter(|n| *n > 0) {
        return size.div_ceil(runs).max(1);
    }
    match kind {
        SourceKind::Keyword => schedule.keywords_per_run.max(1),
        SourceKind::Account => schedule.accounts_per_run.max(1),
    }
}

/// Rotating groups of one kind, in order of first appearance in the watchlist.
fn rotating_groups(watchlist: &Watchlist, kind: SourceKind) -> Vec<(Tier, Vec<SourceKey>)> {
    let mut groups: Vec<(Tier, Vec<SourceKey>)> = Vec::new();
    for src in watchlist.list(kind).iter().filter(|s| !s.tier.is_always_poll()) {
        let key = SourceKey::new(kind, src.id.clone());
        match groups.iter_mut().find(|(t, _)| *t == src.tier) {
            Some((_, members)) => members.push(key),
            None => groups.push((src.tier.clone(), vec![key])),
        }
    }
    groups
}

pub fn select_for_run(
    watchlist: &Watchlist,
    state: &RotationState,
    schedule: &ScheduleConfig,
    options: PlanOptions,
) -> SelectionPlan {
    let mut plan = SelectionPlan {
        full_sweep: options.full_sweep,
        ..SelectionPlan::default()
    };

    for kind in SourceKind::ALL {
        if !options.scope.includes(kind) {
            continue;
        }
        plan.always.extend(
            watchlist
                .list(kind)
                .iter()
                .filter(|s| s.tier.is_always_poll())
                .map(|s| SourceKey::new(kind, s.id.clone())),
        );

        for (tier, members) in rotating_groups(watchlist, kind) {
            let group = group_name(kind, &tier);
            let size = members.len();
            let (start, width, picked) = if options.full_sweep {
                (0, size, members)
            } else {
                let width = width_for(schedule, kind, &group, size);
                let start = state.start_for(&group, size);
                let end = (start + width).min(size);
                (start, width, members[start..end].to_vec())
            };
            plan.slices.push(GroupSlice {
                group,
                kind,
                tier,
                start,
                width,
                group_size: size,
                members: picked,
            });
        }
    }
    plan
}
