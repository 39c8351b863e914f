//! # Watchlist Store
//!
//! Tracked keywords and accounts, each kept in insertion order. Persisted as a
//! human-editable TOML file:
//!
//! ```toml
//! [[keywords]]
//! id = "rust async"
//! tier = "core"
//! created_at = "2026-10-01T08:00:00Z"
//!
//! [[accounts]]
//! id = "karpathy"
//! tier = "tier2_ai"
//! created_at = "2026-10-01T08:00:00Z"
//! ```

use anyhow::Result as AnyResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{PatrolError, Result};
use crate::source::{normalize_id, Overrides, Protection, Source, SourceKind, Tier};
use crate::store;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WatchlistFile {
    #[serde(default)]
    keywords: Vec<Source>,
    #[serde(default)]
    accounts: Vec<Source>,
}

#[derive(Debug, Clone, Default)]
pub struct Watchlist {
    keywords: Vec<Source>,
    accounts: Vec<Source>,
    protection: Protection,
}

impl Watchlist {
    pub fn new(protection: Protection) -> Self {
        Self {
            keywords: Vec::new(),
            accounts: Vec::new(),
            protection,
        }
    }

    /// Load from disk. Entries whose tier does not fit their kind, and repeated
    /// ids, are dropped with a warning.
    pub fn load(path: &Path, protection: Protection) -> AnyResult<Self> {
        let file: WatchlistFile = store::load_or_default(path)?;
        let mut wl = Self::new(protection);
        for (kind, entries) in [
            (SourceKind::Keyword, file.keywords),
            (SourceKind::Account, file.accounts),
        ] {
            let mut seen = HashSet::new();
            for mut src in entries {
                src.id = normalize_id(kind, &src.id);
                if src.id.is_empty() || !src.tier.fits(kind) || !seen.insert(src.id.clone()) {
                    tracing::warn!(
                        target: "store",
                        kind = %kind,
                        id = %src.id,
                        tier = %src.tier,
                        "skipping invalid or repeated watchlist entry"
                    );
                    continue;
                }
                wl.entries_mut(kind).push(src);
            }
        }
        Ok(wl)
    }

    pub fn save(&self, path: &Path) -> AnyResult<()> {
        let file = WatchlistFile {
            keywords: self.keywords.clone(),
            accounts: self.accounts.clone(),
        };
        store::save_atomic(path, &file)
    }

    pub fn protection(&self) -> &Protection {
        &self.protection
    }

    pub fn is_protected(&self, tier: &Tier) -> bool {
        self.protection.covers(tier)
    }

    pub fn list(&self, kind: SourceKind) -> &[Source] {
        match kind {
            SourceKind::Keyword => &self.keywords,
            SourceKind::Account => &self.accounts,
        }
    }

    fn entries_mut(&mut self, kind: SourceKind) -> &mut Vec<Source> {
        match kind {
            SourceKind::Keyword => &mut self.keywords,
            SourceKind::Account => &mut self.accounts,
        }
    }

    pub fn get(&self, kind: SourceKind, id: &str) -> Option<&Source> {
        let id = normalize_id(kind, id);
        self.list(kind).iter().find(|s| s.id == id)
    }

    pub fn contains(&self, kind: SourceKind, id: &str) -> bool {
        self.get(kind, id).is_some()
    }

    pub fn tier_of(&self, kind: SourceKind, id: &str) -> Option<&Tier> {
        self.get(kind, id).map(|s| &s.tier)
    }

    pub fn len(&self, kind: SourceKind) -> usize {
        self.list(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.accounts.is_empty()
    }

    pub fn add(
        &mut self,
        kind: SourceKind,
        id: &str,
        tier: Tier,
        overrides: Overrides,
    ) -> Result<Source> {
        let id = normalize_id(kind, id);
        if id.is_empty() {
            return Err(PatrolError::EmptyId { kind });
        }
        if !tier.fits(kind) {
            return Err(PatrolError::InvalidTier {
                kind,
                tier: tier.to_string(),
            });
        }
        if self.contains(kind, &id) {
            return Err(PatrolError::DuplicateSource { kind, id });
        }
        let src = Source {
            id,
            tier,
            created_at: Utc::now(),
            overrides,
        };
        self.entries_mut(kind).push(src.clone());
        Ok(src)
    }

    /// Remove a source; protected tiers require `force`.
    pub fn remove(&mut self, kind: SourceKind, id: &str, force: bool) -> Result<Source> {
        let id = normalize_id(kind, id);
        let pos = self
            .list(kind)
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| PatrolError::NotFound {
                kind,
                id: id.clone(),
            })?;
        let tier = &self.list(kind)[pos].tier;
        if !force && self.protection.covers(tier) {
            return Err(PatrolError::ProtectedTier {
                kind,
                id,
                tier: tier.to_string(),
            });
        }
        Ok(self.entries_mut(kind).remove(pos))
    }

    /// Move a source to `tier`. Returns `false` when it was already there.
    pub fn set_tier(&mut self, kind: SourceKind, id: &str, tier: Tier) -> Result<bool> {
        if !tier.fits(kind) {
            return Err(PatrolError::InvalidTier {
                kind,
                tier: tier.to_string(),
            });
        }
        let id = normalize_id(kind, id);
        let src = self
            .entries_mut(kind)
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| PatrolError::NotFound {
                kind,
                id: id.clone(),
            })?;
        if src.tier == tier {
            return Ok(false);
        }
        src.tier = tier;
        Ok(true)
    }

    pub fn set_overrides(
        &mut self,
        kind: SourceKind,
        id: &str,
        overrides: Overrides,
    ) -> Result<()> {
        let id = normalize_id(kind, id);
        let src = self
            .entries_mut(kind)
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(PatrolError::NotFound { kind, id })?;
        src.overrides = overrides;
        Ok(())
    }
}
