//! # Sources & Tiers
//!
//! Core vocabulary shared by every store:
//!
//! - [`SourceKind`]: keyword search vs. account timeline.
//! - [`Tier`]: a tagged variant, `Fixed` for the well-known tiers and `Dynamic`
//!   for the user-defined `tier2_<group>` account groups. Grouping logic matches
//!   on the variant, never on a naming convention.
//! - [`Source`]: one tracked entry with optional per-source overrides.
//! - [`Item`]: one post/video record as returned by the fetch capability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::PatrolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Keyword,
    Account,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Keyword, SourceKind::Account];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Keyword => "keyword",
            SourceKind::Account => "account",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FixedTier {
    Core,
    Trending,
    Custom,
    Tier1,
}

/// Priority/grouping label of a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Tier {
    Fixed(FixedTier),
    /// `tier2_<group>`; the payload is the group suffix only.
    Dynamic(String),
}

const TIER2_PREFIX: &str = "tier2_";

impl Tier {
    pub const CORE: Tier = Tier::Fixed(FixedTier::Core);
    pub const TRENDING: Tier = Tier::Fixed(FixedTier::Trending);
    pub const CUSTOM: Tier = Tier::Fixed(FixedTier::Custom);
    pub const TIER1: Tier = Tier::Fixed(FixedTier::Tier1);

    pub fn tier2(group: impl Into<String>) -> Tier {
        Tier::Dynamic(group.into())
    }

    /// Whether this tier may hold sources of `kind`.
    pub fn fits(&self, kind: SourceKind) -> bool {
        match (self, kind) {
            (
                Tier::Fixed(FixedTier::Core | FixedTier::Trending | FixedTier::Custom),
                SourceKind::Keyword,
            ) => true,
            (Tier::Fixed(FixedTier::Tier1) | Tier::Dynamic(_), SourceKind::Account) => true,
            _ => false,
        }
    }

    /// Always-poll tiers are queried on every run; every other tier rotates.
    pub fn is_always_poll(&self) -> bool {
        matches!(self, Tier::Fixed(FixedTier::Core | FixedTier::Tier1))
    }

    /// Parse and validate against `kind` in one step.
    pub fn parse_for(kind: SourceKind, raw: &str) -> Result<Tier, PatrolError> {
        let tier: Tier = raw.parse().map_err(|_| PatrolError::InvalidTier {
            kind,
            tier: raw.to_string(),
        })?;
        if !tier.fits(kind) {
            return Err(PatrolError::InvalidTier {
                kind,
                tier: raw.to_string(),
            });
        }
        Ok(tier)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Fixed(FixedTier::Core) => f.write_str("core"),
            Tier::Fixed(FixedTier::Trending) => f.write_str("trending"),
            Tier::Fixed(FixedTier::Custom) => f.write_str("custom"),
            Tier::Fixed(FixedTier::Tier1) => f.write_str("tier1"),
            Tier::Dynamic(group) => write!(f, "{TIER2_PREFIX}{group}"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim().to_ascii_lowercase();
        match t.as_str() {
            "core" => Ok(Tier::CORE),
            "trending" => Ok(Tier::TRENDING),
            "custom" => Ok(Tier::CUSTOM),
            "tier1" => Ok(Tier::TIER1),
            other => match other.strip_prefix(TIER2_PREFIX) {
                Some(group)
                    if !group.is_empty()
                        && group
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
                {
                    Ok(Tier::Dynamic(group.to_string()))
                }
                _ => Err(format!("unknown tier '{s}'")),
            },
        }
    }
}

impl TryFrom<String> for Tier {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tier> for String {
    fn from(t: Tier) -> Self {
        t.to_string()
    }
}

/// Set of tiers exempt from removal (without force) and from auto-apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protection {
    tiers: BTreeSet<Tier>,
}

impl Protection {
    pub fn new(tiers: impl IntoIterator<Item = Tier>) -> Self {
        Self {
            tiers: tiers.into_iter().collect(),
        }
    }

    pub fn covers(&self, tier: &Tier) -> bool {
        self.tiers.contains(tier)
    }
}

impl Default for Protection {
    fn default() -> Self {
        Self::new([Tier::CORE, Tier::TIER1])
    }
}

/// Per-source filter overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_retweets: Option<bool>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.exclude_keywords.is_empty() && self.lang.is_none() && self.include_retweets.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Overrides::is_empty")]
    pub overrides: Overrides,
}

/// Identity of a source across stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub kind: SourceKind,
    pub id: String,
}

impl SourceKey {
    pub fn new(kind: SourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn keyword(id: impl Into<String>) -> Self {
        Self::new(SourceKind::Keyword, id)
    }

    pub fn account(id: impl Into<String>) -> Self {
        Self::new(SourceKind::Account, id)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SourceKind::Keyword => write!(f, "keyword:{}", self.id),
            SourceKind::Account => write!(f, "@{}", self.id),
        }
    }
}

/// Canonical id: trimmed; account handles lose a leading `@`.
pub fn normalize_id(kind: SourceKind, raw: &str) -> String {
    let t = raw.trim();
    match kind {
        SourceKind::Keyword => t.to_string(),
        SourceKind::Account => t.trim_start_matches('@').to_string(),
    }
}

/// One post/video record returned by the fetch capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub author_id: String,
    pub engagement_score: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Item {
    /// Engagement for payloads that report raw counts: reposts weigh 3x.
    pub fn engagement_from_counts(likes: u64, reposts: u64) -> f64 {
        likes as f64 + 3.0 * reposts as f64
    }
}

/// Descriptor handed to the fetch capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub key: SourceKey,
    /// Keyword: the full search query. Account: the handle.
    pub query: String,
}

/// Case-insensitive substring match against an exclude list.
pub fn matches_exclude(text: &str, exclude: &[String]) -> bool {
    if exclude.is_empty() {
        return false;
    }
    let lower = text.to_lowercase();
    exclude
        .iter()
        .filter(|e| !e.trim().is_empty())
        .any(|e| lower.contains(&e.trim().to_lowercase()))
}
