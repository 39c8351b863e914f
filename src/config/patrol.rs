// src/config/patrol.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::maintain::MaintainThresholds;
use crate::source::{Protection, Tier};

pub const ENV_CONFIG_PATH: &str = "PATROL_CONFIG_PATH";
pub const ENV_STATE_DIR: &str = "PATROL_STATE_DIR";

/// Top-level patrol configuration. Every section has defaults, so an empty
/// file (or no file at all) yields a working setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatrolConfig {
    /// Directory holding the five persisted stores and the run lock.
    pub state_dir: PathBuf,
    pub schedule: ScheduleConfig,
    pub fetch: FetchConfig,
    pub filters: FilterConfig,
    pub thresholds: MaintainThresholds,
    pub maintain: MaintainConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            schedule: ScheduleConfig::default(),
            fetch: FetchConfig::default(),
            filters: FilterConfig::default(),
            thresholds: MaintainThresholds::default(),
            maintain: MaintainConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Slice width for rotating keyword groups.
    pub keywords_per_run: usize,
    /// Slice width for rotating account groups.
    pub accounts_per_run: usize,
    /// When set, each group is sized to finish one rotation in about this many runs.
    pub target_cycle_runs: Option<usize>,
    /// Explicit widths keyed by group name (`keyword:trending`, `account:tier2_ai`).
    pub group_widths: BTreeMap<String, usize>,
    /// Keep a group's cursor in place when any member of its slice failed to fetch.
    pub retry_failed_slices: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            keywords_per_run: 3,
            accounts_per_run: 6,
            target_cycle_runs: None,
            group_widths: BTreeMap::new(),
            retry_failed_slices: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Max concurrent fetches within one run.
    pub concurrency: usize,
    pub timeout_secs: u64,
    /// Hard bound for the whole fetch phase of one run.
    pub run_timeout_secs: u64,
    /// Base URL of the search/fetch gateway used by the binary.
    pub base_url: Option<String>,
    pub keyword_max_results: u32,
    pub account_max_results: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            timeout_secs: 30,
            run_timeout_secs: 300,
            base_url: None,
            keyword_max_results: 10,
            account_max_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Global exclude list, merged with per-source overrides.
    pub exclude_keywords: Vec<String>,
    pub lang: Option<String>,
    pub include_retweets: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_keywords: Vec::new(),
            lang: Some("en".to_string()),
            include_retweets: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintainConfig {
    pub protected_tiers: Vec<Tier>,
    /// Group that demoted `tier1` accounts land in (`tier2_<group>`).
    pub demote_group: String,
    /// `health().maintain_overdue` turns on after this many days without maintenance.
    pub interval_days: i64,
}

impl Default for MaintainConfig {
    fn default() -> Self {
        Self {
            protected_tiers: vec![Tier::CORE, Tier::TIER1],
            demote_group: "demoted".to_string(),
            interval_days: 3,
        }
    }
}

impl MaintainConfig {
    pub fn protection(&self) -> Protection {
        Protection::new(self.protected_tiers.iter().cloned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Items at or above this engagement surface their untracked author.
    pub min_engagement: f64,
    /// Queue bound; the newest entries survive.
    pub max_entries: usize,
    /// Entries resolved per maintenance pass.
    pub resolve_batch: usize,
    /// Unresolved entries older than this are pruned.
    pub ttl_days: i64,
    /// Resolved handles are proposed for `tier2_<group>`.
    pub propose_group: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_engagement: 1000.0,
            max_entries: 20,
            resolve_batch: 5,
            ttl_days: 14,
            propose_group: "discovered".to_string(),
        }
    }
}

impl PatrolConfig {
    /// Clamp out-of-range values instead of failing the run.
    pub fn sanitized(mut self) -> Self {
        self.schedule.keywords_per_run = self.schedule.keywords_per_run.max(1);
        self.schedule.accounts_per_run = self.schedule.accounts_per_run.max(1);
        if self.schedule.target_cycle_runs == Some(0) {
            self.schedule.target_cycle_runs = None;
        }
        self.schedule.group_widths.retain(|_, w| *w > 0);

        self.fetch.concurrency = self.fetch.concurrency.clamp(1, 8);
        self.fetch.timeout_secs = self.fetch.timeout_secs.max(1);
        self.fetch.run_timeout_secs = self.fetch.run_timeout_secs.max(self.fetch.timeout_secs);

        self.thresholds = self.thresholds.sanitized();

        if self.maintain.demote_group.trim().is_empty() {
            self.maintain.demote_group = MaintainConfig::default().demote_group;
        }
        if self.discovery.propose_group.trim().is_empty() {
            self.discovery.propose_group = DiscoveryConfig::default().propose_group;
        }
        self.discovery.max_entries = self.discovery.max_entries.max(1);
        self.discovery.ttl_days = self.discovery.ttl_days.max(1);
        self
    }
}

/// Load configuration from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<PatrolConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading patrol config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing patrol config {}", path.display()))?;
    Ok(cfg.sanitized())
}

/// Load configuration using env var + fallbacks:
/// 1) $PATROL_CONFIG_PATH
/// 2) config/patrol.toml
/// 3) config/patrol.json
/// 4) built-in defaults
///
/// `$PATROL_STATE_DIR`, when set, overrides `state_dir` from any source.
pub fn load_config_default() -> Result<PatrolConfig> {
    load_config(None)
}

/// Like [`load_config_default`], but an `explicit` path skips the lookup
/// chain. The `$PATROL_STATE_DIR` override applies on both paths.
pub fn load_config(explicit: Option<&Path>) -> Result<PatrolConfig> {
    let mut cfg = if let Some(p) = explicit {
        load_config_from(p)?
    } else if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if !pb.exists() {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        load_config_from(&pb)?
    } else {
        let toml_p = PathBuf::from("config/patrol.toml");
        let json_p = PathBuf::from("config/patrol.json");
        if toml_p.exists() {
            load_config_from(&toml_p)?
        } else if json_p.exists() {
            load_config_from(&json_p)?
        } else {
            PatrolConfig::default()
        }
    };
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        if !dir.trim().is_empty() {
            cfg.state_dir = PathBuf::from(dir);
        }
    }
    Ok(cfg)
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PatrolConfig> {
    if hint_ext == "json" {
        return Ok(serde_json::from_str(s)?);
    }
    match toml::from_str::<PatrolConfig>(s) {
        Ok(cfg) => Ok(cfg),
        Err(toml_err) => serde_json::from_str(s)
            .map_err(|_| anyhow!("unsupported config format: {toml_err}")),
    }
}
