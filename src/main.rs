//! scout-patrol CLI entrypoint.
//! Wires configuration, logging and the HTTP gateway into the [`Patrol`] engine.
//!
//! See `README.md` for the state layout and the config reference.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scout_patrol::config::{load_config, ENV_CONFIG_PATH};
use scout_patrol::fetch::http::HttpFetcher;
use scout_patrol::maintain::Action;
use scout_patrol::patrol::SourceOutcome;
use scout_patrol::telemetry::Telemetry;
use scout_patrol::{Overrides, Patrol, PlanOptions, RunScope, SourceKind, Tier};

#[derive(Parser)]
#[command(
    name = "scout-patrol",
    version,
    about = "Budgeted keyword/account patrol with a self-maintaining watchlist"
)]
struct Cli {
    /// Config file (TOML or JSON)
    #[arg(long, global = true, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    /// State directory (overrides config)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Write Prometheus metrics to this textfile on exit
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Keyword,
    Account,
}

impl From<KindArg> for SourceKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Keyword => SourceKind::Keyword,
            KindArg::Account => SourceKind::Account,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run one patrol over the selected sources
    Patrol {
        /// Keywords only
        #[arg(long, conflicts_with = "accounts")]
        keywords: bool,
        /// Accounts only
        #[arg(long)]
        accounts: bool,
        /// Poll every source and leave rotation cursors untouched
        #[arg(long)]
        all: bool,
    },
    /// Aggregate health snapshot
    Health,
    /// Tier counts, rotation cursors and top accounts
    Status,
    /// Analyze sources, resolve discoveries, optionally apply safe actions
    Maintain {
        #[arg(long)]
        apply: bool,
    },
    /// Ad-hoc keyword search; records nothing
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        max_results: u32,
    },
    /// Resolve queued discovered authors
    Resolve {
        #[arg(long, default_value_t = 5)]
        max: usize,
    },
    AddKeyword {
        keyword: String,
        #[arg(long, default_value = "trending")]
        tier: String,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        #[arg(long)]
        lang: Option<String>,
    },
    AddAccount {
        handle: String,
        #[arg(long, default_value = "tier2_builders")]
        tier: String,
    },
    RemoveKeyword {
        keyword: String,
        /// Allow removing a protected source
        #[arg(long)]
        force: bool,
    },
    RemoveAccount {
        handle: String,
        #[arg(long)]
        force: bool,
    },
    SetTier {
        #[arg(value_enum)]
        kind: KindArg,
        id: String,
        tier: String,
    },
}

/// `RUST_LOG` wins; `PATROL_LOG_FORMAT=json` switches to JSON lines.
/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scout_patrol=info,warn"));
    let json = std::env::var("PATROL_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; PATROL_* and the gateway token may live there.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    let mut cfg = load_config(cli.config.as_deref())?;
    if let Some(dir) = &cli.state_dir {
        cfg.state_dir = dir.clone();
    }

    let telemetry = match &cli.metrics_file {
        Some(_) => Some(Telemetry::install()?),
        None => None,
    };

    let mut patrol = Patrol::open(cfg).context("opening patrol state")?;
    let outcome = dispatch(&cli, &mut patrol).await;

    if let (Some(t), Some(path)) = (&telemetry, &cli.metrics_file) {
        if let Err(e) = t.write_textfile(path) {
            tracing::warn!(error = ?e, "metrics textfile not written");
        }
    }
    outcome
}

async fn dispatch(cli: &Cli, patrol: &mut Patrol) -> Result<()> {
    let json = cli.json;
    match &cli.command {
        Command::Patrol {
            keywords,
            accounts,
            all,
        } => {
            let scope = if *keywords {
                RunScope::KeywordsOnly
            } else if *accounts {
                RunScope::AccountsOnly
            } else {
                RunScope::All
            };
            let fetcher = HttpFetcher::from_config(&patrol.config().fetch)?;
            let report = patrol
                .run_patrol(
                    &fetcher,
                    PlanOptions {
                        scope,
                        full_sweep: *all,
                    },
                )
                .await?;
            emit(json, &report, |r| {
                for s in &r.sources {
                    let line = match &s.outcome {
                        SourceOutcome::Hit { new_items } => format!("hit  +{new_items}"),
                        SourceOutcome::Miss => "miss".to_string(),
                        SourceOutcome::Error { message } => format!("ERR  {message}"),
                    };
                    println!("{:<32} {line}", s.key.to_string());
                }
                println!(
                    "\n{} new items, {} sources; advanced: [{}] held: [{}]",
                    r.items.len(),
                    r.sources.len(),
                    r.advanced.join(", "),
                    r.held.join(", ")
                );
                if !r.discovered.is_empty() {
                    println!("discovered authors: {}", r.discovered.join(", "));
                }
            })
        }
        Command::Health => emit(json, &patrol.health(), |h| {
            println!(
                "accounts:        {} (tier1 {}, rotating {})",
                h.total_accounts, h.tier1_accounts, h.rotating_accounts
            );
            println!("keywords:        {}", h.total_keywords);
            println!("data coverage:   {:.0}%", h.data_coverage * 100.0);
            println!("avg engagement:  {:.1}", h.avg_engagement);
            println!("unresolved ids:  {}", h.unresolved_discoveries);
            println!("seen items:      {}", h.seen_items);
            println!(
                "last run:        {}",
                h.last_run_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into())
            );
            println!("needs maintain:  {} (overdue: {})", h.needs_maintain, h.maintain_overdue);
        }),
        Command::Status => emit(json, &patrol.status(), |s| {
            for (tier, n) in &s.tiers {
                println!("{tier:<28} {n}");
            }
            println!();
            for g in &s.groups {
                println!(
                    "{:<28} next {}..{} of {}: {}",
                    g.group,
                    g.next_start,
                    g.next_start + g.next_slice.len(),
                    g.size,
                    g.next_slice.join(", ")
                );
            }
            if !s.top_accounts.is_empty() {
                println!("\ntop accounts:");
                for a in &s.top_accounts {
                    println!(
                        "  @{:<24} {:>8.1}  [{}] {} runs",
                        a.id, a.avg_engagement, a.tier, a.total_runs
                    );
                }
            }
        }),
        Command::Maintain { apply } => {
            let resolver = HttpFetcher::from_config(&patrol.config().fetch)?;
            let report = patrol.maintain(&resolver, *apply).await?;
            emit(json, &report, |r| {
                if r.recommendations.is_empty() {
                    println!("no recommendations");
                }
                for rec in &r.recommendations {
                    let action = match &rec.action {
                        Action::Remove => "remove".to_string(),
                        Action::Demote { to } => format!("demote -> {to}"),
                        Action::Promote { to } => format!("promote -> {to}"),
                    };
                    println!(
                        "{}{:<28} [{}] {action}: {} (runs {}, hits {})",
                        if rec.protected { "(protected) " } else { "" },
                        rec.key.to_string(),
                        rec.tier,
                        rec.detail,
                        rec.sample.total_runs,
                        rec.sample.hits
                    );
                }
                for a in &r.applied {
                    println!("applied: {} {:?}", a.key, a.rule);
                }
                for k in &r.strong_keywords {
                    println!(
                        "strong keyword: '{}' [{}] avg {:.1} results, engagement {:.1}",
                        k.id, k.tier, k.avg_result_count, k.avg_engagement
                    );
                }
                for p in &r.proposals {
                    println!(
                        "proposal: add @{} to {} (engagement {:.0})",
                        p.id, p.tier, p.engagement
                    );
                }
                if !r.pruned.is_empty() {
                    println!("pruned stale discoveries: {}", r.pruned.join(", "));
                }
            })
        }
        Command::Search { query, max_results } => {
            let mut fetch = patrol.config().fetch.clone();
            fetch.keyword_max_results = *max_results;
            let fetcher = HttpFetcher::from_config(&fetch)?;
            let items = patrol.search(&fetcher, query).await?;
            emit(json, &items, |its| {
                if its.is_empty() {
                    println!("no results");
                }
                for it in its {
                    let text: String = it.text.chars().take(80).collect();
                    println!("{:>8.0}  {:<20} {}", it.engagement_score, it.author_id, text);
                }
            })
        }
        Command::Resolve { max } => {
            let resolver = HttpFetcher::from_config(&patrol.config().fetch)?;
            let out = patrol.resolve_discoveries(&resolver, *max).await?;
            emit(json, &out, |rs| {
                for r in rs {
                    println!("{:<20} {:?}", r.raw_id, r.outcome);
                }
            })
        }
        Command::AddKeyword {
            keyword,
            tier,
            exclude,
            lang,
        } => {
            let tier = Tier::parse_for(SourceKind::Keyword, tier)?;
            let overrides = Overrides {
                exclude_keywords: exclude.clone(),
                lang: lang.clone(),
                include_retweets: None,
            };
            let src = patrol.add_source(SourceKind::Keyword, keyword, tier, overrides)?;
            emit(json, &src, |s| println!("added keyword '{}' to {}", s.id, s.tier))
        }
        Command::AddAccount { handle, tier } => {
            let tier = Tier::parse_for(SourceKind::Account, tier)?;
            let src = patrol.add_source(SourceKind::Account, handle, tier, Overrides::default())?;
            emit(json, &src, |s| println!("added @{} to {}", s.id, s.tier))
        }
        Command::RemoveKeyword { keyword, force } => {
            let src = patrol.remove_source(SourceKind::Keyword, keyword, *force)?;
            emit(json, &src, |s| println!("removed keyword '{}' from {}", s.id, s.tier))
        }
        Command::RemoveAccount { handle, force } => {
            let src = patrol.remove_source(SourceKind::Account, handle, *force)?;
            emit(json, &src, |s| println!("removed @{} from {}", s.id, s.tier))
        }
        Command::SetTier { kind, id, tier } => {
            let kind = SourceKind::from(*kind);
            let tier = Tier::parse_for(kind, tier)?;
            let changed = patrol.set_tier(kind, id, tier.clone())?;
            emit(json, &changed, |c| {
                if *c {
                    println!("{kind} '{id}' moved to {tier}");
                } else {
                    println!("{kind} '{id}' already in {tier}");
                }
            })
        }
    }
}
