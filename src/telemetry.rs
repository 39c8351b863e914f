use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::path::Path;

use crate::store;

/// One-time metrics registration (so series carry help text in the export).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("patrol_runs_total", "Completed patrol runs.");
        describe_counter!(
            "patrol_sources_polled_total",
            "Sources polled, labelled by outcome (hit/miss/error)."
        );
        describe_counter!("patrol_new_items_total", "Items that passed dedup and filters.");
        describe_counter!(
            "patrol_duplicates_total",
            "Items dropped because the ledger had seen them."
        );
        describe_counter!(
            "patrol_excluded_total",
            "Items dropped by exclude keywords."
        );
        describe_counter!("patrol_fetch_errors_total", "Fetch failures and timeouts.");
        describe_counter!(
            "patrol_discoveries_total",
            "Untracked authors added to the discovery queue."
        );
        describe_histogram!("patrol_fetch_ms", "Per-source fetch latency in milliseconds.");
        describe_gauge!("patrol_last_run_ts", "Unix ts when the last patrol run finished.");
        describe_gauge!("patrol_watchlist_sources", "Tracked sources per kind.");
        describe_counter!(
            "maintain_recommendations_total",
            "Recommendations produced by maintenance, by rule."
        );
        describe_counter!("maintain_applied_total", "Recommendations auto-applied.");
        describe_counter!(
            "maintain_resolutions_total",
            "Discovery resolutions, labelled by result."
        );
    });
}

/// Prometheus recorder whose snapshot is written as a textfile at exit.
pub struct Telemetry {
    handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the global recorder. Call at most once per process.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the exposition text for a node-exporter textfile collector.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        store::write_atomic(path, self.render().as_bytes())
            .with_context(|| format!("writing metrics textfile {}", path.display()))
    }
}
