// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod maintain;
pub mod patrol;
pub mod rotation;
pub mod source;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod watchlist;

// ---- Re-exports for stable public API ----
pub use crate::config::{load_config, load_config_default, load_config_from, PatrolConfig};
pub use crate::error::{PatrolError, Result};
pub use crate::fetch::{IdentityResolver, SourceFetcher};
pub use crate::maintain::{HealthReport, MaintenanceReport, Recommendation, StatusReport};
pub use crate::patrol::{Patrol, RunReport, SourceOutcome};
pub use crate::rotation::{PlanOptions, RunScope};
pub use crate::source::{Item, Overrides, Source, SourceKey, SourceKind, Tier};
