// src/config/mod.rs
pub mod patrol;

pub use patrol::{
    load_config, load_config_default, load_config_from, DiscoveryConfig, FetchConfig,
    FilterConfig, MaintainConfig, PatrolConfig, ScheduleConfig, ENV_CONFIG_PATH, ENV_STATE_DIR,
};
