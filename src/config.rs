//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - squill.toml (project configuration)
//! - Environment variables (SQUILL_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # squill.toml
//! [execution]
//! auto_complete_ticks = 2
//!
//! [logging]
//! filter = "squill=debug"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! SQUILL_EXECUTION__AUTO_COMPLETE_TICKS=3
//! SQUILL_LOGGING__FILTER=squill=trace
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Idle ticks an in-memory transaction waits after its last
    /// `delay_complete` before auto-completing.
    #[serde(default = "default_auto_complete_ticks")]
    pub auto_complete_ticks: u8,
}

fn default_auto_complete_ticks() -> u8 {
    2
}

impl Default for ExecutionConfig {
    fn default() -> ExecutionConfig {
        ExecutionConfig {
            auto_complete_ticks: default_auto_complete_ticks(),
        }
    }
}

/// Diagnostics settings; the filter string is for embedders wiring up a
/// tracing subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "squill=warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            filter: default_filter(),
        }
    }
}

impl EngineConfig {
    /// Load from squill.toml and SQUILL_* environment overrides.
    pub fn load() -> Result<EngineConfig, figment::Error> {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file("squill.toml"))
            .merge(Env::prefixed("SQUILL_").split("__"))
            .extract()
    }

    /// Process-wide configuration, loaded once; falls back to defaults on
    /// load errors.
    pub fn global() -> &'static EngineConfig {
        static GLOBAL: OnceLock<EngineConfig> = OnceLock::new();
        GLOBAL.get_or_init(|| EngineConfig::load().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.execution.auto_complete_ticks, 2);
        assert!(config.logging.filter.contains("squill"));
    }

    #[test]
    fn global_is_stable() {
        let a = EngineConfig::global();
        let b = EngineConfig::global();
        assert_eq!(a.execution.auto_complete_ticks, b.execution.auto_complete_ticks);
    }
}
