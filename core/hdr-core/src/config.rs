//! Runtime tunables for the label pipeline and selection store.
//!
//! Loaded from `<module_dir>/webui.toml` when present. Every field has a
//! default, so a partial file only overrides what it names:
//!
//! ```toml
//! [scheduler]
//! concurrency = 16
//! max_retry_count = 5
//!
//! [selection]
//! auto_save = false
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{HdrError, Result};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PanelConfig {
    pub scheduler: SchedulerConfig,
    pub strategies: StrategyTimeouts,
    pub monitor: MonitorConfig,
    pub cache: CacheConfig,
    pub selection: SelectionConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub max_retry_count: u32,
    /// Wall-clock budget per package, measured from its first attempt.
    pub total_timeout_ms: u64,
    /// Outer race around the whole badging strategy.
    pub badging_race_ms: u64,
    /// Outer race around the whole dump strategy.
    pub dump_race_ms: u64,
    /// Size of the batch host-API lookup issued at startup.
    pub eager_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            max_retry_count: 3,
            total_timeout_ms: 10_000,
            badging_race_ms: 8_000,
            dump_race_ms: 5_000,
            eager_batch: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StrategyTimeouts {
    pub api_ms: u64,
    pub apk_path_ms: u64,
    pub badging_ms: u64,
    pub dump_ms: u64,
}

impl Default for StrategyTimeouts {
    fn default() -> Self {
        Self {
            api_ms: 3_000,
            apk_path_ms: 3_000,
            badging_ms: 5_000,
            dump_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub stall_threshold_ms: u64,
    pub stall_batch: usize,
    pub stuck_item_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            stall_threshold_ms: 10_000,
            stall_batch: 10,
            stuck_item_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub debounce_ms: u64,
    pub flush_every: usize,
    pub periodic_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            flush_every: 20,
            periodic_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SelectionConfig {
    pub auto_save: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self { auto_save: true }
    }
}

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Reads the config file. A missing file yields defaults.
pub fn load_panel_config(path: &Path) -> Result<PanelConfig> {
    if !path.exists() {
        return Ok(PanelConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| HdrError::io(format!("read {}", path.display()), err))?;
    toml::from_str::<PanelConfig>(&content).map_err(|source| HdrError::ConfigMalformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`load_panel_config`], but a broken file is logged and replaced by defaults.
pub fn load_panel_config_or_default(path: &Path) -> PanelConfig {
    match load_panel_config(path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load panel config; using defaults");
            PanelConfig::default()
        }
    }
}
