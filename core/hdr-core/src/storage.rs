//! Storage configuration and path management for the HDR module.
//!
//! Every file the panel touches lives under the module directory on the
//! device. Centralising the layout here keeps the rest of the crate free of
//! string-built paths and lets tests point a whole session at a temp dir.
//!
//! ## Layout
//!
//! ```text
//! <module_dir>/
//!   app_cache.json                          label cache
//!   appList.xml                             selection, feature encoding
//!   appList_new.xml                         selection, uir encoding
//!   webui.toml                              optional tunables
//!   webui.log                               log sink (cleared per launch)
//!   multimedia_display_feature_config.xml   derived by the merge step
//!   multimedia_display_uir_config.xml       derived by the merge step
//!   backup/                                 stock OS configs
//!   bin/<abi>/aapt                          bundled badging tool
//! ```

use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODULE_DIR: &str = "/data/adb/modules/enable-hdr-oneplus13-webui";
pub const MODULE_DIR_ENV: &str = "HDR_MODULE_DIR";

/// Central configuration for all module storage paths.
///
/// Production code uses `StorageConfig::default()`, which honours
/// `HDR_MODULE_DIR` before falling back to the installed module path.
/// Tests use `StorageConfig::with_root(temp_dir)` for isolation.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = env::var_os(MODULE_DIR_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULE_DIR));
        Self { root }
    }
}

impl StorageConfig {
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Returns the module directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Panel Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to app_cache.json (package → label cache).
    pub fn cache_file(&self) -> PathBuf {
        self.root.join("app_cache.json")
    }

    /// Path to appList.xml (`<application name="..."></application>` lines).
    pub fn app_list_file(&self) -> PathBuf {
        self.root.join("appList.xml")
    }

    /// Path to appList_new.xml (`<app>...</app>` lines).
    pub fn app_list_new_file(&self) -> PathBuf {
        self.root.join("appList_new.xml")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("webui.toml")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("webui.log")
    }

    /// Files the selection store reads at startup, in union order.
    pub fn selection_sources(&self) -> Vec<PathBuf> {
        vec![self.app_list_file()]
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // OS Config Files
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn feature_config_backup(&self) -> PathBuf {
        self.backup_dir()
            .join("multimedia_display_feature_config.xml")
    }

    pub fn uir_config_backup(&self) -> PathBuf {
        self.backup_dir().join("multimedia_display_uir_config.xml")
    }

    pub fn feature_config_module(&self) -> PathBuf {
        self.root.join("multimedia_display_feature_config.xml")
    }

    pub fn uir_config_module(&self) -> PathBuf {
        self.root.join("multimedia_display_uir_config.xml")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Tools
    // ─────────────────────────────────────────────────────────────────────────────

    /// Path to the bundled aapt binary for an ABI.
    /// Example: <module_dir>/bin/arm64-v8a/aapt
    pub fn bundled_aapt(&self, abi: &str) -> PathBuf {
        self.root.join("bin").join(abi).join("aapt")
    }
}
