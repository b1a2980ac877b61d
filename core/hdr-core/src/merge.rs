//! Folds the saved selection into the device's display config files.
//!
//! Both derived configs are rebuilt from the pristine copies under
//! `<module>/backup/`, so merging is repeatable: packages already listed in
//! the backup are kept, selected packages are appended once each. An empty
//! selection removes the derived file so the backup applies unchanged.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{HdrError, Result};
use crate::fs_utils::write_atomic;
use crate::storage::StorageConfig;

/// Feature blocks that receive the selected packages.
pub const FEATURE_NAMES: [&str; 2] = ["HdrVision", "OplusDolbyVision"];

static FEATURE_LIST_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<application\s+name="([^"]+)"[^>]*>"#).expect("valid regex"));
static UIR_LIST_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<app>([^<]+)</app>").expect("valid regex"));
static EXISTING_APPLICATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<application\s+name="([^"]+)"[^>]*(?:/>|>[^<]*</application>)"#)
        .expect("valid regex")
});
static APP_LIST_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)(<app_list>.*?)(</app_list>)").expect("valid regex"));
static FEATURE_BLOCKS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    FEATURE_NAMES
        .iter()
        .map(|name| {
            let pattern = format!(r#"(?is)(<feature\s+name="{name}"[^>]*>(.*?))</feature>"#);
            (*name, Regex::new(&pattern).expect("valid regex"))
        })
        .collect()
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeDetails {
    pub feature_apps: usize,
    pub uir_apps: usize,
    pub success_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub success: bool,
    pub message: String,
    pub details: MergeDetails,
}

/// Invoked after every successful selection write.
pub trait XmlMerger: Send + Sync {
    fn merge(&self) -> Result<MergeReport>;
}

/// Existence and size of one config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub exists: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl FileStatus {
    fn probe(path: PathBuf) -> Self {
        match fs_err::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Self {
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                size: meta.len(),
                exists: true,
                path,
            },
            _ => Self {
                path,
                exists: false,
                size: 0,
                modified: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigPair {
    pub feature_config: FileStatus,
    pub uir_config: FileStatus,
}

/// Parses `appList.xml` content.
pub fn parse_feature_list(content: &str) -> Vec<String> {
    collect_captures(&FEATURE_LIST_ENTRY, content)
}

/// Parses `appList_new.xml` content.
pub fn parse_uir_list(content: &str) -> Vec<String> {
    collect_captures(&UIR_LIST_ENTRY, content)
}

fn collect_captures(pattern: &Regex, content: &str) -> Vec<String> {
    pattern
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|pkg| !pkg.is_empty())
        .collect()
}

/// Appends selected packages to each known feature block of the backup.
///
/// Returns `None` when the backup is blank.
pub fn merge_feature_config(backup: &str, apps: &[String]) -> Option<String> {
    if backup.trim().is_empty() {
        return None;
    }

    let mut merged = backup.to_string();
    for (name, block) in FEATURE_BLOCKS.iter() {
        let Some((range, rebuilt)) = rebuild_feature_block(block, &merged, apps) else {
            debug!(feature = *name, "Feature block not present in backup");
            continue;
        };
        merged.replace_range(range, &rebuilt);
    }
    Some(merged)
}

fn rebuild_feature_block(
    block: &Regex,
    content: &str,
    apps: &[String],
) -> Option<(std::ops::Range<usize>, String)> {
    let caps = block.captures(content)?;
    let whole = caps.get(0)?;
    let head = caps.get(1).map_or("", |m| m.as_str());
    let body = caps.get(2).map_or("", |m| m.as_str());

    let existing: HashSet<&str> = EXISTING_APPLICATION
        .captures_iter(body)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();

    let mut rebuilt = head.to_string();
    let mut added = 0;
    for pkg in apps {
        if !existing.contains(pkg.as_str()) {
            rebuilt.push_str(&format!(
                "\n            <application name=\"{pkg}\"></application>"
            ));
            added += 1;
        }
    }
    rebuilt.push_str("\n        </feature>");
    info!(kept = existing.len(), added, "Feature block merged");
    Some((whole.range(), rebuilt))
}

/// Appends selected packages to the `<app_list>` block of the backup.
///
/// Returns `None` when the backup is blank or has no `<app_list>`.
pub fn merge_uir_config(backup: &str, apps: &[String]) -> Option<String> {
    if backup.trim().is_empty() {
        return None;
    }
    let Some(caps) = APP_LIST_BLOCK.captures(backup) else {
        error!("No <app_list> block in UIR backup");
        return None;
    };

    let head = caps.get(1).map_or("", |m| m.as_str());
    let tail = caps.get(2).map_or("", |m| m.as_str());
    let existing: HashSet<&str> = UIR_LIST_ENTRY
        .captures_iter(head)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();

    let mut rebuilt = head.to_string();
    let mut added = 0;
    for pkg in apps {
        if !existing.contains(pkg.as_str()) {
            rebuilt.push_str(&format!("\n\t\t\t<app>{pkg}</app>"));
            added += 1;
        }
    }
    rebuilt.push_str("\n\t\t");
    rebuilt.push_str(tail);

    let whole = caps.get(0)?;
    info!(kept = existing.len(), added, "UIR app list merged");
    let mut merged = backup.to_string();
    merged.replace_range(whole.range(), &rebuilt);
    Some(merged)
}

/// Reads a file, mapping "missing" to `None`.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs_err::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(HdrError::io(format!("reading {}", path.display()), err)),
    }
}

/// Reads a backup, treating unreadable or blank files as absent.
fn read_backup(path: &Path) -> Option<String> {
    match read_optional(path) {
        Ok(Some(content)) if !content.trim().is_empty() => Some(content),
        Ok(_) => None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Backup unreadable");
            None
        }
    }
}

fn with_trailing_newline(mut content: String) -> String {
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content
}

/// Merger working on the module directory layout.
#[derive(Debug, Clone)]
pub struct ConfigMerger {
    storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Succeeded,
    Failed,
    Skipped,
}

impl ConfigMerger {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    pub fn check_backup_files(&self) -> ConfigPair {
        ConfigPair {
            feature_config: FileStatus::probe(self.storage.feature_config_backup()),
            uir_config: FileStatus::probe(self.storage.uir_config_backup()),
        }
    }

    pub fn config_status(&self) -> ConfigPair {
        ConfigPair {
            feature_config: FileStatus::probe(self.storage.feature_config_module()),
            uir_config: FileStatus::probe(self.storage.uir_config_module()),
        }
    }

    fn remove_derived(&self, target: &Path) -> Step {
        match fs_err::remove_file(target) {
            Ok(()) => {
                info!(path = %target.display(), "Derived config removed (no selection)");
                Step::Succeeded
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Step::Succeeded,
            Err(err) => {
                error!(path = %target.display(), error = %err, "Failed to remove derived config");
                Step::Failed
            }
        }
    }

    fn merge_one(
        &self,
        apps: &[String],
        backup: &Path,
        target: &Path,
        merge: fn(&str, &[String]) -> Option<String>,
    ) -> Step {
        if apps.is_empty() {
            return self.remove_derived(target);
        }
        let Some(content) = read_backup(backup) else {
            warn!(backup = %backup.display(), "Skipping merge: backup missing");
            return Step::Skipped;
        };
        let Some(merged) = merge(&content, apps) else {
            error!(backup = %backup.display(), "Merge produced no output");
            return Step::Failed;
        };
        match write_atomic(target, with_trailing_newline(merged).as_bytes()) {
            Ok(()) => {
                info!(path = %target.display(), apps = apps.len(), "Config merged");
                Step::Succeeded
            }
            Err(err) => {
                error!(path = %target.display(), error = %err, "Failed to write merged config");
                Step::Failed
            }
        }
    }
}

impl XmlMerger for ConfigMerger {
    fn merge(&self) -> Result<MergeReport> {
        let feature_apps = read_optional(&self.storage.app_list_file())?
            .map(|content| parse_feature_list(&content))
            .unwrap_or_default();
        let uir_apps = read_optional(&self.storage.app_list_new_file())?
            .map(|content| parse_uir_list(&content))
            .unwrap_or_default();
        debug!(
            feature = feature_apps.len(),
            uir = uir_apps.len(),
            "Selection lists parsed for merge"
        );

        let steps = [
            self.merge_one(
                &feature_apps,
                &self.storage.feature_config_backup(),
                &self.storage.feature_config_module(),
                merge_feature_config,
            ),
            self.merge_one(
                &uir_apps,
                &self.storage.uir_config_backup(),
                &self.storage.uir_config_module(),
                merge_uir_config,
            ),
        ];

        let success_count = steps.iter().filter(|s| **s == Step::Succeeded).count();
        let error_count = steps.iter().filter(|s| **s == Step::Failed).count();
        let message = format!("Merge finished: {success_count} succeeded, {error_count} failed");
        info!("{message}");

        Ok(MergeReport {
            success: error_count == 0,
            message,
            details: MergeDetails {
                feature_apps: feature_apps.len(),
                uir_apps: uir_apps.len(),
                success_count,
                error_count,
            },
        })
    }
}
