//! Selection store: which packages get HDR enabled.
//!
//! The selection is kept in memory in insertion order and persisted to two
//! files on every save, each fully rewritten:
//!
//! - `appList.xml`: one `<application name="PKG"></application>` per line
//! - `appList_new.xml`: one `<app>PKG</app>` per line
//!
//! An empty selection writes empty files. After `appList_new.xml` is written
//! the merge collaborator folds the selection into the display configs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{HdrError, Result};
use crate::fs_utils::write_atomic;
use crate::merge::XmlMerger;
use crate::records::{Notice, PresentationHooks};
use crate::storage::StorageConfig;

static APPLICATION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<application\s+name="([^"]+)"\s*></application>"#).expect("valid regex")
});
static LEGACY_APP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<app\s+package="([^"]+)"\s*/?\s*>"#).expect("valid regex"));

/// Parses selection file content line by line.
///
/// Blank and `<!--` lines are skipped. Lines that look app-related but match
/// neither encoding are logged and ignored.
pub fn parse_selection(content: &str) -> Vec<String> {
    let mut found = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("<!--") {
            continue;
        }

        let matched = [&*APPLICATION_LINE, &*LEGACY_APP_LINE]
            .into_iter()
            .find_map(|pattern| pattern.captures(line).and_then(|caps| caps.get(1)))
            .map(|m| m.as_str().trim());

        match matched {
            Some(pkg) if !pkg.is_empty() => found.push(pkg.to_string()),
            Some(_) => {}
            None if line.contains("app") => debug!(line, "Unmatched selection line"),
            None => {}
        }
    }
    found
}

/// Renders the `appList.xml` encoding.
pub fn render_feature_list(packages: &[String]) -> String {
    render_lines(packages, |pkg| {
        format!("<application name=\"{pkg}\"></application>")
    })
}

/// Renders the `appList_new.xml` encoding.
pub fn render_uir_list(packages: &[String]) -> String {
    render_lines(packages, |pkg| format!("<app>{pkg}</app>"))
}

fn render_lines(packages: &[String], line: impl Fn(&str) -> String) -> String {
    packages.iter().map(|pkg| line(pkg) + "\n").collect()
}

/// Insertion-ordered set of package ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedSet {
    order: Vec<String>,
    members: HashSet<String>,
}

impl SelectedSet {
    pub fn insert(&mut self, pkg: &str) -> bool {
        if !self.members.insert(pkg.to_string()) {
            return false;
        }
        self.order.push(pkg.to_string());
        true
    }

    pub fn remove(&mut self, pkg: &str) -> bool {
        if !self.members.remove(pkg) {
            return false;
        }
        self.order.retain(|p| p != pkg);
        true
    }

    pub fn contains(&self, pkg: &str) -> bool {
        self.members.contains(pkg)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.order.clone()
    }
}

impl<S: AsRef<str>> FromIterator<S> for SelectedSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = SelectedSet::default();
        for pkg in iter {
            set.insert(pkg.as_ref());
        }
        set
    }
}

pub struct SelectionStore {
    storage: StorageConfig,
    merger: Arc<dyn XmlMerger>,
    hooks: Arc<dyn PresentationHooks>,
    selected: Mutex<SelectedSet>,
    auto_save: AtomicBool,
    sort_requested: AtomicBool,
}

impl SelectionStore {
    pub fn new(
        storage: StorageConfig,
        merger: Arc<dyn XmlMerger>,
        hooks: Arc<dyn PresentationHooks>,
        auto_save: bool,
    ) -> Self {
        Self {
            storage,
            merger,
            hooks,
            selected: Mutex::new(SelectedSet::default()),
            auto_save: AtomicBool::new(auto_save),
            sort_requested: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SelectedSet> {
        self.selected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the in-memory selection with what the source files list.
    ///
    /// Unreadable files are logged and skipped.
    pub fn load_from_disk(&self) -> usize {
        let mut found = SelectedSet::default();
        for path in self.storage.selection_sources() {
            let content = match fs_err::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "Selection source unreadable");
                    continue;
                }
            };
            let parsed = parse_selection(&content);
            debug!(path = %path.display(), found = parsed.len(), "Selection source parsed");
            for pkg in &parsed {
                found.insert(pkg);
            }
        }

        let count = found.len();
        *self.lock() = found;
        info!(selected = count, "Selection loaded");
        count
    }

    pub fn selected(&self) -> Vec<String> {
        self.lock().to_vec()
    }

    pub fn is_selected(&self, pkg: &str) -> bool {
        self.lock().contains(pkg)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn auto_save(&self) -> bool {
        self.auto_save.load(Ordering::Relaxed)
    }

    pub fn set_auto_save(&self, enabled: bool) {
        self.auto_save.store(enabled, Ordering::Relaxed);
    }

    /// Flips one package. Returns whether it is selected afterwards.
    pub fn toggle(&self, pkg: &str) -> bool {
        let selected = {
            let mut set = self.lock();
            if set.remove(pkg) {
                false
            } else {
                set.insert(pkg);
                true
            }
        };
        self.after_mutation();
        selected
    }

    pub fn select_all<I, S>(&self, packages: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        {
            let mut set = self.lock();
            for pkg in packages {
                set.insert(pkg.as_ref());
            }
        }
        self.after_mutation();
        self.hooks.on_notice(Notice::SelectAllComplete);
    }

    pub fn deselect_all(&self) {
        self.lock().clear();
        self.after_mutation();
        self.hooks.on_notice(Notice::DeselectAllComplete);
    }

    fn after_mutation(&self) {
        if self.auto_save() {
            self.save_realtime();
        }
    }

    /// Writes both files. Success is decided by the `appList_new.xml` write.
    fn write_files(&self) -> Result<usize> {
        let packages = self.selected();

        let feature_path = self.storage.app_list_file();
        if let Err(err) = write_atomic(&feature_path, render_feature_list(&packages).as_bytes()) {
            warn!(path = %feature_path.display(), error = %err, "Failed to write selection list");
        }

        let uir_path = self.storage.app_list_new_file();
        write_atomic(&uir_path, render_uir_list(&packages).as_bytes())
            .map_err(|err| HdrError::SaveFailed(err.to_string()))?;

        Ok(packages.len())
    }

    /// Silent save after a mutation. Merge problems are only logged.
    pub fn save_realtime(&self) -> bool {
        match self.write_files() {
            Ok(count) => {
                debug!(selected = count, "Selection saved");
                match self.merger.merge() {
                    Ok(report) if report.success => debug!(message = %report.message, "Merge ok"),
                    Ok(report) => warn!(message = %report.message, "Merge reported errors"),
                    Err(err) => warn!(error = %err, "Merge failed"),
                }
                true
            }
            Err(err) => {
                warn!(error = %err, "Realtime selection save failed");
                false
            }
        }
    }

    /// User-initiated save: notifies and requests a re-sort on success.
    pub fn save_explicit(&self) -> Result<()> {
        let outcome = self.write_files().and_then(|count| {
            let report = self.merger.merge()?;
            if !report.success {
                warn!(message = %report.message, "Merge reported errors");
            }
            Ok(count)
        });

        match outcome {
            Ok(count) => {
                info!(selected = count, "Selection saved; reboot required");
                self.hooks.on_notice(Notice::SavedRebootRequired);
                self.sort_requested.store(true, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Selection save failed");
                self.hooks.on_notice(Notice::SaveFailed);
                Err(err)
            }
        }
    }

    /// Returns and clears the "show selected first" request.
    pub fn take_sort_request(&self) -> bool {
        self.sort_requested.swap(false, Ordering::AcqRel)
    }
}
