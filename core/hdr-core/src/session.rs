//! PanelSession - the main entry point for panel clients.
//!
//! One session owns every piece of pipeline state for one module directory:
//! the label cache, the scheduler and its workers, the liveness monitor and
//! the selection store. Clients (the CLI, or an embedding UI) drive it
//! through the methods below and observe it through [`PresentationHooks`].
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use hdr_core::{PanelSession, StorageConfig};
//!
//! let session = PanelSession::new(StorageConfig::default());
//! session.init().await;
//! session.wait_until_complete(Duration::from_secs(30)).await;
//! for app in session.records() {
//!     println!("{} ({})", app.name, app.pkg);
//! }
//! session.shutdown().await;
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::LabelCache;
use crate::config::{load_panel_config_or_default, millis, PanelConfig};
use crate::error::{HdrError, Result};
use crate::fs_utils::ensure_file;
use crate::host::HostApi;
use crate::merge::{ConfigMerger, ConfigPair, MergeReport, XmlMerger};
use crate::monitor::LivenessMonitor;
use crate::packages::list_packages;
use crate::records::{AppRecord, NoopHooks, Notice, PresentationHooks, Progress};
use crate::runner::{CommandRunner, ShellRunner};
use crate::scheduler::LabelScheduler;
use crate::selection::SelectionStore;
use crate::storage::StorageConfig;
use crate::strategies::LabelResolver;

/// Collaborators a session is built from. `Default` wires the real ones.
pub struct SessionParts {
    pub runner: Arc<dyn CommandRunner>,
    pub host: Option<Arc<dyn HostApi>>,
    pub hooks: Arc<dyn PresentationHooks>,
    /// Defaults to a [`ConfigMerger`] over the session's storage.
    pub merger: Option<Arc<dyn XmlMerger>>,
}

impl Default for SessionParts {
    fn default() -> Self {
        Self {
            runner: Arc::new(ShellRunner::default()),
            host: None,
            hooks: Arc::new(NoopHooks),
            merger: None,
        }
    }
}

/// Summary of what `init` found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub packages: usize,
    pub cached: usize,
    pub eager: usize,
    pub queued: usize,
    pub selected: usize,
}

pub struct PanelSession {
    storage: StorageConfig,
    config: PanelConfig,
    runner: Arc<dyn CommandRunner>,
    hooks: Arc<dyn PresentationHooks>,
    cache: Arc<LabelCache>,
    scheduler: LabelScheduler,
    selection: SelectionStore,
    config_merger: ConfigMerger,
    merger: Arc<dyn XmlMerger>,
    background: Mutex<Vec<JoinHandle<()>>>,
    evicted: AtomicBool,
}

impl PanelSession {
    /// Session over `storage` with the shell runner and no host APIs.
    ///
    /// Reads `webui.toml` from the module directory if present.
    pub fn new(storage: StorageConfig) -> Self {
        let config = load_panel_config_or_default(&storage.config_file());
        Self::with_parts(storage, config, SessionParts::default())
    }

    pub fn with_parts(storage: StorageConfig, config: PanelConfig, parts: SessionParts) -> Self {
        let cache = Arc::new(LabelCache::new(&storage.cache_file()));
        let resolver = Arc::new(LabelResolver::new(
            Arc::clone(&parts.runner),
            parts.host,
            Arc::clone(&cache),
            storage.clone(),
            config.strategies.clone(),
        ));
        let scheduler = LabelScheduler::new(
            resolver,
            Arc::clone(&parts.hooks),
            config.scheduler.clone(),
            config.cache.clone(),
        );

        let config_merger = ConfigMerger::new(storage.clone());
        let merger = parts
            .merger
            .unwrap_or_else(|| Arc::new(config_merger.clone()));
        let selection = SelectionStore::new(
            storage.clone(),
            Arc::clone(&merger),
            Arc::clone(&parts.hooks),
            config.selection.auto_save,
        );

        Self {
            storage,
            config,
            runner: parts.runner,
            hooks: parts.hooks,
            cache,
            scheduler,
            selection,
            config_merger,
            merger,
            background: Mutex::new(Vec::new()),
            evicted: AtomicBool::new(false),
        }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<LabelCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &LabelScheduler {
        &self.scheduler
    }

    pub fn selection(&self) -> &SelectionStore {
        &self.selection
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────────────────

    /// Full startup: files, cache, selection, packages, then resolution.
    ///
    /// Never fails; problems along the way are logged and degrade.
    pub async fn init(&self) -> InitReport {
        self.open();
        let mut report = self.load_packages().await;
        let (eager, queued) = self.start_resolution();
        report.eager = eager;
        report.queued = queued;
        info!(?report, "Panel session initialized");
        report
    }

    /// Creates missing module files and loads the cache and selection.
    pub fn open(&self) -> usize {
        self.bootstrap_files();
        if self.cache.load() {
            debug!("Label cache empty; labels will be resolved from scratch");
        }
        self.selection.load_from_disk()
    }

    fn bootstrap_files(&self) {
        let files: [(_, &[u8]); 3] = [
            (self.storage.cache_file(), b"{}"),
            (self.storage.app_list_file(), b""),
            (self.storage.app_list_new_file(), b""),
        ];
        for (path, initial) in files {
            match ensure_file(&path, initial) {
                Ok(true) => info!(path = %path.display(), "Created missing module file"),
                Ok(false) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Could not create module file"),
            }
        }
    }

    /// Lists installed packages and builds one record per package.
    ///
    /// Records whose label is cached start out labeled.
    pub async fn load_packages(&self) -> InitReport {
        let packages = list_packages(self.runner.as_ref()).await;
        let records: Vec<AppRecord> = packages
            .iter()
            .map(|pkg| AppRecord::new(pkg, self.cache.get(pkg)))
            .collect();
        let cached = records.iter().filter(|record| record.labeled).count();
        self.scheduler.load_records(records);

        InitReport {
            packages: packages.len(),
            cached,
            selected: self.selection.len(),
            ..InitReport::default()
        }
    }

    /// Eager batch lookup, enqueue the rest, start the monitor and flusher.
    ///
    /// Returns `(eagerly_labeled, queued)`.
    pub fn start_resolution(&self) -> (usize, usize) {
        let pending = self.scheduler.unlabeled_packages();
        let batch: Vec<String> = pending
            .iter()
            .take(self.config.scheduler.eager_batch)
            .cloned()
            .collect();

        let mut eager = 0;
        if batch.len() > 1 {
            let labels = self.scheduler.resolver().batch_labels(&batch);
            eager = self.scheduler.apply_labels(&labels);
            debug!(requested = batch.len(), resolved = eager, "Eager batch lookup");
        }

        let queued = self.scheduler.enqueue_unlabeled();
        self.scheduler.check_complete();
        self.evict_uninstalled();

        let monitor = LivenessMonitor::new(self.scheduler.clone(), self.config.monitor.clone());
        let handles = [monitor.spawn(), self.spawn_periodic_flush()];
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        (eager, queued)
    }

    fn spawn_periodic_flush(&self) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let period = millis(self.config.cache.periodic_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let cache = Arc::clone(&cache);
                if let Err(err) = tokio::task::spawn_blocking(move || cache.flush_if_dirty()).await
                {
                    warn!(error = %err, "Periodic cache flush aborted");
                }
            }
        })
    }

    /// Drops cache entries for packages that are no longer installed. Runs once.
    fn evict_uninstalled(&self) -> usize {
        if self.evicted.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.evict_cache()
    }

    /// Drops cache entries for packages not in the current listing.
    pub fn evict_cache(&self) -> usize {
        let installed: HashSet<String> = self.scheduler.packages().into_iter().collect();
        if installed.is_empty() {
            debug!("Skipping cache eviction: no package listing");
            return 0;
        }
        let removed = self.cache.evict(&installed);
        if removed > 0 {
            info!(removed, "Evicted labels of uninstalled packages");
            self.scheduler.schedule_flush();
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline state
    // ─────────────────────────────────────────────────────────────────────────

    pub fn records(&self) -> Vec<AppRecord> {
        self.scheduler.records()
    }

    /// Records in render order. After an explicit save, selected apps move
    /// to the top once.
    pub fn display_records(&self) -> Vec<AppRecord> {
        let mut records = self.records();
        if self.selection.take_sort_request() {
            records.sort_by_key(|record| !self.selection.is_selected(&record.pkg));
        }
        records
    }

    pub fn progress(&self) -> Progress {
        self.scheduler.progress()
    }

    pub fn is_complete(&self) -> bool {
        self.scheduler.is_complete()
    }

    /// Visibility signal from the presentation layer.
    pub fn notify_visible(&self, pkg: &str) {
        self.scheduler.enqueue(pkg);
    }

    /// Waits for the pipeline to settle. Returns false on deadline.
    pub async fn wait_until_complete(&self, deadline: Duration) -> bool {
        let settled = tokio::time::timeout(deadline, async {
            while !self.scheduler.check_complete() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        settled.is_ok()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Selection
    // ─────────────────────────────────────────────────────────────────────────

    /// Toggles a listed package. Returns whether it is now selected.
    pub fn toggle(&self, pkg: &str) -> Result<bool> {
        if self.scheduler.record(pkg).is_none() {
            return Err(HdrError::UnknownPackage(pkg.to_string()));
        }
        Ok(self.selection.toggle(pkg))
    }

    pub fn select_all(&self) {
        self.selection.select_all(self.scheduler.packages());
    }

    pub fn deselect_all(&self) {
        self.selection.deselect_all();
    }

    pub fn save(&self) -> Result<()> {
        self.selection.save_explicit()
    }

    pub fn merge_now(&self) -> Result<MergeReport> {
        self.merger.merge()
    }

    pub fn backup_status(&self) -> ConfigPair {
        self.config_merger.check_backup_files()
    }

    pub fn config_status(&self) -> ConfigPair {
        self.config_merger.config_status()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Device actions and teardown
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn reboot(&self) -> Result<()> {
        let output = self.runner.exec("reboot").await;
        if output.success() {
            return Ok(());
        }
        let details = if output.stderr.trim().is_empty() {
            format!("exit code {}", output.errno)
        } else {
            output.stderr.trim().to_string()
        };
        self.hooks.on_notice(Notice::RebootFailed(details.clone()));
        Err(HdrError::CommandFailed {
            command: "reboot".to_string(),
            details,
        })
    }

    /// Stops background tasks and writes any unsaved labels.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        let cache = Arc::clone(&self.cache);
        if let Err(err) = tokio::task::spawn_blocking(move || cache.flush_if_dirty()).await {
            warn!(error = %err, "Final cache flush aborted");
        }
        debug!("Panel session shut down");
    }
}
