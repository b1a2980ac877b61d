//! Label resolution scheduler.
//!
//! A bounded pool of tokio tasks drains a shared FIFO of package ids and
//! runs the strategies for each one. Per package:
//!
//! ```text
//! Unresolved ──enqueue──▶ InQueue ──pop──▶ Resolving ──label──▶ Resolved
//!                            ▲                 │
//!                            └──── no label ───┤ (budget left)
//!                                              └──▶ Failed (fallback name)
//! ```
//!
//! `Resolved` and `Failed` are terminal and both leave the record `labeled`.
//! A package fails once `retry_count >= max_retry_count` or once more than
//! `total_timeout_ms` has passed since its first attempt, whichever comes
//! first. Retry bookkeeping is cleared whenever a record becomes labeled.
//!
//! A package is never queued twice, nor queued while a worker holds it.
//! State lives behind a std mutex that is only held between awaits, never
//! across one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::FlushOutcome;
use crate::config::{millis, CacheConfig, SchedulerConfig};
use crate::records::{fallback_name, AppRecord, PresentationHooks, Progress};
use crate::strategies::LabelResolver;
use crate::timeout::race;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    MaxRetries,
    Timeout,
    /// Forced by the liveness monitor after a progress stall.
    Stalled,
    /// Forced by the liveness monitor after a single item hung too long.
    Stuck,
}

impl FailReason {
    fn as_str(self) -> &'static str {
        match self {
            FailReason::MaxRetries => "max_retries",
            FailReason::Timeout => "timeout",
            FailReason::Stalled => "stalled",
            FailReason::Stuck => "stuck",
        }
    }
}

/// A display change produced by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LabelUpdate {
    pkg: String,
    name: String,
}

#[derive(Debug, Default)]
struct PipelineState {
    apps: Vec<AppRecord>,
    index: HashMap<String, usize>,
    queue: VecDeque<String>,
    queued: HashSet<String>,
    /// Packages a worker has popped and not yet finished.
    in_flight: HashSet<String>,
    running: usize,
    retry_count: HashMap<String, u32>,
    first_attempt: HashMap<String, Instant>,
    failed: HashSet<String>,
    progress: Progress,
    completed: bool,
}

impl PipelineState {
    fn record(&self, pkg: &str) -> Option<&AppRecord> {
        self.index.get(pkg).map(|&i| &self.apps[i])
    }

    fn record_mut(&mut self, pkg: &str) -> Option<&mut AppRecord> {
        match self.index.get(pkg) {
            Some(&i) => Some(&mut self.apps[i]),
            None => None,
        }
    }

    fn is_labeled(&self, pkg: &str) -> bool {
        self.record(pkg).is_some_and(|record| record.labeled)
    }

    fn clear_bookkeeping(&mut self, pkg: &str) {
        self.retry_count.remove(pkg);
        self.first_attempt.remove(pkg);
    }

    /// Appends `pkg` unless it is unknown, labeled, queued or being resolved.
    fn push(&mut self, pkg: &str) -> bool {
        if self.is_labeled(pkg)
            || !self.index.contains_key(pkg)
            || self.queued.contains(pkg)
            || self.in_flight.contains(pkg)
        {
            return false;
        }
        self.queued.insert(pkg.to_string());
        self.queue.push_back(pkg.to_string());
        true
    }

    fn pop(&mut self) -> Option<String> {
        let pkg = self.queue.pop_front()?;
        self.queued.remove(&pkg);
        Some(pkg)
    }

    /// Pops the next package and marks it in flight.
    fn claim(&mut self) -> Option<String> {
        let pkg = self.pop()?;
        self.in_flight.insert(pkg.clone());
        Some(pkg)
    }

    /// Releases a worker's hold on `pkg`, re-queueing it when asked.
    fn release(&mut self, pkg: &str, requeue: bool) {
        self.in_flight.remove(pkg);
        if requeue {
            self.push(pkg);
        }
    }

    /// Rebuilds the queue without duplicates or labeled records.
    fn dedupe_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let mut seen = HashSet::new();
        let drained: Vec<String> = self.queue.drain(..).collect();
        for pkg in drained {
            if !self.is_labeled(&pkg) && seen.insert(pkg.clone()) {
                self.queue.push_back(pkg);
            }
        }
        self.queued = seen;
    }

    fn resolve(&mut self, pkg: &str, label: &str) -> Option<LabelUpdate> {
        let record = self.record_mut(pkg)?;
        if record.labeled {
            return None;
        }
        record.name = label.to_string();
        record.labeled = true;
        self.clear_bookkeeping(pkg);
        self.progress.labeled += 1;
        Some(LabelUpdate {
            pkg: pkg.to_string(),
            name: label.to_string(),
        })
    }

    /// Marks a package failed and gives it the fallback name.
    fn fail(&mut self, pkg: &str) -> Option<LabelUpdate> {
        let record = self.record_mut(pkg)?;
        if record.labeled {
            return None;
        }
        let name = fallback_name(pkg);
        record.name = name.clone();
        record.labeled = true;
        self.failed.insert(pkg.to_string());
        self.clear_bookkeeping(pkg);
        self.progress.failed += 1;
        self.progress.labeled += 1;
        Some(LabelUpdate {
            pkg: pkg.to_string(),
            name,
        })
    }

    fn all_labeled(&self) -> bool {
        self.apps.iter().all(|record| record.labeled)
    }
}

/// What a worker should do after the budget check.
enum Step {
    Skip,
    Cached(String),
    Attempt,
}

struct Inner {
    resolver: Arc<LabelResolver>,
    hooks: Arc<dyn PresentationHooks>,
    config: SchedulerConfig,
    cache_config: CacheConfig,
    state: Mutex<PipelineState>,
    flush_pending: AtomicBool,
}

/// Cheap, cloneable handle to the pipeline.
///
/// Methods that start workers spawn tokio tasks and must be called from
/// inside a runtime.
#[derive(Clone)]
pub struct LabelScheduler {
    inner: Arc<Inner>,
}

/// Decrements the running count even if a worker task panics.
struct WorkerGuard {
    scheduler: LabelScheduler,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut state = self.scheduler.state();
        state.running = state.running.saturating_sub(1);
    }
}

impl LabelScheduler {
    pub fn new(
        resolver: Arc<LabelResolver>,
        hooks: Arc<dyn PresentationHooks>,
        config: SchedulerConfig,
        cache_config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                hooks,
                config,
                cache_config,
                state: Mutex::new(PipelineState::default()),
                flush_pending: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resolver(&self) -> &Arc<LabelResolver> {
        &self.inner.resolver
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Records
    // ─────────────────────────────────────────────────────────────────────────

    /// Replaces every record and resets all bookkeeping (full reload).
    pub fn load_records(&self, records: Vec<AppRecord>) {
        let progress = {
            let mut state = self.state();
            let running = state.running;
            let in_flight = std::mem::take(&mut state.in_flight);
            *state = PipelineState::default();
            state.running = running;
            state.in_flight = in_flight;
            state.index = records
                .iter()
                .enumerate()
                .map(|(i, record)| (record.pkg.clone(), i))
                .collect();
            state.progress = Progress {
                total: records.len(),
                labeled: records.iter().filter(|record| record.labeled).count(),
                failed: 0,
            };
            state.apps = records;
            state.progress
        };
        self.inner.hooks.on_progress(progress);
    }

    pub fn records(&self) -> Vec<AppRecord> {
        self.state().apps.clone()
    }

    pub fn record(&self, pkg: &str) -> Option<AppRecord> {
        self.state().record(pkg).cloned()
    }

    pub fn packages(&self) -> Vec<String> {
        self.state().apps.iter().map(|record| record.pkg.clone()).collect()
    }

    pub fn unlabeled_packages(&self) -> Vec<String> {
        self.state()
            .apps
            .iter()
            .filter(|record| !record.labeled)
            .map(|record| record.pkg.clone())
            .collect()
    }

    pub fn progress(&self) -> Progress {
        self.state().progress
    }

    pub fn failed_packages(&self) -> HashSet<String> {
        self.state().failed.clone()
    }

    pub fn queued_packages(&self) -> Vec<String> {
        self.state().queue.iter().cloned().collect()
    }

    pub fn running_workers(&self) -> usize {
        self.state().running
    }

    pub fn retry_count(&self, pkg: &str) -> u32 {
        self.state().retry_count.get(pkg).copied().unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.state().completed
    }

    /// Applies labels found outside the workers (the eager batch pass).
    pub fn apply_labels(&self, labels: &HashMap<String, String>) -> usize {
        let (updates, progress) = {
            let mut state = self.state();
            let updates: Vec<LabelUpdate> = labels
                .iter()
                .filter_map(|(pkg, label)| state.resolve(pkg, label))
                .collect();
            (updates, state.progress)
        };
        let applied = updates.len();
        if applied > 0 {
            self.emit(updates, progress);
            self.schedule_flush();
        }
        applied
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Intake
    // ─────────────────────────────────────────────────────────────────────────

    /// Visibility signal: a record scrolled into view.
    pub fn enqueue(&self, pkg: &str) {
        if self.state().push(pkg) {
            self.dispatch();
        }
    }

    pub fn enqueue_many<I, S>(&self, packages: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let added = {
            let mut state = self.state();
            packages
                .into_iter()
                .filter(|pkg| state.push(pkg.as_ref()))
                .count()
        };
        if added > 0 {
            self.dispatch();
        }
        added
    }

    /// Queues every record that is still unlabeled.
    pub fn enqueue_unlabeled(&self) -> usize {
        let pending = self.unlabeled_packages();
        self.enqueue_many(pending)
    }

    /// Starts workers until the queue is covered or the pool is full.
    pub fn dispatch(&self) {
        let spawn = {
            let mut state = self.state();
            state.dedupe_queue();
            let free = self.inner.config.concurrency.saturating_sub(state.running);
            let spawn = free.min(state.queue.len());
            state.running += spawn;
            spawn
        };

        for _ in 0..spawn {
            let worker = self.clone();
            tokio::spawn(async move { worker.run_worker().await });
        }
    }

    async fn run_worker(self) {
        let guard = WorkerGuard {
            scheduler: self.clone(),
        };

        loop {
            let next = self.state().claim();
            let Some(pkg) = next else {
                break;
            };
            let requeue = self.process(&pkg).await;
            self.state().release(&pkg, requeue);
        }

        drop(guard);
        self.check_complete();

        let (pending, running) = {
            let state = self.state();
            (!state.queue.is_empty(), state.running)
        };
        if pending && running < self.inner.config.concurrency {
            self.dispatch();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-package state machine
    // ─────────────────────────────────────────────────────────────────────────

    fn begin(&self, pkg: &str) -> Step {
        let mut state = self.state();
        let Some(record) = state.record(pkg) else {
            return Step::Skip;
        };

        if record.labeled || state.failed.contains(pkg) {
            // Stale queue entry: make sure it ends labeled and move on.
            if let Some(update) = state.fail(pkg) {
                let progress = state.progress;
                drop(state);
                self.emit(vec![update], progress);
            }
            return Step::Skip;
        }

        if let Some(name) = self.inner.resolver.cache().get(pkg) {
            return Step::Cached(name);
        }

        let now = Instant::now();
        let retries = state.retry_count.get(pkg).copied().unwrap_or(0);
        let first = *state.first_attempt.entry(pkg.to_string()).or_insert(now);
        let elapsed = now.saturating_duration_since(first);

        let budget = millis(self.inner.config.total_timeout_ms);
        let reason = if retries >= self.inner.config.max_retry_count {
            Some(FailReason::MaxRetries)
        } else if elapsed > budget {
            Some(FailReason::Timeout)
        } else {
            None
        };

        if let Some(reason) = reason {
            let update = state.fail(pkg);
            let progress = state.progress;
            drop(state);
            if let Some(update) = update {
                info!(
                    pkg,
                    retries,
                    elapsed_ms = elapsed.as_millis() as u64,
                    reason = reason.as_str(),
                    fallback = %update.name,
                    "Label resolution failed"
                );
                self.emit(vec![update], progress);
            }
            return Step::Skip;
        }

        state.retry_count.insert(pkg.to_string(), retries + 1);
        Step::Attempt
    }

    async fn attempt(&self, pkg: &str) -> Option<String> {
        let resolver = &self.inner.resolver;
        if let Some(label) = resolver.fast_label(pkg) {
            return Some(label);
        }
        if !resolver.backends().is_empty() {
            if let Some(label) = resolver.async_label(pkg).await {
                return Some(label);
            }
        }

        let badging = race(
            millis(self.inner.config.badging_race_ms),
            resolver.badging_label(pkg),
        )
        .await;
        if badging.is_timeout() {
            debug!(pkg, "Badging race timed out");
        }
        if let Some(label) = badging.ok().flatten() {
            return Some(label);
        }

        let dump = race(millis(self.inner.config.dump_race_ms), resolver.dump_label(pkg)).await;
        if dump.is_timeout() {
            debug!(pkg, "Dump race timed out");
        }
        dump.ok().flatten()
    }

    /// Runs one pass for `pkg`. Returns true when it should go back in the queue.
    async fn process(&self, pkg: &str) -> bool {
        let (label, from_cache) = match self.begin(pkg) {
            Step::Skip => return false,
            Step::Cached(name) => (Some(name), true),
            Step::Attempt => (self.attempt(pkg).await, false),
        };

        match label {
            Some(label) => {
                self.finish_resolved(pkg, &label, from_cache);
                false
            }
            None => self.finish_empty(pkg),
        }
    }

    fn finish_resolved(&self, pkg: &str, label: &str, from_cache: bool) {
        if !from_cache {
            self.inner.resolver.cache().put(pkg, label);
        }

        let (update, progress) = {
            let mut state = self.state();
            (state.resolve(pkg, label), state.progress)
        };

        let Some(update) = update else {
            // Late completion after the monitor already settled this record.
            debug!(pkg, label, "Ignoring late label for settled record");
            return;
        };
        debug!(pkg, label, from_cache, "Label resolved");
        self.emit(vec![update], progress);

        let every = self.inner.cache_config.flush_every;
        if every > 0 && progress.labeled % every == 0 {
            self.schedule_flush();
        }
    }

    /// Returns true when retries remain and the package should be re-queued.
    fn finish_empty(&self, pkg: &str) -> bool {
        let (update, progress, retries) = {
            let mut state = self.state();
            if state.is_labeled(pkg) {
                return false;
            }
            let retries = state.retry_count.get(pkg).copied().unwrap_or(0);
            if retries < self.inner.config.max_retry_count {
                return true;
            }
            (state.fail(pkg), state.progress, retries)
        };

        if let Some(update) = update {
            info!(pkg, retries, fallback = %update.name, "Label fallback assigned");
            self.emit(vec![update], progress);
        }
        false
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery hooks for the liveness monitor
    // ─────────────────────────────────────────────────────────────────────────

    /// Fails up to `limit` of the oldest queued packages.
    pub fn force_fail_oldest(&self, limit: usize) -> Vec<String> {
        let (updates, progress) = {
            let mut state = self.state();
            let mut updates = Vec::new();
            for _ in 0..limit {
                let Some(pkg) = state.pop() else {
                    break;
                };
                if let Some(update) = state.fail(&pkg) {
                    updates.push(update);
                }
            }
            (updates, state.progress)
        };
        let failed: Vec<String> = updates.iter().map(|update| update.pkg.clone()).collect();
        for pkg in &failed {
            warn!(pkg = %pkg, reason = FailReason::Stalled.as_str(), "Label resolution force-failed");
        }
        self.emit(updates, progress);
        failed
    }

    /// Re-queues unlabeled records when the queue is empty and no worker runs.
    pub fn reinject_unlabeled(&self) -> usize {
        let added = {
            let mut state = self.state();
            if !state.queue.is_empty() || state.running > 0 {
                return 0;
            }
            let missing: Vec<String> = state
                .apps
                .iter()
                .filter(|record| !record.labeled)
                .map(|record| record.pkg.clone())
                .collect();
            missing.iter().filter(|pkg| state.push(pkg)).count()
        };
        if added > 0 {
            warn!(count = added, "Unlabeled records missing from queue; re-injected");
        }
        added
    }

    /// Fails records whose first attempt is older than `max_age`.
    pub fn fail_stuck(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let (updates, progress) = {
            let mut state = self.state();
            let stuck: Vec<String> = state
                .first_attempt
                .iter()
                .filter(|(pkg, started)| {
                    now.saturating_duration_since(**started) > max_age
                        && !state.failed.contains(*pkg)
                })
                .map(|(pkg, _)| pkg.clone())
                .collect();

            let mut updates = Vec::new();
            for pkg in stuck {
                match state.fail(&pkg) {
                    Some(update) => updates.push(update),
                    None => state.clear_bookkeeping(&pkg),
                }
            }
            (updates, state.progress)
        };
        let failed: Vec<String> = updates.iter().map(|update| update.pkg.clone()).collect();
        for pkg in &failed {
            warn!(pkg = %pkg, reason = FailReason::Stuck.as_str(), "Label resolution force-failed");
        }
        self.emit(updates, progress);
        failed
    }

    /// Fires the one-time completion transition when everything is settled.
    pub fn check_complete(&self) -> bool {
        let newly_complete = {
            let mut state = self.state();
            if state.completed {
                return true;
            }
            if state.running == 0 && state.queue.is_empty() && state.all_labeled() {
                state.completed = true;
                true
            } else {
                false
            }
        };

        if newly_complete {
            let progress = self.progress();
            info!(
                total = progress.total,
                failed = progress.failed,
                "Label pipeline complete"
            );
            self.inner.hooks.on_pipeline_complete();
            self.schedule_flush();
        }
        newly_complete
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cache flushing
    // ─────────────────────────────────────────────────────────────────────────

    /// Debounced flush: the first request arms a timer, later ones ride along.
    pub fn schedule_flush(&self) {
        if self.inner.flush_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let delay = millis(self.inner.cache_config.debounce_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_pending.store(false, Ordering::Release);
            let cache = Arc::clone(inner.resolver.cache());
            match tokio::task::spawn_blocking(move || cache.flush()).await {
                Ok(FlushOutcome::Failed) => debug!("Debounced cache flush failed; will retry"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Cache flush task aborted"),
            }
        });
    }

    fn emit(&self, updates: Vec<LabelUpdate>, progress: Progress) {
        if updates.is_empty() {
            return;
        }
        for update in &updates {
            self.inner.hooks.on_label_resolved(&update.pkg, &update.name);
        }
        self.inner.hooks.on_progress(progress);
    }
}
