//! Liveness monitor for the label pipeline.
//!
//! Runs on a fixed interval until the pipeline completes. Each tick:
//! stall detection (no labeled-count change for longer than the threshold),
//! re-injection of unlabeled records when the queue is empty and no worker
//! runs, stuck-item detection (first attempt older than the item limit), then
//! an unconditional dispatch so an idle pool picks up queued work.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::{millis, MonitorConfig};
use crate::scheduler::LabelScheduler;

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub complete: bool,
    pub stalled: bool,
    pub force_failed: Vec<String>,
    pub reinjected: usize,
    pub stuck: Vec<String>,
}

pub struct LivenessMonitor {
    scheduler: LabelScheduler,
    config: MonitorConfig,
    last_labeled: usize,
    last_progress_at: Instant,
}

impl LivenessMonitor {
    pub fn new(scheduler: LabelScheduler, config: MonitorConfig) -> Self {
        let last_labeled = scheduler.progress().labeled;
        Self {
            scheduler,
            config,
            last_labeled,
            last_progress_at: Instant::now(),
        }
    }

    fn stall_threshold(&self) -> Duration {
        millis(self.config.stall_threshold_ms)
    }

    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.scheduler.check_complete() {
            report.complete = true;
            return report;
        }

        let now = Instant::now();
        let progress = self.scheduler.progress();
        if progress.labeled != self.last_labeled {
            self.last_labeled = progress.labeled;
            self.last_progress_at = now;
        } else if now.saturating_duration_since(self.last_progress_at) > self.stall_threshold() {
            report.stalled = true;
            warn!(
                labeled = progress.labeled,
                total = progress.total,
                queued = self.scheduler.queued_packages().len(),
                running = self.scheduler.running_workers(),
                "Label pipeline stalled"
            );
            report.force_failed = self.scheduler.force_fail_oldest(self.config.stall_batch);
            self.last_labeled = self.scheduler.progress().labeled;
            self.last_progress_at = now;
        }

        report.reinjected = self.scheduler.reinject_unlabeled();
        report.stuck = self
            .scheduler
            .fail_stuck(millis(self.config.stuck_item_ms));

        self.scheduler.dispatch();
        report.complete = self.scheduler.check_complete();
        report
    }

    /// Ticks on the configured interval until the pipeline completes.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = millis(self.config.interval_ms);
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = self.tick();
                if report.complete {
                    debug!("Liveness monitor stopping");
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LabelCache;
    use crate::config::{CacheConfig, SchedulerConfig, StrategyTimeouts};
    use crate::records::{AppRecord, NoopHooks};
    use crate::runner::ExecOutput;
    use crate::storage::StorageConfig;
    use crate::strategies::LabelResolver;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Scheduler with no workers: concurrency zero keeps the queue frozen.
    fn frozen_scheduler(root: &std::path::Path) -> LabelScheduler {
        let storage = StorageConfig::with_root(root.to_path_buf());
        let cache = Arc::new(LabelCache::new(&storage.cache_file()));
        let runner = |_: &str| ExecOutput::failed("offline");
        let resolver = Arc::new(LabelResolver::new(
            Arc::new(runner),
            None,
            cache,
            storage,
            StrategyTimeouts::default(),
        ));
        LabelScheduler::new(
            resolver,
            Arc::new(NoopHooks),
            SchedulerConfig {
                concurrency: 0,
                ..SchedulerConfig::default()
            },
            CacheConfig::default(),
        )
    }

    fn pkgs(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("com.test.app{i}")).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn stall_force_fails_oldest_queued() {
        let temp = tempdir().unwrap();
        let scheduler = frozen_scheduler(temp.path());
        let packages = pkgs(12);
        scheduler.load_records(packages.iter().map(|p| AppRecord::new(p, None)).collect());
        scheduler.enqueue_many(&packages);

        let mut monitor = LivenessMonitor::new(scheduler.clone(), MonitorConfig::default());
        let report = monitor.tick();
        assert!(!report.stalled);

        tokio::time::advance(Duration::from_millis(10_001)).await;
        let report = monitor.tick();
        assert!(report.stalled);
        assert_eq!(report.force_failed, packages[..10].to_vec());
        assert_eq!(scheduler.queued_packages(), packages[10..].to_vec());
        assert_eq!(scheduler.progress().failed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_with_empty_queue_reinjects_unlabeled() {
        let temp = tempdir().unwrap();
        let scheduler = frozen_scheduler(temp.path());
        let packages = pkgs(3);
        scheduler.load_records(packages.iter().map(|p| AppRecord::new(p, None)).collect());

        let mut monitor = LivenessMonitor::new(scheduler.clone(), MonitorConfig::default());
        tokio::time::advance(Duration::from_millis(10_001)).await;
        let report = monitor.tick();

        assert!(report.stalled);
        assert!(report.force_failed.is_empty());
        assert_eq!(report.reinjected, 3);
        assert_eq!(scheduler.queued_packages(), packages);
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_records_reinjected_before_stall_threshold() {
        let temp = tempdir().unwrap();
        let scheduler = frozen_scheduler(temp.path());
        let packages = pkgs(3);
        scheduler.load_records(packages.iter().map(|p| AppRecord::new(p, None)).collect());

        let mut monitor = LivenessMonitor::new(scheduler.clone(), MonitorConfig::default());
        tokio::time::advance(Duration::from_secs(5)).await;
        let report = monitor.tick();

        assert!(!report.stalled);
        assert_eq!(report.reinjected, 3);
        assert_eq!(scheduler.queued_packages(), packages);

        // already queued: nothing more to re-inject
        assert_eq!(monitor.tick().reinjected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_pipeline_reports_complete() {
        let temp = tempdir().unwrap();
        let scheduler = frozen_scheduler(temp.path());
        scheduler.load_records(vec![AppRecord::new("com.a", Some("A".to_string()))]);

        let mut monitor = LivenessMonitor::new(scheduler, MonitorConfig::default());
        assert!(monitor.tick().complete);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_stops_after_completion() {
        let temp = tempdir().unwrap();
        let scheduler = frozen_scheduler(temp.path());
        let packages = pkgs(2);
        scheduler.load_records(packages.iter().map(|p| AppRecord::new(p, None)).collect());
        scheduler.enqueue_many(&packages);

        let handle = LivenessMonitor::new(scheduler.clone(), MonitorConfig::default()).spawn();
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("monitor should stop")
            .unwrap();

        assert!(scheduler.is_complete());
        assert_eq!(scheduler.progress().failed, 2);
    }
}
