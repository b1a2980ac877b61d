//! End-to-end tests driving a PanelSession against a scripted device.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hdr_core::config::SelectionConfig;
use hdr_core::{
    ExecOutput, HdrError, HostApi, LabelCache, MergeDetails, MergeReport, PackageInfo,
    PanelConfig, PanelSession, PresentationHooks, Progress, SessionParts, StorageConfig,
    XmlMerger,
};
use tempfile::tempdir;

/// Fake device: a package listing plus `dumpsys` labels for some packages.
struct Device {
    packages: Vec<String>,
    labels: HashMap<String, String>,
    commands: Mutex<Vec<String>>,
}

impl Device {
    fn new(packages: &[&str], labels: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            packages: packages.iter().map(|p| p.to_string()).collect(),
            labels: labels
                .iter()
                .map(|(pkg, label)| (pkg.to_string(), label.to_string()))
                .collect(),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn run(&self, command: &str) -> ExecOutput {
        self.commands.lock().unwrap().push(command.to_string());
        if command == "pm list packages -3" {
            let listing: String = self
                .packages
                .iter()
                .map(|pkg| format!("package:{pkg}\n"))
                .collect();
            return ExecOutput::ok(listing);
        }
        if let Some(rest) = command.strip_prefix("dumpsys package ") {
            let pkg = rest.trim_matches('"');
            if let Some(label) = self.labels.get(pkg) {
                return ExecOutput::ok(format!("  application-label:{label}\n"));
            }
        }
        ExecOutput::failed("not available")
    }

    fn commands_mentioning(&self, pkg: &str) -> usize {
        let needle = format!("\"{pkg}\"");
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.contains(&needle))
            .count()
    }
}

#[derive(Default)]
struct CountingMerger {
    calls: AtomicUsize,
}

impl XmlMerger for CountingMerger {
    fn merge(&self) -> Result<MergeReport, HdrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(MergeReport {
            success: true,
            message: "merged".to_string(),
            details: MergeDetails::default(),
        })
    }
}

#[derive(Default)]
struct RecordingHooks {
    resolved: Mutex<Vec<(String, String)>>,
    completions: AtomicUsize,
    last_progress: Mutex<Option<Progress>>,
}

impl PresentationHooks for RecordingHooks {
    fn on_label_resolved(&self, pkg: &str, name: &str) {
        self.resolved
            .lock()
            .unwrap()
            .push((pkg.to_string(), name.to_string()));
    }

    fn on_progress(&self, progress: Progress) {
        *self.last_progress.lock().unwrap() = Some(progress);
    }

    fn on_pipeline_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    session: PanelSession,
    device: Arc<Device>,
    merger: Arc<CountingMerger>,
    hooks: Arc<RecordingHooks>,
}

fn harness(root: &Path, device: Arc<Device>, host: Option<Arc<dyn HostApi>>) -> Harness {
    let merger = Arc::new(CountingMerger::default());
    let hooks = Arc::new(RecordingHooks::default());
    let config = PanelConfig {
        selection: SelectionConfig { auto_save: false },
        ..PanelConfig::default()
    };

    let runner_device = Arc::clone(&device);
    let session = PanelSession::with_parts(
        StorageConfig::with_root(root.to_path_buf()),
        config,
        SessionParts {
            runner: Arc::new(move |command: &str| runner_device.run(command)),
            host,
            hooks: hooks.clone() as Arc<dyn PresentationHooks>,
            merger: Some(merger.clone() as Arc<dyn XmlMerger>),
        },
    );
    Harness {
        session,
        device,
        merger,
        hooks,
    }
}

fn write_cache(root: &Path, entries: &[(&str, &str)]) {
    let map: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(pkg, name)| {
            (
                pkg.to_string(),
                serde_json::json!({ "name": name, "timestamp": 1_700_000_000_000_i64 }),
            )
        })
        .collect();
    fs_err::create_dir_all(root).unwrap();
    fs_err::write(
        root.join("app_cache.json"),
        serde_json::to_string_pretty(&map).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn cached_package_is_labeled_and_never_resolved() {
    let temp = tempdir().unwrap();
    write_cache(temp.path(), &[("com.example.foo", "Foo App")]);
    let device = Device::new(&["com.example.foo", "com.acme.bar"], &[]);
    let h = harness(temp.path(), device, None);

    let report = h.session.init().await;
    assert_eq!(report.packages, 2);
    assert_eq!(report.cached, 1);
    assert!(h.session.wait_until_complete(Duration::from_secs(30)).await);

    let foo = h.session.scheduler().record("com.example.foo").unwrap();
    assert_eq!(foo.name, "Foo App");
    assert!(foo.labeled);
    assert_eq!(h.device.commands_mentioning("com.example.foo"), 0);
    h.session.shutdown().await;
}

#[tokio::test]
async fn unresolvable_package_falls_back_after_retries() {
    let temp = tempdir().unwrap();
    let device = Device::new(&["com.acme.bar"], &[]);
    let h = harness(temp.path(), device, None);

    h.session.init().await;
    assert!(h.session.wait_until_complete(Duration::from_secs(30)).await);

    let bar = h.session.scheduler().record("com.acme.bar").unwrap();
    assert_eq!(bar.name, "Bar");
    assert!(bar.labeled);
    assert!(h.session.scheduler().failed_packages().contains("com.acme.bar"));
    assert_eq!(h.session.scheduler().retry_count("com.acme.bar"), 0);
    assert_eq!(
        *h.hooks.resolved.lock().unwrap(),
        vec![("com.acme.bar".to_string(), "Bar".to_string())]
    );
    // one dumpsys call per attempt
    assert_eq!(
        h.device
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("dumpsys package"))
            .count(),
        3
    );
    assert!(h.session.scheduler().queued_packages().is_empty());
    h.session.shutdown().await;
}

#[tokio::test]
async fn pipeline_converges_and_persists_labels() {
    let temp = tempdir().unwrap();
    let packages: Vec<String> = (0..80).map(|i| format!("com.vendor.app{i}")).collect();
    let labels: Vec<(String, String)> = packages
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 != 0)
        .map(|(i, pkg)| (pkg.clone(), format!("App {i}")))
        .collect();
    let package_refs: Vec<&str> = packages.iter().map(String::as_str).collect();
    let label_refs: Vec<(&str, &str)> = labels
        .iter()
        .map(|(pkg, label)| (pkg.as_str(), label.as_str()))
        .collect();
    let h = harness(temp.path(), Device::new(&package_refs, &label_refs), None);

    h.session.init().await;
    assert!(h.session.wait_until_complete(Duration::from_secs(60)).await);

    let progress = h.session.progress();
    assert_eq!(progress.total, 80);
    assert_eq!(progress.labeled, 80);
    assert_eq!(progress.failed, 27);
    assert!(h.session.records().iter().all(|record| record.labeled));
    assert_eq!(h.session.scheduler().running_workers(), 0);
    assert_eq!(h.hooks.completions.load(Ordering::SeqCst), 1);
    assert_eq!(*h.hooks.last_progress.lock().unwrap(), Some(progress));

    h.session.shutdown().await;
    let reloaded = LabelCache::new(&temp.path().join("app_cache.json"));
    reloaded.load();
    assert_eq!(reloaded.len(), labels.len());
    assert_eq!(reloaded.get("com.vendor.app1").as_deref(), Some("App 1"));
    // fallback names are display-only
    assert!(reloaded.get("com.vendor.app0").is_none());
}

#[tokio::test]
async fn saving_two_apps_writes_both_encodings_and_merges_once() {
    let temp = tempdir().unwrap();
    let h = harness(temp.path(), Device::new(&["com.a", "com.b", "com.c"], &[]), None);
    h.session.open();
    h.session.load_packages().await;

    h.session.toggle("com.a").unwrap();
    h.session.toggle("com.b").unwrap();
    h.session.save().unwrap();

    assert_eq!(
        fs_err::read_to_string(temp.path().join("appList.xml")).unwrap(),
        "<application name=\"com.a\"></application>\n<application name=\"com.b\"></application>\n"
    );
    assert_eq!(
        fs_err::read_to_string(temp.path().join("appList_new.xml")).unwrap(),
        "<app>com.a</app>\n<app>com.b</app>\n"
    );
    assert_eq!(h.merger.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn saving_empty_selection_writes_empty_files() {
    let temp = tempdir().unwrap();
    fs_err::write(
        temp.path().join("appList.xml"),
        "<application name=\"com.stale\"></application>\n",
    )
    .unwrap();
    fs_err::write(temp.path().join("appList_new.xml"), "<app>com.stale</app>\n").unwrap();

    let h = harness(temp.path(), Device::new(&["com.stale"], &[]), None);
    h.session.open();
    assert_eq!(h.session.selection().selected(), vec!["com.stale"]);

    h.session.deselect_all();
    h.session.save().unwrap();

    for file in ["appList.xml", "appList_new.xml"] {
        let path = temp.path().join(file);
        assert!(path.exists());
        assert_eq!(fs_err::read_to_string(&path).unwrap(), "");
    }
    assert_eq!(h.merger.calls.load(Ordering::SeqCst), 1);
}

struct BatchHost {
    batch_calls: AtomicUsize,
}

impl HostApi for BatchHost {
    fn has_packages_info(&self) -> bool {
        true
    }

    fn packages_info(&self, packages: &[String]) -> Result<Vec<PackageInfo>, String> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(packages
            .iter()
            .map(|pkg| PackageInfo {
                package_name: pkg.clone(),
                app_label: Some(format!("Host {pkg}")),
            })
            .collect())
    }

    fn application_label(&self, _package: &str) -> Result<Option<String>, String> {
        Ok(None)
    }
}

#[tokio::test]
async fn eager_batch_labels_through_host_in_one_call() {
    let temp = tempdir().unwrap();
    let host = Arc::new(BatchHost {
        batch_calls: AtomicUsize::new(0),
    });
    let h = harness(
        temp.path(),
        Device::new(&["com.a", "com.b", "com.c"], &[]),
        Some(host.clone() as Arc<dyn HostApi>),
    );

    let report = h.session.init().await;
    assert_eq!(report.eager, 3);
    assert_eq!(report.queued, 0);
    assert_eq!(host.batch_calls.load(Ordering::SeqCst), 1);
    assert!(h.session.wait_until_complete(Duration::from_secs(5)).await);
    assert_eq!(
        h.session.scheduler().record("com.b").unwrap().name,
        "Host com.b"
    );
    assert_eq!(h.device.commands_mentioning("com.b"), 0);
    h.session.shutdown().await;
}

#[tokio::test]
async fn eviction_drops_uninstalled_packages() {
    let temp = tempdir().unwrap();
    write_cache(
        temp.path(),
        &[("com.kept", "Kept"), ("com.removed", "Removed")],
    );
    let h = harness(temp.path(), Device::new(&["com.kept"], &[]), None);

    h.session.init().await;
    assert!(h.session.cache().contains("com.kept"));
    assert!(!h.session.cache().contains("com.removed"));
    h.session.shutdown().await;
}
