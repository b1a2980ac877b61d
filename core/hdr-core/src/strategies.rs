//! Label resolution strategies.
//!
//! Tried in order, each only when the previous produced nothing:
//!
//! 1. cache, then synchronous host API
//! 2. asynchronous host API, bounded by the API timeout
//! 3. `pm path` → `aapt dump badging` → `application-label:'...'`
//! 4. `dumpsys package` / `pm dump` → `application-label:` or `label=`
//!
//! Every strategy swallows its own failures and answers `None`. A strategy
//! that finds a label writes it to the cache before returning.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::cache::LabelCache;
use crate::config::{millis, StrategyTimeouts};
use crate::host::{Backend, HostApi, ResolutionBackends};
use crate::runner::{shell_quote, CommandRunner};
use crate::storage::StorageConfig;
use crate::timeout::{race, with_timeout, Attempt};

static BADGING_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"application-label:'([^']+)'").expect("valid regex"));
static DUMP_APPLICATION_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"application-label:[ \t]*(.*)").expect("valid regex"));
static DUMP_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"label=([^\n]+)").expect("valid regex"));

/// Extracts the label from `aapt dump badging` output.
pub fn parse_badging_label(output: &str) -> Option<String> {
    BADGING_LABEL
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extracts the label from `dumpsys package` / `pm dump` output.
pub fn parse_dump_label(output: &str) -> Option<String> {
    [&*DUMP_APPLICATION_LABEL, &*DUMP_LABEL]
        .into_iter()
        .find_map(|pattern| {
            pattern
                .captures(output)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|label| !label.is_empty())
        })
}

/// Maps `getprop` ABI output to a bundled-binary directory name.
pub fn abi_from_getprop(output: &str) -> &'static str {
    let lowered = output.to_lowercase();
    if lowered.contains("arm64") {
        "arm64-v8a"
    } else if lowered.contains("armeabi-v7a") {
        "armeabi-v7a"
    } else {
        "arm64-v8a"
    }
}

/// Finds a usable aapt binary once per session.
pub struct AaptLocator {
    storage: StorageConfig,
    path: OnceCell<Option<String>>,
}

impl AaptLocator {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            path: OnceCell::new(),
        }
    }

    pub async fn locate(&self, runner: &dyn CommandRunner) -> Option<String> {
        self.path
            .get_or_init(|| async {
                let found = self.detect(runner).await;
                info!(path = ?found, "aapt detected");
                found
            })
            .await
            .clone()
    }

    async fn detect(&self, runner: &dyn CommandRunner) -> Option<String> {
        let abi_output = runner
            .exec("getprop ro.product.cpu.abilist || getprop ro.product.cpu.abi")
            .await;
        let abi = abi_from_getprop(&abi_output.stdout);

        let candidate = self.storage.bundled_aapt(abi);
        let candidate = shell_quote(&candidate.to_string_lossy());
        runner
            .exec(&format!("[ -f {candidate} ] && chmod 0755 {candidate} || true"))
            .await;
        let executable = runner
            .exec(&format!("[ -x {candidate} ] && echo ok || echo no"))
            .await;
        if executable.stdout.trim() == "ok" {
            return Some(candidate);
        }

        let which = runner
            .exec("which aapt 2>/dev/null || which aapt2 2>/dev/null || true")
            .await;
        which
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// Runs the strategies for one package.
pub struct LabelResolver {
    runner: Arc<dyn CommandRunner>,
    host: Option<Arc<dyn HostApi>>,
    backends: ResolutionBackends,
    cache: Arc<LabelCache>,
    aapt: AaptLocator,
    timeouts: StrategyTimeouts,
}

impl LabelResolver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        host: Option<Arc<dyn HostApi>>,
        cache: Arc<LabelCache>,
        storage: StorageConfig,
        timeouts: StrategyTimeouts,
    ) -> Self {
        let backends = ResolutionBackends::probe(host.as_deref());
        Self {
            runner,
            host,
            backends,
            cache,
            aapt: AaptLocator::new(storage),
            timeouts,
        }
    }

    pub fn cache(&self) -> &Arc<LabelCache> {
        &self.cache
    }

    pub fn backends(&self) -> &ResolutionBackends {
        &self.backends
    }

    fn host_for(&self, backend: Backend) -> Option<&dyn HostApi> {
        if self.backends.has(backend) {
            self.host.as_deref()
        } else {
            None
        }
    }

    fn remember(&self, pkg: &str, label: &str) {
        self.cache.put(pkg, label);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Strategy 1: cache + synchronous host API
    // ─────────────────────────────────────────────────────────────────────────

    pub fn fast_label(&self, pkg: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(pkg) {
            return Some(cached);
        }

        let mut label = None;
        if let Some(host) = self.host_for(Backend::PackagesInfo) {
            match host.packages_info(&[pkg.to_string()]) {
                Ok(infos) => {
                    label = infos
                        .into_iter()
                        .next()
                        .and_then(|info| info.app_label)
                        .filter(|label| !label.is_empty());
                }
                Err(err) => debug!(pkg, error = %err, "packages_info lookup failed"),
            }
        }

        if label.is_none() {
            if let Some(host) = self.host_for(Backend::PackageManager) {
                match host.application_label(pkg) {
                    Ok(found) => label = found.filter(|label| !label.is_empty()),
                    Err(err) => debug!(pkg, error = %err, "package manager lookup failed"),
                }
            }
        }

        if let Some(label) = &label {
            self.remember(pkg, label);
        }
        label
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Strategy 2: asynchronous host API
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn async_label(&self, pkg: &str) -> Option<String> {
        let limit = millis(self.timeouts.api_ms);

        let mut label = None;
        if let Some(host) = self.host_for(Backend::PackagesInfo) {
            let packages = [pkg.to_string()];
            let attempt = with_timeout(limit, host.packages_info_async(&packages)).await;
            label = log_attempt(pkg, "packages_info", attempt)
                .and_then(|infos| infos.into_iter().next())
                .and_then(|info| info.app_label)
                .filter(|label| !label.is_empty());
        }

        if label.is_none() {
            if let Some(host) = self.host_for(Backend::PackageManager) {
                let attempt = with_timeout(limit, host.application_label_async(pkg)).await;
                label = log_attempt(pkg, "package_manager", attempt)
                    .flatten()
                    .filter(|label| !label.is_empty());
            }
        }

        if let Some(label) = &label {
            self.remember(pkg, label);
        }
        label
    }

    /// Batch lookup used for the eager startup pass.
    ///
    /// Cached packages are answered from the cache; the rest go through one
    /// batch host call when more than one package needs it. A failing batch
    /// falls back to per-package synchronous lookups.
    pub fn batch_labels(&self, packages: &[String]) -> HashMap<String, String> {
        let mut results = HashMap::new();
        let mut to_fetch = Vec::new();
        for pkg in packages {
            match self.cache.get(pkg) {
                Some(name) => {
                    results.insert(pkg.clone(), name);
                }
                None => to_fetch.push(pkg.clone()),
            }
        }

        if to_fetch.len() <= 1 {
            return results;
        }
        let Some(host) = self.host_for(Backend::PackagesInfo) else {
            return results;
        };

        match host.packages_info(&to_fetch) {
            Ok(infos) => {
                for (pkg, info) in to_fetch.iter().zip(infos) {
                    if let Some(label) = info.app_label.filter(|label| !label.is_empty()) {
                        self.remember(pkg, &label);
                        results.insert(pkg.clone(), label);
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, count = to_fetch.len(), "Batch lookup failed; trying one by one");
                for pkg in &to_fetch {
                    if let Some(label) = self.fast_label(pkg) {
                        results.insert(pkg.clone(), label);
                    }
                }
            }
        }
        results
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Strategy 3: aapt badging
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn apk_path(&self, pkg: &str) -> Option<String> {
        let command = format!(
            "pm path {} | grep -m 1 \"base.apk\" | cut -d: -f2",
            shell_quote(pkg)
        );
        let attempt = race(millis(self.timeouts.apk_path_ms), self.runner.exec(&command)).await;
        attempt
            .ok()
            .map(|output| output.stdout.trim().to_string())
            .filter(|path| !path.is_empty())
    }

    pub async fn badging_label(&self, pkg: &str) -> Option<String> {
        let apk = self.apk_path(pkg).await?;
        let aapt = self.aapt.locate(self.runner.as_ref()).await?;

        let command = format!(
            "{aapt} dump badging {} 2>/dev/null | grep -m 1 \"application-label\"",
            shell_quote(&apk)
        );
        let output = match race(millis(self.timeouts.badging_ms), self.runner.exec(&command)).await
        {
            Attempt::Ok(output) => output,
            Attempt::TimedOut => {
                debug!(pkg, "aapt badging timed out");
                return None;
            }
            Attempt::Failed(reason) => {
                debug!(pkg, error = %reason, "aapt badging failed");
                return None;
            }
        };

        if !output.success() || output.stdout.is_empty() {
            return None;
        }
        let label = parse_badging_label(&output.stdout)?;
        self.remember(pkg, &label);
        Some(label)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Strategy 4: package dumps
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn dump_label(&self, pkg: &str) -> Option<String> {
        let quoted = shell_quote(pkg);
        let tries = [
            format!("dumpsys package {quoted}"),
            format!("pm dump {quoted}"),
        ];
        for command in &tries {
            match race(millis(self.timeouts.dump_ms), self.runner.exec(command)).await {
                Attempt::Ok(output) if output.success() && !output.stdout.is_empty() => {
                    if let Some(label) = parse_dump_label(&output.stdout) {
                        self.remember(pkg, &label);
                        return Some(label);
                    }
                }
                Attempt::Ok(_) => {}
                Attempt::TimedOut => debug!(pkg, command = %command, "dump timed out"),
                Attempt::Failed(reason) => {
                    debug!(pkg, command = %command, error = %reason, "dump failed")
                }
            }
        }
        None
    }
}

fn log_attempt<T>(pkg: &str, api: &str, attempt: Attempt<T>) -> Option<T> {
    match attempt {
        Attempt::Ok(value) => Some(value),
        Attempt::TimedOut => {
            debug!(pkg, api, "host api timed out");
            None
        }
        Attempt::Failed(reason) => {
            debug!(pkg, api, error = %reason, "host api failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PackageInfo;
    use crate::runner::ExecOutput;
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    const BADGING: &str = "application-label:'Foo Player'\n";

    fn resolver_with(
        runner: Arc<dyn CommandRunner>,
        host: Option<Arc<dyn HostApi>>,
        root: &std::path::Path,
    ) -> LabelResolver {
        let storage = StorageConfig::with_root(root.to_path_buf());
        let cache = Arc::new(LabelCache::new(&storage.cache_file()));
        LabelResolver::new(runner, host, cache, storage, StrategyTimeouts::default())
    }

    fn device(command: &str) -> ExecOutput {
        if command.starts_with("getprop") {
            ExecOutput::ok("arm64-v8a,armeabi-v7a")
        } else if command.contains("echo ok") {
            ExecOutput::ok("no")
        } else if command.starts_with("which") {
            ExecOutput::ok("/system/bin/aapt\n")
        } else if command.starts_with("pm path \"com.foo\"") {
            ExecOutput::ok("/data/app/com.foo/base.apk\n")
        } else if command.contains("dump badging") {
            ExecOutput::ok(BADGING)
        } else if command.starts_with("dumpsys package \"com.bar\"") {
            ExecOutput::ok("Packages:\n  label=Bar Tools\n")
        } else {
            ExecOutput::failed("unknown")
        }
    }

    struct Host {
        calls: AtomicUsize,
    }

    impl HostApi for Host {
        fn has_packages_info(&self) -> bool {
            true
        }

        fn packages_info(&self, packages: &[String]) -> Result<Vec<PackageInfo>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(packages
                .iter()
                .map(|pkg| PackageInfo {
                    package_name: pkg.clone(),
                    app_label: (pkg != "com.unknown").then(|| format!("Label {pkg}")),
                })
                .collect())
        }

        fn application_label(&self, _package: &str) -> Result<Option<String>, String> {
            Ok(None)
        }
    }

    struct HangingHost;

    impl HostApi for HangingHost {
        fn has_package_manager(&self) -> bool {
            true
        }

        fn packages_info(&self, _packages: &[String]) -> Result<Vec<PackageInfo>, String> {
            Err("unsupported".to_string())
        }

        fn application_label(&self, _package: &str) -> Result<Option<String>, String> {
            Err("sync path broken".to_string())
        }

        fn application_label_async<'a>(
            &'a self,
            _package: &'a str,
        ) -> BoxFuture<'a, Result<Option<String>, String>> {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Some("Too Late".to_string()))
            }
            .boxed()
        }
    }

    #[test]
    fn test_parse_badging_label() {
        assert_eq!(
            parse_badging_label("package: name='x'\napplication-label:'My App'\n").as_deref(),
            Some("My App")
        );
        assert_eq!(parse_badging_label("application-label:''"), None);
        assert_eq!(parse_badging_label("nothing here"), None);
    }

    #[test]
    fn test_parse_dump_label_prefers_application_label() {
        assert_eq!(
            parse_dump_label("application-label: Maps \nlabel=Other").as_deref(),
            Some("Maps")
        );
        assert_eq!(
            parse_dump_label("  nonLocalizedLabel=null\n  label=Camera\n").as_deref(),
            Some("Camera")
        );
        assert_eq!(parse_dump_label("application-label:\nno label"), None);
        assert_eq!(
            parse_dump_label("application-label:\n  label=Camera\n").as_deref(),
            Some("Camera")
        );
    }

    #[test]
    fn test_abi_from_getprop() {
        assert_eq!(abi_from_getprop("arm64-v8a,armeabi-v7a"), "arm64-v8a");
        assert_eq!(abi_from_getprop("armeabi-v7a,armeabi"), "armeabi-v7a");
        assert_eq!(abi_from_getprop("x86_64"), "arm64-v8a");
    }

    #[tokio::test]
    async fn badging_strategy_resolves_and_caches() {
        let temp = tempdir().unwrap();
        let resolver = resolver_with(Arc::new(device), None, temp.path());

        let label = resolver.badging_label("com.foo").await;
        assert_eq!(label.as_deref(), Some("Foo Player"));
        assert_eq!(resolver.cache().get("com.foo").as_deref(), Some("Foo Player"));
    }

    #[tokio::test]
    async fn badging_strategy_without_apk_path_is_none() {
        let temp = tempdir().unwrap();
        let resolver = resolver_with(Arc::new(device), None, temp.path());
        assert_eq!(resolver.badging_label("com.missing").await, None);
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn dump_strategy_falls_through_to_label_pattern() {
        let temp = tempdir().unwrap();
        let resolver = resolver_with(Arc::new(device), None, temp.path());
        assert_eq!(
            resolver.dump_label("com.bar").await.as_deref(),
            Some("Bar Tools")
        );
        assert_eq!(resolver.dump_label("com.baz").await, None);
    }

    #[tokio::test]
    async fn aapt_location_is_memoised() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let runner = move |command: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            device(command)
        };
        let locator = AaptLocator::new(StorageConfig::with_root("/m".into()));

        assert_eq!(locator.locate(&runner).await.as_deref(), Some("/system/bin/aapt"));
        let after_first = calls.load(Ordering::SeqCst);
        assert_eq!(locator.locate(&runner).await.as_deref(), Some("/system/bin/aapt"));
        assert_eq!(calls.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test]
    async fn fast_label_uses_cache_before_host() {
        let temp = tempdir().unwrap();
        let host = Arc::new(Host {
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver_with(
            Arc::new(device),
            Some(host.clone() as Arc<dyn HostApi>),
            temp.path(),
        );
        resolver.cache().put("com.cached", "Cached");

        assert_eq!(resolver.fast_label("com.cached").as_deref(), Some("Cached"));
        assert_eq!(host.calls.load(Ordering::SeqCst), 0);

        assert_eq!(resolver.fast_label("com.x").as_deref(), Some("Label com.x"));
        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cache().get("com.x").as_deref(), Some("Label com.x"));
    }

    #[tokio::test]
    async fn batch_labels_issues_one_host_call() {
        let temp = tempdir().unwrap();
        let host = Arc::new(Host {
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver_with(
            Arc::new(device),
            Some(host.clone() as Arc<dyn HostApi>),
            temp.path(),
        );
        resolver.cache().put("com.cached", "Cached");

        let packages: Vec<String> = ["com.cached", "com.a", "com.b", "com.unknown"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let labels = resolver.batch_labels(&packages);

        assert_eq!(host.calls.load(Ordering::SeqCst), 1);
        assert_eq!(labels.len(), 3);
        assert_eq!(labels["com.a"], "Label com.a");
        assert!(!labels.contains_key("com.unknown"));
    }

    #[tokio::test(start_paused = true)]
    async fn async_label_times_out_to_none() {
        let temp = tempdir().unwrap();
        let host: Arc<dyn HostApi> = Arc::new(HangingHost);
        let resolver = resolver_with(Arc::new(device), Some(host), temp.path());

        assert_eq!(resolver.fast_label("com.slow"), None);
        assert_eq!(resolver.async_label("com.slow").await, None);
        assert!(resolver.cache().get("com.slow").is_none());
    }
}
