//! Privileged host APIs and the startup capability probe.
//!
//! The panel's host (a root manager's WebView bridge, or any embedder) may
//! expose package-label lookups that are far cheaper than spawning
//! subprocesses. Which of them exist is decided once, by
//! [`ResolutionBackends::probe`]; strategies only consult the probe result.

use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;

/// One entry of a batch package-info lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub app_label: Option<String>,
}

/// Label lookups offered by the host.
///
/// Implementors override the `has_*` probes for what they actually provide.
/// The async variants default to the synchronous call.
pub trait HostApi: Send + Sync {
    /// Root-manager style batch lookup.
    fn has_packages_info(&self) -> bool {
        false
    }

    /// Package-manager style single lookup.
    fn has_package_manager(&self) -> bool {
        false
    }

    /// Results are positional: entry `i` belongs to `packages[i]`.
    fn packages_info(&self, packages: &[String]) -> Result<Vec<PackageInfo>, String>;

    fn application_label(&self, package: &str) -> Result<Option<String>, String>;

    fn packages_info_async<'a>(
        &'a self,
        packages: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<PackageInfo>, String>> {
        futures::future::ready(self.packages_info(packages)).boxed()
    }

    fn application_label_async<'a>(
        &'a self,
        package: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, String>> {
        futures::future::ready(self.application_label(package)).boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    PackagesInfo,
    PackageManager,
}

/// Host backends found at startup, in the order strategies try them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionBackends {
    available: Vec<Backend>,
}

impl ResolutionBackends {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn probe(host: Option<&dyn HostApi>) -> Self {
        let Some(host) = host else {
            return Self::none();
        };
        let mut available = Vec::new();
        if host.has_packages_info() {
            available.push(Backend::PackagesInfo);
        }
        if host.has_package_manager() {
            available.push(Backend::PackageManager);
        }
        tracing::info!(backends = ?available, "Host label backends probed");
        Self { available }
    }

    pub fn has(&self, backend: Backend) -> bool {
        self.available.contains(&backend)
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }
}
