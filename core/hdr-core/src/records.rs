//! App records and the presentation-facing types built on them.

use serde::Serialize;

/// One installed package as the panel shows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppRecord {
    pub pkg: String,
    pub name: String,
    pub labeled: bool,
}

impl AppRecord {
    /// A record seeded from the cache is labeled from the start.
    pub fn new(pkg: &str, cached_name: Option<String>) -> Self {
        match cached_name {
            Some(name) => Self {
                pkg: pkg.to_string(),
                name,
                labeled: true,
            },
            None => Self {
                pkg: pkg.to_string(),
                name: fallback_name(pkg),
                labeled: false,
            },
        }
    }
}

/// Capitalised last dotted segment of a package id.
///
/// `com.acme.bar` → `Bar`. A package ending in a dot falls back to the whole id.
pub fn fallback_name(pkg: &str) -> String {
    let tail = pkg.rsplit('.').next().filter(|tail| !tail.is_empty()).unwrap_or(pkg);
    let mut chars = tail.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Aggregate counters the status bar renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub labeled: usize,
    pub failed: usize,
}

/// User-visible notices; everything else the pipeline does is silent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SavedRebootRequired,
    SaveFailed,
    SelectAllComplete,
    DeselectAllComplete,
    RebootFailed(String),
}

/// Callbacks implemented by the presentation layer. All default to no-ops.
pub trait PresentationHooks: Send + Sync {
    fn on_label_resolved(&self, _pkg: &str, _name: &str) {}

    fn on_progress(&self, _progress: Progress) {}

    fn on_pipeline_complete(&self) {}

    fn on_notice(&self, _notice: Notice) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl PresentationHooks for NoopHooks {}
