//! Persistent package → label cache backed by `app_cache.json`.
//!
//! # File Format
//!
//! ```json
//! {
//!   "com.example.foo": { "name": "Foo App", "timestamp": 1718000000000 }
//! }
//! ```
//!
//! The cache is the source of truth across restarts: any package found here
//! starts the session already labeled. Reads are forgiving (missing, empty or
//! corrupt files load as an empty cache) and writes go through temp file +
//! rename.
//!
//! # Flushing
//!
//! Mutations only mark the cache dirty. [`LabelCache::flush`] serialises the
//! whole map; a flush requested while another is writing is dropped rather
//! than queued, since the next trigger will pick up the latest state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::fs_utils::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    /// Epoch milliseconds of the last change.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since the last successful write.
    Clean,
    /// Another flush was in flight; this request was dropped.
    Busy,
    Written { entries: usize },
    /// Write failed; the cache stays dirty for the next trigger.
    Failed,
}

#[derive(Debug, Default)]
struct CacheState {
    persistent: BTreeMap<String, CacheEntry>,
    /// Fast-path lookup, kept in step with `persistent`.
    memory: HashMap<String, String>,
    dirty: bool,
    /// Bumped on every mutation so a flush only clears `dirty` for what it wrote.
    generation: u64,
}

impl CacheState {
    fn touch(&mut self) {
        self.dirty = true;
        self.generation = self.generation.wrapping_add(1);
    }
}

pub struct LabelCache {
    path: PathBuf,
    state: Mutex<CacheState>,
    flushing: AtomicBool,
}

/// Resets the flush flag on every exit path.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl LabelCache {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            state: Mutex::new(CacheState::default()),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads the cache file into memory. Returns true when nothing usable was loaded.
    ///
    /// Never fails: unreadable or unparsable content is logged and treated as a
    /// first run.
    pub fn load(&self) -> bool {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Label cache missing; first run");
                return true;
            }
            Err(err) => {
                warn!(error = %err, "Failed to read label cache");
                return true;
            }
        };

        if content.trim().is_empty() {
            debug!(path = %self.path.display(), "Label cache empty");
            return true;
        }

        let parsed = match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(path = %self.path.display(), "Label cache is not a JSON object; ignoring");
                return true;
            }
            Err(err) => {
                warn!(
                    error = %err,
                    content_len = content.len(),
                    "Failed to parse label cache; ignoring"
                );
                return true;
            }
        };

        let total = parsed.len();
        let now = Utc::now().timestamp_millis();
        let mut state = self.state();
        let mut loaded = 0usize;
        for (pkg, info) in parsed {
            let Some(name) = info
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
            else {
                continue;
            };
            let timestamp = info
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or(now);
            state.memory.insert(pkg.clone(), name.to_string());
            state.persistent.insert(
                pkg,
                CacheEntry {
                    name: name.to_string(),
                    timestamp,
                },
            );
            loaded += 1;
        }

        info!(loaded, total, "Label cache loaded");
        loaded == 0
    }

    /// Looks up a label, persistent map first, then the in-memory map.
    pub fn get(&self, pkg: &str) -> Option<String> {
        let mut state = self.state();
        if let Some(entry) = state.persistent.get(pkg) {
            let name = entry.name.clone();
            state.memory.insert(pkg.to_string(), name.clone());
            return Some(name);
        }
        state.memory.get(pkg).cloned()
    }

    pub fn contains(&self, pkg: &str) -> bool {
        self.state().persistent.contains_key(pkg)
    }

    /// Records a label. Only a changed name marks the cache dirty.
    /// Returns true when the stored value changed.
    pub fn put(&self, pkg: &str, name: &str) -> bool {
        if pkg.is_empty() || name.is_empty() {
            return false;
        }

        let mut state = self.state();
        if state
            .persistent
            .get(pkg)
            .is_some_and(|entry| entry.name == name)
        {
            return false;
        }

        state.persistent.insert(
            pkg.to_string(),
            CacheEntry {
                name: name.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );
        state.memory.insert(pkg.to_string(), name.to_string());
        state.touch();
        true
    }

    /// Drops entries for packages that are no longer installed.
    pub fn evict(&self, keep: &HashSet<String>) -> usize {
        let mut state = self.state();
        let before = state.persistent.len();
        state.persistent.retain(|pkg, _| keep.contains(pkg));
        state.memory.retain(|pkg, _| keep.contains(pkg));
        let removed = before - state.persistent.len();
        if removed > 0 {
            state.touch();
            info!(removed, remaining = state.persistent.len(), "Label cache evicted");
        }
        removed
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn len(&self) -> usize {
        self.state().persistent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> BTreeMap<String, CacheEntry> {
        self.state().persistent.clone()
    }

    /// Writes the cache to disk if dirty and no other flush is running.
    pub fn flush(&self) -> FlushOutcome {
        if !self.is_dirty() {
            return FlushOutcome::Clean;
        }
        if self.flushing.swap(true, Ordering::AcqRel) {
            debug!("Label cache flush already in flight; dropping request");
            return FlushOutcome::Busy;
        }
        let _guard = FlushGuard(&self.flushing);

        let (snapshot, generation) = {
            let state = self.state();
            (state.persistent.clone(), state.generation)
        };

        let payload = match serde_json::to_vec_pretty(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Failed to serialize label cache");
                return FlushOutcome::Failed;
            }
        };

        if let Err(err) = write_atomic(&self.path, &payload) {
            warn!(error = %err, path = %self.path.display(), "Failed to write label cache");
            return FlushOutcome::Failed;
        }

        let mut state = self.state();
        if state.generation == generation {
            state.dirty = false;
        }
        debug!(
            entries = snapshot.len(),
            bytes = payload.len(),
            "Label cache flushed"
        );
        FlushOutcome::Written {
            entries: snapshot.len(),
        }
    }

    /// Flushes only when dirty; convenience for periodic and shutdown triggers.
    pub fn flush_if_dirty(&self) {
        if self.is_dirty() {
            self.flush();
        }
    }
}
