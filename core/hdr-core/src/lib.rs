//! # HDR Core
//!
//! Core library for the HDR module's app-list panel on rooted Android.
//!
//! The panel shows every user-installed package with a readable name and
//! lets the user pick which apps get HDR enabled. Names are expensive to
//! obtain on device, so most of this crate is a resolution pipeline:
//!
//! - **Cache**: persisted `app_cache.json` ([`cache`])
//! - **Strategies**: host APIs, aapt badging and package dumps ([`strategies`])
//! - **Scheduler**: bounded worker pool with retry and time budgets ([`scheduler`])
//! - **Monitor**: stall and stuck-item recovery ([`monitor`])
//! - **Selection**: `appList.xml` / `appList_new.xml` persistence ([`selection`])
//! - **Merge**: folding the selection into display configs ([`merge`])
//!
//! ## Architecture
//!
//! [`PanelSession`] owns one instance of everything for a module directory.
//! External effects go through two seams: [`CommandRunner`] for shell
//! commands and [`HostApi`] for the privileged lookups a host may offer.
//! Display updates flow out through [`PresentationHooks`].

pub mod cache;
pub mod config;
pub mod error;
pub mod fs_utils;
pub mod host;
pub mod merge;
pub mod monitor;
pub mod packages;
pub mod records;
pub mod runner;
pub mod scheduler;
pub mod selection;
pub mod session;
pub mod storage;
pub mod strategies;
pub mod timeout;

pub use cache::{CacheEntry, FlushOutcome, LabelCache};
pub use config::{load_panel_config, load_panel_config_or_default, PanelConfig};
pub use error::{HdrError, Result};
pub use host::{Backend, HostApi, PackageInfo, ResolutionBackends};
pub use merge::{ConfigMerger, ConfigPair, FileStatus, MergeDetails, MergeReport, XmlMerger};
pub use monitor::{LivenessMonitor, TickReport};
pub use packages::list_packages;
pub use records::{fallback_name, AppRecord, NoopHooks, Notice, PresentationHooks, Progress};
pub use runner::{CommandRunner, ExecOutput, ShellRunner};
pub use scheduler::LabelScheduler;
pub use selection::SelectionStore;
pub use session::{InitReport, PanelSession, SessionParts};
pub use storage::StorageConfig;
pub use strategies::LabelResolver;
pub use timeout::Attempt;
