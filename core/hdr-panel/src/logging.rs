//! Logging setup: stderr plus `<module>/webui.log`, cleared on every launch.
//!
//! `HDR_PANEL_DEBUG_LOG=1` forces debug level; otherwise `RUST_LOG` applies,
//! defaulting to `info`.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "HDR_PANEL_DEBUG_LOG";

fn env_filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Keep the returned guard alive until exit
/// so buffered file lines are written.
pub fn init(log_file: &Path) -> Option<WorkerGuard> {
    let (file_layer, guard) = match open_truncated(log_file) {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("hdr-panel: logging already initialized: {err}");
    }
    guard
}

fn open_truncated(path: &Path) -> Option<fs_err::File> {
    if !path.parent().is_some_and(Path::is_dir) {
        return None;
    }
    match fs_err::File::create(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("hdr-panel: file logging disabled: {err}");
            None
        }
    }
}
