//! hdr-panel: command-line control panel for the per-app HDR module.
//!
//! Lists installed apps with readable names and edits which of them have HDR
//! enabled. Runs on the device (root shell) against the module directory.
//!
//! ## Subcommands
//!
//! - `list`: resolve labels and print every app with its selection mark
//! - `toggle`, `select-all`, `deselect-all`: edit the selection
//! - `save`, `merge`: persist the selection and fold it into display configs
//! - `status`, `evict-cache`, `reboot`: maintenance

mod commands;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hdr_core::StorageConfig;

#[derive(Parser)]
#[command(name = "hdr-panel")]
#[command(about = "Per-app HDR control panel")]
#[command(version)]
struct Cli {
    /// Module directory (defaults to $HDR_MODULE_DIR, then the installed module)
    #[arg(long, global = true, value_name = "DIR")]
    module_dir: Option<PathBuf>,

    /// Override the configured auto-save mode for selection edits
    #[arg(long, global = true, value_name = "BOOL")]
    auto_save: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve app labels and print the app list
    List {
        /// Stop waiting for unresolved labels after this many seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Flip the selection of one or more packages
    Toggle {
        #[arg(value_name = "PKG", required = true)]
        packages: Vec<String>,

        /// Save explicitly afterwards (needed when auto-save is off)
        #[arg(long)]
        save: bool,
    },

    /// Select every installed app
    SelectAll {
        /// Save explicitly afterwards (needed when auto-save is off)
        #[arg(long)]
        save: bool,
    },

    /// Clear the selection
    DeselectAll {
        /// Save explicitly afterwards (needed when auto-save is off)
        #[arg(long)]
        save: bool,
    },

    /// Write the selection files and merge them into the display configs
    Save,

    /// Re-run the display config merge from the saved selection
    Merge,

    /// Show module file status as JSON
    Status,

    /// Drop cached labels of uninstalled packages
    EvictCache,

    /// Reboot the device
    Reboot,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let storage = match cli.module_dir {
        Some(dir) => StorageConfig::with_root(dir),
        None => StorageConfig::default(),
    };
    let _logging_guard = logging::init(&storage.log_file());

    let session = match commands::open_session(storage, cli.auto_save) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "hdr-panel failed to start");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::List { wait_secs, json } => {
            commands::list(&session, Duration::from_secs(wait_secs), json).await
        }
        Commands::Toggle { packages, save } => commands::toggle(&session, &packages, save).await,
        Commands::SelectAll { save } => commands::select_all(&session, save).await,
        Commands::DeselectAll { save } => commands::deselect_all(&session, save),
        Commands::Save => commands::save(&session),
        Commands::Merge => commands::merge(&session),
        Commands::Status => commands::status(&session),
        Commands::EvictCache => commands::evict_cache(&session).await,
        Commands::Reboot => commands::reboot(&session).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "hdr-panel command failed");
        std::process::exit(1);
    }
}
