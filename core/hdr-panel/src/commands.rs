//! Subcommand handlers. Each one opens only as much of the session as it needs.

use std::sync::Arc;
use std::time::Duration;

use hdr_core::{
    load_panel_config_or_default, HdrError, Notice, PanelSession, PresentationHooks, Progress,
    Result, SessionParts, StorageConfig,
};
use tracing::{debug, warn};

/// Prints user-facing notices; background progress goes to the log only.
struct ConsoleHooks;

impl PresentationHooks for ConsoleHooks {
    fn on_progress(&self, progress: Progress) {
        debug!(
            labeled = progress.labeled,
            total = progress.total,
            failed = progress.failed,
            "Progress"
        );
    }

    fn on_pipeline_complete(&self) {
        debug!("All labels resolved");
    }

    fn on_notice(&self, notice: Notice) {
        let message = match notice {
            Notice::SavedRebootRequired => "Saved. Reboot to apply.".to_string(),
            Notice::SaveFailed => "Save failed.".to_string(),
            Notice::SelectAllComplete => "All apps selected.".to_string(),
            Notice::DeselectAllComplete => "All apps deselected.".to_string(),
            Notice::RebootFailed(details) => format!("Reboot failed: {details}"),
        };
        eprintln!("{message}");
    }
}

/// Builds the session. `auto_save` overrides the configured mode when given.
pub fn open_session(storage: StorageConfig, auto_save: Option<bool>) -> Result<PanelSession> {
    if !storage.root().is_dir() {
        return Err(HdrError::ModuleDirNotFound(storage.root().to_path_buf()));
    }
    let config = load_panel_config_or_default(&storage.config_file());
    let session = PanelSession::with_parts(
        storage,
        config,
        SessionParts {
            hooks: Arc::new(ConsoleHooks),
            ..SessionParts::default()
        },
    );
    if let Some(enabled) = auto_save {
        session.selection().set_auto_save(enabled);
    }
    Ok(session)
}

pub async fn list(session: &PanelSession, wait: Duration, json: bool) -> Result<()> {
    session.init().await;

    tokio::select! {
        settled = session.wait_until_complete(wait) => {
            if !settled {
                warn!(?wait, "Deadline reached before all labels resolved");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; saving label cache");
        }
    }
    session.shutdown().await;

    let mut records = session.records();
    records.sort_by_key(|record| record.name.to_lowercase());
    let selection = session.selection();

    if json {
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|record| {
                serde_json::json!({
                    "pkg": record.pkg,
                    "name": record.name,
                    "labeled": record.labeled,
                    "selected": selection.is_selected(&record.pkg),
                })
            })
            .collect();
        let rendered = serde_json::to_string_pretty(&rows).map_err(|source| HdrError::Json {
            context: "rendering app list".to_string(),
            source,
        })?;
        println!("{rendered}");
        return Ok(());
    }

    for record in &records {
        let mark = if selection.is_selected(&record.pkg) { "x" } else { " " };
        println!("[{mark}] {} ({})", record.name, record.pkg);
    }
    println!("{}", summary_line(session.progress(), selection.len()));
    Ok(())
}

fn summary_line(progress: Progress, selected: usize) -> String {
    format!(
        "{} apps, {} selected, {} with fallback names",
        progress.total, selected, progress.failed
    )
}

pub async fn toggle(session: &PanelSession, packages: &[String], save: bool) -> Result<()> {
    session.open();
    session.load_packages().await;
    for pkg in packages {
        let selected = session.toggle(pkg)?;
        println!("{} {pkg}", if selected { "selected" } else { "deselected" });
    }
    persist(session, save)
}

pub async fn select_all(session: &PanelSession, save: bool) -> Result<()> {
    session.open();
    session.load_packages().await;
    session.select_all();
    persist(session, save)
}

pub fn deselect_all(session: &PanelSession, save: bool) -> Result<()> {
    session.open();
    session.deselect_all();
    persist(session, save)
}

/// Saves explicitly when asked; otherwise warns if the edit stays in memory.
fn persist(session: &PanelSession, save: bool) -> Result<()> {
    if save {
        session.save()?;
    } else if !session.selection().auto_save() {
        warn!("Auto-save is off; pass --save to persist this change");
    }
    Ok(())
}

pub fn save(session: &PanelSession) -> Result<()> {
    session.open();
    session.save()
}

pub fn merge(session: &PanelSession) -> Result<()> {
    session.open();
    let report = session.merge_now()?;
    print_json("merge report", &report)?;
    if !report.success {
        return Err(HdrError::SaveFailed(report.message));
    }
    Ok(())
}

pub fn status(session: &PanelSession) -> Result<()> {
    let selected = session.open();
    let status = serde_json::json!({
        "module_dir": session.storage().root(),
        "selected": selected,
        "cached_labels": session.cache().len(),
        "auto_save": session.selection().auto_save(),
        "backups": session.backup_status(),
        "derived": session.config_status(),
    });
    print_json("status", &status)
}

pub async fn evict_cache(session: &PanelSession) -> Result<()> {
    session.open();
    session.load_packages().await;
    let removed = session.evict_cache();
    session.shutdown().await;
    println!("Removed {removed} stale label(s)");
    Ok(())
}

pub async fn reboot(session: &PanelSession) -> Result<()> {
    session.reboot().await
}

fn print_json<T: serde::Serialize>(what: &str, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(|source| HdrError::Json {
        context: format!("rendering {what}"),
        source,
    })?;
    println!("{rendered}");
    Ok(())
}
