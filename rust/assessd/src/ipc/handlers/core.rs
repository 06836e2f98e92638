use crate::config::{AppConfig, Settings};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::workbook::{self, WorkspacePaths};
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

/// Opens (or creates) the workspace database and points every file path at
/// the workspace. The workspace config file is optional: a broken one is
/// logged and the defaults apply.
pub fn select_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    let app = match AppConfig::load_from_workspace(path) {
        Ok(app) => app,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring workspace config");
            AppConfig::default()
        }
    };
    let settings = Settings {
        app,
        ..Settings::standard()
    };
    let paths = WorkspacePaths::new(path, &settings.app);
    // A missing template is regenerated on first export as well.
    if let Err(e) = workbook::ensure_template(&paths, &settings) {
        tracing::warn!(error = %e, "could not create the default template");
    }

    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.paths = Some(paths);
    state.settings = settings;
    tracing::info!(workspace = %path.display(), "workspace selected");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match select_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => {
            tracing::error!(workspace = %path.display(), error = ?e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:?}"), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
