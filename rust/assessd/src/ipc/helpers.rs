use crate::error::{AppError, AppResult};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::users::Actor;
use crate::workbook::WorkspacePaths;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;

pub fn db_conn(state: &AppState) -> AppResult<&Connection> {
    state.db.as_ref().ok_or(AppError::NoWorkspace)
}

pub fn workspace_paths(state: &AppState) -> AppResult<&WorkspacePaths> {
    state.paths.as_ref().ok_or(AppError::NoWorkspace)
}

pub fn required_str(req: &Request, key: &str) -> AppResult<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::validation(format!("missing {key}")))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn required_path(req: &Request, key: &str) -> AppResult<PathBuf> {
    required_str(req, key).map(PathBuf::from)
}

/// The whole params object as `T`. Unknown keys such as `actor` are ignored.
pub fn params_as<T: DeserializeOwned>(req: &Request) -> AppResult<T> {
    let params = if req.params.is_null() {
        serde_json::json!({})
    } else {
        req.params.clone()
    };
    serde_json::from_value(params).map_err(|e| AppError::validation(format!("invalid params: {e}")))
}

/// Resolves `params.actor = {userId?, role?}`. A request without an actor
/// runs as the local administrator.
pub fn actor(conn: &Connection, req: &Request) -> AppResult<Actor> {
    let Some(a) = req.params.get("actor").filter(|v| !v.is_null()) else {
        return Ok(Actor::local_admin());
    };
    let user_id = a.get("userId").and_then(|v| v.as_str());
    let role = a.get("role").and_then(|v| v.as_str());
    Actor::resolve(conn, user_id, role)
}

/// Wraps a handler outcome in the response envelope.
pub fn respond<T: Serialize>(req: &Request, result: AppResult<T>) -> serde_json::Value {
    match result {
        Ok(v) => match serde_json::to_value(v) {
            Ok(value) => ok(&req.id, value),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => {
            match &e {
                AppError::Db(_) | AppError::Io(_) | AppError::Spreadsheet(_) => {
                    tracing::error!(method = %req.method, error = %e, "request failed")
                }
                _ => tracing::debug!(method = %req.method, code = e.code(), "request rejected"),
            }
            e.response(&req.id)
        }
    }
}
