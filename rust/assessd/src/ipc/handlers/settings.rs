use crate::assessments::{self, TermSettings, TermSettingsPatch};
use crate::error::AppResult;
use crate::ipc::helpers::{actor, db_conn, params_as, respond};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn settings_get(state: &AppState) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let term = TermSettings::load(conn)?;
    let grading = &state.settings.grading;
    Ok(json!({
        "term": term,
        "categories": grading.categories,
        "bands": grading.bands,
        "rounding": grading.rounding,
        "app": state.settings.app,
    }))
}

fn settings_update(state: &AppState, req: &Request) -> AppResult<TermSettings> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let patch: TermSettingsPatch = params_as(req)?;
    assessments::update_term_settings(conn, &actor, patch)
}

fn archive_term(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let archived = assessments::archive_previous_terms(conn, &actor)?;
    Ok(json!({ "archived": archived }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(respond(req, settings_get(state))),
        "settings.update" => Some(respond(req, settings_update(state, req))),
        "settings.archiveTerm" => Some(respond(req, archive_term(state, req))),
        _ => None,
    }
}
