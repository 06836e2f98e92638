use crate::error::AppResult;
use crate::ipc::helpers::{actor, db_conn, params_as, required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::users::{self, NewUser, User, UserPatch};
use serde_json::{json, Value};

fn users_list(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    actor(conn, req)?.require_admin("list users")?;
    Ok(json!({ "users": users::list(conn)? }))
}

fn users_create(state: &AppState, req: &Request) -> AppResult<User> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let input: NewUser = params_as(req)?;
    users::create(conn, &actor, input)
}

fn users_update(state: &AppState, req: &Request) -> AppResult<User> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    let patch: UserPatch = params_as(req)?;
    users::update(conn, &actor, &id, patch)
}

fn users_delete(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    users::delete(conn, &actor, &id)?;
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(respond(req, users_list(state, req))),
        "users.create" => Some(respond(req, users_create(state, req))),
        "users.update" => Some(respond(req, users_update(state, req))),
        "users.delete" => Some(respond(req, users_delete(state, req))),
        _ => None,
    }
}
