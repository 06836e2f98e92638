use crate::error::AppResult;
use crate::ipc::helpers::{actor, db_conn, optional_str, params_as, required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::students::{self, NewStudent, Student, StudentPage, StudentPatch, StudentQuery};
use serde_json::{json, Value};

fn students_list(state: &AppState, req: &Request) -> AppResult<StudentPage> {
    let conn = db_conn(state)?;
    let query: StudentQuery = params_as(req)?;
    students::list(conn, &query, state.settings.app.students_per_page)
}

fn students_search(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let term = optional_str(req, "q").unwrap_or_default();
    Ok(json!({ "students": students::search(conn, &term)? }))
}

fn students_get(state: &AppState, req: &Request) -> AppResult<Student> {
    let conn = db_conn(state)?;
    let id = required_str(req, "id")?;
    students::get(conn, &id)
}

fn students_create(state: &AppState, req: &Request) -> AppResult<Student> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let input: NewStudent = params_as(req)?;
    students::create(conn, &actor, input)
}

fn students_update(state: &AppState, req: &Request) -> AppResult<Student> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    let patch: StudentPatch = params_as(req)?;
    students::update(conn, &actor, &id, patch)
}

fn students_delete(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    students::delete(conn, &actor, &id)?;
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(respond(req, students_list(state, req))),
        "students.search" => Some(respond(req, students_search(state, req))),
        "students.get" => Some(respond(req, students_get(state, req))),
        "students.create" => Some(respond(req, students_create(state, req))),
        "students.update" => Some(respond(req, students_update(state, req))),
        "students.delete" => Some(respond(req, students_delete(state, req))),
        _ => None,
    }
}
