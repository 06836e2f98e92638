use crate::assessments::{self, Assessment, AssessmentPage, AssessmentPatch, AssessmentQuery, NewAssessment};
use crate::calc::{self, RecordFilter, StudentGradeReport};
use crate::error::AppResult;
use crate::ipc::helpers::{actor, db_conn, optional_str, params_as, required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::users::Role;
use serde_json::{json, Value};

fn assessments_list(state: &AppState, req: &Request) -> AppResult<AssessmentPage> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let query: AssessmentQuery = params_as(req)?;
    assessments::list(conn, &actor, &query, state.settings.app.assessments_per_page)
}

fn assessments_get(state: &AppState, req: &Request) -> AppResult<Assessment> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    let a = assessments::get(conn, &id)?;
    actor.require_owner_or_admin(a.teacher_id.as_deref(), "view")?;
    Ok(a)
}

fn assessments_create(state: &AppState, req: &Request) -> AppResult<Assessment> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let input: NewAssessment = params_as(req)?;
    assessments::create(conn, &state.settings.grading, &actor, input)
}

fn assessments_update(state: &AppState, req: &Request) -> AppResult<Assessment> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    let patch: AssessmentPatch = params_as(req)?;
    assessments::update(conn, &state.settings.grading, &actor, &id, patch)
}

fn assessments_delete(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    assessments::delete(conn, &actor, &id)?;
    Ok(json!({ "deleted": id }))
}

fn assessments_archive(state: &AppState, req: &Request, archived: bool) -> AppResult<Assessment> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    assessments::set_archived(conn, &actor, &id, archived)
}

/// Teachers only ever see grades built from their own records.
fn teacher_scope(state: &AppState, req: &Request) -> AppResult<Option<String>> {
    let actor = actor(db_conn(state)?, req)?;
    Ok(match actor.role {
        Role::Teacher => actor.user_id,
        Role::Admin => None,
    })
}

fn grades_student(state: &AppState, req: &Request) -> AppResult<StudentGradeReport> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let filter = RecordFilter {
        subject: optional_str(req, "subject"),
        teacher_id: teacher_scope(state, req)?,
    };
    calc::student_report(conn, &state.settings.grading, &student_id, filter)
}

fn grades_subjects(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let teacher_id = teacher_scope(state, req)?;
    let subjects = calc::subject_reports(conn, &state.settings.grading, &student_id, teacher_id)?;
    Ok(json!({ "studentId": student_id, "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.list" => Some(respond(req, assessments_list(state, req))),
        "assessments.get" => Some(respond(req, assessments_get(state, req))),
        "assessments.create" => Some(respond(req, assessments_create(state, req))),
        "assessments.update" => Some(respond(req, assessments_update(state, req))),
        "assessments.delete" => Some(respond(req, assessments_delete(state, req))),
        "assessments.archive" => Some(respond(req, assessments_archive(state, req, true))),
        "assessments.unarchive" => Some(respond(req, assessments_archive(state, req, false))),
        "grades.student" => Some(respond(req, grades_student(state, req))),
        "grades.subjects" => Some(respond(req, grades_subjects(state, req))),
        _ => None,
    }
}
