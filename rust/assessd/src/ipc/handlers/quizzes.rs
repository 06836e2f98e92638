use crate::error::AppResult;
use crate::ipc::helpers::{actor, db_conn, optional_str, params_as, required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::questions::{self, NewQuestion, Question, QuestionPatch, QuestionQuery};
use crate::quizzes::{self, AttemptSubmission, NewQuiz, QuizAttempt, QuizDetail};
use serde_json::{json, Value};

fn questions_list(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let query: QuestionQuery = params_as(req)?;
    Ok(json!({ "questions": questions::list(conn, &query)? }))
}

fn questions_create(state: &AppState, req: &Request) -> AppResult<Question> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let input: NewQuestion = params_as(req)?;
    questions::create(conn, &actor, input)
}

fn questions_update(state: &AppState, req: &Request) -> AppResult<Question> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    let patch: QuestionPatch = params_as(req)?;
    questions::update(conn, &actor, &id, patch)
}

fn questions_approve(state: &AppState, req: &Request) -> AppResult<Question> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    questions::approve(conn, &actor, &id)
}

fn questions_reject(state: &AppState, req: &Request) -> AppResult<Question> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    questions::reject(conn, &actor, &id, optional_str(req, "reason"))
}

fn questions_delete(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    questions::delete(conn, &actor, &id)?;
    Ok(json!({ "deleted": id }))
}

fn quizzes_list(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let subject = optional_str(req, "subject");
    let active_only = req
        .params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    Ok(json!({ "quizzes": quizzes::list(conn, subject.as_deref(), active_only)? }))
}

fn quizzes_get(state: &AppState, req: &Request) -> AppResult<QuizDetail> {
    let conn = db_conn(state)?;
    let id = required_str(req, "id")?;
    quizzes::get(conn, &id)
}

fn quizzes_create(state: &AppState, req: &Request) -> AppResult<QuizDetail> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let input: NewQuiz = params_as(req)?;
    quizzes::create(conn, &actor, input)
}

fn quizzes_delete(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let id = required_str(req, "id")?;
    quizzes::delete(conn, &actor, &id)?;
    Ok(json!({ "deleted": id }))
}

fn quizzes_submit(state: &AppState, req: &Request) -> AppResult<QuizAttempt> {
    let conn = db_conn(state)?;
    let submission: AttemptSubmission = params_as(req)?;
    quizzes::submit_attempt(conn, submission)
}

fn quizzes_attempts(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    let quiz_id = optional_str(req, "quizId");
    let student_id = optional_str(req, "studentId");
    let attempts = quizzes::attempts(conn, quiz_id.as_deref(), student_id.as_deref())?;
    Ok(json!({ "attempts": attempts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "questions.list" => Some(respond(req, questions_list(state, req))),
        "questions.create" => Some(respond(req, questions_create(state, req))),
        "questions.update" => Some(respond(req, questions_update(state, req))),
        "questions.approve" => Some(respond(req, questions_approve(state, req))),
        "questions.reject" => Some(respond(req, questions_reject(state, req))),
        "questions.delete" => Some(respond(req, questions_delete(state, req))),
        "quizzes.list" => Some(respond(req, quizzes_list(state, req))),
        "quizzes.get" => Some(respond(req, quizzes_get(state, req))),
        "quizzes.create" => Some(respond(req, quizzes_create(state, req))),
        "quizzes.delete" => Some(respond(req, quizzes_delete(state, req))),
        "quizzes.submitAttempt" => Some(respond(req, quizzes_submit(state, req))),
        "quizzes.attempts" => Some(respond(req, quizzes_attempts(state, req))),
        _ => None,
    }
}
