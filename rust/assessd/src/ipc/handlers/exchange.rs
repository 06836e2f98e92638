use crate::config::XLSX_MIME;
use crate::error::{AppError, AppResult};
use crate::export::{self, ExportFilters, ExportedFile};
use crate::import::{self, ImportReport};
use crate::ipc::helpers::{
    actor, db_conn, optional_str, params_as, required_path, required_str, respond, workspace_paths,
};
use crate::ipc::types::{AppState, Request};
use crate::workbook::{self, ImportSheet, TemplateWorkbook};
use serde_json::{json, Value};
use std::path::PathBuf;

fn export_assessments_csv(state: &AppState, req: &Request) -> AppResult<ExportedFile> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let filters: ExportFilters = params_as(req)?;
    export::assessments_csv(conn, workspace_paths(state)?, &actor, &filters)
}

fn export_student_csv(state: &AppState, req: &Request) -> AppResult<ExportedFile> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let student_id = required_str(req, "studentId")?;
    export::student_csv(conn, workspace_paths(state)?, &actor, &student_id)
}

fn export_assessments_excel(state: &AppState, req: &Request) -> AppResult<ExportedFile> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let filters: ExportFilters = params_as(req)?;
    export::assessments_excel(conn, &state.settings, workspace_paths(state)?, &actor, &filters)
}

fn export_student_template(state: &AppState, req: &Request) -> AppResult<ExportedFile> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let student_id = required_str(req, "studentId")?;
    let subject = optional_str(req, "subject");
    export::student_template(
        conn,
        &state.settings,
        workspace_paths(state)?,
        &actor,
        &student_id,
        subject.as_deref(),
    )
}

fn export_class_template(state: &AppState, req: &Request) -> AppResult<ExportedFile> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let class_name = optional_str(req, "className");
    let subject = optional_str(req, "subject");
    export::class_template(
        conn,
        &state.settings,
        workspace_paths(state)?,
        &actor,
        class_name.as_deref(),
        subject.as_deref(),
    )
}

fn template_install(state: &AppState, req: &Request) -> AppResult<Value> {
    let conn = db_conn(state)?;
    actor(conn, req)?.require_admin("replace the template")?;
    let source = required_path(req, "path")?;
    let paths = workspace_paths(state)?;
    let bytes = workbook::install_template(&source, paths, &state.settings)?;
    Ok(json!({ "path": paths.template.to_string_lossy(), "bytes": bytes }))
}

fn template_import_sheet(state: &AppState, req: &Request) -> AppResult<Value> {
    let raw = required_str(req, "kind")?;
    let kind = ImportSheet::parse(&raw).ok_or_else(|| {
        AppError::validation_with(
            format!("unknown import sheet: {raw}"),
            json!({ "allowed": ["students", "assessments", "questions"] }),
        )
    })?;
    let path = workbook::ensure_import_sheet(workspace_paths(state)?, kind)?;
    Ok(json!({
        "path": path.to_string_lossy(),
        "fileName": kind.file_name(),
        "mimeType": XLSX_MIME,
    }))
}

/// Reads back the student rows of a filled report-card workbook (the
/// installed template when no path is given).
fn template_read_students(state: &AppState, req: &Request) -> AppResult<Value> {
    let paths = workspace_paths(state)?;
    let path = match optional_str(req, "path") {
        Some(p) => PathBuf::from(p),
        None => workbook::ensure_template(paths, &state.settings)?,
    };
    let mut book = TemplateWorkbook::open(&path, &state.settings.layout)?;
    let students = book.with_mapper(&state.settings, |m| m.all_students())?;
    Ok(json!({
        "path": path.to_string_lossy(),
        "count": students.len(),
        "students": students,
    }))
}

fn import_students(state: &AppState, req: &Request) -> AppResult<ImportReport> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let path = required_path(req, "path")?;
    import::import_students(conn, &state.settings, &actor, &path)
}

fn import_assessments(state: &AppState, req: &Request) -> AppResult<ImportReport> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let path = required_path(req, "path")?;
    import::import_assessments(conn, &state.settings, &actor, &path)
}

fn import_questions(state: &AppState, req: &Request) -> AppResult<ImportReport> {
    let conn = db_conn(state)?;
    let actor = actor(conn, req)?;
    let path = required_path(req, "path")?;
    let subject = optional_str(req, "subject")
        .or_else(|| actor.subject.clone())
        .unwrap_or_default();
    import::import_questions(conn, &state.settings, &actor, &path, &subject)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "export.assessmentsCsv" => Some(respond(req, export_assessments_csv(state, req))),
        "export.studentCsv" => Some(respond(req, export_student_csv(state, req))),
        "export.assessmentsExcel" => Some(respond(req, export_assessments_excel(state, req))),
        "export.studentTemplate" => Some(respond(req, export_student_template(state, req))),
        "export.classTemplate" => Some(respond(req, export_class_template(state, req))),
        "template.install" => Some(respond(req, template_install(state, req))),
        "template.importSheet" => Some(respond(req, template_import_sheet(state, req))),
        "template.readStudents" => Some(respond(req, template_read_students(state, req))),
        "students.importExcel" => Some(respond(req, import_students(state, req))),
        "assessments.importExcel" => Some(respond(req, import_assessments(state, req))),
        "questions.importExcel" => Some(respond(req, import_questions(state, req))),
        _ => None,
    }
}
