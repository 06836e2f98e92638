use crate::assessments::{self, Assessment, TermSettings};
use crate::calc::{self, RecordFilter};
use crate::config::{Settings, XLSX_MIME};
use crate::error::{AppError, AppResult};
use crate::students::{self, Student};
use crate::template::{CellContent, MarkInput, TemplateStudent};
use crate::users::{Actor, Role};
use crate::workbook::{self, TemplateWorkbook, WorkspacePaths};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CSV_MIME: &str = "text/csv";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFilters {
    pub subject: Option<String>,
    pub class_name: Option<String>,
    pub category: Option<String>,
    pub student_id: Option<String>,
}

impl ExportFilters {
    /// Filter values joined for use in a file name, or `all`.
    fn file_stem(&self) -> String {
        let parts: Vec<String> = [&self.subject, &self.class_name, &self.category]
            .into_iter()
            .flatten()
            .filter(|v| !v.trim().is_empty())
            .map(|v| file_part(v))
            .collect();
        if parts.is_empty() {
            "all".to_string()
        } else {
            parts.join("_")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFile {
    pub path: String,
    pub file_name: String,
    pub mime_type: &'static str,
    pub rows_exported: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<serde_json::Value>,
}

impl ExportedFile {
    fn new(path: &Path, mime_type: &'static str, rows_exported: usize) -> Self {
        Self {
            path: path.to_string_lossy().to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            mime_type,
            rows_exported,
            warning: None,
        }
    }
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn csv_line(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|f| csv_quote(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

/// Keeps letters, digits, `-` and `_`; everything else becomes `_`.
fn file_part(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

fn opt(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

fn write_text(dest: &Path, text: &str) -> AppResult<()> {
    std::fs::write(dest, text).map_err(|e| workbook::lock_aware(e, dest))?;
    tracing::info!(path = %dest.display(), bytes = text.len(), "csv written");
    Ok(())
}

/// Export rows visible to the actor: teachers only get their own records.
fn visible_assessments(conn: &Connection, actor: &Actor, f: &ExportFilters) -> AppResult<Vec<Assessment>> {
    let mut rows = assessments::list_for_export(
        conn,
        f.subject.as_deref(),
        f.class_name.as_deref(),
        f.category.as_deref(),
        f.student_id.as_deref(),
    )?;
    if actor.role == Role::Teacher {
        rows.retain(|a| a.teacher_id.is_some() && a.teacher_id == actor.user_id);
    }
    Ok(rows)
}

pub fn assessments_csv(
    conn: &Connection,
    paths: &WorkspacePaths,
    actor: &Actor,
    filters: &ExportFilters,
) -> AppResult<ExportedFile> {
    let rows = visible_assessments(conn, actor, filters)?;
    let mut csv = csv_line(
        &[
            "student_number",
            "name",
            "category",
            "subject",
            "score",
            "max_score",
            "percentage",
            "term",
            "academic_year",
            "session",
            "assessor",
            "teacher",
            "comments",
            "date_recorded",
        ]
        .map(String::from),
    );
    for a in &rows {
        csv.push_str(&csv_line(&[
            a.student_number.clone(),
            a.student_name.clone(),
            a.category.code().to_string(),
            a.subject.clone(),
            a.score.to_string(),
            a.max_score.to_string(),
            format!("{:.2}", a.percentage()),
            opt(&a.term),
            opt(&a.academic_year),
            opt(&a.session),
            opt(&a.assessor),
            a.teacher_username.clone().unwrap_or_else(|| "N/A".to_string()),
            opt(&a.comments),
            a.date_recorded.clone(),
        ]));
    }
    let dest = paths.export_file(&format!("assessments_{}_{}.csv", filters.file_stem(), today()))?;
    write_text(&dest, &csv)?;
    Ok(ExportedFile::new(&dest, CSV_MIME, rows.len()))
}

pub fn student_csv(
    conn: &Connection,
    paths: &WorkspacePaths,
    actor: &Actor,
    student_id: &str,
) -> AppResult<ExportedFile> {
    let student = students::get(conn, student_id)?;
    let filters = ExportFilters {
        student_id: Some(student.id.clone()),
        ..ExportFilters::default()
    };
    let rows = visible_assessments(conn, actor, &filters)?;
    let mut csv = csv_line(
        &[
            "category",
            "subject",
            "class",
            "score",
            "max_score",
            "percentage",
            "grade",
            "term",
            "academic_year",
            "session",
            "assessor",
            "teacher",
            "comments",
            "date_recorded",
        ]
        .map(String::from),
    );
    for a in &rows {
        csv.push_str(&csv_line(&[
            a.category.code().to_string(),
            a.subject.clone(),
            opt(&a.class_name),
            a.score.to_string(),
            a.max_score.to_string(),
            format!("{:.2}", a.percentage()),
            calc::assessment_letter(a.percentage()).to_string(),
            opt(&a.term),
            opt(&a.academic_year),
            opt(&a.session),
            opt(&a.assessor),
            a.teacher_username.clone().unwrap_or_else(|| "N/A".to_string()),
            opt(&a.comments),
            a.date_recorded.clone(),
        ]));
    }
    let dest = paths.export_file(&format!(
        "{}_assessments_{}.csv",
        file_part(&student.student_number),
        today()
    ))?;
    write_text(&dest, &csv)?;
    Ok(ExportedFile::new(&dest, CSV_MIME, rows.len()))
}

pub fn assessments_excel(
    conn: &Connection,
    settings: &Settings,
    paths: &WorkspacePaths,
    actor: &Actor,
    filters: &ExportFilters,
) -> AppResult<ExportedFile> {
    const HEADERS: [&str; 14] = [
        "Student Number",
        "Student Name",
        "Subject",
        "Category",
        "Score",
        "Max Score",
        "Percentage",
        "Grade",
        "Class",
        "Term",
        "Academic Year",
        "Session",
        "Assessor",
        "Date Recorded",
    ];
    let rows = visible_assessments(conn, actor, filters)?;
    let text = |s: &str| CellContent::Text(s.to_string());
    let opt_text = |v: &Option<String>| v.as_deref().map(text).unwrap_or(CellContent::Empty);
    let table: Vec<Vec<CellContent>> = rows
        .iter()
        .map(|a| {
            vec![
                text(&a.student_number),
                text(&a.student_name),
                text(&a.subject),
                text(settings.grading.label(a.category)),
                CellContent::Number(a.score),
                CellContent::Number(a.max_score),
                CellContent::Number(calc::round_2dp(a.percentage())),
                text(calc::assessment_letter(a.percentage())),
                opt_text(&a.class_name),
                opt_text(&a.term),
                opt_text(&a.academic_year),
                opt_text(&a.session),
                opt_text(&a.assessor),
                text(&a.date_recorded),
            ]
        })
        .collect();
    let dest = paths.export_file(&format!("assessments_{}_{}.xlsx", filters.file_stem(), today()))?;
    workbook::write_table(&dest, "Assessments", &HEADERS, &table)?;
    Ok(ExportedFile::new(&dest, XLSX_MIME, rows.len()))
}

/// Teachers are pinned to their own subject when they have one.
fn effective_subject(actor: &Actor, requested: Option<&str>) -> Option<String> {
    let requested = requested.map(str::trim).filter(|s| !s.is_empty());
    match (actor.role, actor.subject.as_deref()) {
        (Role::Teacher, Some(own)) if !own.is_empty() => Some(own.to_string()),
        _ => requested.map(str::to_string),
    }
}

/// Template row for one student: identity columns plus per-category totals.
fn template_row(conn: &Connection, student: &Student, subject: Option<&str>) -> AppResult<TemplateStudent> {
    let records = calc::load_student_records(conn, &student.id)?;
    let filter = RecordFilter {
        subject: subject.map(str::to_string),
        teacher_id: None,
    };
    let summaries = calc::summarize(&records, &filter);
    Ok(TemplateStudent {
        ref_id: Some(student.ref_id().to_string()),
        name: Some(student.template_name()),
        student_number: Some(student.student_number.clone()),
        study_area: student.study_area.clone(),
        marks: calc::template_marks(&summaries)
            .into_iter()
            .map(|(c, v)| (c, MarkInput::Number(v)))
            .collect(),
    })
}

pub fn student_template(
    conn: &Connection,
    settings: &Settings,
    paths: &WorkspacePaths,
    actor: &Actor,
    student_id: &str,
    subject: Option<&str>,
) -> AppResult<ExportedFile> {
    let student = students::get(conn, student_id)?;
    let subject = effective_subject(actor, subject);
    tracing::debug!(student = %student.full_name(), subject = ?subject, "exporting report card");
    let row = template_row(conn, &student, subject.as_deref())?;
    let term_year = TermSettings::load(conn)?.term_year();

    let template = workbook::ensure_template(paths, settings)?;
    let mut book = TemplateWorkbook::open(&template, &settings.layout)?;
    let first_row = settings.layout.first_row;
    book.with_mapper(settings, |m| {
        m.write_student(first_row, &row)?;
        m.update_school_info(
            Some(subject.as_deref().unwrap_or("All Subjects")),
            Some(&term_year),
            student.class_name.as_deref(),
        );
        m.update_count_formula();
        Ok(())
    })?;

    let dest = paths.export_file(&format!(
        "{}_{}_assessment.xlsx",
        file_part(&student.student_number),
        file_part(&student.last_name)
    ))?;
    book.save(&dest)?;
    Ok(ExportedFile::new(&dest, XLSX_MIME, 1))
}

/// Whole class (or every student when no class is given) into one sheet,
/// ordered by last then first name. Students past the template capacity are
/// left out and reported as a warning.
pub fn class_template(
    conn: &Connection,
    settings: &Settings,
    paths: &WorkspacePaths,
    actor: &Actor,
    class_name: Option<&str>,
    subject: Option<&str>,
) -> AppResult<ExportedFile> {
    let class_name = class_name.map(str::trim).filter(|s| !s.is_empty());
    let subject = effective_subject(actor, subject);
    let roster = students::list_by_class(conn, class_name, subject.as_deref())?;
    if roster.is_empty() {
        return Err(AppError::validation("no students match this class and subject"));
    }
    let rows = roster
        .iter()
        .map(|s| template_row(conn, s, subject.as_deref()))
        .collect::<AppResult<Vec<_>>>()?;
    let term_year = TermSettings::load(conn)?.term_year();

    let template = workbook::ensure_template(paths, settings)?;
    let mut book = TemplateWorkbook::open(&template, &settings.layout)?;
    let outcome = book.with_mapper(settings, |m| {
        m.update_school_info(
            Some(subject.as_deref().unwrap_or("All Subjects")),
            Some(&term_year),
            Some(class_name.unwrap_or("All Classes")),
        );
        m.write_batch(&rows)
    })?;

    let dest = paths.export_file(&format!(
        "students_{}_{}_{}.xlsx",
        subject.as_deref().map(file_part).unwrap_or_else(|| "all_subjects".to_string()),
        class_name.map(file_part).unwrap_or_else(|| "all_classes".to_string()),
        today()
    ))?;
    book.save(&dest)?;
    tracing::info!(
        written = outcome.written,
        dropped = outcome.dropped,
        "class template exported"
    );
    let mut file = ExportedFile::new(&dest, XLSX_MIME, outcome.written);
    file.warning = outcome.warning.map(|w| w.to_json());
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessments::tests::record;
    use crate::config::AppConfig;
    use crate::db;
    use crate::students::tests::new_student;
    use crate::template::SheetCells;

    fn workspace() -> (tempfile::TempDir, WorkspacePaths) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = WorkspacePaths::new(dir.path(), &AppConfig::default());
        (dir, paths)
    }

    #[test]
    fn csv_fields_are_quoted_only_when_needed() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(file_part(" 2A/Science "), "2A_Science");
    }

    #[test]
    fn file_stem_joins_filters_or_says_all() {
        assert_eq!(ExportFilters::default().file_stem(), "all");
        let f = ExportFilters {
            subject: Some("Maths".into()),
            class_name: Some("2A".into()),
            ..ExportFilters::default()
        };
        assert_eq!(f.file_stem(), "Maths_2A");
    }

    #[test]
    fn assessments_csv_has_header_and_rows() {
        let (_dir, paths) = workspace();
        let conn = db::open_memory();
        let cfg = Settings::standard();
        let admin = Actor::local_admin();
        let s = students::create(&conn, &admin, new_student("S1", "Ama", "Mensah")).expect("student");
        let mut input = record(&s.id, "ica1", "Maths", 40.0);
        input.comments = Some("good, steady".into());
        assessments::create(&conn, &cfg.grading, &admin, input).expect("assessment");

        let out = assessments_csv(&conn, &paths, &admin, &ExportFilters::default()).expect("export");
        assert_eq!(out.rows_exported, 1);
        assert_eq!(out.mime_type, CSV_MIME);
        assert!(out.file_name.starts_with("assessments_all_"));
        let text = std::fs::read_to_string(&out.path).expect("read");
        let mut lines = text.lines();
        assert!(lines.next().expect("header").starts_with("student_number,name,category"));
        let row = lines.next().expect("row");
        assert!(row.starts_with("S1,Ama Mensah,ica1,Maths,40,50,40.00,"));
        assert!(row.contains(",N/A,\"good, steady\","));
    }

    #[test]
    fn class_template_writes_sorted_rows_and_school_info() {
        let (_dir, paths) = workspace();
        let conn = db::open_memory();
        let settings = Settings::standard();
        let admin = Actor::local_admin();
        let b = students::create(&conn, &admin, new_student("S2", "Kofi", "Boateng")).expect("b");
        let a = students::create(&conn, &admin, new_student("S1", "Ama", "Addo")).expect("a");
        assessments::create(&conn, &settings.grading, &admin, record(&a.id, "ica1", "Maths", 40.0))
            .expect("mark");
        assessments::create(&conn, &settings.grading, &admin, record(&b.id, "ica1", "Maths", 20.0))
            .expect("mark");

        let out = class_template(&conn, &settings, &paths, &admin, Some("2A"), Some("Maths"))
            .expect("export");
        assert_eq!(out.rows_exported, 2);
        assert!(out.warning.is_none());
        assert!(out.file_name.starts_with("students_Maths_2A_"));

        let mut book = TemplateWorkbook::open(Path::new(&out.path), &settings.layout).expect("open");
        let rows = book.with_mapper(&settings, |m| m.all_students()).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], CellContent::Text("Addo Ama".into()));
        assert_eq!(rows[0]["ica1"], CellContent::Number(40.0));
        assert_eq!(rows[1]["name"], CellContent::Text("Boateng Kofi".into()));
        let sheet = book.sheet_mut().expect("sheet");
        assert_eq!(sheet.fetch("B2"), CellContent::Text("Maths".into()));
        assert_eq!(sheet.fetch("B4"), CellContent::Text("2A".into()));
    }

    #[test]
    fn teachers_only_export_their_own_subject() {
        let actor = Actor {
            user_id: Some("t1".into()),
            username: Some("teacher".into()),
            role: Role::Teacher,
            subject: Some("Science".into()),
        };
        assert_eq!(effective_subject(&actor, Some("Maths")).as_deref(), Some("Science"));
        assert_eq!(
            effective_subject(&Actor::local_admin(), Some("Maths")).as_deref(),
            Some("Maths")
        );
        assert_eq!(effective_subject(&Actor::local_admin(), Some(" ")), None);
    }
}
