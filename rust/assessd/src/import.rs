use crate::assessments::{self, NewAssessment};
use crate::config::{AppConfig, Settings};
use crate::error::{AppError, AppResult};
use crate::questions::{self, NewQuestion, QuestionType};
use crate::students::{self, NewStudent};
use crate::users::Actor;
use crate::workbook::{self, lock_aware};
use calamine::{open_workbook_auto, Data, Reader};
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub success_count: usize,
    pub error_count: usize,
    /// The first few row errors only.
    pub errors: Vec<String>,
}

impl ImportReport {
    fn record_error(&mut self, preview: usize, row: usize, message: impl std::fmt::Display) {
        self.error_count += 1;
        if self.errors.len() < preview {
            self.errors.push(format!("Row {row}: {message}"));
        }
    }
}

/// A data row with its 1-based spreadsheet row number.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub row: usize,
    pub cells: Vec<Data>,
}

impl SheetRow {
    fn text(&self, col: usize) -> Option<String> {
        self.cells.get(col).and_then(cell_text)
    }

    fn number(&self, col: usize) -> Option<f64> {
        self.cells.get(col).and_then(cell_number)
    }

    fn required(&self, col: usize, field: &str) -> Result<String, RowError> {
        self.text(col).ok_or_else(|| RowError {
            row: self.row,
            message: format!("{field} is required"),
        })
    }
}

/// A row that could not be parsed; it still counts as a failed row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

/// Trimmed text of a cell. Whole floats lose their fraction so numeric
/// student numbers read back as typed.
pub fn cell_text(cell: &Data) -> Option<String> {
    let s = match cell {
        Data::Empty | Data::Error(_) => return None,
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
    };
    (!s.is_empty()).then_some(s)
}

pub fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Float(f) => Some(*f),
        Data::Int(i) => Some(*i as f64),
        Data::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_blank(cells: &[Data]) -> bool {
    cells.iter().all(|c| cell_text(c).is_none())
}

fn check_extension(path: &Path) -> AppResult<()> {
    let ok = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("xlsx") || e.eq_ignore_ascii_case("xls"))
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(AppError::validation("only .xlsx and .xls files can be imported"))
    }
}

/// Data rows of the first sheet: header row skipped, blank rows dropped.
pub fn read_rows(path: &Path, app: &AppConfig) -> AppResult<Vec<SheetRow>> {
    check_extension(path)?;
    workbook::check_upload_size(path, app)?;
    let mut book = open_workbook_auto(path).map_err(|e| match e {
        calamine::Error::Io(io) => lock_aware(io, path),
        other => AppError::Spreadsheet(other.to_string()),
    })?;
    let Some(first) = book.sheet_names().first().cloned() else {
        return Err(AppError::Spreadsheet("workbook has no sheets".into()));
    };
    let range = book
        .worksheet_range(&first)
        .map_err(|e| AppError::Spreadsheet(e.to_string()))?;
    let start_row = range.start().map(|(r, _)| r as usize).unwrap_or(0);

    let rows = range
        .rows()
        .enumerate()
        .skip(1)
        .filter(|(_, cells)| !is_blank(cells))
        .map(|(i, cells)| SheetRow {
            row: start_row + i + 1,
            cells: cells.to_vec(),
        })
        .collect();
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub row: usize,
    pub student: NewStudent,
}

/// Columns: number, first, last, middle, class, study area. The first three
/// are required.
pub fn parse_student_rows(rows: &[SheetRow]) -> Vec<Result<StudentRow, RowError>> {
    rows.iter()
        .map(|r| -> Result<StudentRow, RowError> {
            Ok(StudentRow {
                row: r.row,
                student: NewStudent {
                    student_number: r.required(0, "student number")?,
                    first_name: r.required(1, "first name")?,
                    last_name: r.required(2, "last name")?,
                    middle_name: r.text(3),
                    class_name: r.text(4),
                    date_of_birth: None,
                    study_area: r.text(5),
                },
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct AssessmentRow {
    pub row: usize,
    pub student_number: String,
    /// `None` when the score cell is not numeric.
    pub score: Option<f64>,
    pub assessment: NewAssessment,
}

/// Columns: student number, category, subject, score, max score, term,
/// session, assessor, comments. The max score column is informational; the
/// category maximum always applies.
pub fn parse_assessment_rows(rows: &[SheetRow]) -> Vec<Result<AssessmentRow, RowError>> {
    rows.iter()
        .map(|r| -> Result<AssessmentRow, RowError> {
            let student_number = r.required(0, "student number")?;
            let category = r.required(1, "category")?;
            let subject = r.required(2, "subject")?;
            r.required(3, "score")?;
            let score = r.number(3);
            Ok(AssessmentRow {
                row: r.row,
                student_number,
                score,
                assessment: NewAssessment {
                    student_id: String::new(),
                    category,
                    subject,
                    score: score.unwrap_or(f64::NAN),
                    class_name: None,
                    term: r.text(5),
                    academic_year: None,
                    session: r.text(6),
                    assessor: r.text(7),
                    comments: r.text(8),
                },
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct QuestionRow {
    pub row: usize,
    pub question: NewQuestion,
}

/// Columns: text, type, options a-d, correct answer, difficulty,
/// explanation. Options are kept for multiple choice only.
pub fn parse_question_rows(rows: &[SheetRow], subject: &str) -> Vec<Result<QuestionRow, RowError>> {
    rows.iter()
        .map(|r| -> Result<QuestionRow, RowError> {
            let question_text = r.required(0, "question text")?;
            let question_type = r.required(1, "question type")?.to_lowercase();
            let correct_answer = r.required(6, "correct answer")?;
            let options = if QuestionType::parse(&question_type) == Some(QuestionType::Mcq) {
                (2..=5).filter_map(|c| r.text(c)).collect()
            } else {
                Vec::new()
            };
            Ok(QuestionRow {
                row: r.row,
                question: NewQuestion {
                    subject: subject.to_string(),
                    question_text,
                    question_type,
                    options,
                    correct_answer,
                    marks: None,
                    keywords: Vec::new(),
                    difficulty: Some(r.text(7).unwrap_or_else(|| "medium".to_string())),
                    explanation: r.text(8),
                },
            })
        })
        .collect()
}

fn finish(tx: rusqlite::Transaction<'_>, report: ImportReport, kind: &str) -> AppResult<ImportReport> {
    tx.commit()?;
    tracing::info!(
        kind,
        imported = report.success_count,
        failed = report.error_count,
        "import finished"
    );
    Ok(report)
}

pub fn import_students(
    conn: &Connection,
    settings: &Settings,
    actor: &Actor,
    path: &Path,
) -> AppResult<ImportReport> {
    let rows = parse_student_rows(&read_rows(path, &settings.app)?);
    let preview = settings.app.import_error_preview;
    let mut report = ImportReport::default();
    let tx = conn.unchecked_transaction()?;
    for r in rows {
        let r = match r {
            Ok(r) => r,
            Err(e) => {
                report.record_error(preview, e.row, e.message);
                continue;
            }
        };
        match students::create(&tx, actor, r.student) {
            Ok(_) => report.success_count += 1,
            Err(e @ (AppError::Validation { .. } | AppError::NotFound { .. })) => {
                report.record_error(preview, r.row, e)
            }
            Err(e) => return Err(e),
        }
    }
    finish(tx, report, "students")
}

pub fn import_assessments(
    conn: &Connection,
    settings: &Settings,
    actor: &Actor,
    path: &Path,
) -> AppResult<ImportReport> {
    let rows = parse_assessment_rows(&read_rows(path, &settings.app)?);
    let preview = settings.app.import_error_preview;
    let mut report = ImportReport::default();
    let tx = conn.unchecked_transaction()?;
    for r in rows {
        let mut r = match r {
            Ok(r) => r,
            Err(e) => {
                report.record_error(preview, e.row, e.message);
                continue;
            }
        };
        let Some(student) = students::find_by_number(&tx, &r.student_number)? else {
            report.record_error(preview, r.row, format!("Student {} not found", r.student_number));
            continue;
        };
        if r.score.is_none() {
            report.record_error(preview, r.row, "score must be a number");
            continue;
        }
        r.assessment.student_id = student.id;
        match assessments::create(&tx, &settings.grading, actor, r.assessment) {
            Ok(_) => report.success_count += 1,
            Err(e @ AppError::Validation { .. }) => {
                report.record_error(preview, r.row, format!("Student {}: {e}", r.student_number))
            }
            Err(e) => return Err(e),
        }
    }
    finish(tx, report, "assessments")
}

pub fn import_questions(
    conn: &Connection,
    settings: &Settings,
    actor: &Actor,
    path: &Path,
    subject: &str,
) -> AppResult<ImportReport> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(AppError::validation("subject is required"));
    }
    let rows = parse_question_rows(&read_rows(path, &settings.app)?, subject);
    let preview = settings.app.import_error_preview;
    let mut report = ImportReport::default();
    let tx = conn.unchecked_transaction()?;
    for r in rows {
        let r = match r {
            Ok(r) => r,
            Err(e) => {
                report.record_error(preview, e.row, e.message);
                continue;
            }
        };
        match questions::create(&tx, actor, r.question) {
            Ok(_) => report.success_count += 1,
            Err(e @ AppError::Validation { .. }) => report.record_error(preview, r.row, e),
            Err(e) => return Err(e),
        }
    }
    finish(tx, report, "questions")
}
