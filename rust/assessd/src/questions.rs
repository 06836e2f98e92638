use crate::db;
use crate::error::{AppError, AppResult};
use crate::users::{Actor, Role};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Mcq,
    TrueFalse,
    ShortAnswer,
}

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::Mcq => "mcq",
            QuestionType::TrueFalse => "true_false",
            QuestionType::ShortAnswer => "short_answer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mcq" => Some(QuestionType::Mcq),
            "true_false" => Some(QuestionType::TrueFalse),
            "short_answer" => Some(QuestionType::ShortAnswer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Approved,
    Rejected,
}

impl QuestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionStatus::Pending => "pending",
            QuestionStatus::Approved => "approved",
            QuestionStatus::Rejected => "rejected",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "approved" => QuestionStatus::Approved,
            "rejected" => QuestionStatus::Rejected,
            _ => QuestionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub subject: String,
    pub question_text: String,
    pub question_type: QuestionType,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub marks: f64,
    pub keywords: Vec<String>,
    pub difficulty: Difficulty,
    pub explanation: Option<String>,
    pub created_by: Option<String>,
    pub approved_by: Option<String>,
    pub status: QuestionStatus,
    pub rejection_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Question {
    /// Marks a single answer. Choice questions compare case-insensitively;
    /// short answers also accept any configured keyword appearing in the
    /// answer.
    pub fn is_correct(&self, answer: &str) -> bool {
        let given = answer.trim();
        if given.is_empty() {
            return false;
        }
        let expected = self.correct_answer.trim();
        match self.question_type {
            QuestionType::Mcq | QuestionType::TrueFalse => given.eq_ignore_ascii_case(expected),
            QuestionType::ShortAnswer => {
                if given.to_lowercase() == expected.to_lowercase() {
                    return true;
                }
                let lowered = given.to_lowercase();
                self.keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .any(|k| lowered.contains(&k))
            }
        }
    }

    fn can_edit(&self, actor: &Actor) -> bool {
        actor.is_admin()
            || (self.status == QuestionStatus::Pending
                && actor.user_id.is_some()
                && actor.user_id == self.created_by)
    }

    fn can_review(&self, actor: &Actor) -> bool {
        actor.is_admin()
            || (actor.role == Role::Teacher && actor.subject.as_deref() == Some(self.subject.as_str()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQuestion {
    pub subject: String,
    pub question_text: String,
    pub question_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub marks: Option<f64>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPatch {
    pub subject: Option<String>,
    pub question_text: Option<String>,
    pub question_type: Option<String>,
    pub options: Option<Vec<String>>,
    pub correct_answer: Option<String>,
    pub marks: Option<f64>,
    pub keywords: Option<Vec<String>>,
    pub difficulty: Option<String>,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionQuery {
    pub subject: Option<String>,
    pub status: Option<QuestionStatus>,
}

const QUESTION_COLUMNS: &str = "id, subject, question_text, question_type, options_json,
     correct_answer, marks, keywords_json, difficulty, explanation, created_by, approved_by,
     status, rejection_reason, created_at, updated_at";

fn question_from_row(r: &Row<'_>) -> rusqlite::Result<Question> {
    let qtype: String = r.get(3)?;
    let difficulty: String = r.get(8)?;
    let status: String = r.get(12)?;
    Ok(Question {
        id: r.get(0)?,
        subject: r.get(1)?,
        question_text: r.get(2)?,
        question_type: QuestionType::parse(&qtype).unwrap_or(QuestionType::ShortAnswer),
        options: db::json_list(r.get(4)?),
        correct_answer: r.get(5)?,
        marks: r.get(6)?,
        keywords: db::json_list(r.get(7)?),
        difficulty: Difficulty::parse(&difficulty).unwrap_or(Difficulty::Medium),
        explanation: r.get(9)?,
        created_by: r.get(10)?,
        approved_by: r.get(11)?,
        status: QuestionStatus::parse(&status),
        rejection_reason: r.get(13)?,
        created_at: r.get(14)?,
        updated_at: r.get(15)?,
    })
}

pub fn list(conn: &Connection, query: &QuestionQuery) -> AppResult<Vec<Question>> {
    let mut sql = format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE 1 = 1");
    let mut args: Vec<String> = Vec::new();
    if let Some(s) = query.subject.as_deref().filter(|s| !s.is_empty()) {
        args.push(s.to_string());
        sql.push_str(&format!(" AND subject = ?{}", args.len()));
    }
    if let Some(st) = query.status {
        args.push(st.as_str().to_string());
        sql.push_str(&format!(" AND status = ?{}", args.len()));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), question_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get(conn: &Connection, id: &str) -> AppResult<Question> {
    conn.query_row(
        &format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE id = ?"),
        [id],
        question_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("question", id))
}

fn trimmed_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Normalises and checks a question body before it is stored.
fn validate(q: &mut Question) -> AppResult<()> {
    q.subject = q.subject.trim().to_string();
    q.question_text = q.question_text.trim().to_string();
    q.correct_answer = q.correct_answer.trim().to_string();
    if q.subject.is_empty() {
        return Err(AppError::validation("subject is required"));
    }
    if q.question_text.is_empty() {
        return Err(AppError::validation("question text is required"));
    }
    if q.correct_answer.is_empty() {
        return Err(AppError::validation("correct answer is required"));
    }
    if !q.marks.is_finite() || q.marks <= 0.0 {
        return Err(AppError::validation("marks must be greater than zero"));
    }
    match q.question_type {
        QuestionType::Mcq => {
            if q.options.len() < 2 {
                return Err(AppError::validation(
                    "multiple choice questions need at least two options",
                ));
            }
        }
        QuestionType::TrueFalse => {
            let a = q.correct_answer.to_ascii_lowercase();
            if a != "true" && a != "false" {
                return Err(AppError::validation(
                    "true/false questions must have True or False as the answer",
                ));
            }
            q.options.clear();
        }
        QuestionType::ShortAnswer => q.options.clear(),
    }
    Ok(())
}

fn parse_type(raw: &str) -> AppResult<QuestionType> {
    QuestionType::parse(raw)
        .ok_or_else(|| AppError::validation(format!("unknown question type: {raw}")))
}

fn parse_difficulty(raw: Option<&str>) -> AppResult<Difficulty> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(Difficulty::Medium),
        Some(d) => Difficulty::parse(d)
            .ok_or_else(|| AppError::validation(format!("unknown difficulty: {d}"))),
    }
}

fn write(conn: &Connection, q: &Question) -> AppResult<()> {
    conn.execute(
        "INSERT INTO questions(id, subject, question_text, question_type, options_json,
           correct_answer, marks, keywords_json, difficulty, explanation, created_by, approved_by,
           status, rejection_reason, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           subject = excluded.subject,
           question_text = excluded.question_text,
           question_type = excluded.question_type,
           options_json = excluded.options_json,
           correct_answer = excluded.correct_answer,
           marks = excluded.marks,
           keywords_json = excluded.keywords_json,
           difficulty = excluded.difficulty,
           explanation = excluded.explanation,
           approved_by = excluded.approved_by,
           status = excluded.status,
           rejection_reason = excluded.rejection_reason,
           updated_at = excluded.updated_at",
        (
            &q.id,
            &q.subject,
            &q.question_text,
            q.question_type.as_str(),
            json_or_null(&q.options),
            &q.correct_answer,
            q.marks,
            json_or_null(&q.keywords),
            q.difficulty.as_str(),
            &q.explanation,
            &q.created_by,
            &q.approved_by,
            q.status.as_str(),
            &q.rejection_reason,
            &q.created_at,
            &q.updated_at,
        ),
    )?;
    Ok(())
}

fn json_or_null(items: &[String]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        serde_json::to_string(items).ok()
    }
}

pub fn create(conn: &Connection, actor: &Actor, input: NewQuestion) -> AppResult<Question> {
    let now = db::now_timestamp();
    let mut q = Question {
        id: db::new_id(),
        subject: input.subject,
        question_text: input.question_text,
        question_type: parse_type(&input.question_type)?,
        options: trimmed_list(input.options),
        correct_answer: input.correct_answer,
        marks: input.marks.unwrap_or(1.0),
        keywords: trimmed_list(input.keywords),
        difficulty: parse_difficulty(input.difficulty.as_deref())?,
        explanation: input.explanation.filter(|s| !s.trim().is_empty()),
        created_by: actor.user_id.clone(),
        approved_by: None,
        status: QuestionStatus::Pending,
        rejection_reason: None,
        created_at: now.clone(),
        updated_at: now,
    };
    validate(&mut q)?;
    write(conn, &q)?;
    tracing::info!(question_id = %q.id, subject = %q.subject, "question submitted");
    Ok(q)
}

pub fn update(conn: &Connection, actor: &Actor, id: &str, patch: QuestionPatch) -> AppResult<Question> {
    let mut q = get(conn, id)?;
    if !q.can_edit(actor) {
        return Err(AppError::forbidden(
            "only administrators or the author of a pending question can edit it",
        ));
    }
    if let Some(v) = patch.subject {
        q.subject = v;
    }
    if let Some(v) = patch.question_text {
        q.question_text = v;
    }
    if let Some(v) = patch.question_type {
        q.question_type = parse_type(&v)?;
    }
    if let Some(v) = patch.options {
        q.options = trimmed_list(v);
    }
    if let Some(v) = patch.correct_answer {
        q.correct_answer = v;
    }
    if let Some(v) = patch.marks {
        q.marks = v;
    }
    if let Some(v) = patch.keywords {
        q.keywords = trimmed_list(v);
    }
    if patch.difficulty.is_some() {
        q.difficulty = parse_difficulty(patch.difficulty.as_deref())?;
    }
    if patch.explanation.is_some() {
        q.explanation = patch.explanation.filter(|s| !s.trim().is_empty());
    }
    validate(&mut q)?;
    q.updated_at = db::now_timestamp();
    write(conn, &q)?;
    Ok(q)
}

pub fn approve(conn: &Connection, actor: &Actor, id: &str) -> AppResult<Question> {
    let mut q = get(conn, id)?;
    if !q.can_review(actor) {
        return Err(AppError::forbidden(
            "only administrators or teachers of this subject can review it",
        ));
    }
    q.status = QuestionStatus::Approved;
    q.approved_by = actor.user_id.clone();
    q.rejection_reason = None;
    q.updated_at = db::now_timestamp();
    write(conn, &q)?;
    tracing::info!(question_id = id, "question approved");
    Ok(q)
}

pub fn reject(conn: &Connection, actor: &Actor, id: &str, reason: Option<String>) -> AppResult<Question> {
    let mut q = get(conn, id)?;
    if !q.can_review(actor) {
        return Err(AppError::forbidden(
            "only administrators or teachers of this subject can review it",
        ));
    }
    q.status = QuestionStatus::Rejected;
    q.approved_by = None;
    q.rejection_reason = reason.filter(|s| !s.trim().is_empty());
    q.updated_at = db::now_timestamp();
    write(conn, &q)?;
    tracing::info!(question_id = id, "question rejected");
    Ok(q)
}

pub fn delete(conn: &Connection, actor: &Actor, id: &str) -> AppResult<()> {
    let q = get(conn, id)?;
    if !q.can_edit(actor) {
        return Err(AppError::forbidden(
            "only administrators or the author of a pending question can delete it",
        ));
    }
    conn.execute("DELETE FROM questions WHERE id = ?", [id])?;
    Ok(())
}
