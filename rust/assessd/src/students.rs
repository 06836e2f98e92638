use crate::db;
use crate::error::{AppError, AppResult};
use crate::users::Actor;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

pub const SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    pub middle_name: Option<String>,
    pub class_name: Option<String>,
    pub reference_number: Option<String>,
    pub date_of_birth: Option<String>,
    pub study_area: Option<String>,
    pub created_at: String,
}

impl Student {
    /// `First [Middle] Last`
    pub fn full_name(&self) -> String {
        join_names([
            Some(self.first_name.as_str()),
            self.middle_name.as_deref(),
            Some(self.last_name.as_str()),
        ])
    }

    /// `Last First [Middle]`, the order the report-card sheet expects.
    pub fn template_name(&self) -> String {
        join_names([
            Some(self.last_name.as_str()),
            Some(self.first_name.as_str()),
            self.middle_name.as_deref(),
        ])
    }

    /// Reference number when one was issued, otherwise the student number.
    pub fn ref_id(&self) -> &str {
        self.reference_number
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.student_number)
    }
}

fn join_names<'a>(parts: [Option<&'a str>; 3]) -> String {
    parts
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub student_number: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub study_area: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPatch {
    pub student_number: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub middle_name: Option<String>,
    pub class_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub study_area: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentQuery {
    pub class_name: Option<String>,
    pub search: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPage {
    pub students: Vec<Student>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

const STUDENT_COLUMNS: &str = "id, student_number, first_name, last_name, middle_name, class_name,
     reference_number, date_of_birth, study_area, created_at";

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(0)?,
        student_number: r.get(1)?,
        first_name: r.get(2)?,
        last_name: r.get(3)?,
        middle_name: r.get(4)?,
        class_name: r.get(5)?,
        reference_number: r.get(6)?,
        date_of_birth: r.get(7)?,
        study_area: r.get(8)?,
        created_at: r.get(9)?,
    })
}

fn like_pattern(term: &str) -> String {
    format!("%{}%", term.trim().to_lowercase())
}

const SEARCH_CLAUSE: &str = "(lower(student_number) LIKE ?1 OR lower(first_name) LIKE ?1
     OR lower(last_name) LIKE ?1 OR lower(coalesce(reference_number, '')) LIKE ?1)";

pub fn list(conn: &Connection, query: &StudentQuery, default_per_page: usize) -> AppResult<StudentPage> {
    let per_page = query.per_page.unwrap_or(default_per_page).max(1);
    let page = query.page.unwrap_or(1).max(1);

    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(term) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
        args.push(like_pattern(term));
        clauses.push(SEARCH_CLAUSE.replace("?1", &format!("?{}", args.len())));
    }
    if let Some(class_name) = query.class_name.as_deref().filter(|s| !s.is_empty()) {
        args.push(class_name.to_string());
        clauses.push(format!("class_name = ?{}", args.len()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM students {where_sql}"),
        rusqlite::params_from_iter(args.iter()),
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {STUDENT_COLUMNS} FROM students {where_sql}
         ORDER BY last_name, first_name
         LIMIT {per_page} OFFSET {}",
        (page - 1) * per_page
    ))?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StudentPage {
        students,
        total: total as usize,
        page,
        per_page,
    })
}

/// Quick lookup for pickers: at most [`SEARCH_LIMIT`] matches.
pub fn search(conn: &Connection, term: &str) -> AppResult<Vec<Student>> {
    if term.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT {STUDENT_COLUMNS} FROM students WHERE {SEARCH_CLAUSE}
         ORDER BY last_name, first_name LIMIT {SEARCH_LIMIT}"
    ))?;
    let students = stmt
        .query_map([like_pattern(term)], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

pub fn get(conn: &Connection, id: &str) -> AppResult<Student> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?"),
        [id],
        student_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("student", id))
}

pub fn find_by_number(conn: &Connection, student_number: &str) -> AppResult<Option<Student>> {
    let s = conn
        .query_row(
            &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE student_number = ?"),
            [student_number.trim()],
            student_from_row,
        )
        .optional()?;
    Ok(s)
}

pub fn list_by_class(conn: &Connection, class_name: Option<&str>, subject: Option<&str>) -> AppResult<Vec<Student>> {
    let mut sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE 1 = 1");
    let mut args: Vec<String> = Vec::new();
    if let Some(c) = class_name {
        args.push(c.to_string());
        sql.push_str(&format!(" AND class_name = ?{}", args.len()));
    }
    if let Some(s) = subject {
        args.push(s.to_string());
        sql.push_str(&format!(
            " AND id IN (SELECT student_id FROM assessments WHERE subject = ?{})",
            args.len()
        ));
    }
    sql.push_str(" ORDER BY last_name, first_name");
    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

fn required(value: &str, field: &str) -> AppResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(AppError::validation(format!("{field} is required")));
    }
    Ok(v.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn number_taken(conn: &Connection, number: &str, except: Option<&str>) -> AppResult<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE student_number = ?",
            [number],
            |r| r.get(0),
        )
        .optional()?;
    Ok(matches!(found, Some(id) if Some(id.as_str()) != except))
}

/// `STU` followed by six digits, retried until unused.
fn generate_reference_number(conn: &Connection) -> AppResult<String> {
    let mut rng = rand::thread_rng();
    loop {
        let n: u32 = rng.gen_range(100_000..1_000_000);
        let candidate = format!("STU{n}");
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students WHERE reference_number = ?",
                [&candidate],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(candidate);
        }
    }
}

pub fn create(conn: &Connection, actor: &Actor, input: NewStudent) -> AppResult<Student> {
    // Both roles may add students; the actor is only logged.
    let student_number = required(&input.student_number, "student number")?;
    let first_name = required(&input.first_name, "first name")?;
    let last_name = required(&input.last_name, "last name")?;
    if number_taken(conn, &student_number, None)? {
        return Err(AppError::validation(format!(
            "Student {student_number} already exists"
        )));
    }

    let student = Student {
        id: db::new_id(),
        student_number,
        first_name,
        last_name,
        middle_name: optional(input.middle_name),
        class_name: optional(input.class_name),
        reference_number: Some(generate_reference_number(conn)?),
        date_of_birth: optional(input.date_of_birth),
        study_area: optional(input.study_area),
        created_at: db::now_timestamp(),
    };
    conn.execute(
        "INSERT INTO students(id, student_number, first_name, last_name, middle_name, class_name,
           reference_number, date_of_birth, study_area, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.student_number,
            &student.first_name,
            &student.last_name,
            &student.middle_name,
            &student.class_name,
            &student.reference_number,
            &student.date_of_birth,
            &student.study_area,
            &student.created_at,
        ),
    )?;
    tracing::info!(
        student_id = %student.id,
        student_number = %student.student_number,
        actor = ?actor.user_id,
        "student created"
    );
    Ok(student)
}

pub fn update(conn: &Connection, actor: &Actor, id: &str, patch: StudentPatch) -> AppResult<Student> {
    let mut s = get(conn, id)?;
    if let Some(v) = patch.student_number {
        let v = required(&v, "student number")?;
        if number_taken(conn, &v, Some(id))? {
            return Err(AppError::validation(format!("Student {v} already exists")));
        }
        s.student_number = v;
    }
    if let Some(v) = patch.first_name {
        s.first_name = required(&v, "first name")?;
    }
    if let Some(v) = patch.last_name {
        s.last_name = required(&v, "last name")?;
    }
    if patch.middle_name.is_some() {
        s.middle_name = optional(patch.middle_name);
    }
    if patch.class_name.is_some() {
        s.class_name = optional(patch.class_name);
    }
    if patch.date_of_birth.is_some() {
        s.date_of_birth = optional(patch.date_of_birth);
    }
    if patch.study_area.is_some() {
        s.study_area = optional(patch.study_area);
    }

    conn.execute(
        "UPDATE students SET student_number = ?, first_name = ?, last_name = ?, middle_name = ?,
           class_name = ?, date_of_birth = ?, study_area = ?
         WHERE id = ?",
        (
            &s.student_number,
            &s.first_name,
            &s.last_name,
            &s.middle_name,
            &s.class_name,
            &s.date_of_birth,
            &s.study_area,
            id,
        ),
    )?;
    tracing::debug!(student_id = id, actor = ?actor.user_id, "student updated");
    Ok(s)
}

/// Deletes the student together with their assessments and quiz attempts.
pub fn delete(conn: &Connection, actor: &Actor, id: &str) -> AppResult<()> {
    actor.require_admin("delete students")?;
    get(conn, id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM assessments WHERE student_id = ?", [id])?;
    tx.execute("DELETE FROM quiz_attempts WHERE student_id = ?", [id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [id])?;
    tx.commit()?;
    tracing::info!(student_id = id, "student deleted");
    Ok(())
}
