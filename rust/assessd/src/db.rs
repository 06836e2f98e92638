use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

pub const DB_FILE_NAME: &str = "assessd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema, for unit tests.
#[cfg(test)]
pub fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute("PRAGMA foreign_keys = ON", [])
        .expect("enable foreign keys");
    create_schema(&conn).expect("create schema");
    conn
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            subject TEXT,
            classes_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_number TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            middle_name TEXT,
            class_name TEXT,
            reference_number TEXT UNIQUE,
            date_of_birth TEXT,
            study_area TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            category TEXT NOT NULL,
            subject TEXT NOT NULL,
            class_name TEXT,
            term TEXT,
            academic_year TEXT,
            session TEXT,
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            assessor TEXT,
            teacher_id TEXT,
            comments TEXT,
            date_recorded TEXT NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_student ON assessments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_teacher ON assessments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            question_text TEXT NOT NULL,
            question_type TEXT NOT NULL,
            options_json TEXT,
            correct_answer TEXT NOT NULL,
            marks REAL NOT NULL DEFAULT 1,
            keywords_json TEXT,
            difficulty TEXT NOT NULL DEFAULT 'medium',
            explanation TEXT,
            created_by TEXT,
            approved_by TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            rejection_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_subject ON questions(subject, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quizzes(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            subject TEXT NOT NULL,
            description TEXT,
            question_ids_json TEXT NOT NULL,
            time_limit INTEGER,
            created_by TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_attempts(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            quiz_id TEXT NOT NULL,
            score REAL NOT NULL,
            total_questions INTEGER NOT NULL,
            correct_answers INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            time_taken INTEGER,
            status TEXT NOT NULL,
            answers_json TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_attempts_quiz ON quiz_attempts(quiz_id)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    // A corrupt value reads as unset so defaults apply.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &Value) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}

/// Timestamp format used for every stored date, matching the export columns.
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_round_trip_and_overwrite() {
        let conn = open_memory();
        assert_eq!(settings_get_json(&conn, "term.current").expect("get"), None);
        settings_set_json(&conn, "term.current", &json!({"currentTerm": "term1"})).expect("set");
        settings_set_json(&conn, "term.current", &json!({"currentTerm": "term2"})).expect("set");
        assert_eq!(
            settings_get_json(&conn, "term.current").expect("get"),
            Some(json!({"currentTerm": "term2"}))
        );
    }

    #[test]
    fn open_db_creates_file_and_is_reopenable() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let conn = open_db(dir.path()).expect("open");
            settings_set_json(&conn, "k", &json!(1)).expect("set");
        }
        assert!(dir.path().join(DB_FILE_NAME).is_file());
        let conn = open_db(dir.path()).expect("reopen");
        assert_eq!(settings_get_json(&conn, "k").expect("get"), Some(json!(1)));
    }

    #[test]
    fn json_list_tolerates_garbage() {
        assert_eq!(json_list(Some(r#"["a","b"]"#.into())), vec!["a", "b"]);
        assert!(json_list(Some("not json".into())).is_empty());
        assert!(json_list(None).is_empty());
    }
}
