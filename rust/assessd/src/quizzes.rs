use crate::db;
use crate::error::{AppError, AppResult};
use crate::questions::{self, Question, QuestionStatus};
use crate::students;
use crate::users::Actor;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub description: Option<String>,
    pub question_ids: Vec<String>,
    /// Minutes.
    pub time_limit: Option<i64>,
    pub created_by: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizDetail {
    #[serde(flatten)]
    pub quiz: Quiz,
    pub questions: Vec<Question>,
    pub total_marks: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQuiz {
    pub title: String,
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    pub question_ids: Vec<String>,
    #[serde(default)]
    pub time_limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResult {
    pub question_id: String,
    pub answer: String,
    pub correct: bool,
    pub marks_awarded: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    pub id: String,
    pub student_id: String,
    pub quiz_id: String,
    pub score: f64,
    pub total_questions: i64,
    pub correct_answers: i64,
    pub percentage: f64,
    pub started_at: String,
    pub completed_at: Option<String>,
    /// Seconds.
    pub time_taken: Option<i64>,
    pub status: String,
    pub answers: Vec<AnswerResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptSubmission {
    pub student_id: String,
    pub quiz_id: String,
    /// Answers keyed by question id.
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub time_taken: Option<i64>,
}

const QUIZ_COLUMNS: &str =
    "id, title, subject, description, question_ids_json, time_limit, created_by, is_active, created_at";

fn quiz_from_row(r: &Row<'_>) -> rusqlite::Result<Quiz> {
    Ok(Quiz {
        id: r.get(0)?,
        title: r.get(1)?,
        subject: r.get(2)?,
        description: r.get(3)?,
        question_ids: db::json_list(r.get(4)?),
        time_limit: r.get(5)?,
        created_by: r.get(6)?,
        is_active: r.get::<_, i64>(7)? != 0,
        created_at: r.get(8)?,
    })
}

pub fn list(conn: &Connection, subject: Option<&str>, active_only: bool) -> AppResult<Vec<Quiz>> {
    let mut sql = format!("SELECT {QUIZ_COLUMNS} FROM quizzes WHERE 1 = 1");
    let mut args: Vec<String> = Vec::new();
    if let Some(s) = subject.filter(|s| !s.is_empty()) {
        args.push(s.to_string());
        sql.push_str(&format!(" AND subject = ?{}", args.len()));
    }
    if active_only {
        sql.push_str(" AND is_active = 1");
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), quiz_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn get_quiz(conn: &Connection, id: &str) -> AppResult<Quiz> {
    conn.query_row(
        &format!("SELECT {QUIZ_COLUMNS} FROM quizzes WHERE id = ?"),
        [id],
        quiz_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("quiz", id))
}

/// The quiz with its questions in quiz order. Questions deleted since the
/// quiz was built are skipped.
pub fn get(conn: &Connection, id: &str) -> AppResult<QuizDetail> {
    let quiz = get_quiz(conn, id)?;
    let mut questions = Vec::with_capacity(quiz.question_ids.len());
    for qid in &quiz.question_ids {
        match questions::get(conn, qid) {
            Ok(q) => questions.push(q),
            Err(AppError::NotFound { .. }) => {
                tracing::warn!(quiz_id = id, question_id = %qid, "quiz references a missing question");
            }
            Err(e) => return Err(e),
        }
    }
    let total_marks = questions.iter().map(|q| q.marks).sum();
    Ok(QuizDetail {
        quiz,
        questions,
        total_marks,
    })
}

pub fn create(conn: &Connection, actor: &Actor, input: NewQuiz) -> AppResult<QuizDetail> {
    let title = input.title.trim().to_string();
    let subject = input.subject.trim().to_string();
    if title.is_empty() {
        return Err(AppError::validation("title is required"));
    }
    if subject.is_empty() {
        return Err(AppError::validation("subject is required"));
    }
    if input.question_ids.is_empty() {
        return Err(AppError::validation("a quiz needs at least one question"));
    }
    if matches!(input.time_limit, Some(t) if t <= 0) {
        return Err(AppError::validation("time limit must be positive"));
    }

    let mut ids: Vec<String> = Vec::with_capacity(input.question_ids.len());
    for qid in input.question_ids {
        if ids.contains(&qid) {
            continue;
        }
        let q = questions::get(conn, &qid)?;
        if q.status != QuestionStatus::Approved {
            return Err(AppError::validation_with(
                "only approved questions can be used in a quiz",
                serde_json::json!({ "questionId": qid }),
            ));
        }
        ids.push(qid);
    }

    let id = db::new_id();
    conn.execute(
        "INSERT INTO quizzes(id, title, subject, description, question_ids_json, time_limit,
           created_by, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &title,
            &subject,
            input.description.filter(|s| !s.trim().is_empty()),
            serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string()),
            input.time_limit,
            &actor.user_id,
            db::now_timestamp(),
        ),
    )?;
    tracing::info!(quiz_id = %id, questions = ids.len(), "quiz created");
    get(conn, &id)
}

pub fn delete(conn: &Connection, actor: &Actor, id: &str) -> AppResult<()> {
    let quiz = get_quiz(conn, id)?;
    actor.require_owner_or_admin(quiz.created_by.as_deref(), "delete")?;
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM quiz_attempts WHERE quiz_id = ?", [id])?;
    tx.execute("DELETE FROM quizzes WHERE id = ?", [id])?;
    tx.commit()?;
    Ok(())
}

/// Pure marking of a set of answers against the quiz questions.
pub fn mark_answers(questions: &[Question], answers: &BTreeMap<String, String>) -> Vec<AnswerResult> {
    questions
        .iter()
        .map(|q| {
            let answer = answers.get(&q.id).cloned().unwrap_or_default();
            let correct = q.is_correct(&answer);
            AnswerResult {
                question_id: q.id.clone(),
                answer,
                correct,
                marks_awarded: if correct { q.marks } else { 0.0 },
            }
        })
        .collect()
}

pub fn submit_attempt(conn: &Connection, submission: AttemptSubmission) -> AppResult<QuizAttempt> {
    let student = students::get(conn, &submission.student_id)?;
    let detail = get(conn, &submission.quiz_id)?;
    if !detail.quiz.is_active {
        return Err(AppError::validation("this quiz is not active"));
    }

    let results = mark_answers(&detail.questions, &submission.answers);
    let total_questions = results.len() as i64;
    let correct_answers = results.iter().filter(|r| r.correct).count() as i64;
    let score: f64 = results.iter().map(|r| r.marks_awarded).sum();
    let percentage = if total_questions > 0 {
        correct_answers as f64 / total_questions as f64 * 100.0
    } else {
        0.0
    };
    let now = db::now_timestamp();

    let attempt = QuizAttempt {
        id: db::new_id(),
        student_id: student.id,
        quiz_id: detail.quiz.id,
        score,
        total_questions,
        correct_answers,
        percentage,
        started_at: submission.started_at.unwrap_or_else(|| now.clone()),
        completed_at: Some(now),
        time_taken: submission.time_taken,
        status: "completed".to_string(),
        answers: results,
    };
    conn.execute(
        "INSERT INTO quiz_attempts(id, student_id, quiz_id, score, total_questions, correct_answers,
           started_at, completed_at, time_taken, status, answers_json)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &attempt.id,
            &attempt.student_id,
            &attempt.quiz_id,
            attempt.score,
            attempt.total_questions,
            attempt.correct_answers,
            &attempt.started_at,
            &attempt.completed_at,
            attempt.time_taken,
            &attempt.status,
            serde_json::to_string(&submission.answers).unwrap_or_else(|_| "{}".to_string()),
        ),
    )?;
    tracing::info!(
        attempt_id = %attempt.id,
        quiz_id = %attempt.quiz_id,
        correct = attempt.correct_answers,
        total = attempt.total_questions,
        "quiz attempt recorded"
    );
    Ok(attempt)
}

/// Stored attempts, newest first, optionally narrowed to a quiz or student.
/// Per-answer detail is re-derived from the stored answers.
pub fn attempts(
    conn: &Connection,
    quiz_id: Option<&str>,
    student_id: Option<&str>,
) -> AppResult<Vec<QuizAttempt>> {
    let mut sql = "SELECT id, student_id, quiz_id, score, total_questions, correct_answers,
           started_at, completed_at, time_taken, status, answers_json
         FROM quiz_attempts WHERE 1 = 1"
        .to_string();
    let mut args: Vec<String> = Vec::new();
    for (column, value) in [("quiz_id", quiz_id), ("student_id", student_id)] {
        if let Some(v) = value {
            args.push(v.to_string());
            sql.push_str(&format!(" AND {column} = ?{}", args.len()));
        }
    }
    sql.push_str(" ORDER BY started_at DESC, rowid DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let raw_answers: String = r.get(10)?;
            let total_questions: i64 = r.get(4)?;
            let correct_answers: i64 = r.get(5)?;
            Ok((
                QuizAttempt {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    quiz_id: r.get(2)?,
                    score: r.get(3)?,
                    total_questions,
                    correct_answers,
                    percentage: if total_questions > 0 {
                        correct_answers as f64 / total_questions as f64 * 100.0
                    } else {
                        0.0
                    },
                    started_at: r.get(6)?,
                    completed_at: r.get(7)?,
                    time_taken: r.get(8)?,
                    status: r.get(9)?,
                    answers: Vec::new(),
                },
                raw_answers,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (mut attempt, raw) in rows {
        let answers: BTreeMap<String, String> = serde_json::from_str(&raw).unwrap_or_default();
        if let Ok(detail) = get(conn, &attempt.quiz_id) {
            attempt.answers = mark_answers(&detail.questions, &answers);
        }
        out.push(attempt);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questions::tests::mcq;
    use crate::questions::NewQuestion;
    use crate::students::tests::new_student;

    fn approved(conn: &Connection, input: NewQuestion) -> Question {
        let q = questions::create(conn, &Actor::local_admin(), input).expect("question");
        questions::approve(conn, &Actor::local_admin(), &q.id).expect("approve")
    }

    #[test]
    fn attempt_scores_marks_and_percentage() {
        let conn = db::open_memory();
        let admin = Actor::local_admin();
        let student = students::create(&conn, &admin, new_student("S1", "Ama", "Mensah")).expect("student");
        let q1 = approved(&conn, mcq("Geography"));
        let mut two_marks = mcq("Geography");
        two_marks.marks = Some(2.0);
        two_marks.correct_answer = "B".into();
        let q2 = approved(&conn, two_marks);

        let quiz = create(
            &conn,
            &admin,
            NewQuiz {
                title: "Capitals".into(),
                subject: "Geography".into(),
                question_ids: vec![q1.id.clone(), q2.id.clone(), q1.id.clone()],
                ..NewQuiz::default()
            },
        )
        .expect("quiz");
        assert_eq!(quiz.quiz.question_ids.len(), 2);
        assert_eq!(quiz.total_marks, 3.0);

        let mut answers = BTreeMap::new();
        answers.insert(q1.id.clone(), "a".to_string());
        answers.insert(q2.id.clone(), "C".to_string());
        let attempt = submit_attempt(
            &conn,
            AttemptSubmission {
                student_id: student.id.clone(),
                quiz_id: quiz.quiz.id.clone(),
                answers,
                ..AttemptSubmission::default()
            },
        )
        .expect("attempt");
        assert_eq!(attempt.score, 1.0);
        assert_eq!(attempt.correct_answers, 1);
        assert_eq!(attempt.total_questions, 2);
        assert_eq!(attempt.percentage, 50.0);

        let stored = attempts(&conn, Some(&quiz.quiz.id), None).expect("attempts");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].answers, attempt.answers);
    }

    #[test]
    fn quizzes_only_take_approved_questions() {
        let conn = db::open_memory();
        let pending = questions::create(&conn, &Actor::local_admin(), mcq("Geography")).expect("q");
        let e = create(
            &conn,
            &Actor::local_admin(),
            NewQuiz {
                title: "Draft".into(),
                subject: "Geography".into(),
                question_ids: vec![pending.id],
                ..NewQuiz::default()
            },
        )
        .expect_err("pending question");
        assert_eq!(e.code(), "bad_params");
        assert!(create(
            &conn,
            &Actor::local_admin(),
            NewQuiz {
                title: "Empty".into(),
                subject: "Geography".into(),
                ..NewQuiz::default()
            },
        )
        .is_err());
    }

    #[test]
    fn deleting_a_quiz_removes_its_attempts() {
        let conn = db::open_memory();
        let admin = Actor::local_admin();
        let student = students::create(&conn, &admin, new_student("S1", "A", "B")).expect("student");
        let q = approved(&conn, mcq("Geography"));
        let quiz = create(
            &conn,
            &admin,
            NewQuiz {
                title: "One".into(),
                subject: "Geography".into(),
                question_ids: vec![q.id],
                ..NewQuiz::default()
            },
        )
        .expect("quiz");
        submit_attempt(
            &conn,
            AttemptSubmission {
                student_id: student.id,
                quiz_id: quiz.quiz.id.clone(),
                ..AttemptSubmission::default()
            },
        )
        .expect("attempt");
        delete(&conn, &admin, &quiz.quiz.id).expect("delete");
        assert!(attempts(&conn, None, None).expect("attempts").is_empty());
        assert_eq!(get(&conn, &quiz.quiz.id).expect_err("gone").code(), "not_found");
    }
}
