use crate::calc::Category;
use crate::config::GradingConfig;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::students;
use crate::users::{Actor, Role};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const TERM_SETTINGS_KEY: &str = "term.current";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TermSettings {
    pub current_term: String,
    pub current_academic_year: String,
    pub current_session: String,
    pub assessment_active: bool,
}

impl Default for TermSettings {
    fn default() -> Self {
        Self {
            current_term: "term1".to_string(),
            current_academic_year: "2024-2025".to_string(),
            current_session: "First Term".to_string(),
            assessment_active: true,
        }
    }
}

impl TermSettings {
    pub fn load(conn: &Connection) -> AppResult<Self> {
        let saved = db::settings_get_json(conn, TERM_SETTINGS_KEY)?;
        Ok(saved
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    pub fn save(&self, conn: &Connection) -> AppResult<()> {
        let value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        db::settings_set_json(conn, TERM_SETTINGS_KEY, &value)?;
        Ok(())
    }

    /// `term1 2024-2025`, as printed in the report-card header.
    pub fn term_year(&self) -> String {
        format!("{} {}", self.current_term, self.current_academic_year)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermSettingsPatch {
    pub current_term: Option<String>,
    pub current_academic_year: Option<String>,
    pub current_session: Option<String>,
    pub assessment_active: Option<bool>,
}

pub fn update_term_settings(
    conn: &Connection,
    actor: &Actor,
    patch: TermSettingsPatch,
) -> AppResult<TermSettings> {
    actor.require_admin("change settings")?;
    let mut s = TermSettings::load(conn)?;
    let non_empty = |v: String, field: &str| -> AppResult<String> {
        let v = v.trim().to_string();
        if v.is_empty() {
            return Err(AppError::validation(format!("{field} must not be empty")));
        }
        Ok(v)
    };
    if let Some(v) = patch.current_term {
        s.current_term = non_empty(v, "currentTerm")?;
    }
    if let Some(v) = patch.current_academic_year {
        s.current_academic_year = non_empty(v, "currentAcademicYear")?;
    }
    if let Some(v) = patch.current_session {
        s.current_session = non_empty(v, "currentSession")?;
    }
    if let Some(v) = patch.assessment_active {
        s.assessment_active = v;
    }
    s.save(conn)?;
    tracing::info!(term = %s.current_term, year = %s.current_academic_year, "term settings updated");
    Ok(s)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub id: String,
    pub student_id: String,
    pub student_number: String,
    pub student_name: String,
    pub category: Category,
    pub subject: String,
    pub class_name: Option<String>,
    pub term: Option<String>,
    pub academic_year: Option<String>,
    pub session: Option<String>,
    pub score: f64,
    pub max_score: f64,
    pub assessor: Option<String>,
    pub teacher_id: Option<String>,
    pub teacher_username: Option<String>,
    pub comments: Option<String>,
    pub date_recorded: String,
    pub archived: bool,
}

impl Assessment {
    /// Raw score; categories are not rescaled by their maximum.
    pub fn percentage(&self) -> f64 {
        self.score
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAssessment {
    pub student_id: String,
    pub category: String,
    pub subject: String,
    pub score: f64,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub academic_year: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub assessor: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentPatch {
    pub category: Option<String>,
    pub subject: Option<String>,
    pub score: Option<f64>,
    pub class_name: Option<String>,
    pub term: Option<String>,
    pub academic_year: Option<String>,
    pub session: Option<String>,
    pub assessor: Option<String>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentQuery {
    pub student_id: Option<String>,
    pub subject: Option<String>,
    pub class_name: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentPage {
    pub assessments: Vec<Assessment>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

const ASSESSMENT_SELECT: &str = "SELECT a.id, a.student_id, s.student_number, s.first_name,
       s.middle_name, s.last_name, a.category, a.subject, a.class_name, a.term,
       a.academic_year, a.session, a.score, a.max_score, a.assessor, a.teacher_id,
       u.username, a.comments, a.date_recorded, a.archived
     FROM assessments a
     JOIN students s ON s.id = a.student_id
     LEFT JOIN users u ON u.id = a.teacher_id";

fn assessment_from_row(r: &Row<'_>) -> rusqlite::Result<Assessment> {
    let first: String = r.get(3)?;
    let middle: Option<String> = r.get(4)?;
    let last: String = r.get(5)?;
    let category: String = r.get(6)?;
    let category = Category::parse(&category).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown category '{category}'").into(),
        )
    })?;
    let student_name = [Some(first), middle, Some(last)]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Ok(Assessment {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_number: r.get(2)?,
        student_name,
        category,
        subject: r.get(7)?,
        class_name: r.get(8)?,
        term: r.get(9)?,
        academic_year: r.get(10)?,
        session: r.get(11)?,
        score: r.get(12)?,
        max_score: r.get(13)?,
        assessor: r.get(14)?,
        teacher_id: r.get(15)?,
        teacher_username: r.get(16)?,
        comments: r.get(17)?,
        date_recorded: r.get(18)?,
        archived: r.get::<_, i64>(19)? != 0,
    })
}

pub fn get(conn: &Connection, id: &str) -> AppResult<Assessment> {
    conn.query_row(
        &format!("{ASSESSMENT_SELECT} WHERE a.id = ?"),
        [id],
        assessment_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("assessment", id))
}

/// Filtered, newest first. Teachers only ever see records they own.
pub fn list(
    conn: &Connection,
    actor: &Actor,
    query: &AssessmentQuery,
    default_per_page: usize,
) -> AppResult<AssessmentPage> {
    let per_page = query.per_page.unwrap_or(default_per_page).max(1);
    let page = query.page.unwrap_or(1).max(1);

    let mut clauses = vec![format!("a.archived = {}", i64::from(query.archived))];
    let mut args: Vec<String> = Vec::new();
    let mut push = |clause: &str, value: String| {
        args.push(value);
        clauses.push(format!("{clause} = ?{}", args.len()));
    };
    if actor.role == Role::Teacher {
        push("a.teacher_id", actor.user_id.clone().unwrap_or_default());
    }
    if let Some(v) = query.student_id.clone().filter(|v| !v.is_empty()) {
        push("a.student_id", v);
    }
    if let Some(v) = query.subject.clone().filter(|v| !v.is_empty()) {
        push("a.subject", v);
    }
    if let Some(v) = query.class_name.clone().filter(|v| !v.is_empty()) {
        push("a.class_name", v);
    }
    if let Some(v) = query.category.clone().filter(|v| !v.is_empty()) {
        push("a.category", v);
    }
    let where_sql = clauses.join(" AND ");

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM assessments a WHERE {where_sql}"),
        rusqlite::params_from_iter(args.iter()),
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(&format!(
        "{ASSESSMENT_SELECT} WHERE {where_sql}
         ORDER BY a.date_recorded DESC, a.rowid DESC
         LIMIT {per_page} OFFSET {}",
        (page - 1) * per_page
    ))?;
    let assessments = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), assessment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AssessmentPage {
        assessments,
        total: total as usize,
        page,
        per_page,
    })
}

/// Non-archived records matching the export filters, newest first.
pub fn list_for_export(
    conn: &Connection,
    subject: Option<&str>,
    class_name: Option<&str>,
    category: Option<&str>,
    student_id: Option<&str>,
) -> AppResult<Vec<Assessment>> {
    let mut sql = format!("{ASSESSMENT_SELECT} WHERE a.archived = 0");
    let mut args: Vec<String> = Vec::new();
    for (column, value) in [
        ("a.subject", subject),
        ("a.class_name", class_name),
        ("a.category", category),
        ("a.student_id", student_id),
    ] {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            args.push(v.to_string());
            sql.push_str(&format!(" AND {column} = ?{}", args.len()));
        }
    }
    sql.push_str(" ORDER BY a.date_recorded DESC, a.rowid DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), assessment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_category(raw: &str) -> AppResult<Category> {
    Category::parse(raw).ok_or_else(|| {
        AppError::validation_with(
            format!("unknown category: {raw}"),
            json!({ "allowed": Category::ALL.iter().map(|c| c.code()).collect::<Vec<_>>() }),
        )
    })
}

/// Score must be a finite, non-negative number no larger than the category
/// maximum. Returns that maximum.
pub fn check_score(cfg: &GradingConfig, category: Category, score: f64) -> AppResult<f64> {
    let max = cfg.max_score(category);
    if !score.is_finite() || score < 0.0 {
        return Err(AppError::validation("score must be a non-negative number"));
    }
    if score > max {
        return Err(AppError::validation_with(
            format!("Score cannot exceed max score of {max}"),
            json!({ "maxScore": max, "category": category.code() }),
        ));
    }
    Ok(max)
}

/// Natural key: student, category, subject, term, academic year, session.
pub struct DuplicateKey<'a> {
    pub student_id: &'a str,
    pub category: Category,
    pub subject: &'a str,
    pub term: Option<&'a str>,
    pub academic_year: Option<&'a str>,
    pub session: Option<&'a str>,
}

pub fn find_duplicate(conn: &Connection, key: &DuplicateKey<'_>, except: Option<&str>) -> AppResult<Option<String>> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM assessments
             WHERE student_id = ? AND category = ? AND subject = ?
               AND term IS ? AND academic_year IS ? AND session IS ?
               AND id IS NOT ?
             LIMIT 1",
            (
                key.student_id,
                key.category.code(),
                key.subject,
                key.term,
                key.academic_year,
                key.session,
                except,
            ),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found)
}

fn duplicate_error(category: Category, subject: &str) -> AppError {
    AppError::validation(format!(
        "An assessment for {category} in {subject} already exists for this student in the same term, academic year, and session"
    ))
}

fn clean(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn create(
    conn: &Connection,
    cfg: &GradingConfig,
    actor: &Actor,
    input: NewAssessment,
) -> AppResult<Assessment> {
    let student = students::get(conn, &input.student_id)?;
    let category = parse_category(&input.category)?;
    let subject = input.subject.trim().to_string();
    if subject.is_empty() {
        return Err(AppError::validation("subject is required"));
    }
    let max_score = check_score(cfg, category, input.score)?;

    let term = TermSettings::load(conn)?;
    let term_code = clean(input.term).unwrap_or(term.current_term);
    let academic_year = clean(input.academic_year).unwrap_or(term.current_academic_year);
    let session = clean(input.session).unwrap_or(term.current_session);

    let key = DuplicateKey {
        student_id: &student.id,
        category,
        subject: &subject,
        term: Some(&term_code),
        academic_year: Some(&academic_year),
        session: Some(&session),
    };
    if find_duplicate(conn, &key, None)?.is_some() {
        return Err(duplicate_error(category, &subject));
    }

    let teacher_id = match actor.role {
        Role::Teacher => actor.user_id.clone(),
        Role::Admin => None,
    };
    let id = db::new_id();
    conn.execute(
        "INSERT INTO assessments(id, student_id, category, subject, class_name, term, academic_year,
           session, score, max_score, assessor, teacher_id, comments, date_recorded, archived)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        (
            &id,
            &student.id,
            category.code(),
            &subject,
            clean(input.class_name).or(student.class_name.clone()),
            &term_code,
            &academic_year,
            &session,
            input.score,
            max_score,
            clean(input.assessor).or(actor.username.clone()),
            &teacher_id,
            clean(input.comments),
            db::now_timestamp(),
        ),
    )?;
    tracing::info!(
        assessment_id = %id,
        student_id = %student.id,
        category = category.code(),
        score = input.score,
        "assessment recorded"
    );
    get(conn, &id)
}

pub fn update(
    conn: &Connection,
    cfg: &GradingConfig,
    actor: &Actor,
    id: &str,
    patch: AssessmentPatch,
) -> AppResult<Assessment> {
    let mut a = get(conn, id)?;
    actor.require_owner_or_admin(a.teacher_id.as_deref(), "edit")?;

    if let Some(c) = patch.category {
        a.category = parse_category(&c)?;
    }
    if let Some(s) = patch.subject {
        let s = s.trim().to_string();
        if s.is_empty() {
            return Err(AppError::validation("subject is required"));
        }
        a.subject = s;
    }
    if let Some(score) = patch.score {
        a.score = score;
    }
    a.max_score = check_score(cfg, a.category, a.score)?;
    if patch.class_name.is_some() {
        a.class_name = clean(patch.class_name);
    }
    if patch.term.is_some() {
        a.term = clean(patch.term);
    }
    if patch.academic_year.is_some() {
        a.academic_year = clean(patch.academic_year);
    }
    if patch.session.is_some() {
        a.session = clean(patch.session);
    }
    if patch.assessor.is_some() {
        a.assessor = clean(patch.assessor);
    }
    if patch.comments.is_some() {
        a.comments = clean(patch.comments);
    }

    let key = DuplicateKey {
        student_id: &a.student_id,
        category: a.category,
        subject: &a.subject,
        term: a.term.as_deref(),
        academic_year: a.academic_year.as_deref(),
        session: a.session.as_deref(),
    };
    if find_duplicate(conn, &key, Some(id))?.is_some() {
        return Err(duplicate_error(a.category, &a.subject));
    }

    conn.execute(
        "UPDATE assessments SET category = ?, subject = ?, class_name = ?, term = ?,
           academic_year = ?, session = ?, score = ?, max_score = ?, assessor = ?, comments = ?
         WHERE id = ?",
        (
            a.category.code(),
            &a.subject,
            &a.class_name,
            &a.term,
            &a.academic_year,
            &a.session,
            a.score,
            a.max_score,
            &a.assessor,
            &a.comments,
            id,
        ),
    )?;
    tracing::debug!(assessment_id = id, "assessment updated");
    get(conn, id)
}

pub fn delete(conn: &Connection, actor: &Actor, id: &str) -> AppResult<()> {
    let a = get(conn, id)?;
    actor.require_owner_or_admin(a.teacher_id.as_deref(), "delete")?;
    conn.execute("DELETE FROM assessments WHERE id = ?", [id])?;
    tracing::info!(assessment_id = id, "assessment deleted");
    Ok(())
}

pub fn set_archived(conn: &Connection, actor: &Actor, id: &str, archived: bool) -> AppResult<Assessment> {
    let a = get(conn, id)?;
    let action = if archived { "archive" } else { "unarchive" };
    actor.require_owner_or_admin(a.teacher_id.as_deref(), action)?;
    conn.execute(
        "UPDATE assessments SET archived = ? WHERE id = ?",
        (i64::from(archived), id),
    )?;
    get(conn, id)
}

/// Archives every live record from a term or academic year other than the
/// current one. Records with no term or year count as another term.
pub fn archive_previous_terms(conn: &Connection, actor: &Actor) -> AppResult<usize> {
    actor.require_admin("archive a term")?;
    let term = TermSettings::load(conn)?;
    let n = conn.execute(
        "UPDATE assessments SET archived = 1
         WHERE archived = 0 AND (term IS NOT ? OR academic_year IS NOT ?)",
        (&term.current_term, &term.current_academic_year),
    )?;
    tracing::info!(archived = n, term = %term.current_term, "previous terms archived");
    Ok(n)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::students::tests::new_student;
    use crate::users::{self, NewUser};

    pub(crate) fn record(student_id: &str, category: &str, subject: &str, score: f64) -> NewAssessment {
        NewAssessment {
            student_id: student_id.to_string(),
            category: category.to_string(),
            subject: subject.to_string(),
            score,
            ..NewAssessment::default()
        }
    }

    fn setup() -> (Connection, GradingConfig, String) {
        let conn = db::open_memory();
        let s = students::create(&conn, &Actor::local_admin(), new_student("S1", "Ama", "Mensah"))
            .expect("student");
        (conn, GradingConfig::standard(), s.id)
    }

    fn teacher_actor(conn: &Connection, name: &str) -> Actor {
        let u = users::create(
            conn,
            &Actor::local_admin(),
            NewUser {
                username: name.to_string(),
                role: Role::Teacher,
                subject: Some("Mathematics".into()),
                classes: vec![],
            },
        )
        .expect("teacher");
        Actor::resolve(conn, Some(&u.id), None).expect("actor")
    }

    #[test]
    fn create_applies_defaults_and_category_max() {
        let (conn, cfg, sid) = setup();
        let t = teacher_actor(&conn, "kofi");
        let a = create(&conn, &cfg, &t, record(&sid, "ICA1", "Mathematics", 42.0)).expect("create");
        assert_eq!(a.category, Category::Ica1);
        assert_eq!(a.max_score, 50.0);
        assert_eq!(a.term.as_deref(), Some("term1"));
        assert_eq!(a.academic_year.as_deref(), Some("2024-2025"));
        assert_eq!(a.session.as_deref(), Some("First Term"));
        assert_eq!(a.class_name.as_deref(), Some("2A"));
        assert_eq!(a.assessor.as_deref(), Some("kofi"));
        assert_eq!(a.teacher_id, t.user_id);
        assert_eq!(a.student_name, "Ama Mensah");
    }

    #[test]
    fn score_above_category_max_is_rejected() {
        let (conn, cfg, sid) = setup();
        let admin = Actor::local_admin();
        let e = create(&conn, &cfg, &admin, record(&sid, "gp2", "Maths", 50.5)).expect_err("too high");
        assert_eq!(e.code(), "bad_params");
        assert!(create(&conn, &cfg, &admin, record(&sid, "gp2", "Maths", -1.0)).is_err());
        assert!(create(&conn, &cfg, &admin, record(&sid, "end_term", "Maths", 100.0)).is_ok());
        assert!(create(&conn, &cfg, &admin, record(&sid, "quiz", "Maths", 1.0)).is_err());
    }

    #[test]
    fn duplicate_natural_key_is_rejected() {
        let (conn, cfg, sid) = setup();
        let admin = Actor::local_admin();
        create(&conn, &cfg, &admin, record(&sid, "ica1", "Maths", 10.0)).expect("first");
        let e = create(&conn, &cfg, &admin, record(&sid, "ica1", "Maths", 12.0)).expect_err("dup");
        assert!(e.to_string().contains("already exists"));

        let mut other_session = record(&sid, "ica1", "Maths", 12.0);
        other_session.session = Some("Second Term".into());
        create(&conn, &cfg, &admin, other_session).expect("different session");
    }

    #[test]
    fn teachers_only_touch_their_own_records() {
        let (conn, cfg, sid) = setup();
        let kofi = teacher_actor(&conn, "kofi");
        let esi = teacher_actor(&conn, "esi");
        let a = create(&conn, &cfg, &kofi, record(&sid, "ica1", "Maths", 10.0)).expect("create");
        create(&conn, &cfg, &Actor::local_admin(), record(&sid, "ica2", "Maths", 10.0)).expect("admin");

        assert_eq!(
            update(&conn, &cfg, &esi, &a.id, AssessmentPatch::default())
                .expect_err("not owner")
                .code(),
            "forbidden"
        );
        assert!(delete(&conn, &esi, &a.id).is_err());
        assert!(set_archived(&conn, &esi, &a.id, true).is_err());

        let mine = list(&conn, &kofi, &AssessmentQuery::default(), 25).expect("list");
        assert_eq!(mine.total, 1);
        let theirs = list(&conn, &esi, &AssessmentQuery::default(), 25).expect("list");
        assert_eq!(theirs.total, 0);
        let all = list(&conn, &Actor::local_admin(), &AssessmentQuery::default(), 25).expect("list");
        assert_eq!(all.total, 2);

        let patched = update(
            &conn,
            &cfg,
            &kofi,
            &a.id,
            AssessmentPatch {
                category: Some("practical".into()),
                score: Some(80.0),
                ..AssessmentPatch::default()
            },
        )
        .expect("owner update");
        assert_eq!(patched.max_score, 100.0);
    }

    #[test]
    fn archive_term_moves_other_terms_out_of_view() {
        let (conn, cfg, sid) = setup();
        let admin = Actor::local_admin();
        let mut old = record(&sid, "ica1", "Maths", 10.0);
        old.term = Some("term3".into());
        old.academic_year = Some("2023-2024".into());
        create(&conn, &cfg, &admin, old).expect("old");
        create(&conn, &cfg, &admin, record(&sid, "ica2", "Maths", 10.0)).expect("current");

        let teacher = Actor {
            role: Role::Teacher,
            ..Actor::local_admin()
        };
        assert!(archive_previous_terms(&conn, &teacher).is_err());
        assert_eq!(archive_previous_terms(&conn, &admin).expect("archive"), 1);
        assert_eq!(archive_previous_terms(&conn, &admin).expect("again"), 0);

        let live = list(&conn, &admin, &AssessmentQuery::default(), 25).expect("list");
        assert_eq!(live.total, 1);
        let archived = list(
            &conn,
            &admin,
            &AssessmentQuery {
                archived: true,
                ..AssessmentQuery::default()
            },
            25,
        )
        .expect("list archived");
        assert_eq!(archived.assessments[0].term.as_deref(), Some("term3"));
    }

    #[test]
    fn term_settings_default_and_update() {
        let conn = db::open_memory();
        assert_eq!(TermSettings::load(&conn).expect("load"), TermSettings::default());
        let s = update_term_settings(
            &conn,
            &Actor::local_admin(),
            TermSettingsPatch {
                current_term: Some("term2".into()),
                ..TermSettingsPatch::default()
            },
        )
        .expect("update");
        assert_eq!(s.term_year(), "term2 2024-2025");
        assert!(update_term_settings(
            &conn,
            &Actor::local_admin(),
            TermSettingsPatch {
                current_session: Some("  ".into()),
                ..TermSettingsPatch::default()
            },
        )
        .is_err());
    }
}
