use crate::config::{GradeBand, GradingConfig};
use crate::error::{AppError, AppResult};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Ica1,
    Ica2,
    Icp1,
    Icp2,
    Gp1,
    Gp2,
    Practical,
    MidTerm,
    EndTerm,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Ica1,
        Category::Ica2,
        Category::Icp1,
        Category::Icp2,
        Category::Gp1,
        Category::Gp2,
        Category::Practical,
        Category::MidTerm,
        Category::EndTerm,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Category::Ica1 => "ica1",
            Category::Ica2 => "ica2",
            Category::Icp1 => "icp1",
            Category::Icp2 => "icp2",
            Category::Gp1 => "gp1",
            Category::Gp2 => "gp2",
            Category::Practical => "practical",
            Category::MidTerm => "mid_term",
            Category::EndTerm => "end_term",
        }
    }

    pub fn parse(raw: &str) -> Option<Category> {
        let t = raw.trim().to_ascii_lowercase();
        Category::ALL.into_iter().find(|c| c.code() == t)
    }

    /// Everything except the end-of-term exam feeds the class score.
    pub fn is_class_work(self) -> bool {
        self != Category::EndTerm
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LetterGrade {
    A1,
    B2,
    B3,
    C4,
    C5,
    C6,
    D7,
    E8,
    F9,
}

impl fmt::Display for LetterGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LetterGrade::A1 => "A1",
            LetterGrade::B2 => "B2",
            LetterGrade::B3 => "B3",
            LetterGrade::C4 => "C4",
            LetterGrade::C5 => "C5",
            LetterGrade::C6 => "C6",
            LetterGrade::D7 => "D7",
            LetterGrade::E8 => "E8",
            LetterGrade::F9 => "F9",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRecord {
    pub category: Category,
    pub subject: String,
    pub score: f64,
    pub max_score: f64,
    pub teacher_id: Option<String>,
    pub archived: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    pub subject: Option<String>,
    pub teacher_id: Option<String>,
}

impl RecordFilter {
    pub fn matches(&self, r: &AssessmentRecord) -> bool {
        if r.archived {
            return false;
        }
        let subject_ok = self
            .subject
            .as_deref()
            .map(|s| r.subject == s)
            .unwrap_or(true);
        let teacher_ok = self
            .teacher_id
            .as_deref()
            .map(|t| r.teacher_id.as_deref() == Some(t))
            .unwrap_or(true);
        subject_ok && teacher_ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub category: Category,
    pub count: usize,
    pub total_score: f64,
    pub total_max: f64,
    /// Mean raw score per record in the category.
    pub avg_score: f64,
}

/// Groups matching records by category, in canonical category order. Only
/// categories with at least one record are returned.
pub fn summarize<'a, I>(records: I, filter: &RecordFilter) -> Vec<CategorySummary>
where
    I: IntoIterator<Item = &'a AssessmentRecord>,
{
    let mut acc: BTreeMap<Category, (usize, f64, f64)> = BTreeMap::new();
    for r in records.into_iter().filter(|r| filter.matches(r)) {
        let e = acc.entry(r.category).or_insert((0, 0.0, 0.0));
        e.0 += 1;
        e.1 += sanitize(r.score);
        e.2 += sanitize(r.max_score);
    }
    acc.into_iter()
        .map(|(category, (count, total_score, total_max))| CategorySummary {
            category,
            count,
            total_score,
            total_max,
            avg_score: total_score / count as f64,
        })
        .collect()
}

fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalGradeResult {
    pub class_raw_total: f64,
    pub class_total_points: f64,
    pub class_percent: f64,
    pub class_score: f64,
    pub exam_raw_score: f64,
    pub exam_score: f64,
    pub final_percent: f64,
    pub gpa: f64,
    pub letter_grade: LetterGrade,
    pub remark: String,
}

/// A student with no matching records is `NoData`, never a computed zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FinalGrade {
    NoData,
    Computed(FinalGradeResult),
}

impl FinalGrade {
    pub fn result(&self) -> Option<&FinalGradeResult> {
        match self {
            FinalGrade::NoData => None,
            FinalGrade::Computed(r) => Some(r),
        }
    }
}

const FAIL_BAND: GradeBand = GradeBand {
    min_percent: 0.0,
    gpa: 0.0,
    letter: LetterGrade::F9,
    remark: "Fail",
};

pub fn band_for(cfg: &GradingConfig, final_percent: f64) -> &GradeBand {
    cfg.bands
        .iter()
        .find(|b| final_percent >= b.min_percent)
        .or_else(|| cfg.bands.last())
        .unwrap_or(&FAIL_BAND)
}

pub fn aggregate(cfg: &GradingConfig, summaries: &[CategorySummary]) -> FinalGradeResult {
    let class_raw_total: f64 = summaries
        .iter()
        .filter(|s| s.category.is_class_work())
        .map(|s| s.total_score)
        .sum();
    let class_total_points = class_raw_total.min(cfg.class_points_cap);
    // Multiply first so whole-number totals divide exactly.
    let class_percent = class_total_points * 100.0 / cfg.class_points_cap;
    let class_score = cfg
        .rounding
        .apply(class_percent / cfg.class_divisor)
        .min(cfg.class_score_cap);

    let exam_raw_score: f64 = summaries
        .iter()
        .filter(|s| s.category == Category::EndTerm)
        .map(|s| s.total_score)
        .sum();
    let exam_score = cfg
        .rounding
        .apply(exam_raw_score / cfg.exam_divisor)
        .min(cfg.exam_score_cap);

    let final_percent = round_2dp((class_score + exam_score).min(cfg.final_cap)).clamp(0.0, cfg.final_cap);
    let band = band_for(cfg, final_percent);

    FinalGradeResult {
        class_raw_total,
        class_total_points,
        class_percent,
        class_score,
        exam_raw_score,
        exam_score,
        final_percent,
        gpa: band.gpa,
        letter_grade: band.letter,
        remark: band.remark.to_string(),
    }
}

pub fn grade_records(
    cfg: &GradingConfig,
    records: &[AssessmentRecord],
    filter: &RecordFilter,
) -> FinalGrade {
    let summaries = summarize(records, filter);
    if summaries.is_empty() {
        return FinalGrade::NoData;
    }
    FinalGrade::Computed(aggregate(cfg, &summaries))
}

/// Per-category totals in template order, zero where a category has no
/// records. These are the raw inputs written into the report-card sheet.
pub fn template_marks(summaries: &[CategorySummary]) -> BTreeMap<Category, f64> {
    let mut out: BTreeMap<Category, f64> = Category::ALL.into_iter().map(|c| (c, 0.0)).collect();
    for s in summaries {
        out.insert(s.category, s.total_score);
    }
    out
}

/// Indicative letter for a single assessment score, used in flat exports.
pub fn assessment_letter(score: f64) -> &'static str {
    match score {
        s if s >= 90.0 => "A+",
        s if s >= 80.0 => "A",
        s if s >= 75.0 => "B+",
        s if s >= 70.0 => "B",
        s if s >= 65.0 => "C+",
        s if s >= 60.0 => "C",
        s if s >= 55.0 => "D+",
        s if s >= 50.0 => "D",
        _ => "F",
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeReport {
    pub student_id: String,
    pub filters: RecordFilter,
    pub summaries: Vec<CategorySummary>,
    pub final_grade: FinalGrade,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGradeReport {
    pub subject: String,
    pub count: usize,
    pub total_score: f64,
    pub total_max: f64,
    pub final_grade: FinalGrade,
}

pub fn load_student_records(conn: &Connection, student_id: &str) -> AppResult<Vec<AssessmentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT category, subject, score, max_score, teacher_id, archived
         FROM assessments
         WHERE student_id = ?",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, Option<f64>>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (category, subject, score, max_score, teacher_id, archived) in rows {
        // Rows with a category outside the fixed nine never contribute.
        let Some(category) = Category::parse(&category) else {
            tracing::debug!(student_id, category, "skipping record with unknown category");
            continue;
        };
        out.push(AssessmentRecord {
            category,
            subject,
            score: score.unwrap_or(0.0),
            max_score: max_score.unwrap_or(0.0),
            teacher_id,
            archived: archived != 0,
        });
    }
    Ok(out)
}

pub fn student_report(
    conn: &Connection,
    cfg: &GradingConfig,
    student_id: &str,
    filters: RecordFilter,
) -> AppResult<StudentGradeReport> {
    ensure_student(conn, student_id)?;
    let records = load_student_records(conn, student_id)?;
    let summaries = summarize(&records, &filters);
    let final_grade = grade_records(cfg, &records, &filters);
    Ok(StudentGradeReport {
        student_id: student_id.to_string(),
        filters,
        summaries,
        final_grade,
    })
}

pub fn subject_reports(
    conn: &Connection,
    cfg: &GradingConfig,
    student_id: &str,
    teacher_id: Option<String>,
) -> AppResult<Vec<SubjectGradeReport>> {
    ensure_student(conn, student_id)?;
    let records = load_student_records(conn, student_id)?;
    let mut subjects: Vec<String> = records
        .iter()
        .filter(|r| !r.archived)
        .map(|r| r.subject.clone())
        .collect();
    subjects.sort();
    subjects.dedup();

    let mut out = Vec::new();
    for subject in subjects {
        let filter = RecordFilter {
            subject: Some(subject.clone()),
            teacher_id: teacher_id.clone(),
        };
        let summaries = summarize(&records, &filter);
        if summaries.is_empty() {
            continue;
        }
        out.push(SubjectGradeReport {
            subject,
            count: summaries.iter().map(|s| s.count).sum(),
            total_score: summaries.iter().map(|s| s.total_score).sum(),
            total_max: summaries.iter().map(|s| s.total_max).sum(),
            final_grade: FinalGrade::Computed(aggregate(cfg, &summaries)),
        });
    }
    Ok(out)
}

fn ensure_student(conn: &Connection, student_id: &str) -> AppResult<()> {
    let exists: Option<i64> = rusqlite::OptionalExtension::optional(conn.query_row(
        "SELECT 1 FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    ))?;
    if exists.is_none() {
        return Err(AppError::not_found("student", student_id));
    }
    Ok(())
}
