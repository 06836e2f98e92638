use crate::calc::{Category, LetterGrade};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const WORKSPACE_CONFIG_FILE: &str = "assessd.config.json";
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Rounding applied to the class and exam contributions.
///
/// `HalfAwayFromZero` matches spreadsheet `ROUND(x,0)`; `Up` matches
/// `ROUNDUP(x,0)`. The aggregator and the generated formulas always use the
/// same rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingRule {
    HalfAwayFromZero,
    Up,
}

impl RoundingRule {
    pub fn apply(self, x: f64) -> f64 {
        // Snap away binary noise so exact halves and whole numbers stay exact.
        let x = (x * 1e9).round() / 1e9;
        match self {
            RoundingRule::HalfAwayFromZero => x.round(),
            RoundingRule::Up => {
                if x >= 0.0 {
                    x.ceil()
                } else {
                    x.floor()
                }
            }
        }
    }

    pub fn spreadsheet_fn(self) -> &'static str {
        match self {
            RoundingRule::HalfAwayFromZero => "ROUND",
            RoundingRule::Up => "ROUNDUP",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDef {
    pub category: Category,
    pub label: &'static str,
    pub max_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub min_percent: f64,
    pub gpa: f64,
    pub letter: LetterGrade,
    pub remark: &'static str,
}

impl GradeBand {
    pub fn gpa_text(&self) -> String {
        format!("{:.1}", self.gpa)
    }
}

#[derive(Debug, Clone)]
pub struct GradingConfig {
    pub categories: Vec<CategoryDef>,
    /// Cap on each two-column subtotal in the template (ICA, ICP, GP).
    pub pair_cap: f64,
    pub class_points_cap: f64,
    pub class_divisor: f64,
    pub class_score_cap: f64,
    pub exam_divisor: f64,
    pub exam_score_cap: f64,
    pub final_cap: f64,
    pub rounding: RoundingRule,
    /// Sorted by descending `min_percent`; the last band has `min_percent` 0.
    pub bands: Vec<GradeBand>,
}

impl GradingConfig {
    pub fn standard() -> Self {
        let cat = |category, label, max_score| CategoryDef {
            category,
            label,
            max_score,
        };
        let band = |min_percent, gpa, letter, remark| GradeBand {
            min_percent,
            gpa,
            letter,
            remark,
        };
        Self {
            categories: vec![
                cat(Category::Ica1, "Individual Assessment 1", 50.0),
                cat(Category::Ica2, "Individual Assessment 2", 50.0),
                cat(Category::Icp1, "Individual Class Project 1", 50.0),
                cat(Category::Icp2, "Individual Class Project 2", 50.0),
                cat(Category::Gp1, "Group Project/Research 1", 50.0),
                cat(Category::Gp2, "Group Project/Research 2", 50.0),
                cat(Category::Practical, "Practical Portfolio", 100.0),
                cat(Category::MidTerm, "Mid-Semester Exam", 100.0),
                cat(Category::EndTerm, "End of Term Exam", 100.0),
            ],
            pair_cap: 100.0,
            class_points_cap: 500.0,
            class_divisor: 2.0,
            class_score_cap: 50.0,
            exam_divisor: 2.0,
            exam_score_cap: 50.0,
            final_cap: 100.0,
            rounding: RoundingRule::HalfAwayFromZero,
            bands: vec![
                band(80.0, 4.0, LetterGrade::A1, "Excellent"),
                band(70.0, 3.5, LetterGrade::B2, "Very Good"),
                band(65.0, 3.0, LetterGrade::B3, "Good"),
                band(60.0, 2.5, LetterGrade::C4, "Average"),
                band(55.0, 2.0, LetterGrade::C5, "Below Average"),
                band(50.0, 1.5, LetterGrade::C6, "Credit"),
                band(45.0, 1.0, LetterGrade::D7, "Satisfactory"),
                band(40.0, 0.5, LetterGrade::E8, "Pass"),
                band(0.0, 0.0, LetterGrade::F9, "Fail"),
            ],
        }
    }

    pub fn category(&self, category: Category) -> Option<&CategoryDef> {
        self.categories.iter().find(|c| c.category == category)
    }

    /// Ceiling used when validating an entered score. Unknown categories fall
    /// back to 100.
    pub fn max_score(&self, category: Category) -> f64 {
        self.category(category).map(|c| c.max_score).unwrap_or(100.0)
    }

    pub fn label(&self, category: Category) -> &'static str {
        self.category(category).map(|c| c.label).unwrap_or("")
    }
}

/// Fixed geometry of the report-card spreadsheet.
#[derive(Debug, Clone)]
pub struct TemplateLayout {
    pub sheet_name: &'static str,
    pub first_row: u32,
    pub capacity: u32,
    pub count_cell: &'static str,
    pub subject_cell: &'static str,
    pub term_year_cell: &'static str,
    pub form_cell: &'static str,
    pub header_row: u32,
}

impl TemplateLayout {
    pub fn standard() -> Self {
        Self {
            sheet_name: "ASSESSMENT TEMPLATE",
            first_row: 10,
            capacity: 111,
            count_cell: "C3",
            subject_cell: "B2",
            term_year_cell: "B3",
            form_cell: "B4",
            header_row: 9,
        }
    }

    pub fn last_row(&self) -> u32 {
        self.first_row + self.capacity - 1
    }

    pub fn contains_row(&self, row: u32) -> bool {
        row >= self.first_row && row <= self.last_row()
    }
}

/// Workspace-level knobs. Every field may be overridden from
/// `assessd.config.json` in the workspace directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub template_folder: String,
    pub template_file_name: String,
    pub export_folder: String,
    pub max_upload_bytes: u64,
    pub assessments_per_page: usize,
    pub students_per_page: usize,
    pub import_error_preview: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            template_folder: "templates_excel".to_string(),
            template_file_name: "student_template.xlsx".to_string(),
            export_folder: "exports".to_string(),
            max_upload_bytes: 16 * 1024 * 1024,
            assessments_per_page: 25,
            students_per_page: 30,
            import_error_preview: 5,
        }
    }
}

impl AppConfig {
    pub fn load_from_workspace(workspace: &Path) -> anyhow::Result<Self> {
        let path = workspace.join(WORKSPACE_CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
        let cfg: AppConfig = serde_json::from_str(&text)
            .with_context(|| format!("{} is invalid JSON", path.to_string_lossy()))?;
        Ok(cfg)
    }
}

/// Everything a request needs besides the database connection.
#[derive(Debug, Clone)]
pub struct Settings {
    pub grading: GradingConfig,
    pub layout: TemplateLayout,
    pub app: AppConfig,
}

impl Settings {
    pub fn standard() -> Self {
        Self {
            grading: GradingConfig::standard(),
            layout: TemplateLayout::standard(),
            app: AppConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_descend_and_end_at_zero() {
        let cfg = GradingConfig::standard();
        for pair in cfg.bands.windows(2) {
            assert!(pair[0].min_percent > pair[1].min_percent);
        }
        assert_eq!(cfg.bands.last().map(|b| b.min_percent), Some(0.0));
    }

    #[test]
    fn rounding_rules_differ_only_below_half() {
        assert_eq!(RoundingRule::HalfAwayFromZero.apply(10.5), 11.0);
        assert_eq!(RoundingRule::HalfAwayFromZero.apply(10.4), 10.0);
        assert_eq!(RoundingRule::Up.apply(10.4), 11.0);
        assert_eq!(RoundingRule::Up.apply(10.0), 10.0);
    }

    #[test]
    fn layout_covers_rows_10_through_120() {
        let layout = TemplateLayout::standard();
        assert_eq!(layout.last_row(), 120);
        assert!(layout.contains_row(10));
        assert!(layout.contains_row(120));
        assert!(!layout.contains_row(9));
        assert!(!layout.contains_row(121));
    }

    #[test]
    fn workspace_config_overrides_selected_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(WORKSPACE_CONFIG_FILE),
            r#"{ "templateFileName": "custom.xlsx", "assessmentsPerPage": 10 }"#,
        )
        .expect("write config");
        let cfg = AppConfig::load_from_workspace(dir.path()).expect("load");
        assert_eq!(cfg.template_file_name, "custom.xlsx");
        assert_eq!(cfg.assessments_per_page, 10);
        assert_eq!(cfg.max_upload_bytes, 16 * 1024 * 1024);
    }
}
