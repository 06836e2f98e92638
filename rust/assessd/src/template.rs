//! Cell mapping for the report-card spreadsheet.
//!
//! Raw inputs go into fixed columns; every derived column is written back as
//! formula text generated from [`GradingConfig`], so spreadsheet software
//! recomputes exactly what [`crate::calc::aggregate`] computes.

use crate::calc::Category;
use crate::config::{GradingConfig, TemplateLayout};
use crate::error::{AppError, AppResult, CapacityWarning};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemplateField {
    Serial,
    RefId,
    Name,
    StudentNumber,
    StudyArea,
    Ica1,
    Ica2,
    IcaTotal,
    Icp1,
    Icp2,
    IcpTotal,
    Gp1,
    Gp2,
    GpTotal,
    Practical,
    MidTerm,
    TotalClass,
    PercentClass,
    AvgClass,
    EndTerm,
    AvgExam,
    Total5050,
    WeightedResult,
    Gpa,
    Grade,
}

impl TemplateField {
    pub const ALL: [TemplateField; 25] = [
        TemplateField::Serial,
        TemplateField::RefId,
        TemplateField::Name,
        TemplateField::StudentNumber,
        TemplateField::StudyArea,
        TemplateField::Ica1,
        TemplateField::Ica2,
        TemplateField::IcaTotal,
        TemplateField::Icp1,
        TemplateField::Icp2,
        TemplateField::IcpTotal,
        TemplateField::Gp1,
        TemplateField::Gp2,
        TemplateField::GpTotal,
        TemplateField::Practical,
        TemplateField::MidTerm,
        TemplateField::TotalClass,
        TemplateField::PercentClass,
        TemplateField::AvgClass,
        TemplateField::EndTerm,
        TemplateField::AvgExam,
        TemplateField::Total5050,
        TemplateField::WeightedResult,
        TemplateField::Gpa,
        TemplateField::Grade,
    ];

    /// Serial number and reference id share column A; whichever is written
    /// last wins.
    pub fn column(self) -> &'static str {
        match self {
            TemplateField::Serial | TemplateField::RefId => "A",
            TemplateField::Name => "B",
            TemplateField::StudentNumber => "C",
            TemplateField::StudyArea => "D",
            TemplateField::Ica1 => "E",
            TemplateField::Ica2 => "F",
            TemplateField::IcaTotal => "G",
            TemplateField::Icp1 => "H",
            TemplateField::Icp2 => "I",
            TemplateField::IcpTotal => "J",
            TemplateField::Gp1 => "K",
            TemplateField::Gp2 => "L",
            TemplateField::GpTotal => "M",
            TemplateField::Practical => "N",
            TemplateField::MidTerm => "O",
            TemplateField::TotalClass => "P",
            TemplateField::PercentClass => "Q",
            TemplateField::AvgClass => "R",
            TemplateField::EndTerm => "S",
            TemplateField::AvgExam => "T",
            TemplateField::Total5050 => "U",
            TemplateField::WeightedResult => "V",
            TemplateField::Gpa => "W",
            TemplateField::Grade => "X",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            TemplateField::Serial => "serial",
            TemplateField::RefId => "ref_id",
            TemplateField::Name => "name",
            TemplateField::StudentNumber => "student_number",
            TemplateField::StudyArea => "study_area",
            TemplateField::Ica1 => "ica1",
            TemplateField::Ica2 => "ica2",
            TemplateField::IcaTotal => "ica_total",
            TemplateField::Icp1 => "icp1",
            TemplateField::Icp2 => "icp2",
            TemplateField::IcpTotal => "icp_total",
            TemplateField::Gp1 => "gp1",
            TemplateField::Gp2 => "gp2",
            TemplateField::GpTotal => "gp_total",
            TemplateField::Practical => "practical",
            TemplateField::MidTerm => "mid_term",
            TemplateField::TotalClass => "total_class",
            TemplateField::PercentClass => "percent_class",
            TemplateField::AvgClass => "avg_class",
            TemplateField::EndTerm => "end_term",
            TemplateField::AvgExam => "avg_exam",
            TemplateField::Total5050 => "total_50_50",
            TemplateField::WeightedResult => "weighted_result",
            TemplateField::Gpa => "gpa",
            TemplateField::Grade => "grade",
        }
    }

    /// Column heading in the header row of a generated template.
    pub fn header(self) -> &'static str {
        match self {
            TemplateField::Serial => "S/N",
            TemplateField::RefId => "REF. NO.",
            TemplateField::Name => "SURNAME FIRSTNAME OTHERNAME",
            TemplateField::StudentNumber => "STUDENT NUMBER",
            TemplateField::StudyArea => "STUDY AREA",
            TemplateField::Ica1 => "I.C.A. 1",
            TemplateField::Ica2 => "I.C.A. 2",
            TemplateField::IcaTotal => "SUB TOTAL (I.C.A.)",
            TemplateField::Icp1 => "I.C.P. 1",
            TemplateField::Icp2 => "I.C.P. 2",
            TemplateField::IcpTotal => "SUB TOTAL (C.P)",
            TemplateField::Gp1 => "G.P. 1",
            TemplateField::Gp2 => "G.P. 2",
            TemplateField::GpTotal => "SUB TOTAL (G.P)",
            TemplateField::Practical => "PRACTICAL PORTFOLIO",
            TemplateField::MidTerm => "MID TERM EXAMS",
            TemplateField::TotalClass => "TOTAL CLASS SCORE",
            TemplateField::PercentClass => "100% OF TOTAL CLASS SCORE",
            TemplateField::AvgClass => "AVG. CLASS SC.",
            TemplateField::EndTerm => "END OF TERM EXAMS",
            TemplateField::AvgExam => "AVG. EXAMS SC.",
            TemplateField::Total5050 => "TOTAL 50 + 50",
            TemplateField::WeightedResult => "WEIGHTED RESULT",
            TemplateField::Gpa => "GPA",
            TemplateField::Grade => "GRADE",
        }
    }

    pub fn for_category(category: Category) -> TemplateField {
        match category {
            Category::Ica1 => TemplateField::Ica1,
            Category::Ica2 => TemplateField::Ica2,
            Category::Icp1 => TemplateField::Icp1,
            Category::Icp2 => TemplateField::Icp2,
            Category::Gp1 => TemplateField::Gp1,
            Category::Gp2 => TemplateField::Gp2,
            Category::Practical => TemplateField::Practical,
            Category::MidTerm => TemplateField::MidTerm,
            Category::EndTerm => TemplateField::EndTerm,
        }
    }

    pub fn addr(self, row: u32) -> String {
        format!("{}{}", self.column(), row)
    }
}

/// Columns holding raw marks, reset to 0 when a row is cleared.
const INPUT_FIELDS: [TemplateField; 9] = [
    TemplateField::Ica1,
    TemplateField::Ica2,
    TemplateField::Icp1,
    TemplateField::Icp2,
    TemplateField::Gp1,
    TemplateField::Gp2,
    TemplateField::Practical,
    TemplateField::MidTerm,
    TemplateField::EndTerm,
];

const INFO_FIELDS: [TemplateField; 3] = [
    TemplateField::Name,
    TemplateField::StudentNumber,
    TemplateField::StudyArea,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellContent {
    Empty,
    Number(f64),
    Text(String),
    /// Formula text including the leading `=`.
    Formula(String),
}

impl CellContent {
    pub fn is_empty(&self) -> bool {
        match self {
            CellContent::Empty => true,
            CellContent::Text(s) => s.is_empty(),
            _ => false,
        }
    }
}

/// Minimal cell access the mapper needs. Implemented for the on-disk
/// workbook and for an in-memory grid in tests.
pub trait SheetCells {
    fn put(&mut self, addr: &str, value: CellContent);
    fn fetch(&self, addr: &str) -> CellContent;
}

/// A mark as it arrives from the caller: already numeric or free text.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkInput {
    Number(f64),
    Text(String),
}

/// `"E"` (excused, any case) stays a text marker, numeric strings become
/// numbers, anything else is written verbatim.
pub fn parse_mark(mark: &MarkInput) -> CellContent {
    match mark {
        MarkInput::Number(n) => CellContent::Number(*n),
        MarkInput::Text(s) => {
            if s.eq_ignore_ascii_case("e") {
                return CellContent::Text("E".to_string());
            }
            match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() => CellContent::Number(n),
                _ => CellContent::Text(s.clone()),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateStudent {
    pub ref_id: Option<String>,
    pub name: Option<String>,
    pub student_number: Option<String>,
    pub study_area: Option<String>,
    pub marks: BTreeMap<Category, MarkInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub written: usize,
    pub dropped: usize,
    pub warning: Option<CapacityWarning>,
}

/// Derived-column formulas for one row, in column order.
pub fn row_formulas(cfg: &GradingConfig, row: u32) -> Vec<(TemplateField, String)> {
    let r = row;
    let round = cfg.rounding.spreadsheet_fn();
    vec![
        (
            TemplateField::IcaTotal,
            format!("=MIN({}, (SUM(E{r}:F{r})))", cfg.pair_cap),
        ),
        (
            TemplateField::IcpTotal,
            format!("=MIN({},(SUM(H{r}:I{r})))", cfg.pair_cap),
        ),
        (
            TemplateField::GpTotal,
            format!("=MIN({},(SUM(K{r}:L{r})))", cfg.pair_cap),
        ),
        (
            TemplateField::TotalClass,
            format!(
                "=MIN({}, (SUM(G{r},J{r},M{r},N{r},O{r})))",
                cfg.class_points_cap
            ),
        ),
        (
            TemplateField::PercentClass,
            format!("=P{r}/{}*100", cfg.class_points_cap),
        ),
        (
            TemplateField::AvgClass,
            format!(
                "=MIN({}, ({round}(SUM(Q{r})/{},0)))",
                cfg.class_score_cap, cfg.class_divisor
            ),
        ),
        (
            TemplateField::AvgExam,
            format!(
                "=MIN({}, ({round}(SUM(S{r})/{},0)))",
                cfg.exam_score_cap, cfg.exam_divisor
            ),
        ),
        (
            TemplateField::Total5050,
            format!("=MIN({}, (SUM(R{r},T{r})))", cfg.final_cap),
        ),
        (TemplateField::WeightedResult, format!("=U{r}")),
        (
            TemplateField::Gpa,
            band_formula(cfg, row, |b| b.gpa_text()),
        ),
        (
            TemplateField::Grade,
            band_formula(cfg, row, |b| b.letter.to_string()),
        ),
    ]
}

fn band_formula(
    cfg: &GradingConfig,
    row: u32,
    label: impl Fn(&crate::config::GradeBand) -> String,
) -> String {
    let bands = &cfg.bands;
    let Some((last, rest)) = bands.split_last() else {
        return "=\"\"".to_string();
    };
    let Some(prev) = rest.last() else {
        return format!("=\"{}\"", label(last));
    };
    let mut out = String::from("=");
    for b in rest {
        out.push_str(&format!("IF(U{row}>={},\"{}\",", b.min_percent, label(b)));
    }
    out.push_str(&format!("IF(U{row}<{},\"{}\")", prev.min_percent, label(last)));
    out.push_str(&")".repeat(rest.len()));
    out
}

pub fn count_formula(layout: &TemplateLayout) -> String {
    format!(
        "=COUNTA({col}{}:{col}{})",
        layout.first_row,
        layout.last_row(),
        col = TemplateField::Name.column()
    )
}

pub struct TemplateMapper<'a, S: SheetCells> {
    sheet: &'a mut S,
    grading: &'a GradingConfig,
    layout: &'a TemplateLayout,
}

impl<'a, S: SheetCells> TemplateMapper<'a, S> {
    pub fn new(sheet: &'a mut S, grading: &'a GradingConfig, layout: &'a TemplateLayout) -> Self {
        Self {
            sheet,
            grading,
            layout,
        }
    }

    fn check_row(&self, row: u32) -> AppResult<()> {
        if self.layout.contains_row(row) {
            return Ok(());
        }
        Err(AppError::validation_with(
            format!(
                "row must be between {} and {}",
                self.layout.first_row,
                self.layout.last_row()
            ),
            json!({ "row": row }),
        ))
    }

    pub fn write_student(&mut self, row: u32, data: &TemplateStudent) -> AppResult<()> {
        self.check_row(row)?;

        let text_fields = [
            (TemplateField::Name, &data.name),
            (TemplateField::RefId, &data.ref_id),
            (TemplateField::StudentNumber, &data.student_number),
            (TemplateField::StudyArea, &data.study_area),
        ];
        for (field, value) in text_fields {
            if let Some(v) = value {
                self.sheet
                    .put(&field.addr(row), CellContent::Text(v.clone()));
            }
        }
        for (category, mark) in &data.marks {
            let field = TemplateField::for_category(*category);
            self.sheet.put(&field.addr(row), parse_mark(mark));
        }

        self.restore_formulas(row);
        Ok(())
    }

    pub fn restore_formulas(&mut self, row: u32) {
        for (field, formula) in row_formulas(self.grading, row) {
            self.sheet.put(&field.addr(row), CellContent::Formula(formula));
        }
    }

    /// Writes students from the first data row with serial numbers 1.. and
    /// stops at the layout capacity. Overflow is reported, never an error.
    pub fn write_batch(&mut self, students: &[TemplateStudent]) -> AppResult<BatchOutcome> {
        let capacity = self.layout.capacity as usize;
        let mut written = 0usize;
        for (i, student) in students.iter().take(capacity).enumerate() {
            let row = self.layout.first_row + i as u32;
            self.sheet.put(
                &TemplateField::Serial.addr(row),
                CellContent::Number((i + 1) as f64),
            );
            self.write_student(row, student)?;
            written += 1;
        }
        self.update_count_formula();

        let dropped = students.len() - written;
        let warning = if dropped > 0 {
            tracing::warn!(
                capacity = self.layout.capacity,
                dropped,
                "template capacity reached"
            );
            Some(CapacityWarning {
                capacity: self.layout.capacity,
                dropped,
            })
        } else {
            None
        };
        Ok(BatchOutcome {
            written,
            dropped,
            warning,
        })
    }

    pub fn update_count_formula(&mut self) {
        let formula = count_formula(self.layout);
        self.sheet
            .put(self.layout.count_cell, CellContent::Formula(formula));
    }

    /// Blanks name, number and study area, zeroes the mark inputs and puts
    /// the formulas back, for every row in `start..=end`.
    pub fn clear_rows(&mut self, start: u32, end: u32) -> AppResult<()> {
        self.check_row(start)?;
        self.check_row(end)?;
        if start > end {
            return Err(AppError::validation("start row is after end row"));
        }
        for row in start..=end {
            for field in INFO_FIELDS {
                self.sheet.put(&field.addr(row), CellContent::Empty);
            }
            for field in INPUT_FIELDS {
                self.sheet.put(&field.addr(row), CellContent::Number(0.0));
            }
            self.restore_formulas(row);
        }
        Ok(())
    }

    pub fn clear_all(&mut self) -> AppResult<()> {
        self.clear_rows(self.layout.first_row, self.layout.last_row())
    }

    /// Every non-empty mapped cell of the row, keyed by field name.
    pub fn student_data(&self, row: u32) -> AppResult<BTreeMap<&'static str, CellContent>> {
        self.check_row(row)?;
        let mut out = BTreeMap::new();
        for field in TemplateField::ALL {
            let value = self.sheet.fetch(&field.addr(row));
            if !value.is_empty() {
                out.insert(field.key(), value);
            }
        }
        Ok(out)
    }

    pub fn all_students(&self) -> AppResult<Vec<BTreeMap<&'static str, CellContent>>> {
        let mut out = Vec::new();
        for row in self.layout.first_row..=self.layout.last_row() {
            let name = self.sheet.fetch(&TemplateField::Name.addr(row));
            if !name.is_empty() {
                out.push(self.student_data(row)?);
            }
        }
        Ok(out)
    }

    pub fn update_school_info(
        &mut self,
        subject: Option<&str>,
        term_year: Option<&str>,
        form: Option<&str>,
    ) {
        let cells = [
            (self.layout.subject_cell, subject),
            (self.layout.term_year_cell, term_year),
            (self.layout.form_cell, form),
        ];
        for (addr, value) in cells {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                self.sheet.put(addr, CellContent::Text(v.to_string()));
            }
        }
    }
}
