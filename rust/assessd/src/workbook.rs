use crate::config::{AppConfig, GradingConfig, Settings, TemplateLayout};
use crate::error::{AppError, AppResult};
use crate::template::{CellContent, SheetCells, TemplateField, TemplateMapper};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use umya_spreadsheet::{Spreadsheet, Worksheet};

/// Windows sharing and lock violations.
const ERROR_SHARING_VIOLATION: i32 = 32;
const ERROR_LOCK_VIOLATION: i32 = 33;

/// Maps an I/O failure on `path` to `ResourceLocked` when another program
/// holds the file, otherwise to a plain I/O error.
pub fn lock_aware(e: std::io::Error, path: &Path) -> AppError {
    let locked = e.kind() == std::io::ErrorKind::PermissionDenied
        || matches!(
            e.raw_os_error(),
            Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION)
        );
    if locked {
        AppError::ResourceLocked {
            path: path.to_string_lossy().to_string(),
        }
    } else {
        AppError::Io(e)
    }
}

fn sheet_err(e: impl std::fmt::Display) -> AppError {
    AppError::Spreadsheet(e.to_string())
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub template_dir: PathBuf,
    pub template: PathBuf,
    pub exports: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: &Path, app: &AppConfig) -> Self {
        let template_dir = root.join(&app.template_folder);
        Self {
            root: root.to_path_buf(),
            template: template_dir.join(&app.template_file_name),
            template_dir,
            exports: root.join(&app.export_folder),
        }
    }

    /// Destination inside the export folder. Only the file name of `name`
    /// is kept so callers cannot escape the folder.
    pub fn export_file(&self, name: &str) -> AppResult<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| AppError::validation("invalid file name"))?;
        std::fs::create_dir_all(&self.exports).map_err(|e| lock_aware(e, &self.exports))?;
        Ok(self.exports.join(file_name))
    }
}

impl SheetCells for Worksheet {
    fn put(&mut self, addr: &str, value: CellContent) {
        let cell = self.get_cell_mut(addr);
        match value {
            CellContent::Empty => {
                cell.set_cell_value(umya_spreadsheet::CellValue::default());
            }
            CellContent::Number(n) => {
                cell.set_value_number(n);
            }
            CellContent::Text(s) => {
                cell.set_value_string(s);
            }
            CellContent::Formula(f) => {
                // Stored without the leading '=' in the file format.
                cell.set_formula(f.trim_start_matches('='));
            }
        }
    }

    fn fetch(&self, addr: &str) -> CellContent {
        let Some(cell) = self.get_cell(addr) else {
            return CellContent::Empty;
        };
        let formula = cell.get_formula();
        if !formula.is_empty() {
            return CellContent::Formula(format!("={}", formula.trim_start_matches('=')));
        }
        if let Some(n) = cell.get_value_number() {
            return CellContent::Number(n);
        }
        let value = cell.get_value();
        if value.is_empty() {
            CellContent::Empty
        } else {
            CellContent::Text(value.into_owned())
        }
    }
}

/// A report-card workbook loaded from a private copy of the template.
pub struct TemplateWorkbook {
    book: Spreadsheet,
    sheet_name: String,
    _copy: tempfile::NamedTempFile,
}

impl TemplateWorkbook {
    pub fn open(template: &Path, layout: &TemplateLayout) -> AppResult<Self> {
        let copy = tempfile::Builder::new()
            .prefix("assessd-")
            .suffix(".xlsx")
            .tempfile()?;
        std::fs::copy(template, copy.path()).map_err(|e| lock_aware(e, template))?;
        let book = umya_spreadsheet::reader::xlsx::read(copy.path()).map_err(sheet_err)?;
        if book.get_sheet_by_name(layout.sheet_name).is_none() {
            return Err(AppError::Spreadsheet(format!(
                "template has no sheet named '{}'",
                layout.sheet_name
            )));
        }
        tracing::debug!(template = %template.display(), "template loaded");
        Ok(Self {
            book,
            sheet_name: layout.sheet_name.to_string(),
            _copy: copy,
        })
    }

    pub fn sheet_mut(&mut self) -> AppResult<&mut Worksheet> {
        let name = self.sheet_name.clone();
        self.book
            .get_sheet_by_name_mut(&name)
            .ok_or_else(|| AppError::Spreadsheet(format!("sheet '{name}' disappeared")))
    }

    pub fn with_mapper<T>(
        &mut self,
        settings: &Settings,
        f: impl FnOnce(&mut TemplateMapper<'_, Worksheet>) -> AppResult<T>,
    ) -> AppResult<T> {
        let sheet = self.sheet_mut()?;
        let mut mapper = TemplateMapper::new(sheet, &settings.grading, &settings.layout);
        f(&mut mapper)
    }

    pub fn save(&self, dest: &Path) -> AppResult<()> {
        write_book(&self.book, dest)
    }
}

fn write_book(book: &Spreadsheet, dest: &Path) -> AppResult<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| lock_aware(e, parent))?;
    }
    let file = File::create(dest).map_err(|e| lock_aware(e, dest))?;
    umya_spreadsheet::writer::xlsx::write_writer(book, BufWriter::new(file)).map_err(sheet_err)?;
    tracing::info!(path = %dest.display(), "workbook written");
    Ok(())
}

/// Builds a blank report-card template whose data rows already carry every
/// formula.
pub fn create_default_template(
    dest: &Path,
    grading: &GradingConfig,
    layout: &TemplateLayout,
) -> AppResult<()> {
    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    let sheet = book.new_sheet(layout.sheet_name).map_err(sheet_err)?;

    let labels = [
        ("A1", "STUDENT ASSESSMENT RECORD"),
        ("A2", "SUBJECT:"),
        ("A3", "TERM/YEAR:"),
        ("A4", "FORM:"),
        ("C2", "NO. OF STUDENTS"),
    ];
    for (addr, text) in labels {
        sheet.put(addr, CellContent::Text(text.to_string()));
    }
    for field in TemplateField::ALL {
        if field == TemplateField::Serial {
            continue;
        }
        sheet.put(
            &field.addr(layout.header_row),
            CellContent::Text(field.header().to_string()),
        );
    }

    let mut mapper = TemplateMapper::new(sheet, grading, layout);
    mapper.clear_all()?;
    mapper.update_count_formula();

    write_book(&book, dest)?;
    tracing::info!(path = %dest.display(), "default template created");
    Ok(())
}

/// Returns the template path, generating the default template first when
/// the workspace has none.
pub fn ensure_template(paths: &WorkspacePaths, settings: &Settings) -> AppResult<PathBuf> {
    if !paths.template.is_file() {
        create_default_template(&paths.template, &settings.grading, &settings.layout)?;
    }
    Ok(paths.template.clone())
}

/// Replaces the workspace template with a caller-provided workbook after
/// checking that it parses and carries the expected sheet.
pub fn install_template(source: &Path, paths: &WorkspacePaths, settings: &Settings) -> AppResult<u64> {
    let is_xlsx = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("xlsx"))
        .unwrap_or(false);
    if !is_xlsx {
        return Err(AppError::validation("template must be an .xlsx file"));
    }
    check_upload_size(source, &settings.app)?;
    TemplateWorkbook::open(source, &settings.layout)?;

    std::fs::create_dir_all(&paths.template_dir).map_err(|e| lock_aware(e, &paths.template_dir))?;
    let bytes = std::fs::copy(source, &paths.template).map_err(|e| lock_aware(e, &paths.template))?;
    tracing::info!(from = %source.display(), to = %paths.template.display(), bytes, "template installed");
    Ok(bytes)
}

pub fn check_upload_size(path: &Path, app: &AppConfig) -> AppResult<u64> {
    let meta = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::not_found("file", path.to_string_lossy()),
        _ => lock_aware(e, path),
    })?;
    if meta.len() > app.max_upload_bytes {
        return Err(AppError::validation_with(
            "file is larger than the upload limit",
            serde_json::json!({ "bytes": meta.len(), "limit": app.max_upload_bytes }),
        ));
    }
    Ok(meta.len())
}

/// Writes a flat single-sheet workbook: header row, then one row per record.
pub fn write_table(
    dest: &Path,
    sheet_name: &str,
    headers: &[&str],
    rows: &[Vec<CellContent>],
) -> AppResult<()> {
    let mut book = umya_spreadsheet::new_file_empty_worksheet();
    let sheet = book.new_sheet(sheet_name).map_err(sheet_err)?;
    for (col, header) in headers.iter().enumerate() {
        sheet.put(&cell_addr(col, 1), CellContent::Text(header.to_string()));
    }
    for (i, row) in rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            sheet.put(&cell_addr(col, i as u32 + 2), value.clone());
        }
    }
    write_book(&book, dest)
}

/// `A1`-style address for a zero-based column index.
pub fn cell_addr(col: usize, row: u32) -> String {
    let mut letters = Vec::new();
    let mut n = col + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    format!("{}{}", String::from_utf8_lossy(&letters), row)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSheet {
    Students,
    Assessments,
    Questions,
}

impl ImportSheet {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "students" | "student_import" => Some(ImportSheet::Students),
            "assessments" | "import" => Some(ImportSheet::Assessments),
            "questions" | "question_import" => Some(ImportSheet::Questions),
            _ => None,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            ImportSheet::Students => "student_import_template.xlsx",
            ImportSheet::Assessments => "import_template.xlsx",
            ImportSheet::Questions => "question_import_template.xlsx",
        }
    }

    fn sheet_name(self) -> &'static str {
        match self {
            ImportSheet::Students => "Student Import",
            ImportSheet::Assessments => "Assessment Import",
            ImportSheet::Questions => "Question Import",
        }
    }

    pub fn headers(self) -> &'static [&'static str] {
        match self {
            ImportSheet::Students => &[
                "Student Number",
                "First Name",
                "Last Name",
                "Middle Name",
                "Class",
                "Study Area",
            ],
            ImportSheet::Assessments => &[
                "Student Number",
                "Category",
                "Subject",
                "Score",
                "Max Score",
                "Term",
                "Session",
                "Assessor",
                "Comments",
            ],
            ImportSheet::Questions => &[
                "Question Text",
                "Question Type",
                "Option A",
                "Option B",
                "Option C",
                "Option D",
                "Correct Answer",
                "Difficulty",
                "Explanation",
            ],
        }
    }

    fn samples(self) -> Vec<Vec<CellContent>> {
        let t = |s: &str| CellContent::Text(s.to_string());
        let n = CellContent::Number;
        match self {
            ImportSheet::Students => vec![
                vec![t("STU001"), t("John"), t("Doe"), t("Michael"), t("Grade 10"), t("Mathematics")],
                vec![t("STU002"), t("Jane"), t("Smith"), t(""), t("Grade 9"), t("Science")],
                vec![t("STU003"), t("Bob"), t("Johnson"), t("William"), t("Grade 11"), t("English")],
            ],
            ImportSheet::Assessments => vec![
                vec![
                    t("STU001"),
                    t("ica1"),
                    t("Mathematics"),
                    n(42.0),
                    n(50.0),
                    t("term1"),
                    t("First Term"),
                    t("Mr. Mensah"),
                    t("Good work"),
                ],
                vec![
                    t("STU002"),
                    t("end_term"),
                    t("Science"),
                    n(78.0),
                    n(100.0),
                    t("term1"),
                    t("First Term"),
                    t("Ms. Owusu"),
                    t(""),
                ],
            ],
            ImportSheet::Questions => vec![
                vec![
                    t("What is the capital of France?"),
                    t("mcq"),
                    t("Paris"),
                    t("London"),
                    t("Berlin"),
                    t("Madrid"),
                    t("A"),
                    t("easy"),
                    t("Paris is the capital and largest city of France."),
                ],
                vec![
                    t("The Earth is round."),
                    t("true_false"),
                    t(""),
                    t(""),
                    t(""),
                    t(""),
                    t("True"),
                    t("easy"),
                    t("The Earth is an oblate spheroid."),
                ],
                vec![
                    t("What is 2 + 2?"),
                    t("short_answer"),
                    t(""),
                    t(""),
                    t(""),
                    t(""),
                    t("4"),
                    t("easy"),
                    t("Basic arithmetic."),
                ],
            ],
        }
    }
}

/// Writes the import workbook for `kind` into the template folder unless it
/// already exists, and returns its path.
pub fn ensure_import_sheet(paths: &WorkspacePaths, kind: ImportSheet) -> AppResult<PathBuf> {
    let dest = paths.template_dir.join(kind.file_name());
    if !dest.is_file() {
        write_table(&dest, kind.sheet_name(), kind.headers(), &kind.samples())?;
    }
    Ok(dest)
}
