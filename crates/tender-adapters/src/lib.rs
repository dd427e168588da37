//! Row sources for tender spreadsheet exports.
//!
//! A source turns one file into an ordered list of string-keyed rows whose
//! cells are already typed as [`CellValue`]. Header detection and metadata-row
//! skipping happen here, so the reconciliation engine only ever sees data rows.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tender_core::{CellValue, ExternalRow, RowField};
use thiserror::Error;

pub const CRATE_NAME: &str = "tender-adapters";

/// Minimum number of recognised headers for a row to count as the header row.
const HEADER_MIN_MATCHES: usize = 2;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("workbook {path}: {message}")]
    Workbook { path: PathBuf, message: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One data row keyed by its header text, cells in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    /// 1-based line/row number in the source file.
    pub row_number: usize,
    pub cells: Vec<(String, CellValue)>,
}

impl RawRow {
    pub fn get(&self, header: &str) -> Option<&CellValue> {
        self.cells.iter().find(|(h, _)| h == header).map(|(_, v)| v)
    }
}

/// Grid row paired with its 1-based line number in the source.
pub type NumberedRow = (usize, Vec<CellValue>);

pub trait RowSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn read_rows(&self, columns: &ColumnMap) -> Result<Vec<RawRow>, AdapterError>;
}

/// Header alias table mapping export column titles to row fields.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    aliases: HashMap<String, RowField>,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    columns: BTreeMap<RowField, Vec<String>>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        let mut map = Self {
            aliases: HashMap::new(),
        };
        let builtin: &[(RowField, &[&str])] = &[
            (
                RowField::OpportunityId,
                &["Opp-ID", "OppID", "Opp ID", "Opp-Nr.", "Opportunity ID", "Opportunity-ID", "CRM-ID"],
            ),
            (RowField::Customer, &["Kunde", "Auftraggeber", "Customer", "Kunde / Auftraggeber"]),
            (
                RowField::RequestedService,
                &["Angefragte Leistung", "Leistung", "Angefragte Leistungen", "Requested Service", "Gegenstand"],
            ),
            (RowField::OppPartner, &["Opp Partner", "OPP-Partner", "OPP Partner", "Opp-Partner"]),
            (
                RowField::TechnicalLead,
                &["Fachverantwortlicher", "Fachverantwortliche", "Fachlicher Lead", "FV"],
            ),
            (RowField::SalesLead, &["Vertriebslead", "Vertriebslead (VL)", "Lead Vertrieb", "VL"]),
            (RowField::Status, &["Status", "Status Angebot", "Angebotsstatus"]),
            (RowField::TenderType, &["Typ", "Art", "Type", "Ausschreibungsart"]),
            (
                RowField::VolumeEuro,
                &["Volumen", "Volumen €", "Volumen EUR", "Volumen (EUR)", "Auftragswert", "Volume EUR"],
            ),
            (RowField::VolumeHours, &["Volumen PT", "Volumen Stunden", "Stunden", "Aufwand (h)"]),
            (
                RowField::OfferDeadline,
                &["Angebotsfrist", "Abgabefrist", "Abgabetermin", "Offer Deadline"],
            ),
            (RowField::QuestionDeadline, &["Fragefrist", "Bieterfragen bis", "Question Deadline"]),
            (RowField::BindingDeadline, &["Bindefrist", "Zuschlagsfrist", "Binding Deadline"]),
            (RowField::ProjectStart, &["Projektstart", "Laufzeit Beginn", "Start"]),
            (RowField::ProjectEnd, &["Projektende", "Laufzeit Ende", "Ende"]),
        ];
        for (field, names) in builtin {
            for name in *names {
                map.insert(name, *field);
            }
        }
        map
    }
}

impl ColumnMap {
    pub fn insert(&mut self, header: &str, field: RowField) {
        self.aliases.insert(header_key(header), field);
    }

    pub fn lookup(&self, header: &str) -> Option<RowField> {
        self.aliases.get(&header_key(header)).copied()
    }

    /// Built-in aliases extended by an optional `columns.yaml`.
    pub fn from_workspace_root(root: &Path) -> anyhow::Result<Self> {
        let mut map = Self::default();
        let path = root.join("columns.yaml");
        if !path.exists() {
            return Ok(map);
        }
        let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file: ColumnsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for (field, names) in file.columns {
            for name in names {
                map.insert(&name, field);
            }
        }
        Ok(map)
    }

    /// Project a raw row onto the typed external row. Unknown headers land in
    /// `extra`; when two headers map to the same field the leftmost present
    /// value wins.
    pub fn to_external_row(&self, source_id: &str, raw: &RawRow) -> ExternalRow {
        let mut row = ExternalRow::new(source_id, raw.row_number);
        for (header, value) in &raw.cells {
            match self.lookup(header) {
                Some(field) => {
                    let current = row.get(field);
                    if !current.is_present() && (value.is_present() || current.is_missing()) {
                        row.set(field, value.clone());
                    }
                }
                None => {
                    row.extra.insert(header.clone(), value.clone());
                }
            }
        }
        row
    }
}

fn header_key(header: &str) -> String {
    header
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Turn a cell grid into keyed rows: locate the header row, skip metadata
/// rows above it and blank rows below it. Row numbers are grid positions.
pub fn rows_from_grid(grid: Vec<Vec<CellValue>>, columns: &ColumnMap) -> Vec<RawRow> {
    rows_from_numbered_grid(
        grid.into_iter().enumerate().map(|(idx, cells)| (idx + 1, cells)).collect(),
        columns,
    )
}

/// Like [`rows_from_grid`], but each row carries its own source line number.
pub fn rows_from_numbered_grid(grid: Vec<NumberedRow>, columns: &ColumnMap) -> Vec<RawRow> {
    header_index(&grid, columns).map_or_else(Vec::new, |header_idx| keyed_rows(grid, header_idx))
}

fn recognised_headers(cells: &[CellValue], columns: &ColumnMap) -> usize {
    cells
        .iter()
        .filter_map(CellValue::as_text)
        .filter(|text| columns.lookup(text).is_some())
        .count()
}

fn header_index(grid: &[NumberedRow], columns: &ColumnMap) -> Option<usize> {
    grid.iter()
        .position(|(_, cells)| recognised_headers(cells, columns) >= HEADER_MIN_MATCHES)
        .or_else(|| grid.iter().position(|(_, cells)| cells.iter().any(CellValue::is_present)))
}

fn keyed_rows(grid: Vec<NumberedRow>, header_idx: usize) -> Vec<RawRow> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let headers = grid[header_idx]
        .1
        .iter()
        .enumerate()
        .map(|(col, cell)| {
            let base = cell
                .as_text()
                .unwrap_or_else(|| format!("column_{}", col + 1));
            let count = seen.entry(base.clone()).or_default();
            *count += 1;
            if *count > 1 {
                format!("{base} ({count})")
            } else {
                base
            }
        })
        .collect::<Vec<_>>();

    grid.into_iter()
        .skip(header_idx + 1)
        .filter(|(_, cells)| cells.iter().any(|c| !c.is_missing()))
        .map(|(line, cells)| RawRow {
            row_number: line,
            cells: headers
                .iter()
                .cloned()
                .zip(cells.into_iter().chain(std::iter::repeat(CellValue::Missing)))
                .collect(),
        })
        .collect()
}

fn read_text(path: &Path) -> Result<String, AdapterError> {
    fs::read_to_string(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Delimited text export (`;`, `,` or tab, detected from the leading lines).
#[derive(Debug, Clone)]
pub struct CsvRowSource {
    source_id: String,
    path: PathBuf,
}

impl CsvRowSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

/// Non-empty lines inspected when guessing the delimiter.
const DELIMITER_SAMPLE_LINES: usize = 10;

/// Pick the separator that splits the most leading lines into two or more
/// fields. Ties go to the earlier candidate, so `;` wins over `,` and tab.
pub fn detect_delimiter(text: &str) -> u8 {
    let sample = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(DELIMITER_SAMPLE_LINES)
        .collect::<Vec<_>>();
    let score = |d: u8| {
        let split_lines = sample.iter().filter(|l| l.bytes().any(|b| b == d)).count();
        let occurrences = sample
            .iter()
            .map(|l| l.bytes().filter(|b| *b == d).count())
            .sum::<usize>();
        (split_lines, occurrences)
    };
    let mut best = (b';', score(b';'));
    for d in [b',', b'\t'] {
        let s = score(d);
        if s > best.1 {
            best = (d, s);
        }
    }
    best.0
}

impl RowSource for CsvRowSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn read_rows(&self, columns: &ColumnMap) -> Result<Vec<RawRow>, AdapterError> {
        let text = read_text(&self.path)?;
        let text = text.trim_start_matches('\u{feff}');
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(detect_delimiter(text))
            .from_reader(text.as_bytes());
        // The reader drops blank lines, so keep each record's own line number.
        let mut grid = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let line = record.position().map_or(idx + 1, |p| p.line() as usize);
            grid.push((line, record.iter().map(CellValue::from_text).collect::<Vec<_>>()));
        }
        Ok(rows_from_numbered_grid(grid, columns))
    }
}

/// Workbook export (xlsx/xlsm/xls/ods) read through calamine.
#[derive(Debug, Clone)]
pub struct WorkbookRowSource {
    source_id: String,
    path: PathBuf,
    sheet: Option<String>,
}

impl WorkbookRowSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            sheet: None,
        }
    }

    pub fn with_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.sheet = Some(sheet.into());
        self
    }

    fn workbook_error(&self, message: impl ToString) -> AdapterError {
        AdapterError::Workbook {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }
}

pub fn cell_from_workbook(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Missing,
        Data::String(s) => CellValue::from_text(s),
        Data::Int(n) => CellValue::from_number(*n as f64),
        Data::Float(f) => CellValue::from_number(*f),
        Data::Bool(b) => CellValue::Text(b.to_string()),
        Data::Error(e) => CellValue::Sentinel(format!("#ERR({e:?})")),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(value) => CellValue::Date(value.date()),
            None => CellValue::from_number(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::from_text(s),
    }
}

impl RowSource for WorkbookRowSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn read_rows(&self, columns: &ColumnMap) -> Result<Vec<RawRow>, AdapterError> {
        let mut workbook = open_workbook_auto(&self.path).map_err(|e| self.workbook_error(e))?;
        let sheet = match &self.sheet {
            Some(name) => name.clone(),
            None => workbook
                .sheet_names()
                .first()
                .cloned()
                .ok_or_else(|| self.workbook_error("workbook has no sheets"))?,
        };
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| self.workbook_error(format!("sheet {sheet}: {e}")))?;
        // The range starts at the first used row, not necessarily row 1.
        let first_row = range.start().map_or(0, |(row, _)| row as usize);
        let grid = range
            .rows()
            .enumerate()
            .map(|(idx, row)| {
                (
                    first_row + idx + 1,
                    row.iter().map(cell_from_workbook).collect::<Vec<_>>(),
                )
            })
            .collect::<Vec<_>>();
        Ok(rows_from_numbered_grid(grid, columns))
    }
}

/// JSON export: an array of objects, or an object with a `rows` array.
#[derive(Debug, Clone)]
pub struct JsonRowSource {
    source_id: String,
    path: PathBuf,
}

impl JsonRowSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

pub fn cell_from_json(value: &JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Missing,
        JsonValue::String(s) => CellValue::from_text(s),
        JsonValue::Number(n) => n
            .as_f64()
            .map(CellValue::from_number)
            .unwrap_or_else(|| CellValue::Text(n.to_string())),
        JsonValue::Bool(b) => CellValue::Text(b.to_string()),
        other => CellValue::Text(other.to_string()),
    }
}

impl RowSource for JsonRowSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn read_rows(&self, _columns: &ColumnMap) -> Result<Vec<RawRow>, AdapterError> {
        let value: JsonValue = serde_json::from_str(&read_text(&self.path)?)?;
        let rows = match &value {
            JsonValue::Array(items) => items,
            JsonValue::Object(obj) => obj
                .get("rows")
                .and_then(|r| r.as_array())
                .ok_or_else(|| AdapterError::Message(format!("{}: missing rows array", self.path.display())))?,
            _ => {
                return Err(AdapterError::Message(format!(
                    "{}: expected an array of rows",
                    self.path.display()
                )))
            }
        };
        Ok(rows
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                let obj = item.as_object()?;
                let cells = obj
                    .iter()
                    .map(|(k, v)| (k.clone(), cell_from_json(v)))
                    .collect::<Vec<_>>();
                cells.iter().any(|(_, c)| !c.is_missing()).then_some(RawRow {
                    row_number: idx + 1,
                    cells,
                })
            })
            .collect())
    }
}

/// Derive a stable source id from a file name, e.g.
/// `"Vertrieb 2024 (final).xlsx"` -> `"vertrieb-2024-final"`.
pub fn source_id_for_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("export")
        .to_lowercase();
    let mut out = String::new();
    let mut last_dash = false;
    for ch in stem.chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Pick a row source by file extension. `sheet` only applies to workbooks.
pub fn row_source_for_path(path: &Path, sheet: Option<&str>) -> Option<Box<dyn RowSource>> {
    let source_id = source_id_for_path(path);
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "csv" | "tsv" | "txt" => Some(Box::new(CsvRowSource::new(source_id, path))),
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => {
            let source = WorkbookRowSource::new(source_id, path);
            Some(Box::new(match sheet {
                Some(sheet) => source.with_sheet(sheet),
                None => source,
            }))
        }
        "json" => Some(Box::new(JsonRowSource::new(source_id, path))),
        _ => None,
    }
}

/// Read a source and type every row.
pub fn load_external_rows(
    source: &dyn RowSource,
    columns: &ColumnMap,
) -> Result<Vec<ExternalRow>, AdapterError> {
    Ok(source
        .read_rows(columns)?
        .iter()
        .map(|raw| columns.to_external_row(source.source_id(), raw))
        .collect())
}
