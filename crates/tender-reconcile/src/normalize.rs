//! Cell normalizers: dates, amounts, statuses, role labels, and the one-shot
//! row preprocessing that feeds the matcher and the reconciler.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use tender_core::{roles, CellValue, ExternalRow, Pseudonym, PseudonymPolicy, RowField};

pub const MIN_YEAR: i32 = 1990;
pub const MAX_YEAR: i32 = 2100;

/// Spreadsheet serial day 0.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
/// Serial numbers above this cannot land inside the year window.
const SERIAL_DAY_LIMIT: f64 = 80_000.0;

static ORDINAL_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s*(?:[-–]\s*)?").expect("ordinal prefix regex"));

/// Result of normalizing one cell into a typed value.
///
/// Callers that only want the value use [`ValueOutcome::value`]; verbose
/// reporting keeps the distinction between blanks, sentinels, garbage and
/// implausible values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "raw", rename_all = "snake_case")]
pub enum ValueOutcome<T> {
    Value(T),
    Empty,
    Sentinel,
    Unparseable(String),
    OutOfRange(String),
}

impl<T: Clone> ValueOutcome<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            ValueOutcome::Value(v) => Some(v.clone()),
            _ => None,
        }
    }
}

pub type DateOutcome = ValueOutcome<NaiveDate>;

fn in_window(date: NaiveDate, raw: impl FnOnce() -> String) -> DateOutcome {
    if (MIN_YEAR..=MAX_YEAR).contains(&date.year()) {
        ValueOutcome::Value(date)
    } else {
        ValueOutcome::OutOfRange(raw())
    }
}

fn from_serial(serial: f64) -> DateOutcome {
    if !serial.is_finite() {
        return ValueOutcome::Unparseable(serial.to_string());
    }
    let days = serial.trunc();
    if !(0.0..=SERIAL_DAY_LIMIT).contains(&days) {
        return ValueOutcome::OutOfRange(serial.to_string());
    }
    let (y, m, d) = SERIAL_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|epoch| epoch.checked_add_signed(Duration::days(days as i64)))
        .map(|date| in_window(date, || serial.to_string()))
        .unwrap_or_else(|| ValueOutcome::OutOfRange(serial.to_string()))
}

fn german_date(token: &str) -> Option<NaiveDate> {
    let mut parts = token.split('.');
    let day: u32 = parts.next()?.trim().parse().ok()?;
    let month: u32 = parts.next()?.trim().parse().ok()?;
    let year_part = parts.next()?.trim();
    if parts.next().is_some_and(|rest| !rest.is_empty()) {
        return None;
    }
    let year: i32 = year_part.parse().ok()?;
    let year = match year_part.len() {
        2 if year <= 68 => 2000 + year,
        2 => 1900 + year,
        4 => year,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_date_text(text: &str) -> DateOutcome {
    let trimmed = text.trim();
    if let Ok(serial) = trimmed.parse::<f64>() {
        return from_serial(serial);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return in_window(dt.date_naive(), || trimmed.to_string());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return in_window(dt.date(), || trimmed.to_string());
        }
    }
    let date_token = trimmed
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(trimmed);
    let parsed = NaiveDate::parse_from_str(date_token, "%Y-%m-%d")
        .ok()
        .or_else(|| german_date(date_token));
    match parsed {
        Some(date) => in_window(date, || trimmed.to_string()),
        None => ValueOutcome::Unparseable(trimmed.to_string()),
    }
}

/// Total date normalizer: never panics, never yields a date outside
/// [`MIN_YEAR`, `MAX_YEAR`].
pub fn classify_date(cell: &CellValue) -> DateOutcome {
    match cell {
        CellValue::Missing => ValueOutcome::Empty,
        CellValue::Sentinel(_) => ValueOutcome::Sentinel,
        CellValue::Date(date) => in_window(*date, || date.to_string()),
        CellValue::Number(serial) => from_serial(*serial),
        CellValue::Text(text) => parse_date_text(text),
    }
}

pub fn parse_date(cell: &CellValue) -> Option<NaiveDate> {
    classify_date(cell).value()
}

pub type AmountOutcome = ValueOutcome<f64>;

fn parse_amount_text(text: &str) -> AmountOutcome {
    let cleaned = text
        .replace('€', "")
        .replace("EUR", "")
        .replace("Eur", "")
        .replace("eur", "")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect::<String>();
    if cleaned.is_empty() {
        return ValueOutcome::Unparseable(text.trim().to_string());
    }

    let commas = cleaned.matches(',').count();
    let dots = cleaned.matches('.').count();
    let canonical = match (commas, dots) {
        (0, 0) => cleaned.clone(),
        (_, 0) if commas > 1 => cleaned.replace(',', ""),
        (_, 0) => cleaned.replace(',', "."),
        (0, _) if dots > 1 => cleaned.replace('.', ""),
        (0, _) => {
            // a single dot followed by exactly three digits is a German thousands separator
            let (head, tail) = cleaned.split_once('.').unwrap_or((cleaned.as_str(), ""));
            let head_digits = head.trim_start_matches('-');
            if tail.len() == 3 && !head_digits.is_empty() && head_digits != "0" {
                format!("{head}{tail}")
            } else {
                cleaned.clone()
            }
        }
        _ => {
            let last_comma = cleaned.rfind(',').unwrap_or(0);
            let last_dot = cleaned.rfind('.').unwrap_or(0);
            if last_comma > last_dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
    };

    match canonical.parse::<f64>() {
        Ok(value) if value.is_finite() => ValueOutcome::Value(value),
        _ => ValueOutcome::Unparseable(text.trim().to_string()),
    }
}

pub fn classify_amount(cell: &CellValue) -> AmountOutcome {
    match cell {
        CellValue::Missing => ValueOutcome::Empty,
        CellValue::Sentinel(_) => ValueOutcome::Sentinel,
        CellValue::Number(value) if value.is_finite() => ValueOutcome::Value(*value),
        CellValue::Number(value) => ValueOutcome::Unparseable(value.to_string()),
        CellValue::Date(date) => ValueOutcome::Unparseable(date.to_string()),
        CellValue::Text(text) => parse_amount_text(text),
    }
}

pub fn parse_amount(cell: &CellValue) -> Option<f64> {
    classify_amount(cell).value()
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn lookup_key(text: &str) -> String {
    collapse_whitespace(&text.replace('–', "-")).to_lowercase()
}

pub mod status {
    pub const IN_PROGRESS: &str = "In Erstellung";
    pub const IN_PROGRESS_TNA: &str = "In Erstellung TNA";
    pub const IN_PROGRESS_OFFER: &str = "In Erstellung Angebot";
    pub const WON: &str = "Gewonnen";
    pub const LOST: &str = "Verloren";
    pub const NOT_OFFERED: &str = "Nicht angeboten";
    pub const OTHER_LEAD: &str = "Anderer im Lead";
    pub const PREQUALIFICATION: &str = "Präqualifizierung";
    pub const SENT: &str = "Versendet";
}

/// Tender type that turns "In Erstellung" into the TNA variant.
pub const TNA_TYPE: &str = "TNA";

/// Historical status spellings, keyed by the lower-cased, whitespace-collapsed
/// label after the ordinal prefix is removed. Union of every spelling seen in
/// past exports; several "Anderer im Lead" variants may carry finer meaning.
const STATUS_SYNONYMS: &[(&str, &str)] = &[
    ("gewonnen", status::WON),
    ("zuschlag", status::WON),
    ("zuschlag erhalten", status::WON),
    ("won", status::WON),
    ("verloren", status::LOST),
    ("absage", status::LOST),
    ("absage erhalten", status::LOST),
    ("lost", status::LOST),
    ("nicht angeboten", status::NOT_OFFERED),
    ("kein angebot", status::NOT_OFFERED),
    ("no bid", status::NOT_OFFERED),
    ("verzicht", status::NOT_OFFERED),
    ("anderer im lead", status::OTHER_LEAD),
    ("anderer im lead - angeboten", status::OTHER_LEAD),
    ("anderer im lead - zuarbeit css", status::OTHER_LEAD),
    ("anderer im lead - nicht angeboten", status::OTHER_LEAD),
    ("präqualifizierung", status::PREQUALIFICATION),
    ("praequalifizierung", status::PREQUALIFICATION),
    ("präqualifikation", status::PREQUALIFICATION),
    ("pq", status::PREQUALIFICATION),
    ("versendet", status::SENT),
    ("angebot versendet", status::SENT),
    ("abgegeben", status::SENT),
    ("angebot abgegeben", status::SENT),
    ("in erstellung tna", status::IN_PROGRESS_TNA),
    ("in erstellung angebot", status::IN_PROGRESS_OFFER),
];

/// Labels that mean "nothing to report yet"; they never overwrite a status.
const WITHDRAWN_STATUSES: &[&str] = &["warten auf veröffentlichung", "warten auf veroeffentlichung"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StatusOutcome {
    Empty,
    Canonical(String),
    Withdrawn,
    /// No rule matched; the stripped text passes through for manual review.
    Unmapped(String),
}

impl StatusOutcome {
    pub fn value(&self) -> Option<&str> {
        match self {
            StatusOutcome::Canonical(v) | StatusOutcome::Unmapped(v) => Some(v),
            StatusOutcome::Empty | StatusOutcome::Withdrawn => None,
        }
    }
}

pub fn strip_ordinal(raw: &str) -> &str {
    let trimmed = raw.trim();
    ORDINAL_PREFIX
        .find(trimmed)
        .map(|m| &trimmed[m.end()..])
        .unwrap_or(trimmed)
}

pub fn classify_status(raw: &str, tender_type: Option<&str>) -> StatusOutcome {
    let stripped = strip_ordinal(raw).trim();
    if stripped.is_empty() {
        return StatusOutcome::Empty;
    }
    let key = lookup_key(stripped);
    if key == lookup_key(status::IN_PROGRESS) {
        let tna = tender_type.is_some_and(|t| t.trim().eq_ignore_ascii_case(TNA_TYPE));
        let value = if tna {
            status::IN_PROGRESS_TNA
        } else {
            status::IN_PROGRESS_OFFER
        };
        return StatusOutcome::Canonical(value.to_string());
    }
    if WITHDRAWN_STATUSES.contains(&key.as_str()) {
        return StatusOutcome::Withdrawn;
    }
    match STATUS_SYNONYMS.iter().find(|(alias, _)| *alias == key) {
        Some((_, canonical)) => StatusOutcome::Canonical((*canonical).to_string()),
        None => StatusOutcome::Unmapped(stripped.to_string()),
    }
}

/// Canonical status or `None` for blank and "withdraw" statuses.
pub fn normalize_status(raw: &str, tender_type: Option<&str>) -> Option<String> {
    classify_status(raw, tender_type).value().map(ToString::to_string)
}

/// Historical role labels, lower-cased and whitespace-collapsed.
const ROLE_ALIASES: &[(&str, &str)] = &[
    ("vertriebslead (vl)", roles::SALES_LEAD),
    ("vertriebslead", roles::SALES_LEAD),
    ("vertriebs-lead", roles::SALES_LEAD),
    ("lead vertrieb", roles::SALES_LEAD),
    ("vl", roles::SALES_LEAD),
    ("opp partner", roles::OPP_PARTNER),
    ("opp-partner", roles::OPP_PARTNER),
    ("opppartner", roles::OPP_PARTNER),
    ("opportunity partner", roles::OPP_PARTNER),
    ("fachverantwortlicher", roles::TECHNICAL_LEAD),
    ("fachverantwortliche", roles::TECHNICAL_LEAD),
    ("fachlicher lead", roles::TECHNICAL_LEAD),
    ("fachlich verantwortlich", roles::TECHNICAL_LEAD),
    ("fachlead", roles::TECHNICAL_LEAD),
    ("fv", roles::TECHNICAL_LEAD),
    ("vertriebssupport (vs)", roles::SALES_SUPPORT),
    ("vertriebssupport", roles::SALES_SUPPORT),
    ("vertriebsunterstützung", roles::SALES_SUPPORT),
    ("support vertrieb", roles::SALES_SUPPORT),
    ("vs", roles::SALES_SUPPORT),
];

/// Map a role label to its canonical form; unknown labels come back unchanged.
pub fn canonical_role(raw: &str) -> &str {
    let key = lookup_key(raw);
    ROLE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(raw)
}

pub fn is_canonical_role(label: &str) -> bool {
    roles::CANONICAL.contains(&label)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    UnparseableDate,
    DateOutOfRange,
    UnparseableNumber,
    UnmappedStatus,
    RejectedPseudonym,
    UnknownPseudonym,
}

/// A value that could not be used as-is; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueIssue {
    pub field: RowField,
    pub kind: IssueKind,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaffRef {
    pub field: RowField,
    pub role: &'static str,
    pub pseudonym: Pseudonym,
}

/// An external row after every normalizer ran once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRow {
    pub source_id: String,
    pub row_number: usize,
    pub label: String,
    pub opportunity_id: Option<String>,
    pub customer: Option<String>,
    pub requested_service: Option<String>,
    pub status: StatusOutcome,
    pub tender_type: Option<String>,
    pub volume_euro: Option<f64>,
    pub volume_hours: Option<f64>,
    pub offer_deadline: Option<NaiveDate>,
    pub question_deadline: Option<NaiveDate>,
    pub binding_deadline: Option<NaiveDate>,
    pub project_start: Option<NaiveDate>,
    pub project_end: Option<NaiveDate>,
    pub staff: Vec<StaffRef>,
    pub issues: Vec<ValueIssue>,
}

fn text_of(cell: &CellValue) -> Option<String> {
    cell.as_text()
        .map(|t| collapse_whitespace(&t))
        .filter(|t| !t.is_empty())
}

struct RowNormalizer<'a> {
    row: &'a ExternalRow,
    issues: Vec<ValueIssue>,
}

impl RowNormalizer<'_> {
    fn date(&mut self, field: RowField) -> Option<NaiveDate> {
        match classify_date(self.row.get(field)) {
            ValueOutcome::Value(date) => Some(date),
            ValueOutcome::Unparseable(raw) => {
                tracing::debug!(row = %self.row.label(), ?field, %raw, "unparseable date");
                self.issue(field, IssueKind::UnparseableDate, raw);
                None
            }
            ValueOutcome::OutOfRange(raw) => {
                tracing::debug!(row = %self.row.label(), ?field, %raw, "date outside plausible window");
                self.issue(field, IssueKind::DateOutOfRange, raw);
                None
            }
            ValueOutcome::Empty | ValueOutcome::Sentinel => None,
        }
    }

    fn amount(&mut self, field: RowField) -> Option<f64> {
        match classify_amount(self.row.get(field)) {
            ValueOutcome::Value(value) => Some(value),
            ValueOutcome::Unparseable(raw) | ValueOutcome::OutOfRange(raw) => {
                tracing::debug!(row = %self.row.label(), ?field, %raw, "unparseable number");
                self.issue(field, IssueKind::UnparseableNumber, raw);
                None
            }
            ValueOutcome::Empty | ValueOutcome::Sentinel => None,
        }
    }

    fn staff(&mut self, policy: &PseudonymPolicy) -> Vec<StaffRef> {
        let mut staff = Vec::new();
        for field in [RowField::OppPartner, RowField::TechnicalLead, RowField::SalesLead] {
            let Some(role) = field.staff_role() else {
                continue;
            };
            // sentinels like "?" are rejected as well: they are never a pseudonym
            let raw = match self.row.get(field) {
                CellValue::Missing => continue,
                other => other.display_raw(),
            };
            match Pseudonym::parse(&raw, policy) {
                Ok(pseudonym) => staff.push(StaffRef {
                    field,
                    role,
                    pseudonym,
                }),
                Err(_) => self.issue(field, IssueKind::RejectedPseudonym, raw),
            }
        }
        staff
    }

    fn issue(&mut self, field: RowField, kind: IssueKind, raw: String) {
        self.issues.push(ValueIssue { field, kind, raw });
    }
}

/// Run every normalizer over a row once.
pub fn normalize_row(row: &ExternalRow, policy: &PseudonymPolicy) -> NormalizedRow {
    let mut n = RowNormalizer {
        row,
        issues: Vec::new(),
    };
    let tender_type = text_of(&row.tender_type);
    let status = match text_of(&row.status) {
        Some(raw) => classify_status(&raw, tender_type.as_deref()),
        None => StatusOutcome::Empty,
    };
    if let StatusOutcome::Unmapped(raw) = &status {
        n.issue(RowField::Status, IssueKind::UnmappedStatus, raw.clone());
    }

    let volume_euro = n.amount(RowField::VolumeEuro);
    let volume_hours = n.amount(RowField::VolumeHours);
    let offer_deadline = n.date(RowField::OfferDeadline);
    let question_deadline = n.date(RowField::QuestionDeadline);
    let binding_deadline = n.date(RowField::BindingDeadline);
    let project_start = n.date(RowField::ProjectStart);
    let project_end = n.date(RowField::ProjectEnd);
    let staff = n.staff(policy);

    NormalizedRow {
        source_id: row.source_id.clone(),
        row_number: row.row_number,
        label: row.label(),
        opportunity_id: text_of(&row.opportunity_id),
        customer: text_of(&row.customer),
        requested_service: text_of(&row.requested_service),
        status,
        tender_type,
        volume_euro,
        volume_hours,
        offer_deadline,
        question_deadline,
        binding_deadline,
        project_start,
        project_end,
        staff,
        issues: n.issues,
    }
}
