//! Core domain model for tender reconciliation.
//!
//! Everything here is plain data: the typed cell union produced at row
//! ingestion, the persisted tender graph, and the mutation/plan values that the
//! reconciliation engine hands to an entity store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tender-core";

/// Organisation role used for the customer of a tender.
pub const CUSTOMER_ROLE: &str = "Auftraggeber";

/// Canonical employee roles.
pub mod roles {
    pub const SALES_LEAD: &str = "Vertriebslead (VL)";
    pub const OPP_PARTNER: &str = "Opp Partner";
    pub const TECHNICAL_LEAD: &str = "Fachverantwortlicher";
    pub const SALES_SUPPORT: &str = "Vertriebssupport (VS)";

    pub const CANONICAL: [&str; 4] = [SALES_LEAD, OPP_PARTNER, TECHNICAL_LEAD, SALES_SUPPORT];
}

/// Placeholder strings that stand for "no value yet" in the exports.
pub const SENTINELS: &[&str] = &["n/a", "na", "tbd", "tba", "?", "-", "k.a."];

/// A spreadsheet cell after ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Missing,
    Sentinel(String),
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl CellValue {
    /// Classify a raw text cell. Surrounding whitespace is not significant.
    pub fn from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Missing;
        }
        let lower = trimmed.to_lowercase();
        if SENTINELS.contains(&lower.as_str()) {
            return Self::Sentinel(trimmed.to_string());
        }
        Self::Text(trimmed.to_string())
    }

    pub fn from_number(value: f64) -> Self {
        if value.is_finite() {
            Self::Number(value)
        } else {
            Self::Sentinel(value.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// True for cells carrying an actual value (not missing, not a sentinel).
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Missing | Self::Sentinel(_))
    }

    /// Text rendering of a present value. Integral numbers render without a
    /// fractional part so that an id typed as `785` reads the same as `"785"`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Missing | Self::Sentinel(_) => None,
            Self::Text(text) => Some(text.clone()),
            Self::Number(value) => Some(format_number(*value)),
            Self::Date(date) => Some(date.format("%Y-%m-%d").to_string()),
        }
    }

    /// Raw rendering for reports, including sentinels.
    pub fn display_raw(&self) -> String {
        match self {
            Self::Missing => String::new(),
            Self::Sentinel(raw) => raw.clone(),
            other => other.as_text().unwrap_or_default(),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Known columns of a tender export row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowField {
    OpportunityId,
    Customer,
    RequestedService,
    OppPartner,
    TechnicalLead,
    SalesLead,
    Status,
    TenderType,
    VolumeEuro,
    VolumeHours,
    OfferDeadline,
    QuestionDeadline,
    BindingDeadline,
    ProjectStart,
    ProjectEnd,
}

impl RowField {
    pub const ALL: [RowField; 15] = [
        RowField::OpportunityId,
        RowField::Customer,
        RowField::RequestedService,
        RowField::OppPartner,
        RowField::TechnicalLead,
        RowField::SalesLead,
        RowField::Status,
        RowField::TenderType,
        RowField::VolumeEuro,
        RowField::VolumeHours,
        RowField::OfferDeadline,
        RowField::QuestionDeadline,
        RowField::BindingDeadline,
        RowField::ProjectStart,
        RowField::ProjectEnd,
    ];

    /// Canonical role for the employee-identifier columns.
    pub fn staff_role(self) -> Option<&'static str> {
        match self {
            RowField::OppPartner => Some(roles::OPP_PARTNER),
            RowField::TechnicalLead => Some(roles::TECHNICAL_LEAD),
            RowField::SalesLead => Some(roles::SALES_LEAD),
            _ => None,
        }
    }
}

/// One external row, typed once at ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExternalRow {
    pub source_id: String,
    pub row_number: usize,
    pub opportunity_id: CellValue,
    pub customer: CellValue,
    pub requested_service: CellValue,
    pub opp_partner: CellValue,
    pub technical_lead: CellValue,
    pub sales_lead: CellValue,
    pub status: CellValue,
    pub tender_type: CellValue,
    pub volume_euro: CellValue,
    pub volume_hours: CellValue,
    pub offer_deadline: CellValue,
    pub question_deadline: CellValue,
    pub binding_deadline: CellValue,
    pub project_start: CellValue,
    pub project_end: CellValue,
    #[serde(default)]
    pub extra: BTreeMap<String, CellValue>,
}

impl ExternalRow {
    pub fn new(source_id: impl Into<String>, row_number: usize) -> Self {
        Self {
            source_id: source_id.into(),
            row_number,
            ..Self::default()
        }
    }

    pub fn get(&self, field: RowField) -> &CellValue {
        match field {
            RowField::OpportunityId => &self.opportunity_id,
            RowField::Customer => &self.customer,
            RowField::RequestedService => &self.requested_service,
            RowField::OppPartner => &self.opp_partner,
            RowField::TechnicalLead => &self.technical_lead,
            RowField::SalesLead => &self.sales_lead,
            RowField::Status => &self.status,
            RowField::TenderType => &self.tender_type,
            RowField::VolumeEuro => &self.volume_euro,
            RowField::VolumeHours => &self.volume_hours,
            RowField::OfferDeadline => &self.offer_deadline,
            RowField::QuestionDeadline => &self.question_deadline,
            RowField::BindingDeadline => &self.binding_deadline,
            RowField::ProjectStart => &self.project_start,
            RowField::ProjectEnd => &self.project_end,
        }
    }

    pub fn set(&mut self, field: RowField, value: CellValue) {
        let slot = match field {
            RowField::OpportunityId => &mut self.opportunity_id,
            RowField::Customer => &mut self.customer,
            RowField::RequestedService => &mut self.requested_service,
            RowField::OppPartner => &mut self.opp_partner,
            RowField::TechnicalLead => &mut self.technical_lead,
            RowField::SalesLead => &mut self.sales_lead,
            RowField::Status => &mut self.status,
            RowField::TenderType => &mut self.tender_type,
            RowField::VolumeEuro => &mut self.volume_euro,
            RowField::VolumeHours => &mut self.volume_hours,
            RowField::OfferDeadline => &mut self.offer_deadline,
            RowField::QuestionDeadline => &mut self.question_deadline,
            RowField::BindingDeadline => &mut self.binding_deadline,
            RowField::ProjectStart => &mut self.project_start,
            RowField::ProjectEnd => &mut self.project_end,
        };
        *slot = value;
    }

    /// Human-readable row identity for reports and logs.
    pub fn label(&self) -> String {
        match self.opportunity_id.as_text() {
            Some(id) => format!("{}#{} (opp {})", self.source_id, self.row_number, id),
            None => format!("{}#{}", self.source_id, self.row_number),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PseudonymError {
    #[error("empty pseudonym")]
    Empty,
    #[error("malformed pseudonym {0:?}: expected three uppercase letters")]
    Malformed(String),
    #[error("invalid pseudonym exception {0:?}: expected four uppercase letters")]
    InvalidException(String),
}

/// Accepted pseudonym shapes beyond the three-letter rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PseudonymPolicy {
    four_letter_exceptions: Vec<String>,
}

impl PseudonymPolicy {
    /// Every exception must be exactly four ASCII uppercase letters.
    pub fn with_exceptions<I, S>(exceptions: I) -> Result<Self, PseudonymError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let four_letter_exceptions = exceptions
            .into_iter()
            .map(Into::into)
            .map(|code: String| {
                if Self::is_valid_exception(&code) {
                    Ok(code)
                } else {
                    Err(PseudonymError::InvalidException(code))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            four_letter_exceptions,
        })
    }

    pub fn is_valid_exception(code: &str) -> bool {
        code.len() == 4 && code.bytes().all(|b| b.is_ascii_uppercase())
    }

    pub fn exceptions(&self) -> &[String] {
        &self.four_letter_exceptions
    }
}

/// Validated employee short code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Pseudonym(String);

impl Pseudonym {
    pub fn parse(raw: &str, policy: &PseudonymPolicy) -> Result<Self, PseudonymError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PseudonymError::Empty);
        }
        let three_upper = trimmed.len() == 3 && trimmed.bytes().all(|b| b.is_ascii_uppercase());
        let exception = policy
            .four_letter_exceptions
            .iter()
            .any(|allowed| allowed == trimmed);
        if three_upper || exception {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(PseudonymError::Malformed(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Employee {
    pub id: Uuid,
    pub pseudonym: Pseudonym,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organisation {
    pub id: Uuid,
    pub name: String,
}

/// Edge tender -> organisation with the organisation's role in the tender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationLink {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub organisation_name: String,
    pub role: String,
}

/// Edge tender -> employee carrying the role label exactly as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmployeeAssignment {
    pub id: Uuid,
    pub employee_id: Uuid,
    pub pseudonym: Pseudonym,
    pub role: String,
}

/// Canonical persisted tender with its links.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tender {
    pub id: Uuid,
    pub title: String,
    pub short_description: Option<String>,
    pub notes: Option<String>,
    pub status: Option<String>,
    pub tender_type: Option<String>,
    pub volume_euro: Option<f64>,
    pub volume_hours: Option<f64>,
    pub offer_deadline: Option<NaiveDate>,
    pub question_deadline: Option<NaiveDate>,
    pub binding_deadline: Option<NaiveDate>,
    pub project_start: Option<NaiveDate>,
    pub project_end: Option<NaiveDate>,
    pub organisations: Vec<OrganisationLink>,
    pub employees: Vec<EmployeeAssignment>,
}

impl Tender {
    pub fn new(id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            short_description: None,
            notes: None,
            status: None,
            tender_type: None,
            volume_euro: None,
            volume_hours: None,
            offer_deadline: None,
            question_deadline: None,
            binding_deadline: None,
            project_start: None,
            project_end: None,
            organisations: Vec::new(),
            employees: Vec::new(),
        }
    }

    pub fn field_value(&self, field: TenderField) -> Option<FieldValue> {
        match field {
            TenderField::Notes => self.notes.clone().map(FieldValue::Text),
            TenderField::ShortDescription => self.short_description.clone().map(FieldValue::Text),
            TenderField::Status => self.status.clone().map(FieldValue::Text),
            TenderField::TenderType => self.tender_type.clone().map(FieldValue::Text),
            TenderField::VolumeEuro => self.volume_euro.map(FieldValue::Number),
            TenderField::VolumeHours => self.volume_hours.map(FieldValue::Number),
            TenderField::OfferDeadline => self.offer_deadline.map(FieldValue::Date),
            TenderField::QuestionDeadline => self.question_deadline.map(FieldValue::Date),
            TenderField::BindingDeadline => self.binding_deadline.map(FieldValue::Date),
            TenderField::ProjectStart => self.project_start.map(FieldValue::Date),
            TenderField::ProjectEnd => self.project_end.map(FieldValue::Date),
        }
    }

    /// Apply a field update in place. A value of the wrong shape for a field is
    /// returned as an error and leaves the tender unchanged for that field.
    pub fn apply_update(&mut self, update: &FieldUpdate) -> Result<(), FieldTypeError> {
        for change in update.iter() {
            self.set_field(change.field, &change.next)?;
        }
        Ok(())
    }

    fn set_field(&mut self, field: TenderField, value: &FieldValue) -> Result<(), FieldTypeError> {
        let mismatch = || FieldTypeError {
            field,
            value: value.clone(),
        };
        match (field, value) {
            (TenderField::Notes, FieldValue::Text(v)) => self.notes = Some(v.clone()),
            (TenderField::ShortDescription, FieldValue::Text(v)) => {
                self.short_description = Some(v.clone())
            }
            (TenderField::Status, FieldValue::Text(v)) => self.status = Some(v.clone()),
            (TenderField::TenderType, FieldValue::Text(v)) => self.tender_type = Some(v.clone()),
            (TenderField::VolumeEuro, FieldValue::Number(v)) => self.volume_euro = Some(*v),
            (TenderField::VolumeHours, FieldValue::Number(v)) => self.volume_hours = Some(*v),
            (TenderField::OfferDeadline, FieldValue::Date(v)) => self.offer_deadline = Some(*v),
            (TenderField::QuestionDeadline, FieldValue::Date(v)) => {
                self.question_deadline = Some(*v)
            }
            (TenderField::BindingDeadline, FieldValue::Date(v)) => {
                self.binding_deadline = Some(*v)
            }
            (TenderField::ProjectStart, FieldValue::Date(v)) => self.project_start = Some(*v),
            (TenderField::ProjectEnd, FieldValue::Date(v)) => self.project_end = Some(*v),
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    pub fn customer_link(&self) -> Option<&OrganisationLink> {
        self.organisations.iter().find(|link| link.role == CUSTOMER_ROLE)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("value {value:?} does not fit field {field:?}")]
pub struct FieldTypeError {
    pub field: TenderField,
    pub value: FieldValue,
}

/// Scalar tender fields the reconciler may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenderField {
    Notes,
    ShortDescription,
    Status,
    TenderType,
    VolumeEuro,
    VolumeHours,
    OfferDeadline,
    QuestionDeadline,
    BindingDeadline,
    ProjectStart,
    ProjectEnd,
}

impl TenderField {
    /// Column name in the `tenders` table.
    pub fn column(self) -> &'static str {
        match self {
            TenderField::Notes => "notes",
            TenderField::ShortDescription => "short_description",
            TenderField::Status => "status",
            TenderField::TenderType => "tender_type",
            TenderField::VolumeEuro => "volume_euro",
            TenderField::VolumeHours => "volume_hours",
            TenderField::OfferDeadline => "offer_deadline",
            TenderField::QuestionDeadline => "question_deadline",
            TenderField::BindingDeadline => "binding_deadline",
            TenderField::ProjectStart => "project_start",
            TenderField::ProjectEnd => "project_end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Number(v) => f.write_str(&format_number(*v)),
            FieldValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: TenderField,
    pub previous: Option<FieldValue>,
    pub next: FieldValue,
}

/// Sparse set of field writes for one tender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FieldUpdate {
    changes: BTreeMap<TenderField, FieldChange>,
}

impl FieldUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: TenderField, previous: Option<FieldValue>, next: FieldValue) {
        self.changes.insert(
            field,
            FieldChange {
                field,
                previous,
                next,
            },
        );
    }

    pub fn get(&self, field: TenderField) -> Option<&FieldChange> {
        self.changes.get(&field)
    }

    pub fn contains(&self, field: TenderField) -> bool {
        self.changes.contains_key(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.values()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAssignment {
    pub employee_id: Uuid,
    pub pseudonym: Pseudonym,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrganisationLink {
    pub organisation_name: String,
    pub role: String,
}

/// Everything one row writes; applied by the store as a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowMutation {
    pub tender_id: Uuid,
    pub update: FieldUpdate,
    pub new_assignments: Vec<NewAssignment>,
    pub new_organisation_link: Option<NewOrganisationLink>,
}

impl RowMutation {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty()
            && self.new_assignments.is_empty()
            && self.new_organisation_link.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relabel {
    pub assignment_id: Uuid,
    pub role: String,
}

/// Keep/delete/relabel decision for the employee assignments of one tender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DedupPlan {
    pub keep: Vec<Uuid>,
    pub delete: Vec<Uuid>,
    pub relabel: Vec<Relabel>,
}

impl DedupPlan {
    /// True when applying the plan would not change the store.
    pub fn is_noop(&self) -> bool {
        self.delete.is_empty() && self.relabel.is_empty()
    }
}
