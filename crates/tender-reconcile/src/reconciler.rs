//! Conservative field reconciliation of one normalized row against one tender.
//!
//! Existing text is never replaced by less information. Staff and customer
//! edges are only ever added, and only when no equivalent edge exists.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use tender_core::{
    Employee, FieldUpdate, FieldValue, NewAssignment, NewOrganisationLink, Pseudonym, Tender,
    TenderField, CUSTOMER_ROLE,
};

use crate::normalize::{canonical_role, collapse_whitespace, IssueKind, NormalizedRow, ValueIssue};

pub type EmployeeDirectory = HashMap<Pseudonym, Employee>;

/// A value that was not written because the stored one may hold more
/// information; surfaced for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldConflict {
    pub field: String,
    pub stored: String,
    pub incoming: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Reconciliation {
    pub update: FieldUpdate,
    pub new_assignments: Vec<NewAssignment>,
    pub new_organisation_link: Option<NewOrganisationLink>,
    pub conflicts: Vec<FieldConflict>,
    pub issues: Vec<ValueIssue>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.update.is_empty()
            && self.new_assignments.is_empty()
            && self.new_organisation_link.is_none()
    }
}

fn stored_text(value: Option<&String>) -> String {
    value.map(|v| collapse_whitespace(v)).unwrap_or_default()
}

fn same_amount(a: f64, b: f64) -> bool {
    format!("{a:.2}") == format!("{b:.2}")
}

/// Compute what `row` would change on `tender`. Pure: the caller decides
/// whether and how to apply the result.
pub fn reconcile(tender: &Tender, row: &NormalizedRow, directory: &EmployeeDirectory) -> Reconciliation {
    let mut out = Reconciliation::default();

    reconcile_notes(tender, row, &mut out);
    reconcile_short_description(tender, row, &mut out);

    let text_fields = [
        (TenderField::Status, row.status.value().map(ToString::to_string), &tender.status),
        (TenderField::TenderType, row.tender_type.clone(), &tender.tender_type),
    ];
    for (field, incoming, stored) in text_fields {
        if let Some(incoming) = incoming {
            if stored.as_deref() != Some(incoming.as_str()) {
                out.update.set(
                    field,
                    stored.clone().map(FieldValue::Text),
                    FieldValue::Text(incoming),
                );
            }
        }
    }

    let amounts = [
        (TenderField::VolumeEuro, row.volume_euro, tender.volume_euro),
        (TenderField::VolumeHours, row.volume_hours, tender.volume_hours),
    ];
    for (field, incoming, stored) in amounts {
        let Some(incoming) = incoming else { continue };
        if !stored.is_some_and(|s| same_amount(s, incoming)) {
            out.update
                .set(field, stored.map(FieldValue::Number), FieldValue::Number(incoming));
        }
    }

    let dates: [(TenderField, Option<NaiveDate>, Option<NaiveDate>); 5] = [
        (TenderField::OfferDeadline, row.offer_deadline, tender.offer_deadline),
        (TenderField::QuestionDeadline, row.question_deadline, tender.question_deadline),
        (TenderField::BindingDeadline, row.binding_deadline, tender.binding_deadline),
        (TenderField::ProjectStart, row.project_start, tender.project_start),
        (TenderField::ProjectEnd, row.project_end, tender.project_end),
    ];
    for (field, incoming, stored) in dates {
        if let Some(incoming) = incoming {
            if stored != Some(incoming) {
                out.update
                    .set(field, stored.map(FieldValue::Date), FieldValue::Date(incoming));
            }
        }
    }

    reconcile_customer(tender, row, &mut out);
    reconcile_staff(tender, row, directory, &mut out);
    out
}

fn reconcile_notes(tender: &Tender, row: &NormalizedRow, out: &mut Reconciliation) {
    let Some(incoming) = &row.requested_service else {
        return;
    };
    let stored = stored_text(tender.notes.as_ref());
    if !stored.is_empty() && stored.contains(incoming.as_str()) {
        return;
    }
    if stored.is_empty() || incoming.chars().count() > stored.chars().count() {
        out.update.set(
            TenderField::Notes,
            tender.notes.clone().map(FieldValue::Text),
            FieldValue::Text(incoming.clone()),
        );
    } else {
        out.conflicts.push(FieldConflict {
            field: TenderField::Notes.column().to_string(),
            stored,
            incoming: incoming.clone(),
        });
    }
}

fn reconcile_short_description(tender: &Tender, row: &NormalizedRow, out: &mut Reconciliation) {
    let Some(code) = &row.opportunity_id else {
        return;
    };
    let stored = stored_text(tender.short_description.as_ref());
    if !stored.contains(code.as_str()) {
        out.update.set(
            TenderField::ShortDescription,
            tender.short_description.clone().map(FieldValue::Text),
            FieldValue::Text(code.clone()),
        );
    }
}

fn reconcile_customer(tender: &Tender, row: &NormalizedRow, out: &mut Reconciliation) {
    let Some(customer) = &row.customer else {
        return;
    };
    match tender.customer_link() {
        None => {
            out.new_organisation_link = Some(NewOrganisationLink {
                organisation_name: customer.clone(),
                role: CUSTOMER_ROLE.to_string(),
            })
        }
        Some(link) if collapse_whitespace(&link.organisation_name) == *customer => {}
        Some(link) => out.conflicts.push(FieldConflict {
            field: "customer".to_string(),
            stored: link.organisation_name.clone(),
            incoming: customer.clone(),
        }),
    }
}

fn reconcile_staff(
    tender: &Tender,
    row: &NormalizedRow,
    directory: &EmployeeDirectory,
    out: &mut Reconciliation,
) {
    for staff in &row.staff {
        let Some(employee) = directory.get(&staff.pseudonym) else {
            out.issues.push(ValueIssue {
                field: staff.field,
                kind: IssueKind::UnknownPseudonym,
                raw: staff.pseudonym.to_string(),
            });
            continue;
        };
        // historical labels count as the canonical role they map to
        let already_assigned = tender
            .employees
            .iter()
            .any(|a| a.employee_id == employee.id && canonical_role(&a.role) == staff.role);
        let already_planned = out
            .new_assignments
            .iter()
            .any(|a| a.employee_id == employee.id && a.role == staff.role);
        if !already_assigned && !already_planned {
            out.new_assignments.push(NewAssignment {
                employee_id: employee.id,
                pseudonym: employee.pseudonym.clone(),
                role: staff.role.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_row;
    use tender_core::{
        roles, CellValue, EmployeeAssignment, ExternalRow, OrganisationLink, PseudonymPolicy,
    };
    use uuid::Uuid;

    fn employee(code: &str) -> Employee {
        Employee {
            id: Uuid::new_v4(),
            pseudonym: Pseudonym::parse(code, &PseudonymPolicy::default()).expect("pseudonym"),
            display_name: None,
        }
    }

    fn directory(employees: &[&Employee]) -> EmployeeDirectory {
        employees
            .iter()
            .map(|e| (e.pseudonym.clone(), (*e).clone()))
            .collect()
    }

    fn assign(tender: &mut Tender, employee: &Employee, role: &str) {
        tender.employees.push(EmployeeAssignment {
            id: Uuid::new_v4(),
            employee_id: employee.id,
            pseudonym: employee.pseudonym.clone(),
            role: role.to_string(),
        });
    }

    fn row_with(fill: impl FnOnce(&mut ExternalRow)) -> NormalizedRow {
        let mut raw = ExternalRow::new("export", 4);
        fill(&mut raw);
        normalize_row(&raw, &PseudonymPolicy::default())
    }

    #[test]
    fn longer_service_text_replaces_shorter_note() {
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        tender.notes = Some("ISO Audit".into());
        let row = row_with(|r| r.requested_service = CellValue::from_text("ISO 27001 Audit inkl. Vorbereitung"));

        let rec = reconcile(&tender, &row, &EmployeeDirectory::new());
        let change = rec.update.get(TenderField::Notes).expect("notes change");
        assert_eq!(change.previous, Some(FieldValue::Text("ISO Audit".into())));
        assert_eq!(
            change.next,
            FieldValue::Text("ISO 27001 Audit inkl. Vorbereitung".into())
        );
        assert!(rec.conflicts.is_empty());
    }

    #[test]
    fn contained_or_shorter_service_text_never_overwrites() {
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        tender.notes = Some("ISO 27001 Audit inkl. Vorbereitung und Nachbereitung".into());

        let contained = row_with(|r| r.requested_service = CellValue::from_text("ISO 27001 Audit"));
        let rec = reconcile(&tender, &contained, &EmployeeDirectory::new());
        assert!(!rec.update.contains(TenderField::Notes));
        assert!(rec.conflicts.is_empty());

        let divergent = row_with(|r| r.requested_service = CellValue::from_text("Pentest"));
        let rec = reconcile(&tender, &divergent, &EmployeeDirectory::new());
        assert!(!rec.update.contains(TenderField::Notes));
        assert_eq!(rec.conflicts.len(), 1);
        assert_eq!(rec.conflicts[0].field, "notes");
    }

    #[test]
    fn empty_note_is_filled() {
        let tender = Tender::new(Uuid::new_v4(), "Audit");
        let row = row_with(|r| r.requested_service = CellValue::from_text("Pentest"));
        let rec = reconcile(&tender, &row, &EmployeeDirectory::new());
        assert!(rec.update.contains(TenderField::Notes));
    }

    #[test]
    fn title_is_never_written() {
        let tender = Tender::new(Uuid::new_v4(), "Audit");
        let row = row_with(|r| {
            r.requested_service = CellValue::from_text("Komplett anderer Titel");
            r.opportunity_id = CellValue::from_text("785");
        });
        let rec = reconcile(&tender, &row, &EmployeeDirectory::new());
        let fields = rec.update.iter().map(|c| c.field).collect::<Vec<_>>();
        assert_eq!(fields, vec![TenderField::Notes, TenderField::ShortDescription]);
    }

    #[test]
    fn short_description_keeps_codes_that_contain_the_id() {
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        tender.short_description = Some("OPP-785".into());
        let row = row_with(|r| r.opportunity_id = CellValue::Number(785.0));
        assert!(reconcile(&tender, &row, &EmployeeDirectory::new()).is_noop());

        tender.short_description = Some("OPP-999".into());
        let rec = reconcile(&tender, &row, &EmployeeDirectory::new());
        let change = rec.update.get(TenderField::ShortDescription).expect("overwrite");
        assert_eq!(change.previous, Some(FieldValue::Text("OPP-999".into())));
    }

    #[test]
    fn scalars_are_written_only_when_different() {
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        tender.volume_euro = Some(120_000.0);
        tender.status = Some("In Erstellung TNA".into());
        tender.offer_deadline = NaiveDate::from_ymd_opt(2024, 3, 15);
        let row = row_with(|r| {
            r.volume_euro = CellValue::from_text("120.000,00");
            r.status = CellValue::from_text("20 In Erstellung");
            r.tender_type = CellValue::from_text("TNA");
            r.offer_deadline = CellValue::from_text("15.03.2024");
            r.question_deadline = CellValue::from_text("n/a");
        });

        let rec = reconcile(&tender, &row, &EmployeeDirectory::new());
        let fields = rec.update.iter().map(|c| c.field).collect::<Vec<_>>();
        assert_eq!(fields, vec![TenderField::TenderType]);
    }

    #[test]
    fn withdrawn_status_never_clears_existing_status() {
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        tender.status = Some("Versendet".into());
        let row = row_with(|r| r.status = CellValue::from_text("00 Warten auf Veröffentlichung"));
        assert!(reconcile(&tender, &row, &EmployeeDirectory::new()).is_noop());
    }

    #[test]
    fn customer_is_linked_once_and_conflicts_are_reported() {
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        let row = row_with(|r| r.customer = CellValue::from_text("Acme GmbH"));
        let rec = reconcile(&tender, &row, &EmployeeDirectory::new());
        assert_eq!(
            rec.new_organisation_link,
            Some(NewOrganisationLink {
                organisation_name: "Acme GmbH".into(),
                role: CUSTOMER_ROLE.into(),
            })
        );

        tender.organisations.push(OrganisationLink {
            id: Uuid::new_v4(),
            organisation_id: Uuid::new_v4(),
            organisation_name: "Acme GmbH".into(),
            role: CUSTOMER_ROLE.into(),
        });
        assert!(reconcile(&tender, &row, &EmployeeDirectory::new()).is_noop());

        let other = row_with(|r| r.customer = CellValue::from_text("Beta AG"));
        let rec = reconcile(&tender, &other, &EmployeeDirectory::new());
        assert!(rec.new_organisation_link.is_none());
        assert_eq!(rec.conflicts[0].field, "customer");
    }

    #[test]
    fn staff_assignment_is_added_once_per_role() {
        let kbr = employee("KBR");
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        let row = row_with(|r| r.opp_partner = CellValue::from_text("KBR"));

        let rec = reconcile(&tender, &row, &directory(&[&kbr]));
        assert_eq!(rec.new_assignments.len(), 1);
        assert_eq!(rec.new_assignments[0].role, roles::OPP_PARTNER);

        assign(&mut tender, &kbr, roles::OPP_PARTNER);
        assert!(reconcile(&tender, &row, &directory(&[&kbr])).is_noop());
    }

    #[test]
    fn historical_role_label_counts_as_existing_assignment() {
        let mue = employee("MUE");
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        assign(&mut tender, &mue, "Lead Vertrieb");
        let row = row_with(|r| r.sales_lead = CellValue::from_text("MUE"));
        assert!(reconcile(&tender, &row, &directory(&[&mue])).new_assignments.is_empty());
    }

    #[test]
    fn unknown_pseudonym_is_reported_and_rest_of_row_applies() {
        let tender = Tender::new(Uuid::new_v4(), "Audit");
        let row = row_with(|r| {
            r.opp_partner = CellValue::from_text("ZZZ");
            r.tender_type = CellValue::from_text("RFP");
        });
        let rec = reconcile(&tender, &row, &EmployeeDirectory::new());
        assert!(rec.new_assignments.is_empty());
        assert_eq!(rec.issues[0].kind, IssueKind::UnknownPseudonym);
        assert!(rec.update.contains(TenderField::TenderType));
    }

    #[test]
    fn reconciling_the_applied_result_is_a_noop() {
        let kbr = employee("KBR");
        let dir = directory(&[&kbr]);
        let mut tender = Tender::new(Uuid::new_v4(), "Audit");
        let row = row_with(|r| {
            r.opportunity_id = CellValue::from_text("785");
            r.requested_service = CellValue::from_text("ISO 27001  Audit");
            r.status = CellValue::from_text("30 Versendet");
            r.volume_hours = CellValue::from_text("80");
            r.project_start = CellValue::from_text("2024-06-01");
            r.opp_partner = CellValue::from_text("KBR");
        });

        let first = reconcile(&tender, &row, &dir);
        tender.apply_update(&first.update).expect("apply");
        for a in &first.new_assignments {
            assign(&mut tender, &kbr, &a.role);
        }
        assert!(reconcile(&tender, &row, &dir).is_noop());
    }
}
