use std::path::PathBuf;
use std::sync::Arc;

use tempfile::tempdir;
use tender_core::{
    roles, CellValue, ExternalRow, Pseudonym, PseudonymPolicy, Tender, CUSTOMER_ROLE,
};
use tender_reconcile::{
    EngineConfig, MatchStrategy, ReconcileError, Reconciler, RowOutcome,
};
use tender_storage::MemoryEntityStore;
use uuid::Uuid;

fn pseudonym(code: &str) -> Pseudonym {
    Pseudonym::parse(code, &PseudonymPolicy::default()).expect("pseudonym")
}

fn config() -> EngineConfig {
    EngineConfig {
        dedup_after_run: false,
        ..EngineConfig::default()
    }
}

fn acme_row() -> ExternalRow {
    let mut row = ExternalRow::new("vertrieb-2024", 4);
    row.opportunity_id = CellValue::from_text("785");
    row.customer = CellValue::from_text("Acme GmbH");
    row.requested_service = CellValue::from_text("ISO 27001 Audit");
    row.opp_partner = CellValue::from_text("KBR");
    row
}

async fn seeded_store() -> (Arc<MemoryEntityStore>, Uuid) {
    let store = Arc::new(MemoryEntityStore::new());
    let mut tender = Tender::new(Uuid::new_v4(), "ISO 27001 Audit Acme");
    tender.short_description = Some("785".into());
    let tender_id = store.insert_tender(tender).await;
    store.insert_employee(pseudonym("KBR"), Some("K. Braun")).await;
    store.insert_employee(pseudonym("MUE"), Some("M. Müller")).await;
    (store, tender_id)
}

#[tokio::test]
async fn exact_code_row_adds_opp_partner_without_touching_title() {
    let (store, tender_id) = seeded_store().await;
    let reconciler = Reconciler::new(store.clone(), config());

    let report = reconciler.run(&[acme_row()]).await.expect("run");
    let row = &report.rows[0];
    assert_eq!(row.outcome, RowOutcome::Updated);
    assert_eq!(row.strategy, Some(MatchStrategy::ExactCode));
    assert_eq!(row.tender_id, Some(tender_id));
    assert_eq!(row.assignments_created, 1);

    let tender = store.tender(tender_id).await.expect("tender");
    assert_eq!(tender.title, "ISO 27001 Audit Acme");
    assert_eq!(tender.employees.len(), 1);
    assert_eq!(tender.employees[0].pseudonym.as_str(), "KBR");
    assert_eq!(tender.employees[0].role, roles::OPP_PARTNER);
    assert_eq!(
        tender.customer_link().map(|l| l.organisation_name.as_str()),
        Some("Acme GmbH")
    );
    assert_eq!(tender.notes.as_deref(), Some("ISO 27001 Audit"));
}

#[tokio::test]
async fn second_run_on_same_rows_writes_nothing() {
    let (store, _) = seeded_store().await;
    let reconciler = Reconciler::new(store.clone(), config());
    let mut second_row = acme_row();
    second_row.row_number = 5;
    second_row.sales_lead = CellValue::from_text("MUE");
    second_row.volume_euro = CellValue::from_text("120.000,00");
    second_row.offer_deadline = CellValue::from_text("15.03.2024");
    let rows = vec![acme_row(), second_row];

    let first = reconciler.run(&rows).await.expect("first run");
    assert_eq!(first.counters.updated, 2);
    let writes_after_first = store.committed_writes().await;

    let second = reconciler.run(&rows).await.expect("second run");
    assert_eq!(second.counters.updated, 0);
    assert_eq!(second.counters.no_op, 2);
    assert_eq!(second.counters.fields_written, 0);
    assert_eq!(second.counters.assignments_created, 0);
    assert_eq!(store.committed_writes().await, writes_after_first);
}

#[tokio::test]
async fn rows_hitting_one_tender_share_edges_within_a_run() {
    let (store, tender_id) = seeded_store().await;
    let reconciler = Reconciler::new(store.clone(), config());
    let mut again = acme_row();
    again.row_number = 9;

    let report = reconciler.run(&[acme_row(), again]).await.expect("run");
    assert_eq!(report.rows[0].outcome, RowOutcome::Updated);
    assert_eq!(report.rows[1].outcome, RowOutcome::NoOp);

    let tender = store.tender(tender_id).await.expect("tender");
    assert_eq!(tender.employees.len(), 1);
    assert_eq!(tender.organisations.len(), 1);
}

#[tokio::test]
async fn invalid_pseudonyms_never_resolve_to_employees() {
    let (store, tender_id) = seeded_store().await;
    store.insert_employee(pseudonym("THR"), None).await;
    let reconciler = Reconciler::new(store.clone(), config());

    let mut row = acme_row();
    row.opp_partner = CellValue::from_text("Threat?");
    row.sales_lead = CellValue::from_text("?");
    row.technical_lead = CellValue::from_text("kbr");

    let report = reconciler.run(&[row]).await.expect("run");
    assert_eq!(report.value_issues.rejected_pseudonyms, 3);
    assert_eq!(report.rows[0].assignments_created, 0);
    assert_eq!(report.rows[0].outcome, RowOutcome::Updated);

    let tender = store.tender(tender_id).await.expect("tender");
    assert!(tender.employees.is_empty());
}

#[tokio::test]
async fn unmatched_rows_are_reported_not_dropped() {
    let (store, _) = seeded_store().await;
    let reconciler = Reconciler::new(store, config());
    let mut row = ExternalRow::new("vertrieb-2024", 6);
    row.customer = CellValue::from_text("Gamma KG");
    row.status = CellValue::from_text("00 Warten auf Veröffentlichung");

    let report = reconciler.run(&[row]).await.expect("run");
    assert_eq!(report.counters.unmatched, 1);
    assert_eq!(report.rows_with(RowOutcome::Unmatched).count(), 1);
}

#[tokio::test]
async fn ambiguous_matches_are_skipped_unless_enabled() {
    let store = Arc::new(MemoryEntityStore::new());
    let first = store.insert_tender(Tender::new(Uuid::new_v4(), "Pentest")).await;
    let second = store.insert_tender(Tender::new(Uuid::new_v4(), "Audit")).await;
    for id in [first, second] {
        store
            .link_organisation(id, "Acme GmbH", CUSTOMER_ROLE)
            .await
            .expect("link");
    }
    let mut row = ExternalRow::new("vertrieb-2024", 4);
    row.customer = CellValue::from_text("Acme GmbH");
    row.tender_type = CellValue::from_text("RFP");

    let report = Reconciler::new(store.clone(), config())
        .run(&[row.clone()])
        .await
        .expect("run");
    assert_eq!(report.rows[0].outcome, RowOutcome::SkippedAmbiguous);
    assert_eq!(report.rows[0].tender_id, Some(first));
    assert_eq!(report.rows[0].other_candidates, vec![second]);
    assert_eq!(report.counters.ambiguous, 1);
    assert_eq!(store.committed_writes().await, 0);

    let permissive = EngineConfig {
        apply_ambiguous_matches: true,
        ..config()
    };
    let report = Reconciler::new(store.clone(), permissive)
        .run(&[row])
        .await
        .expect("run");
    assert_eq!(report.rows[0].outcome, RowOutcome::Updated);
    let tender = store.tender(first).await.expect("tender");
    assert_eq!(tender.tender_type.as_deref(), Some("RFP"));
}

#[tokio::test]
async fn failing_row_is_recorded_and_batch_continues() {
    let (store, tender_id) = seeded_store().await;
    let mut other = Tender::new(Uuid::new_v4(), "Pentest Beta");
    other.short_description = Some("786".into());
    let other_id = store.insert_tender(other).await;
    store.fail_mutations_for(tender_id).await;

    let mut beta = ExternalRow::new("vertrieb-2024", 5);
    beta.opportunity_id = CellValue::from_text("786");
    beta.tender_type = CellValue::from_text("RFP");

    let report = Reconciler::new(store.clone(), config())
        .run(&[acme_row(), beta])
        .await
        .expect("run completes");
    assert_eq!(report.rows[0].outcome, RowOutcome::Errored);
    assert!(report.rows[0].error.is_some());
    assert_eq!(report.rows[0].fingerprint.len(), 64);
    assert_eq!(report.rows[1].outcome, RowOutcome::Updated);
    assert_eq!(report.counters.errored, 1);

    let failed = store.tender(tender_id).await.expect("tender");
    assert!(failed.employees.is_empty());
    assert!(failed.organisations.is_empty());
    assert_eq!(
        store.tender(other_id).await.expect("tender").tender_type.as_deref(),
        Some("RFP")
    );
}

#[tokio::test]
async fn unavailable_store_aborts_the_run() {
    let (store, _) = seeded_store().await;
    store.set_unavailable(true).await;
    let err = Reconciler::new(store, config())
        .run(&[acme_row()])
        .await
        .expect_err("store offline");
    assert!(matches!(err, ReconcileError::StoreUnavailable(_)));
}

#[tokio::test]
async fn dry_run_reports_changes_without_writing() {
    let (store, tender_id) = seeded_store().await;
    let dry = EngineConfig {
        dry_run: true,
        ..config()
    };
    let report = Reconciler::new(store.clone(), dry)
        .run(&[acme_row()])
        .await
        .expect("run");
    assert!(report.dry_run);
    assert_eq!(report.rows[0].outcome, RowOutcome::Updated);
    assert!(!report.rows[0].changes.is_empty());
    assert_eq!(store.committed_writes().await, 0);
    assert!(store.tender(tender_id).await.expect("tender").employees.is_empty());
}

#[tokio::test]
async fn dedup_pass_restores_one_assignment_per_role_and_converges() {
    let store = Arc::new(MemoryEntityStore::new());
    let tender_id = store.insert_tender(Tender::new(Uuid::new_v4(), "Audit")).await;
    let mue = store.insert_employee(pseudonym("MUE"), None).await;
    let kbr = store.insert_employee(pseudonym("KBR"), None).await;
    for (employee, role) in [
        (&mue, "Lead Vertrieb"),
        (&mue, roles::SALES_LEAD),
        (&kbr, "OPP-Partner"),
        (&kbr, "OPP-Partner"),
    ] {
        store
            .assign_employee(tender_id, employee.id, role)
            .await
            .expect("assign");
    }
    let reconciler = Reconciler::new(store.clone(), config());

    let first = reconciler.run_dedup_pass().await.expect("first pass");
    assert_eq!(first.tenders_scanned, 1);
    assert_eq!(first.duplicate_groups, 2);
    assert_eq!(first.assignments_deleted, 2);
    assert_eq!(first.assignments_relabeled, 1);

    let tender = store.tender(tender_id).await.expect("tender");
    let mut roles_held = tender
        .employees
        .iter()
        .map(|a| (a.pseudonym.as_str().to_string(), a.role.clone()))
        .collect::<Vec<_>>();
    roles_held.sort();
    assert_eq!(
        roles_held,
        vec![
            ("KBR".to_string(), roles::OPP_PARTNER.to_string()),
            ("MUE".to_string(), roles::SALES_LEAD.to_string()),
        ]
    );

    let second = reconciler.run_dedup_pass().await.expect("second pass");
    assert_eq!(second.assignments_deleted, 0);
    assert_eq!(second.assignments_relabeled, 0);
    assert_eq!(second.tenders_changed, 0);
}

#[tokio::test]
async fn run_includes_dedup_summary_when_enabled() {
    let (store, tender_id) = seeded_store().await;
    let abc = store.insert_employee(pseudonym("ABC"), None).await;
    store
        .assign_employee(tender_id, abc.id, "Fachlicher Lead")
        .await
        .expect("assign");
    let report = Reconciler::new(store.clone(), EngineConfig::default())
        .run(&[])
        .await
        .expect("run");
    let dedup = report.dedup.expect("dedup summary");
    assert_eq!(dedup.assignments_relabeled, 1);
}

#[tokio::test]
async fn sample_export_reconciles_end_to_end() {
    let input = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sample-export/vertrieb-2024.csv");
    let workspace = tempdir().expect("tempdir");
    let (store, tender_id) = seeded_store().await;
    let config = EngineConfig {
        workspace_root: workspace.path().to_path_buf(),
        artifacts_dir: workspace.path().join("artifacts"),
        ..EngineConfig::default()
    };

    let run = Reconciler::new(store.clone(), config)
        .reconcile_input(&input, None)
        .await
        .expect("reconcile input");

    assert!(run.archived.absolute_path.exists());
    assert_eq!(run.report.counters.rows_seen, 3);
    assert_eq!(run.report.rows[0].tender_id, Some(tender_id));
    assert!(run.report.counters.unmatched >= 1);
    assert!(run.written.manifest_path.exists());
    assert!(run.written.reports_dir.join("run_brief.md").exists());

    let tender = store.tender(tender_id).await.expect("tender");
    assert_eq!(tender.status.as_deref(), Some("In Erstellung TNA"));
    assert_eq!(tender.volume_euro, Some(120_000.0));
    assert_eq!(tender.employees.len(), 1);
}
