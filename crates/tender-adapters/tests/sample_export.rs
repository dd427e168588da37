use std::path::PathBuf;

use tender_adapters::{load_external_rows, row_source_for_path, ColumnMap};
use tender_core::CellValue;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/sample-export")
        .join(name)
}

#[test]
fn sample_csv_export_yields_typed_data_rows() {
    let path = fixture("vertrieb-2024.csv");
    let source = row_source_for_path(&path, None).expect("csv source");
    let rows = load_external_rows(source.as_ref(), &ColumnMap::default()).expect("rows");

    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.source_id == "vertrieb-2024"));

    let first = &rows[0];
    assert_eq!(first.row_number, 4);
    assert_eq!(first.opportunity_id, CellValue::Text("785".into()));
    assert_eq!(first.opp_partner, CellValue::Text("KBR".into()));
    assert_eq!(first.question_deadline, CellValue::Sentinel("n/a".into()));

    let second = &rows[1];
    assert_eq!(second.sales_lead, CellValue::Text("Threat?".into()));
    assert_eq!(second.question_deadline, CellValue::Sentinel("tbd".into()));

    assert!(rows[2].opportunity_id.is_missing());
    assert_eq!(rows[2].customer, CellValue::Text("Gamma KG".into()));
}
