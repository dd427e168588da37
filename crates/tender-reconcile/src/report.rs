//! Run reports: the immutable result of a reconcile run and its on-disk
//! artifacts (markdown brief, JSON, parquet snapshots with a hash manifest).

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tender_core::FieldChange;
use tokio::fs;
use uuid::Uuid;

use crate::dedup::DedupSummary;
use crate::matcher::MatchStrategy;
use crate::normalize::{IssueKind, ValueIssue};
use crate::reconciler::FieldConflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOutcome {
    Updated,
    NoOp,
    Unmatched,
    /// Several tenders matched and ambiguous matches are not applied.
    SkippedAmbiguous,
    Errored,
}

impl RowOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RowOutcome::Updated => "updated",
            RowOutcome::NoOp => "no_op",
            RowOutcome::Unmatched => "unmatched",
            RowOutcome::SkippedAmbiguous => "skipped_ambiguous",
            RowOutcome::Errored => "errored",
        }
    }
}

/// What happened to one input row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowRecord {
    pub source_id: String,
    pub row_number: usize,
    pub label: String,
    /// sha256 over the typed row; identifies the row in error reports.
    pub fingerprint: String,
    pub outcome: RowOutcome,
    pub tender_id: Option<Uuid>,
    pub strategy: Option<MatchStrategy>,
    pub other_candidates: Vec<Uuid>,
    pub changes: Vec<FieldChange>,
    pub assignments_created: usize,
    pub organisation_linked: bool,
    pub conflicts: Vec<FieldConflict>,
    pub issues: Vec<ValueIssue>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub rows_seen: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
    pub updated: usize,
    pub no_op: usize,
    pub skipped_ambiguous: usize,
    pub errored: usize,
    pub fields_written: usize,
    pub assignments_created: usize,
    pub organisation_links_created: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValueIssueCounters {
    pub unparseable_dates: usize,
    pub dates_out_of_range: usize,
    pub unparseable_numbers: usize,
    pub unmapped_statuses: usize,
    pub rejected_pseudonyms: usize,
    pub unknown_pseudonyms: usize,
}

impl ValueIssueCounters {
    fn count(&mut self, kind: IssueKind) {
        let slot = match kind {
            IssueKind::UnparseableDate => &mut self.unparseable_dates,
            IssueKind::DateOutOfRange => &mut self.dates_out_of_range,
            IssueKind::UnparseableNumber => &mut self.unparseable_numbers,
            IssueKind::UnmappedStatus => &mut self.unmapped_statuses,
            IssueKind::RejectedPseudonym => &mut self.rejected_pseudonyms,
            IssueKind::UnknownPseudonym => &mut self.unknown_pseudonyms,
        };
        *slot += 1;
    }
}

/// Everything a finished run produced. Built once by [`RunReportBuilder`] and
/// not changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub counters: RunCounters,
    pub value_issues: ValueIssueCounters,
    pub rows: Vec<RowRecord>,
    pub dedup: Option<DedupSummary>,
}

impl RunReport {
    pub fn rows_with(&self, outcome: RowOutcome) -> impl Iterator<Item = &RowRecord> {
        self.rows.iter().filter(move |r| r.outcome == outcome)
    }

    pub fn ambiguous_rows(&self) -> impl Iterator<Item = &RowRecord> {
        self.rows.iter().filter(|r| !r.other_candidates.is_empty())
    }

    pub fn conflicting_rows(&self) -> impl Iterator<Item = &RowRecord> {
        self.rows.iter().filter(|r| !r.conflicts.is_empty())
    }

    /// Rows carrying values a human should look at (unmapped statuses,
    /// rejected or unknown pseudonyms).
    pub fn review_rows(&self) -> impl Iterator<Item = &RowRecord> {
        self.rows
            .iter()
            .filter(|r| r.issues.iter().any(|i| needs_review(i.kind)))
    }
}

fn needs_review(kind: IssueKind) -> bool {
    matches!(
        kind,
        IssueKind::UnmappedStatus | IssueKind::RejectedPseudonym | IssueKind::UnknownPseudonym
    )
}

#[derive(Debug)]
pub struct RunReportBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dry_run: bool,
    counters: RunCounters,
    value_issues: ValueIssueCounters,
    rows: Vec<RowRecord>,
}

impl RunReportBuilder {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            dry_run,
            counters: RunCounters::default(),
            value_issues: ValueIssueCounters::default(),
            rows: Vec::new(),
        }
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    pub fn record(&mut self, row: RowRecord) {
        let c = &mut self.counters;
        c.rows_seen += 1;
        if row.tender_id.is_some() {
            c.matched += 1;
        }
        if !row.other_candidates.is_empty() {
            c.ambiguous += 1;
        }
        match row.outcome {
            RowOutcome::Updated => c.updated += 1,
            RowOutcome::NoOp => c.no_op += 1,
            RowOutcome::Unmatched => c.unmatched += 1,
            RowOutcome::SkippedAmbiguous => c.skipped_ambiguous += 1,
            RowOutcome::Errored => c.errored += 1,
        }
        if row.outcome == RowOutcome::Updated {
            c.fields_written += row.changes.len();
            c.assignments_created += row.assignments_created;
            c.organisation_links_created += usize::from(row.organisation_linked);
        }
        c.conflicts += row.conflicts.len();
        for issue in &row.issues {
            self.value_issues.count(issue.kind);
        }
        self.rows.push(row);
    }

    pub fn finish(self, dedup: Option<DedupSummary>) -> RunReport {
        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            counters: self.counters,
            value_issues: self.value_issues,
            rows: self.rows,
            dedup,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub reports_dir: PathBuf,
    pub manifest_path: PathBuf,
}

fn render_brief(report: &RunReport) -> String {
    let c = &report.counters;
    let v = &report.value_issues;
    let mut out = vec![
        "# Tender Reconciliation Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Dry run: {}", report.dry_run),
        String::new(),
        "## Rows".to_string(),
        format!("- seen: {}", c.rows_seen),
        format!("- matched: {} (ambiguous: {})", c.matched, c.ambiguous),
        format!("- updated: {}", c.updated),
        format!("- unchanged: {}", c.no_op),
        format!("- skipped (ambiguous): {}", c.skipped_ambiguous),
        format!("- unmatched: {}", c.unmatched),
        format!("- errored: {}", c.errored),
        format!(
            "- writes: {} fields, {} assignments, {} customer links",
            c.fields_written, c.assignments_created, c.organisation_links_created
        ),
        String::new(),
        "## Value Issues".to_string(),
        format!("- unparseable dates: {}", v.unparseable_dates),
        format!("- dates out of range: {}", v.dates_out_of_range),
        format!("- unparseable numbers: {}", v.unparseable_numbers),
        format!("- unmapped statuses: {}", v.unmapped_statuses),
        format!("- rejected pseudonyms: {}", v.rejected_pseudonyms),
        format!("- unknown pseudonyms: {}", v.unknown_pseudonyms),
    ];

    let mut section = |title: &str, lines: Vec<String>| {
        if lines.is_empty() {
            return;
        }
        out.push(String::new());
        out.push(format!("## {title}"));
        out.extend(lines);
    };

    section(
        "Unmatched",
        report
            .rows_with(RowOutcome::Unmatched)
            .map(|r| format!("- {}", r.label))
            .collect(),
    );
    section(
        "Ambiguous Matches",
        report
            .ambiguous_rows()
            .map(|r| {
                format!(
                    "- {} -> `{}` via {}; also: {}",
                    r.label,
                    r.tender_id.map(|id| id.to_string()).unwrap_or_default(),
                    r.strategy.map(MatchStrategy::as_str).unwrap_or("-"),
                    r.other_candidates
                        .iter()
                        .map(|id| format!("`{id}`"))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
            .collect(),
    );
    section(
        "Conflicts",
        report
            .conflicting_rows()
            .flat_map(|r| {
                r.conflicts.iter().map(move |conflict| {
                    format!(
                        "- {} {}: stored {:?}, incoming {:?}",
                        r.label, conflict.field, conflict.stored, conflict.incoming
                    )
                })
            })
            .collect(),
    );
    section(
        "Needs Review",
        report
            .review_rows()
            .flat_map(|r| {
                r.issues
                    .iter()
                    .filter(|i| needs_review(i.kind))
                    .map(move |i| format!("- {} {:?} {:?}: {:?}", r.label, i.field, i.kind, i.raw))
            })
            .collect(),
    );
    section(
        "Errors",
        report
            .rows_with(RowOutcome::Errored)
            .map(|r| {
                format!(
                    "- {} [{}]: {}",
                    r.label,
                    &r.fingerprint[..r.fingerprint.len().min(12)],
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect(),
    );

    if let Some(dedup) = &report.dedup {
        out.push(String::new());
        out.push("## Assignment Dedup".to_string());
        out.push(format!("- tenders scanned: {}", dedup.tenders_scanned));
        out.push(format!("- duplicate groups: {}", dedup.duplicate_groups));
        out.push(format!("- deleted: {}", dedup.assignments_deleted));
        out.push(format!("- relabeled: {}", dedup.assignments_relabeled));
        out.push(format!("- failed tenders: {}", dedup.failures.len()));
    }

    out.push(String::new());
    out.join("\n")
}

/// Write `reports/<run_id>/` under `workspace_root`.
pub async fn write_run_report(workspace_root: &Path, report: &RunReport) -> Result<WrittenReport> {
    let reports_dir = workspace_root
        .join("reports")
        .join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("run_brief.md"), render_brief(report))
        .await
        .context("writing run_brief.md")?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(reports_dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let outcomes_path = snapshot_dir.join("row_outcomes.parquet");
    let changes_path = snapshot_dir.join("field_changes.parquet");
    write_row_outcomes_parquet(&outcomes_path, &report.rows)?;
    write_parquet(&changes_path, field_changes_batch(&report.rows, report.dry_run)?)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("row_outcomes", &reports_dir, &outcomes_path)?,
            manifest_entry("field_changes", &reports_dir, &changes_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(WrittenReport {
        reports_dir,
        manifest_path,
    })
}

/// Markdown digest of the most recent runs found under `workspace_root/reports`.
pub fn report_recent_runs(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_report.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Reconciliation Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join("run_report.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        let counter = |name: &str| {
            value
                .get("counters")
                .and_then(|c| c.get(name))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let dry_run = value.get("dry_run").and_then(|v| v.as_bool()).unwrap_or(false);
        let finished = value
            .get("finished_at")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`{}", if dry_run { " (dry run)" } else { "" }));
        lines.push(format!("- finished: {finished}"));
        lines.push(format!(
            "- rows: {} seen, {} updated, {} unchanged, {} unmatched, {} ambiguous, {} errored",
            counter("rows_seen"),
            counter("updated"),
            counter("no_op"),
            counter("unmatched"),
            counter("ambiguous"),
            counter("errored")
        ));
        lines.push(format!("- conflicts: {}", counter("conflicts")));
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(format!("- brief: `{}`", dir.path().join("run_brief.md").display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_row_outcomes_parquet(path: &Path, rows: &[RowRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("row_number", DataType::UInt64, false),
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("outcome", DataType::Utf8, false),
        ArrowField::new("tender_id", DataType::Utf8, true),
        ArrowField::new("strategy", DataType::Utf8, true),
        ArrowField::new("ambiguous", DataType::Boolean, false),
        ArrowField::new("fields_changed", DataType::UInt32, false),
        ArrowField::new("assignments_created", DataType::UInt32, false),
        ArrowField::new("organisation_linked", DataType::Boolean, false),
        ArrowField::new("error", DataType::Utf8, true),
    ]));

    let source_ids = StringArray::from(rows.iter().map(|r| Some(r.source_id.as_str())).collect::<Vec<_>>());
    let row_numbers = UInt64Array::from(rows.iter().map(|r| r.row_number as u64).collect::<Vec<_>>());
    let fingerprints = StringArray::from(rows.iter().map(|r| Some(r.fingerprint.as_str())).collect::<Vec<_>>());
    let outcomes = StringArray::from(rows.iter().map(|r| Some(r.outcome.as_str())).collect::<Vec<_>>());
    let tender_ids = StringArray::from(
        rows.iter()
            .map(|r| r.tender_id.map(|id| id.to_string()))
            .collect::<Vec<_>>(),
    );
    let strategies = StringArray::from(
        rows.iter()
            .map(|r| r.strategy.map(MatchStrategy::as_str))
            .collect::<Vec<_>>(),
    );
    let ambiguous = BooleanArray::from(
        rows.iter()
            .map(|r| !r.other_candidates.is_empty())
            .collect::<Vec<_>>(),
    );
    let fields_changed = UInt32Array::from(rows.iter().map(|r| r.changes.len() as u32).collect::<Vec<_>>());
    let assignments = UInt32Array::from(
        rows.iter()
            .map(|r| r.assignments_created as u32)
            .collect::<Vec<_>>(),
    );
    let linked = BooleanArray::from(rows.iter().map(|r| r.organisation_linked).collect::<Vec<_>>());
    let errors = StringArray::from(rows.iter().map(|r| r.error.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(row_numbers),
            Arc::new(fingerprints),
            Arc::new(outcomes),
            Arc::new(tender_ids),
            Arc::new(strategies),
            Arc::new(ambiguous),
            Arc::new(fields_changed),
            Arc::new(assignments),
            Arc::new(linked),
            Arc::new(errors),
        ],
    )
    .context("building row_outcomes record batch")?;
    write_parquet(path, batch)
}

/// One line per planned field change. `applied` stays false in dry runs,
/// where updated rows were only computed.
fn field_changes_batch(rows: &[RowRecord], dry_run: bool) -> Result<RecordBatch> {
    let changes = rows
        .iter()
        .flat_map(|r| r.changes.iter().map(move |change| (r, change)))
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("tender_id", DataType::Utf8, true),
        ArrowField::new("field", DataType::Utf8, false),
        ArrowField::new("previous", DataType::Utf8, true),
        ArrowField::new("next", DataType::Utf8, false),
        ArrowField::new("applied", DataType::Boolean, false),
    ]));

    let fingerprints = StringArray::from(
        changes
            .iter()
            .map(|(r, _)| Some(r.fingerprint.as_str()))
            .collect::<Vec<_>>(),
    );
    let tender_ids = StringArray::from(
        changes
            .iter()
            .map(|(r, _)| r.tender_id.map(|id| id.to_string()))
            .collect::<Vec<_>>(),
    );
    let fields = StringArray::from(
        changes
            .iter()
            .map(|(_, c)| Some(c.field.column()))
            .collect::<Vec<_>>(),
    );
    let previous = StringArray::from(
        changes
            .iter()
            .map(|(_, c)| c.previous.as_ref().map(ToString::to_string))
            .collect::<Vec<_>>(),
    );
    let next = StringArray::from(
        changes
            .iter()
            .map(|(_, c)| Some(c.next.to_string()))
            .collect::<Vec<_>>(),
    );
    let applied = BooleanArray::from(
        changes
            .iter()
            .map(|(r, _)| !dry_run && r.outcome == RowOutcome::Updated)
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(fingerprints),
            Arc::new(tender_ids),
            Arc::new(fields),
            Arc::new(previous),
            Arc::new(next),
            Arc::new(applied),
        ],
    )
    .context("building field_changes record batch")
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Count rows per outcome, for log lines.
pub fn outcome_histogram(report: &RunReport) -> BTreeMap<&'static str, usize> {
    let mut histogram = BTreeMap::new();
    for row in &report.rows {
        *histogram.entry(row.outcome.as_str()).or_default() += 1;
    }
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tender_core::{FieldValue, RowField, TenderField};

    fn record(outcome: RowOutcome) -> RowRecord {
        RowRecord {
            source_id: "vertrieb-2024".into(),
            row_number: 4,
            label: "vertrieb-2024#4 (opp 785)".into(),
            fingerprint: "ab".repeat(32),
            outcome,
            tender_id: None,
            strategy: None,
            other_candidates: Vec::new(),
            changes: Vec::new(),
            assignments_created: 0,
            organisation_linked: false,
            conflicts: Vec::new(),
            issues: Vec::new(),
            error: None,
        }
    }

    fn sample_report() -> RunReport {
        let mut builder = RunReportBuilder::new(Uuid::new_v4(), Utc::now(), false);

        let mut updated = record(RowOutcome::Updated);
        updated.tender_id = Some(Uuid::new_v4());
        updated.strategy = Some(MatchStrategy::ExactCode);
        updated.changes = vec![FieldChange {
            field: TenderField::Notes,
            previous: None,
            next: FieldValue::Text("ISO 27001 Audit".into()),
        }];
        updated.assignments_created = 1;
        updated.organisation_linked = true;
        updated.issues = vec![ValueIssue {
            field: RowField::Status,
            kind: IssueKind::UnmappedStatus,
            raw: "Rückfrage".into(),
        }];
        builder.record(updated);

        let mut ambiguous = record(RowOutcome::SkippedAmbiguous);
        ambiguous.tender_id = Some(Uuid::new_v4());
        ambiguous.strategy = Some(MatchStrategy::OrganisationName);
        ambiguous.other_candidates = vec![Uuid::new_v4()];
        builder.record(ambiguous);

        builder.record(record(RowOutcome::Unmatched));
        let mut errored = record(RowOutcome::Errored);
        errored.error = Some("constraint violated".into());
        builder.record(errored);

        builder.finish(None)
    }

    #[test]
    fn builder_counts_outcomes() {
        let report = sample_report();
        let c = &report.counters;
        assert_eq!(c.rows_seen, 4);
        assert_eq!(c.matched, 2);
        assert_eq!(c.ambiguous, 1);
        assert_eq!(c.updated, 1);
        assert_eq!(c.skipped_ambiguous, 1);
        assert_eq!(c.unmatched, 1);
        assert_eq!(c.errored, 1);
        assert_eq!(c.fields_written, 1);
        assert_eq!(c.assignments_created, 1);
        assert_eq!(c.organisation_links_created, 1);
        assert_eq!(report.value_issues.unmapped_statuses, 1);
        assert_eq!(report.review_rows().count(), 1);
        assert_eq!(outcome_histogram(&report).get("errored"), Some(&1));
    }

    #[test]
    fn field_changes_are_not_applied_in_dry_runs() {
        use arrow_array::cast::AsArray;

        let report = sample_report();
        let wet = field_changes_batch(&report.rows, false).expect("batch");
        let applied = wet.column_by_name("applied").expect("applied").as_boolean();
        assert_eq!(applied.len(), 1);
        assert!(applied.value(0));

        let dry = field_changes_batch(&report.rows, true).expect("batch");
        let applied = dry.column_by_name("applied").expect("applied").as_boolean();
        assert_eq!(applied.len(), 1);
        assert!(!applied.value(0));
    }

    #[tokio::test]
    async fn report_artifacts_are_written_with_manifest() {
        let dir = tempdir().expect("tempdir");
        let report = sample_report();
        let written = write_run_report(dir.path(), &report).await.expect("write report");

        assert!(written.reports_dir.join("run_brief.md").exists());
        assert!(written.reports_dir.join("run_report.json").exists());
        assert!(written.reports_dir.join("snapshots/row_outcomes.parquet").exists());
        assert!(written.reports_dir.join("snapshots/field_changes.parquet").exists());

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(&written.manifest_path).expect("manifest"),
        )
        .expect("manifest json");
        let files = manifest["files"].as_array().expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["sha256"].as_str().map(str::len), Some(64));

        let brief = std::fs::read_to_string(written.reports_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("## Ambiguous Matches"));
        assert!(brief.contains("## Needs Review"));
        assert!(brief.contains("constraint violated"));

        let digest = report_recent_runs(5, Some(dir.path().to_path_buf())).expect("digest");
        assert!(digest.contains(&report.run_id.to_string()));
        assert!(digest.contains("4 seen, 1 updated"));
    }
}
