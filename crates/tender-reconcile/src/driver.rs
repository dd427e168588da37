use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tender_adapters::{load_external_rows, row_source_for_path, source_id_for_path, ColumnMap};
use tender_core::{EmployeeAssignment, ExternalRow, OrganisationLink, RowMutation, Tender};
use tender_storage::{ArchivedInput, EntityStore, InputArchive, StoreError};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedup::{duplicate_group_count, plan_dedup, DedupFailure, DedupSummary};
use crate::matcher::{CandidateSet, MatchOutcome};
use crate::normalize::{normalize_row, IssueKind};
use crate::reconciler::{reconcile, EmployeeDirectory, FieldConflict};
use crate::report::{
    outcome_histogram, write_run_report, RowOutcome, RowRecord, RunReport, RunReportBuilder,
    WrittenReport,
};
use crate::ReconcileError;

/// Tender state as this run has left it so far. Rows are matched against the
/// snapshot taken at run start, but reconciled against the ledger so that two
/// rows hitting the same tender never create the same edge twice.
#[derive(Debug)]
struct RunLedger {
    tenders: Vec<Tender>,
}

impl RunLedger {
    fn record(&mut self, index: usize, mutation: &RowMutation) {
        let Some(tender) = self.tenders.get_mut(index) else {
            return;
        };
        if let Err(err) = tender.apply_update(&mutation.update) {
            warn!(tender_id = %tender.id, %err, "ledger could not mirror field update");
        }
        for assignment in &mutation.new_assignments {
            tender.employees.push(EmployeeAssignment {
                id: Uuid::new_v4(),
                employee_id: assignment.employee_id,
                pseudonym: assignment.pseudonym.clone(),
                role: assignment.role.clone(),
            });
        }
        if let Some(link) = &mutation.new_organisation_link {
            tender.organisations.push(OrganisationLink {
                id: Uuid::new_v4(),
                organisation_id: Uuid::nil(),
                organisation_name: link.organisation_name.clone(),
                role: link.role.clone(),
            });
        }
    }
}

fn row_fingerprint(row: &ExternalRow) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(row).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Result of reconciling one spreadsheet export end to end.
#[derive(Debug, Clone)]
pub struct InputRun {
    pub archived: ArchivedInput,
    pub report: RunReport,
    pub written: WrittenReport,
}

/// Drives reconcile runs and dedup passes against an entity store.
pub struct Reconciler {
    store: Arc<dyn EntityStore>,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EntityStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reconcile a batch of rows. Each row commits in its own transaction; a
    /// row that fails is recorded and the run continues. Only an unavailable
    /// store aborts the run.
    pub async fn run(&self, rows: &[ExternalRow]) -> Result<RunReport, ReconcileError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "reconcile_run",
            %run_id,
            rows = rows.len(),
            dry_run = self.config.dry_run
        );
        self.run_rows(run_id, rows).instrument(span).await
    }

    async fn run_rows(&self, run_id: Uuid, rows: &[ExternalRow]) -> Result<RunReport, ReconcileError> {
        let started_at = Utc::now();
        let snapshot = self
            .store
            .load_snapshot()
            .await
            .map_err(ReconcileError::snapshot)?;
        info!(
            tenders = snapshot.tenders.len(),
            employees = snapshot.employees.len(),
            assignments = snapshot.assignment_count(),
            "loaded tender snapshot"
        );

        let directory = snapshot.employee_index();
        let candidates = CandidateSet::new(&snapshot.tenders);
        let mut ledger = RunLedger {
            tenders: snapshot.tenders.clone(),
        };
        let mut builder = RunReportBuilder::new(run_id, started_at, self.config.dry_run);
        let progress_every = self.config.progress_every.max(1);

        for (done, row) in rows.iter().enumerate() {
            let record = match self
                .reconcile_row(row, &candidates, &directory, &mut ledger)
                .await
            {
                Ok(record) => record,
                Err(err) => {
                    let counters = builder.counters();
                    warn!(
                        rows_done = done,
                        updated = counters.updated,
                        %err,
                        "entity store unavailable, aborting run"
                    );
                    return Err(ReconcileError::StoreUnavailable(err));
                }
            };
            builder.record(record);

            if (done + 1) % progress_every == 0 {
                let c = builder.counters();
                info!(
                    rows_done = done + 1,
                    total = rows.len(),
                    updated = c.updated,
                    unmatched = c.unmatched,
                    errored = c.errored,
                    "reconcile progress"
                );
            }
        }

        let dedup = if self.config.dedup_after_run {
            Some(self.dedup_snapshot_pass().await?)
        } else {
            None
        };
        let report = builder.finish(dedup);
        info!(
            outcomes = ?outcome_histogram(&report),
            conflicts = report.counters.conflicts,
            "reconcile run finished"
        );
        Ok(report)
    }

    /// Returns `Err` only for batch-fatal store failures.
    async fn reconcile_row(
        &self,
        row: &ExternalRow,
        candidates: &CandidateSet<'_>,
        directory: &EmployeeDirectory,
        ledger: &mut RunLedger,
    ) -> Result<RowRecord, StoreError> {
        let normalized = normalize_row(row, &self.config.pseudonyms);
        for issue in &normalized.issues {
            if issue.kind == IssueKind::RejectedPseudonym {
                warn!(row = %normalized.label, field = ?issue.field, raw = %issue.raw, "rejected pseudonym");
            } else {
                debug!(row = %normalized.label, field = ?issue.field, kind = ?issue.kind, raw = %issue.raw, "value issue");
            }
        }

        let mut record = RowRecord {
            source_id: normalized.source_id.clone(),
            row_number: normalized.row_number,
            label: normalized.label.clone(),
            fingerprint: row_fingerprint(row),
            outcome: RowOutcome::Unmatched,
            tender_id: None,
            strategy: None,
            other_candidates: Vec::new(),
            changes: Vec::new(),
            assignments_created: 0,
            organisation_linked: false,
            conflicts: Vec::new(),
            issues: normalized.issues.clone(),
            error: None,
        };

        let found = match candidates.match_row(&normalized) {
            MatchOutcome::Matched(found) => found,
            MatchOutcome::Unmatched => {
                debug!(row = %normalized.label, "no matching tender");
                return Ok(record);
            }
        };
        record.tender_id = Some(found.tender_id);
        record.strategy = Some(found.strategy);
        record.other_candidates = found.other_candidates.clone();

        if found.is_ambiguous() {
            warn!(
                row = %normalized.label,
                tender_id = %found.tender_id,
                strategy = found.strategy.as_str(),
                others = found.other_candidates.len(),
                "ambiguous match"
            );
            if !self.config.apply_ambiguous_matches {
                record.outcome = RowOutcome::SkippedAmbiguous;
                return Ok(record);
            }
        }

        let Some(current) = ledger.tenders.get(found.index) else {
            record.outcome = RowOutcome::Errored;
            record.error = Some(format!("tender {} missing from run ledger", found.tender_id));
            return Ok(record);
        };
        let reconciliation = reconcile(current, &normalized, directory);
        for issue in &reconciliation.issues {
            warn!(row = %normalized.label, field = ?issue.field, raw = %issue.raw, "unknown pseudonym");
        }
        record.issues.extend(reconciliation.issues.iter().cloned());
        record.conflicts = reconciliation.conflicts.clone();
        log_conflicts(&normalized.label, &record.conflicts);

        let mutation = RowMutation {
            tender_id: found.tender_id,
            update: reconciliation.update,
            new_assignments: reconciliation.new_assignments,
            new_organisation_link: reconciliation.new_organisation_link,
        };
        record.changes = mutation.update.iter().cloned().collect();
        record.assignments_created = mutation.new_assignments.len();
        record.organisation_linked = mutation.new_organisation_link.is_some();

        if mutation.is_empty() {
            record.outcome = RowOutcome::NoOp;
            return Ok(record);
        }
        if self.config.dry_run {
            ledger.record(found.index, &mutation);
            record.outcome = RowOutcome::Updated;
            return Ok(record);
        }

        match self.store.apply_row_mutation(&mutation).await {
            Ok(receipt) => {
                ledger.record(found.index, &mutation);
                record.outcome = if receipt.wrote_anything() {
                    RowOutcome::Updated
                } else {
                    RowOutcome::NoOp
                };
                Ok(record)
            }
            Err(err) if err.is_batch_fatal() => Err(err),
            Err(err) => {
                warn!(row = %normalized.label, fingerprint = %record.fingerprint, %err, "row failed, continuing");
                record.outcome = RowOutcome::Errored;
                record.error = Some(err.to_string());
                record.assignments_created = 0;
                record.organisation_linked = false;
                Ok(record)
            }
        }
    }

    /// Dedup employee assignments across every tender in the store.
    pub async fn run_dedup_pass(&self) -> Result<DedupSummary, ReconcileError> {
        let span = info_span!("dedup_pass", dry_run = self.config.dry_run);
        self.dedup_snapshot_pass().instrument(span).await
    }

    async fn dedup_snapshot_pass(&self) -> Result<DedupSummary, ReconcileError> {
        let snapshot = self
            .store
            .load_snapshot()
            .await
            .map_err(ReconcileError::snapshot)?;
        let mut summary = DedupSummary {
            dry_run: self.config.dry_run,
            ..DedupSummary::default()
        };

        for tender in &snapshot.tenders {
            summary.tenders_scanned += 1;
            let groups = duplicate_group_count(&tender.employees);
            let plan = plan_dedup(&tender.employees);
            if plan.is_noop() {
                continue;
            }
            if !self.config.dry_run {
                match self.store.apply_dedup_plan(tender.id, &plan).await {
                    Ok(()) => {}
                    Err(err) if err.is_batch_fatal() => {
                        warn!(tenders_scanned = summary.tenders_scanned, %err, "entity store unavailable, aborting dedup");
                        return Err(ReconcileError::StoreUnavailable(err));
                    }
                    Err(err) => {
                        warn!(tender_id = %tender.id, %err, "dedup failed for tender, continuing");
                        summary.failures.push(DedupFailure {
                            tender_id: tender.id,
                            error: err.to_string(),
                        });
                        continue;
                    }
                }
            }
            summary.tenders_changed += 1;
            summary.duplicate_groups += groups;
            summary.assignments_deleted += plan.delete.len();
            summary.assignments_relabeled += plan.relabel.len();
        }

        info!(
            tenders_scanned = summary.tenders_scanned,
            duplicate_groups = summary.duplicate_groups,
            deleted = summary.assignments_deleted,
            relabeled = summary.assignments_relabeled,
            failed = summary.failures.len(),
            "dedup pass finished"
        );
        Ok(summary)
    }

    /// Archive an export, read its rows, reconcile them and write the report.
    pub async fn reconcile_input(&self, input: &Path, sheet: Option<&str>) -> Result<InputRun> {
        let source_id = source_id_for_path(input);
        let archive = InputArchive::new(self.config.artifacts_dir.join("inputs"));
        let archived = archive
            .archive_file(Utc::now(), &source_id, input)
            .await
            .with_context(|| format!("archiving input {}", input.display()))?;
        info!(
            source_id = %source_id,
            path = %archived.relative_path.display(),
            deduplicated = archived.deduplicated,
            "archived input"
        );

        let columns = ColumnMap::from_workspace_root(&self.config.workspace_root)?;
        let source = row_source_for_path(input, sheet)
            .with_context(|| format!("unsupported input format {}", input.display()))?;
        let rows = load_external_rows(source.as_ref(), &columns)
            .with_context(|| format!("reading rows from {}", input.display()))?;
        info!(source_id = %source_id, rows = rows.len(), "loaded export rows");

        let report = self.run(&rows).await?;
        let written = write_run_report(&self.config.workspace_root, &report).await?;
        Ok(InputRun {
            archived,
            report,
            written,
        })
    }
}

fn log_conflicts(label: &str, conflicts: &[FieldConflict]) {
    for conflict in conflicts {
        info!(
            row = %label,
            field = %conflict.field,
            stored = %conflict.stored,
            incoming = %conflict.incoming,
            "kept stored value"
        );
    }
}
