//! Reconciliation engine: normalizes external tender rows, matches them to
//! stored tenders, writes the conservative field updates and staff edges, and
//! deduplicates employee assignments.

use tender_storage::StoreError;
use thiserror::Error;

pub mod config;
pub mod dedup;
pub mod driver;
pub mod matcher;
pub mod normalize;
pub mod reconciler;
pub mod report;
pub mod schedule;

pub use config::EngineConfig;
pub use dedup::{plan_dedup, DedupSummary};
pub use driver::{InputRun, Reconciler};
pub use matcher::{match_row, CandidateSet, MatchOutcome, MatchStrategy, TenderMatch};
pub use normalize::{
    canonical_role, classify_date, classify_status, normalize_row, normalize_status, parse_amount,
    parse_date, NormalizedRow,
};
pub use reconciler::{reconcile, FieldConflict, Reconciliation};
pub use report::{report_recent_runs, write_run_report, RowOutcome, RowRecord, RunReport};
pub use schedule::maybe_build_dedup_scheduler;

pub const CRATE_NAME: &str = "tender-reconcile";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("entity store unavailable, run aborted: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("loading tender snapshot failed: {0}")]
    Snapshot(#[source] StoreError),
}

impl ReconcileError {
    pub(crate) fn snapshot(err: StoreError) -> Self {
        if err.is_batch_fatal() {
            Self::StoreUnavailable(err)
        } else {
            Self::Snapshot(err)
        }
    }
}
