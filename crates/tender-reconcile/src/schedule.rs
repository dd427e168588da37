use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::driver::Reconciler;

/// Build (but do not start) a scheduler that runs the assignment dedup pass on
/// `dedup_cron`. Returns `None` when scheduling is disabled.
pub async fn maybe_build_dedup_scheduler(reconciler: Arc<Reconciler>) -> Result<Option<JobScheduler>> {
    if !reconciler.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = reconciler.config().dedup_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let reconciler = Arc::clone(&reconciler);
        Box::pin(async move {
            match reconciler.run_dedup_pass().await {
                Ok(summary) => info!(
                    deleted = summary.assignments_deleted,
                    relabeled = summary.assignments_relabeled,
                    "scheduled dedup pass finished"
                ),
                Err(err) => error!(%err, "scheduled dedup pass failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tender_storage::MemoryEntityStore;

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(MemoryEntityStore::new()),
            EngineConfig::default(),
        ));
        let sched = maybe_build_dedup_scheduler(reconciler).await.expect("build");
        assert!(sched.is_none());
    }
}
