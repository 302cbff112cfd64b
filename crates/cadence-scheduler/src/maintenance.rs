//! Built-in housekeeping handler.
//!
//! Failed jobs are terminal and would otherwise pile up forever, and every
//! periodic enqueue leaves a run marker behind. The `scheduler::purge`
//! action deletes both once they are old enough.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    handler::{arg, Handler, PeriodicTask},
    store::JobStore,
    types::priority,
};

pub const MAINTENANCE_HANDLER: &str = "scheduler";
pub const PURGE_ACTION: &str = "purge";

/// Markers only matter within their due minute; a day is plenty.
const RUN_MARKER_RETENTION_HOURS: i64 = 24;

pub struct MaintenanceHandler {
    store: Arc<JobStore>,
    schedule: String,
    retention_days: u64,
}

impl MaintenanceHandler {
    pub fn new(store: Arc<JobStore>, schedule: impl Into<String>, retention_days: u64) -> Self {
        Self {
            store,
            schedule: schedule.into(),
            retention_days,
        }
    }

    fn purge(&self, retention_days: u64) -> anyhow::Result<()> {
        let now = Utc::now();
        let failed_cutoff = i64::try_from(retention_days)
            .ok()
            .and_then(Duration::try_days)
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| anyhow::anyhow!("retention of {retention_days} days is out of range"))?;
        let deleted = self.store.purge_failed(failed_cutoff)?;
        let markers = self
            .store
            .prune_run_markers(now - Duration::hours(RUN_MARKER_RETENTION_HOURS))?;

        info!(
            retention_days,
            failed_deleted = deleted,
            markers_deleted = markers,
            "maintenance purge finished"
        );
        Ok(())
    }
}

impl Handler for MaintenanceHandler {
    fn name(&self) -> &str {
        MAINTENANCE_HANDLER
    }

    fn actions(&self) -> &[&str] {
        &[PURGE_ACTION]
    }

    fn call(&self, action: &str, params: &[Value]) -> anyhow::Result<()> {
        match action {
            PURGE_ACTION => {
                let retention_days = if params.is_empty() {
                    self.retention_days
                } else {
                    arg(params, 0)?
                };
                self.purge(retention_days)
            }
            other => anyhow::bail!("unknown maintenance action `{other}`"),
        }
    }

    fn periodic_tasks(&self) -> Vec<PeriodicTask> {
        vec![PeriodicTask::new(PURGE_ACTION, self.schedule.clone())
            .with_priority(priority::LOW)
            .with_parameters(vec![json!(self.retention_days)])]
    }
}
