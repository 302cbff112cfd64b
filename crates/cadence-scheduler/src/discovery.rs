use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    handler::HandlerResolver,
    lock::{LockGuard, LockManager, DISCOVERY_LOCK},
    schedule::CronExpr,
    store::JobStore,
};

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Declarations whose schedule matched the evaluation minute.
    pub due: usize,
    pub enqueued: usize,
    /// Due, but already enqueued for this minute by an earlier pass.
    pub skipped_duplicate: usize,
    /// Due, but refused by job validation.
    pub rejected: usize,
    /// Declarations skipped because their schedule does not parse.
    pub invalid_schedule: usize,
    /// Distinct expressions parsed during the pass.
    pub schedules_parsed: usize,
}

/// Turns periodic-task declarations into jobs.
pub struct TaskDiscovery {
    store: Arc<JobStore>,
    locks: Arc<dyn LockManager>,
    handlers: Arc<dyn HandlerResolver>,
    lock_ttl: Duration,
}

impl TaskDiscovery {
    pub fn new(
        store: Arc<JobStore>,
        locks: Arc<dyn LockManager>,
        handlers: Arc<dyn HandlerResolver>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            handlers,
            lock_ttl,
        }
    }

    /// Enqueue everything due at the current minute.
    pub fn run(&self) -> Result<DiscoveryReport> {
        self.run_at(Utc::now())
    }

    /// Enqueue everything due at the minute containing `now`.
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<DiscoveryReport> {
        let guard = LockGuard::acquire(self.locks.as_ref(), DISCOVERY_LOCK, self.lock_ttl)?;
        let report = self.scan(now)?;
        if let Err(e) = guard.release() {
            warn!(lock = DISCOVERY_LOCK, error = %e, "lock release failed, lease will expire");
        }

        info!(
            due = report.due,
            enqueued = report.enqueued,
            duplicates = report.skipped_duplicate,
            rejected = report.rejected,
            invalid = report.invalid_schedule,
            "task discovery finished"
        );
        Ok(report)
    }

    fn scan(&self, now: DateTime<Utc>) -> Result<DiscoveryReport> {
        let slot = now.format("%Y-%m-%dT%H:%MZ").to_string();
        let mut report = DiscoveryReport::default();
        // One parse per distinct expression per pass; `None` caches a parse failure.
        let mut schedules: HashMap<String, Option<CronExpr>> = HashMap::new();

        for handler in self.handlers.handlers() {
            for task in handler.periodic_tasks() {
                let cron = schedules
                    .entry(task.schedule.clone())
                    .or_insert_with(|| {
                        report.schedules_parsed += 1;
                        match task.schedule.parse::<CronExpr>() {
                            Ok(cron) => Some(cron),
                            Err(e) => {
                                error!(handler = %handler.name(), action = %task.action, "{e}");
                                None
                            }
                        }
                    });
                let Some(cron) = cron else {
                    report.invalid_schedule += 1;
                    continue;
                };
                if !cron.is_due(now) {
                    continue;
                }
                report.due += 1;
                debug!(handler = %handler.name(), action = %task.action, schedule = %cron, "periodic task due");

                let job = task.to_job(handler.name());
                let key = task.task_key(handler.name());
                match self.store.enqueue_periodic(&job, &key, &slot) {
                    Ok(Some(_)) => report.enqueued += 1,
                    Ok(None) => report.skipped_duplicate += 1,
                    Err(SchedulerError::Validation(reason)) => {
                        warn!(
                            handler = %handler.name(),
                            action = %task.action,
                            job_type = %task.job_type,
                            %reason,
                            "periodic task rejected"
                        );
                        report.rejected += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(report)
    }
}
