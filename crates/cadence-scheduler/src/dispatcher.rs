use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    handler::HandlerResolver,
    lock::{LockGuard, LockManager, DISPATCH_LOCK},
    store::JobStore,
    types::Job,
};

/// Claims jobs one at a time and runs them.
///
/// Only the claim happens under [`DISPATCH_LOCK`]. Execution is unlocked, so
/// another process can claim the next job while a slow handler runs here.
pub struct Dispatcher {
    store: Arc<JobStore>,
    locks: Arc<dyn LockManager>,
    handlers: Arc<dyn HandlerResolver>,
    lock_ttl: Duration,
}

impl Dispatcher {
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

    /// Claim and run the next eligible job. Returns `false` when the queue
    /// has nothing in `new`.
    ///
    /// A job whose handler fails, or whose completion cannot be recorded, is
    /// marked `failed` and the error is returned; nothing is retried here.
    pub fn run_job(&self) -> Result<bool> {
        let guard = LockGuard::acquire(self.locks.as_ref(), DISPATCH_LOCK, self.lock_ttl)?;
        let claimed = self.store.claim_next();
        if let Err(e) = guard.release() {
            warn!(lock = DISPATCH_LOCK, error = %e, "lock release failed, lease will expire");
        }
        let Some(job) = claimed? else {
            return Ok(false);
        };

        info!(job_id = job.id, name = %job.name, action = %job.action, priority = job.priority, "running job");
        let started = Instant::now();

        match self
            .execute(&job)
            .and_then(|()| self.store.complete(job.id))
        {
            Ok(()) => {
                info!(
                    job_id = job.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
                Ok(true)
            }
            Err(e) => {
                if let Err(store_err) = self.store.fail(job.id) {
                    error!(job_id = job.id, error = %store_err, "could not mark job failed");
                }
                error!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    name = %job.name,
                    action = %job.action,
                    parameters = %job.parameters,
                    priority = job.priority,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    code = e.code(),
                    error = %e,
                    chain = %error_chain(&e),
                    details = ?e,
                    "job failed"
                );
                Err(e)
            }
        }
    }

    fn execute(&self, job: &Job) -> Result<()> {
        let handler = self
            .handlers
            .resolve(&job.name)
            .ok_or_else(|| SchedulerError::HandlerNotFound {
                name: job.name.clone(),
            })?;
        if !handler.actions().contains(&job.action.as_str()) {
            return Err(SchedulerError::ActionNotFound {
                handler: job.name.clone(),
                action: job.action.clone(),
            });
        }

        let params = job
            .decode_parameters()
            .map_err(|e| execution_error(job, Box::new(e)))?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&job.action, &params))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(execution_error(job, e.into())),
            Err(payload) => Err(execution_error(
                job,
                format!("handler panicked: {}", panic_message(payload.as_ref())).into(),
            )),
        }
    }
}

fn execution_error(
    job: &Job,
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> SchedulerError {
    SchedulerError::Execution {
        job_id: job.id,
        handler: job.name.clone(),
        action: job.action.clone(),
        source,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// `outer: cause: root cause` for a log line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
