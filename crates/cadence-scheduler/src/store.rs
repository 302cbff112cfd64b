use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{Job, JobStatus, NewJob},
};

const JOB_COLUMNS: &str =
    "id, type, name, action, parameters, priority, status, created_at, updated_at";

/// Fixed-width UTC timestamps so stored values compare correctly as text.
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(6)?;
    let status = status.parse::<JobStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into())
    })?;
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        name: row.get(2)?,
        action: row.get(3)?,
        parameters: row.get(4)?,
        priority: row.get(5)?,
        status,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn insert_job(conn: &Connection, job: &NewJob, now: &str) -> Result<i64> {
    let parameters = serde_json::to_string(&job.parameters)?;
    conn.execute(
        "INSERT INTO jobs (type, name, action, parameters, priority, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'new', ?6, ?6)",
        rusqlite::params![job.job_type, job.name, job.action, parameters, job.priority, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Durable job queue.
///
/// `claim_next` is only safe against other claimers while the caller holds
/// [`crate::lock::DISPATCH_LOCK`]; the lock is the exclusion mechanism.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Store a new job. Anything but a `model` job is refused before touching
    /// the database.
    pub fn enqueue(&self, job: &NewJob) -> Result<i64> {
        job.validate()?;
        let conn = self.conn.lock().expect("job store connection poisoned");
        let id = insert_job(&conn, job, &format_ts(Utc::now()))?;
        info!(job_id = id, name = %job.name, action = %job.action, priority = job.priority, "job enqueued");
        Ok(id)
    }

    /// Enqueue a periodic task at most once per `(task_key, slot)`.
    ///
    /// The run marker and the job are written in one transaction. Returns
    /// `None` when the slot was already taken.
    pub fn enqueue_periodic(&self, job: &NewJob, task_key: &str, slot: &str) -> Result<Option<i64>> {
        job.validate()?;
        let mut conn = self.conn.lock().expect("job store connection poisoned");
        let now = format_ts(Utc::now());
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let marked = tx.execute(
            "INSERT OR IGNORE INTO periodic_runs (task_key, slot, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![task_key, slot, now],
        )?;
        if marked == 0 {
            debug!(task_key, slot, "periodic task already enqueued for this slot");
            return Ok(None);
        }

        let id = insert_job(&tx, job, &now)?;
        tx.commit()?;
        info!(job_id = id, name = %job.name, action = %job.action, slot, "periodic job enqueued");
        Ok(Some(id))
    }

    /// Take the highest-priority `new` job (oldest first on ties) and mark it
    /// `processing`.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let sql = format!(
            "UPDATE jobs SET status = 'processing', updated_at = ?1
             WHERE id = (
                 SELECT id FROM jobs WHERE status = 'new'
                 ORDER BY priority DESC, id ASC LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        );
        let job = conn
            .query_row(&sql, [format_ts(Utc::now())], row_to_job)
            .optional()?;
        if let Some(ref job) = job {
            debug!(job_id = job.id, name = %job.name, action = %job.action, "job claimed");
        }
        Ok(job)
    }

    /// A finished job leaves no trace.
    pub fn complete(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        Ok(())
    }

    /// Mark a job `failed`. Failed jobs are never picked up again.
    pub fn fail(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let n = conn.execute(
            "UPDATE jobs SET status = 'failed', updated_at = ?1 WHERE id = ?2",
            rusqlite::params![format_ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id });
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn count(&self, status: JobStatus) -> Result<u64> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// All jobs in `status`, in claim order.
    pub fn list(&self, status: JobStatus) -> Result<Vec<Job>> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY priority DESC, id ASC"
        ))?;
        let jobs = stmt
            .query_map([status.as_str()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Delete `failed` jobs whose last transition is older than `cutoff`.
    pub fn purge_failed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let n = conn.execute(
            "DELETE FROM jobs WHERE status = 'failed' AND updated_at < ?1",
            [format_ts(cutoff)],
        )?;
        Ok(n as u64)
    }

    /// Forget periodic run markers created before `cutoff`.
    pub fn prune_run_markers(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let n = conn.execute(
            "DELETE FROM periodic_runs WHERE created_at < ?1",
            [format_ts(cutoff)],
        )?;
        Ok(n as u64)
    }

    /// Move `processing` jobs untouched since `cutoff` to `failed`.
    ///
    /// These are jobs whose dispatcher died mid-execution. They are not
    /// retried.
    pub fn fail_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().expect("job store connection poisoned");
        let n = conn.execute(
            "UPDATE jobs SET status = 'failed', updated_at = ?1
             WHERE status = 'processing' AND updated_at < ?2",
            rusqlite::params![format_ts(Utc::now()), format_ts(cutoff)],
        )?;
        if n > 0 {
            warn!(count = n, "stale processing jobs marked failed");
        }
        Ok(n as u64)
    }
}
