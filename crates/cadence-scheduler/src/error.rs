use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The job was refused before anything was written.
    #[error("Invalid job: {0}")]
    Validation(String),

    /// The scheduler was started with an unusable configuration.
    #[error(transparent)]
    Config(#[from] cadence_core::CadenceError),

    /// The provided cron expression could not be parsed.
    #[error("Invalid schedule `{expression}`: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// No handler is registered under the job's name.
    #[error("Handler not found: {name}")]
    HandlerNotFound { name: String },

    /// The handler exists but does not expose the requested action.
    #[error("Action not found: {handler}::{action}")]
    ActionNotFound { handler: String, action: String },

    /// The handler action failed (or panicked) while running a claimed job.
    #[error("Job {job_id} ({handler}::{action}) failed")]
    Execution {
        job_id: i64,
        handler: String,
        action: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Gave up waiting for a lock lease.
    #[error("Timed out after {waited_ms}ms waiting for lock `{name}`")]
    LockTimeout { name: String, waited_ms: u64 },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: i64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task could not be joined (panicked or was cancelled).
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl SchedulerError {
    /// True for errors raised by running a claimed job, as opposed to
    /// failures of the scheduler's own machinery.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            SchedulerError::Execution { .. }
                | SchedulerError::HandlerNotFound { .. }
                | SchedulerError::ActionNotFound { .. }
        )
    }

    /// Short error code string used in structured log events.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "STORE_ERROR",
            SchedulerError::Config(e) => e.code(),
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            SchedulerError::HandlerNotFound { .. } | SchedulerError::ActionNotFound { .. } => {
                "NOT_FOUND"
            }
            SchedulerError::Execution { .. } => "EXECUTION_ERROR",
            SchedulerError::LockTimeout { .. } => "LOCK_ERROR",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Runtime(_) => "RUNTIME_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
