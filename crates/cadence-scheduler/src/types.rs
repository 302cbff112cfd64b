use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SchedulerError};

/// The only job type the dispatcher knows how to run.
pub const MODEL_JOB_TYPE: &str = "model";

/// Named priority bands. Any `i64` is a legal priority; higher runs first.
pub mod priority {
    pub const MINIMUM: i64 = -255;
    pub const LOW: i64 = -100;
    pub const NORMAL: i64 = 0;
    pub const MEDIUM: i64 = 100;
    pub const HIGH: i64 = 255;
}

/// Lifecycle state of a stored job. Successful jobs are deleted, so there is
/// no `done` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    New,
    /// Claimed by a dispatcher and running.
    Processing,
    /// The handler returned an error. Terminal.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Processing => "processing",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobStatus::New),
            "processing" => Ok(JobStatus::Processing),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned, monotonically increasing.
    pub id: i64,
    /// Handler category, always `model` for stored rows.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Handler name.
    pub name: String,
    /// Action invoked on the handler.
    pub action: String,
    /// JSON-encoded argument list, decoded just before invocation.
    pub parameters: String,
    pub priority: i64,
    pub status: JobStatus,
    /// ISO-8601 timestamp of creation.
    pub created_at: String,
    /// ISO-8601 timestamp of the last status transition.
    pub updated_at: String,
}

impl Job {
    /// Decode the stored argument list.
    pub fn decode_parameters(&self) -> Result<Vec<Value>> {
        Ok(serde_json::from_str(&self.parameters)?)
    }
}

/// A job that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub priority: i64,
}

impl NewJob {
    /// A `model` job at normal priority with no arguments.
    pub fn model(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            job_type: MODEL_JOB_TYPE.to_string(),
            name: name.into(),
            action: action.into(),
            parameters: Vec::new(),
            priority: priority::NORMAL,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Refuse anything the dispatcher could never run.
    pub fn validate(&self) -> Result<()> {
        if self.job_type != MODEL_JOB_TYPE {
            return Err(SchedulerError::Validation(format!(
                "unsupported job type `{}` (only `{MODEL_JOB_TYPE}` is allowed)",
                self.job_type
            )));
        }
        if self.name.is_empty() || self.action.is_empty() {
            return Err(SchedulerError::Validation(
                "job name and action must not be empty".into(),
            ));
        }
        Ok(())
    }
}
