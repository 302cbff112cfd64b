use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::types::{priority, NewJob, MODEL_JOB_TYPE};

/// A periodic-task declaration attached to one of a handler's actions.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicTask {
    pub action: String,
    /// Five-field cron expression.
    pub schedule: String,
    pub priority: i64,
    /// Static arguments passed on every run.
    pub parameters: Vec<Value>,
    /// Job type to enqueue; anything but `model` is rejected at enqueue.
    pub job_type: String,
}

impl PeriodicTask {
    pub fn new(action: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            schedule: schedule.into(),
            priority: priority::NORMAL,
            parameters: Vec::new(),
            job_type: MODEL_JOB_TYPE.to_string(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// The job this declaration produces when due.
    pub fn to_job(&self, handler: &str) -> NewJob {
        NewJob {
            job_type: self.job_type.clone(),
            name: handler.to_string(),
            action: self.action.clone(),
            parameters: self.parameters.clone(),
            priority: self.priority,
        }
    }

    /// Identity used to enqueue this declaration at most once per due minute.
    pub fn task_key(&self, handler: &str) -> String {
        let parameters = Value::Array(self.parameters.clone());
        format!("{handler}:{}:{}:{parameters}", self.action, self.schedule)
    }
}

/// A named target for jobs, exposing actions invoked by name.
///
/// The dispatcher checks [`Handler::actions`] before calling, so `call` is
/// only ever reached with a listed action.
pub trait Handler: Send + Sync {
    /// Name stored in the job's `name` column.
    fn name(&self) -> &str;

    /// Actions jobs may invoke.
    fn actions(&self) -> &[&str];

    /// Run `action` with the job's decoded arguments.
    fn call(&self, action: &str, params: &[Value]) -> anyhow::Result<()>;

    /// Periodic tasks this handler declares. Re-read on every discovery pass.
    fn periodic_tasks(&self) -> Vec<PeriodicTask> {
        Vec::new()
    }
}

/// Looks handlers up by name when a job runs.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Handler>>;

    /// Every registered handler, in name order.
    fn handlers(&self) -> Vec<Arc<dyn Handler>>;
}

/// Startup-time registry of handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        debug!(handler = %name, actions = handler.actions().len(), "handler registered");
        self.handlers.insert(name, handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers.values().cloned().collect()
    }
}

/// Decode argument `index` for a handler action.
pub fn arg<T: DeserializeOwned>(params: &[Value], index: usize) -> anyhow::Result<T> {
    let value = params
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("missing argument {index}"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| anyhow::anyhow!("argument {index} has the wrong shape: {e}"))
}
