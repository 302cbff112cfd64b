// Shared fixtures: a temp database, a recording handler, and "processes"
// (independent connection sets on the same file).
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_scheduler::{
    db, Dispatcher, Handler, HandlerRegistry, JobStore, PeriodicTask, SqliteLockManager,
    TaskDiscovery,
};
use serde_json::Value;
use tempfile::TempDir;

pub const LOCK_TTL: Duration = Duration::from_secs(30);
pub const RECORDER: &str = "recorder";

/// Remembers every call; `fail` returns an error and `panic` panics.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    tasks: Vec<PeriodicTask>,
}

impl Recorder {
    pub fn with_tasks(tasks: Vec<PeriodicTask>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            tasks,
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }

    /// First argument of every call, in call order.
    pub fn first_args(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .map(|(_, params)| params.first().cloned().unwrap_or(Value::Null))
            .collect()
    }
}

impl Handler for Recorder {
    fn name(&self) -> &str {
        RECORDER
    }

    fn actions(&self) -> &[&str] {
        &["record", "fail", "panic"]
    }

    fn call(&self, action: &str, params: &[Value]) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), params.to_vec()));
        match action {
            "fail" => anyhow::bail!("requested failure"),
            "panic" => panic!("requested panic"),
            _ => Ok(()),
        }
    }

    fn periodic_tasks(&self) -> Vec<PeriodicTask> {
        self.tasks.clone()
    }
}

pub fn registry(recorder: Arc<Recorder>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(recorder);
    Arc::new(registry)
}

pub struct TestDb {
    pub dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("cadence.db")
    }

    pub fn connection(&self) -> rusqlite::Connection {
        db::open(self.path(), Duration::from_secs(5)).unwrap()
    }

    /// A new scheduler "process" with its own connections.
    pub fn process(&self, handlers: Arc<HandlerRegistry>) -> TestProcess {
        let store = Arc::new(JobStore::new(self.connection()).unwrap());
        let locks = Arc::new(
            SqliteLockManager::new(self.connection())
                .unwrap()
                .with_poll_interval(Duration::from_millis(2))
                .with_acquire_timeout(Some(Duration::from_secs(10))),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            locks.clone(),
            handlers.clone(),
            LOCK_TTL,
        );
        let discovery = TaskDiscovery::new(Arc::clone(&store), locks.clone(), handlers, LOCK_TTL);
        TestProcess {
            store,
            locks,
            dispatcher,
            discovery,
        }
    }
}

pub struct TestProcess {
    pub store: Arc<JobStore>,
    pub locks: Arc<SqliteLockManager>,
    pub dispatcher: Dispatcher,
    pub discovery: TaskDiscovery,
}
