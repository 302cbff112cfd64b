use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_core::CadenceConfig;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::{
    db,
    discovery::{DiscoveryReport, TaskDiscovery},
    dispatcher::Dispatcher,
    error::{Result, SchedulerError},
    handler::HandlerResolver,
    lock::{LockManager, SqliteLockManager},
    store::JobStore,
};

/// How one bounded scheduler run behaves.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Total wall-clock length of [`SchedulerEngine::run`].
    pub window: Duration,
    /// Sleep after every dispatch attempt.
    pub tick: Duration,
    /// Run one discovery pass before dispatching.
    pub discover: bool,
    /// Fail `processing` jobs older than this before starting.
    pub stale_processing: Option<Duration>,
}

impl EngineOptions {
    pub fn from_config(config: &CadenceConfig) -> Self {
        Self {
            window: config.scheduler.window(),
            tick: config.scheduler.tick(),
            discover: config.scheduler.discover_on_start,
            stale_processing: config.scheduler.stale_processing(),
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: u64,
    /// Dispatch attempts that found nothing to claim.
    pub idle_polls: u64,
    pub discovery: Option<DiscoveryReport>,
    pub elapsed: Duration,
}

/// Process driver: optional discovery, then dispatch until the window closes.
///
/// The caller is expected to exit after [`SchedulerEngine::run`] returns and
/// be relaunched by a supervisor or timer.
pub struct SchedulerEngine {
    store: Arc<JobStore>,
    dispatcher: Arc<Dispatcher>,
    discovery: Arc<TaskDiscovery>,
    options: EngineOptions,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<JobStore>,
        locks: Arc<dyn LockManager>,
        handlers: Arc<dyn HandlerResolver>,
        lock_ttl: Duration,
        options: EngineOptions,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&handlers),
            lock_ttl,
        );
        let discovery = TaskDiscovery::new(Arc::clone(&store), locks, handlers, lock_ttl);
        Self {
            store,
            dispatcher: Arc::new(dispatcher),
            discovery: Arc::new(discovery),
            options,
        }
    }

    /// Wait for the configured database, then wire the store, lock manager,
    /// dispatcher and discovery onto their own connections.
    ///
    /// `build_handlers` receives the shared store so handlers that touch the
    /// queue themselves can be registered.
    pub async fn connect<F>(config: &CadenceConfig, build_handlers: F) -> Result<Self>
    where
        F: FnOnce(&Arc<JobStore>) -> Arc<dyn HandlerResolver>,
    {
        let database = config.require_database()?;
        let busy_timeout = Duration::from_millis(database.busy_timeout_ms);
        let path = PathBuf::from(&database.path);

        let conn = wait_for_store(path.clone(), busy_timeout, config.scheduler.connect_retry()).await;
        let store = Arc::new(JobStore::new(conn)?);
        let handlers = build_handlers(&store);

        let lock_conn = db::open(&path, busy_timeout)?;
        let locks = SqliteLockManager::new(lock_conn)?
            .with_poll_interval(config.lock.poll_interval())
            .with_acquire_timeout(config.lock.acquire_timeout());

        Ok(Self::new(
            store,
            Arc::new(locks),
            handlers,
            config.lock.ttl(),
            EngineOptions::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Run for `options.window`. An error from a job ends the run.
    pub async fn run(self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        info!(
            window_secs = self.options.window.as_secs(),
            discover = self.options.discover,
            "scheduler engine started"
        );

        let stale_cutoff = self
            .options
            .stale_processing
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| Utc::now().checked_sub_signed(age));
        if let Some(cutoff) = stale_cutoff {
            let store = Arc::clone(&self.store);
            blocking(move || store.fail_stale_processing(cutoff)).await?;
        }

        if self.options.discover {
            let discovery = Arc::clone(&self.discovery);
            summary.discovery = Some(blocking(move || discovery.run()).await?);
        }

        while started.elapsed() < self.options.window {
            let dispatcher = Arc::clone(&self.dispatcher);
            if blocking(move || dispatcher.run_job()).await? {
                summary.processed += 1;
            } else {
                summary.idle_polls += 1;
            }

            let remaining = self.options.window.saturating_sub(started.elapsed());
            tokio::time::sleep(self.options.tick.min(remaining)).await;
        }

        summary.elapsed = started.elapsed();
        info!(
            processed = summary.processed,
            idle_polls = summary.idle_polls,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "scheduler window closed"
        );
        Ok(summary)
    }
}

/// Block until the database at `path` answers, retrying every `retry`.
///
/// Never gives up: the scheduler may start before its storage is mounted.
/// The returned connection has the schema applied.
pub async fn wait_for_store(path: PathBuf, busy_timeout: Duration, retry: Duration) -> Connection {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let candidate = path.clone();
        let probe = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = db::open(&candidate, busy_timeout)?;
            db::ping(&conn)?;
            db::init_db(&conn)?;
            Ok(conn)
        })
        .await;

        match probe {
            Ok(Ok(conn)) => {
                info!(path = %path.display(), attempt, "job store reachable");
                return conn;
            }
            Ok(Err(e)) => {
                warn!(path = %path.display(), attempt, retry_secs = retry.as_secs(), error = %e, "job store unreachable, retrying");
            }
            Err(e) => {
                warn!(path = %path.display(), attempt, error = %e, "store probe task failed, retrying");
            }
        }
        tokio::time::sleep(retry).await;
    }
}

/// Run blocking store or handler work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SchedulerError::Runtime(e.to_string()))?
}
