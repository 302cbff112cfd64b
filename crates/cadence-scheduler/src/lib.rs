//! `cadence-scheduler` — SQLite-backed job queue with cross-process locking.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table shared by any number of scheduler
//! processes. Each process runs a [`engine::SchedulerEngine`] for a bounded
//! window: it enqueues due periodic tasks ([`discovery::TaskDiscovery`]),
//! then repeatedly claims and runs one job at a time
//! ([`dispatcher::Dispatcher`]).
//!
//! Claims are serialized across processes by a lease-based named lock
//! ([`lock::SqliteLockManager`]). Handler execution is not.
//!
//! # Job lifecycle
//!
//! | From         | Event          | To                  |
//! |--------------|----------------|---------------------|
//! | `new`        | claimed        | `processing`        |
//! | `processing` | handler ok     | deleted             |
//! | `processing` | handler error  | `failed` (terminal) |

pub mod db;
pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lock;
pub mod maintenance;
pub mod schedule;
pub mod store;
pub mod types;

pub use discovery::{DiscoveryReport, TaskDiscovery};
pub use dispatcher::Dispatcher;
pub use engine::{EngineOptions, RunSummary, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use handler::{Handler, HandlerRegistry, HandlerResolver, PeriodicTask};
pub use lock::{LockGuard, LockManager, LockToken, SqliteLockManager};
pub use schedule::CronExpr;
pub use store::JobStore;
pub use types::{priority, Job, JobStatus, NewJob};
