mod common;

use std::collections::HashSet;
use std::error::Error as _;
use std::sync::Arc;
use std::thread;

use cadence_scheduler::{lock::DISPATCH_LOCK, JobStatus, NewJob, SchedulerError};
use common::{registry, Recorder, TestDb, LOCK_TTL, RECORDER};
use serde_json::json;

fn record(tag: i64) -> NewJob {
    NewJob::model(RECORDER, "record").with_parameters(vec![json!(tag)])
}

#[test]
fn dispatches_by_priority_not_insertion() {
    let db = TestDb::new();
    let recorder = Arc::new(Recorder::default());
    let process = db.process(registry(recorder.clone()));

    for p in [10, 100, -5] {
        process.store.enqueue(&record(p).with_priority(p)).unwrap();
    }
    for _ in 0..3 {
        assert!(process.dispatcher.run_job().unwrap());
    }

    assert_eq!(recorder.first_args(), vec![json!(100), json!(10), json!(-5)]);
    assert!(!process.dispatcher.run_job().unwrap());
}

#[test]
fn equal_priority_runs_in_insertion_order() {
    let db = TestDb::new();
    let recorder = Arc::new(Recorder::default());
    let process = db.process(registry(recorder.clone()));

    for tag in 1..=4 {
        process.store.enqueue(&record(tag)).unwrap();
    }
    while process.dispatcher.run_job().unwrap() {}

    assert_eq!(
        recorder.first_args(),
        vec![json!(1), json!(2), json!(3), json!(4)]
    );
}

#[test]
fn empty_queue_returns_false_and_leaves_no_lock() {
    let db = TestDb::new();
    let process = db.process(registry(Arc::new(Recorder::default())));

    assert!(!process.dispatcher.run_job().unwrap());
    assert!(!process.locks.is_locked(DISPATCH_LOCK).unwrap());
    for status in [JobStatus::New, JobStatus::Processing, JobStatus::Failed] {
        assert_eq!(process.store.count(status).unwrap(), 0);
    }
}

#[test]
fn successful_job_is_deleted() {
    let db = TestDb::new();
    let recorder = Arc::new(Recorder::default());
    let process = db.process(registry(recorder.clone()));

    let id = process.store.enqueue(&record(1)).unwrap();
    assert!(process.dispatcher.run_job().unwrap());

    assert!(process.store.get(id).unwrap().is_none());
    assert!(process.store.claim_next().unwrap().is_none());
    assert_eq!(recorder.calls().len(), 1);
}

#[test]
fn handler_error_marks_failed_propagates_and_releases_lock() {
    let db = TestDb::new();
    let process = db.process(registry(Arc::new(Recorder::default())));

    let id = process
        .store
        .enqueue(&NewJob::model(RECORDER, "fail"))
        .unwrap();
    let err = process.dispatcher.run_job().unwrap_err();

    assert!(matches!(err, SchedulerError::Execution { job_id, .. } if job_id == id));
    assert_eq!(err.source().unwrap().to_string(), "requested failure");
    assert_eq!(process.store.get(id).unwrap().unwrap().status, JobStatus::Failed);

    // re-acquiring must not wait for the lease to expire
    let token = process
        .locks
        .try_acquire(DISPATCH_LOCK, LOCK_TTL)
        .unwrap()
        .expect("dispatch lock released after failure");
    assert_eq!(token.name(), DISPATCH_LOCK);
}

#[test]
fn failed_job_is_not_retried() {
    let db = TestDb::new();
    let recorder = Arc::new(Recorder::default());
    let process = db.process(registry(recorder.clone()));

    process.store.enqueue(&NewJob::model(RECORDER, "fail")).unwrap();
    assert!(process.dispatcher.run_job().is_err());
    assert!(!process.dispatcher.run_job().unwrap());
    assert_eq!(recorder.calls().len(), 1);
    assert_eq!(process.store.count(JobStatus::Failed).unwrap(), 1);
}

#[test]
fn panicking_handler_is_an_execution_error() {
    let db = TestDb::new();
    let process = db.process(registry(Arc::new(Recorder::default())));

    let id = process
        .store
        .enqueue(&NewJob::model(RECORDER, "panic"))
        .unwrap();
    let err = process.dispatcher.run_job().unwrap_err();

    assert!(err.is_execution());
    assert!(err.source().unwrap().to_string().contains("requested panic"));
    assert_eq!(process.store.get(id).unwrap().unwrap().status, JobStatus::Failed);
    assert!(!process.locks.is_locked(DISPATCH_LOCK).unwrap());
}

#[test]
fn missing_handler_or_action_fails_the_job() {
    let db = TestDb::new();
    let process = db.process(registry(Arc::new(Recorder::default())));

    let ghost = process.store.enqueue(&NewJob::model("ghost", "run")).unwrap();
    let err = process.dispatcher.run_job().unwrap_err();
    assert!(matches!(err, SchedulerError::HandlerNotFound { ref name } if name == "ghost"));
    assert_eq!(process.store.get(ghost).unwrap().unwrap().status, JobStatus::Failed);

    let missing = process.store.enqueue(&NewJob::model(RECORDER, "vanish")).unwrap();
    let err = process.dispatcher.run_job().unwrap_err();
    assert!(matches!(err, SchedulerError::ActionNotFound { .. }));
    assert_eq!(process.store.get(missing).unwrap().unwrap().status, JobStatus::Failed);
}

#[test]
fn undecodable_parameters_fail_the_job() {
    let db = TestDb::new();
    let recorder = Arc::new(Recorder::default());
    let process = db.process(registry(recorder.clone()));

    let id = process.store.enqueue(&record(1)).unwrap();
    db.connection()
        .execute("UPDATE jobs SET parameters = 'not json' WHERE id = ?1", [id])
        .unwrap();

    let err = process.dispatcher.run_job().unwrap_err();
    assert!(matches!(err, SchedulerError::Execution { .. }));
    assert!(recorder.calls().is_empty());
    assert_eq!(process.store.get(id).unwrap().unwrap().status, JobStatus::Failed);
}

#[test]
fn rejected_job_type_never_reaches_the_store() {
    let db = TestDb::new();
    let process = db.process(registry(Arc::new(Recorder::default())));

    let mut job = record(1);
    job.job_type = "controller".into();
    assert!(matches!(
        process.store.enqueue(&job),
        Err(SchedulerError::Validation(_))
    ));
    assert!(!process.dispatcher.run_job().unwrap());
}

#[test]
fn store_outage_during_claim_releases_lock() {
    let db = TestDb::new();
    let process = db.process(registry(Arc::new(Recorder::default())));

    db.connection().execute_batch("DROP TABLE jobs;").unwrap();
    let err = process.dispatcher.run_job().unwrap_err();

    assert!(matches!(err, SchedulerError::Database(_)));
    assert!(!process.locks.is_locked(DISPATCH_LOCK).unwrap());
}

#[test]
fn completion_failure_marks_job_failed_and_releases_lock() {
    let db = TestDb::new();
    let recorder = Arc::new(Recorder::default());
    let process = db.process(registry(recorder.clone()));

    db.connection()
        .execute_batch(
            "CREATE TRIGGER refuse_delete BEFORE DELETE ON jobs
             BEGIN SELECT RAISE(ABORT, 'store refused delete'); END;",
        )
        .unwrap();
    let id = process.store.enqueue(&record(1)).unwrap();

    let err = process.dispatcher.run_job().unwrap_err();

    assert!(matches!(err, SchedulerError::Database(_)));
    assert!(err.to_string().contains("store refused delete"));
    assert_eq!(recorder.calls().len(), 1);
    assert_eq!(process.store.get(id).unwrap().unwrap().status, JobStatus::Failed);
    assert!(!process.locks.is_locked(DISPATCH_LOCK).unwrap());
    assert!(!process.dispatcher.run_job().unwrap());
}

#[test]
fn concurrent_processes_run_each_job_exactly_once() {
    let db = TestDb::new();
    let recorder = Arc::new(Recorder::default());
    let handlers = registry(recorder.clone());

    let seed = db.process(handlers.clone());
    for tag in 0..40 {
        seed.store.enqueue(&record(tag)).unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let process = db.process(handlers.clone());
            thread::spawn(move || {
                let mut ran = 0;
                while process.dispatcher.run_job().unwrap() {
                    ran += 1;
                }
                ran
            })
        })
        .collect();
    let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert_eq!(total, 40);
    let seen: HashSet<i64> = recorder
        .first_args()
        .into_iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    assert_eq!(seen.len(), 40);
    assert_eq!(seed.store.count(JobStatus::New).unwrap(), 0);
}
