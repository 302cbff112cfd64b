use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
};

/// Serializes `claim_next` across every dispatcher sharing the store.
pub const DISPATCH_LOCK: &str = "cron_run_jobs";
/// Serializes task discovery passes.
pub const DISCOVERY_LOCK: &str = "cron_init_tasks";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Proof of ownership for one acquisition of a named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    name: String,
    token: String,
}

impl LockToken {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named cross-process mutex.
///
/// Ownership is a lease: a holder that dies without releasing loses the lock
/// once `ttl` has passed, so nobody waits on a dead process forever.
pub trait LockManager: Send + Sync {
    /// Block until `name` is held by the caller.
    fn acquire(&self, name: &str, ttl: Duration) -> Result<LockToken>;

    /// Give the lock back. Releasing a lock that is no longer held is a no-op.
    fn release(&self, token: &LockToken) -> Result<()>;
}

/// Scope-bound ownership of a lock. Dropping an unreleased guard releases it.
pub struct LockGuard<'a> {
    manager: &'a dyn LockManager,
    token: Option<LockToken>,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(manager: &'a dyn LockManager, name: &str, ttl: Duration) -> Result<Self> {
        let token = manager.acquire(name, ttl)?;
        Ok(Self {
            manager,
            token: Some(token),
        })
    }

    /// Release now and report store errors instead of only logging them.
    pub fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.manager.release(&token),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.manager.release(&token) {
                // the lease still expires on its own
                warn!(lock = %token.name, error = %e, "failed to release lock on drop");
            }
        }
    }
}

/// [`LockManager`] backed by lease rows in the `locks` table.
///
/// Acquisition is a single upsert that only overwrites an expired lease, so
/// at most one caller can observe a changed row for a live lease.
pub struct SqliteLockManager {
    conn: Mutex<Connection>,
    poll_interval: Duration,
    acquire_timeout: Option<Duration>,
}

impl SqliteLockManager {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            poll_interval: DEFAULT_POLL_INTERVAL,
            acquire_timeout: None,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Fail with [`SchedulerError::LockTimeout`] instead of waiting forever.
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// One acquisition attempt. `None` means a live lease is held elsewhere.
    pub fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let conn = self.conn.lock().expect("lock connection poisoned");
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);
        let token = Uuid::new_v4().to_string();

        let changed = conn.execute(
            "INSERT INTO locks (name, token, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE
                SET token = excluded.token, expires_at = excluded.expires_at
                WHERE locks.expires_at <= ?4",
            rusqlite::params![name, token, expires_at, now],
        )?;

        if changed == 1 {
            Ok(Some(LockToken {
                name: name.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// True while an unexpired lease exists for `name`, whoever owns it.
    pub fn is_locked(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("lock connection poisoned");
        let now = Utc::now().timestamp_millis();
        let held: i64 = conn.query_row(
            "SELECT COUNT(*) FROM locks WHERE name = ?1 AND expires_at > ?2",
            rusqlite::params![name, now],
            |row| row.get(0),
        )?;
        Ok(held > 0)
    }
}

impl LockManager for SqliteLockManager {
    fn acquire(&self, name: &str, ttl: Duration) -> Result<LockToken> {
        let started = Instant::now();
        loop {
            if let Some(token) = self.try_acquire(name, ttl)? {
                debug!(lock = name, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                return Ok(token);
            }
            if let Some(limit) = self.acquire_timeout {
                if started.elapsed() >= limit {
                    return Err(SchedulerError::LockTimeout {
                        name: name.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn release(&self, token: &LockToken) -> Result<()> {
        let conn = self.conn.lock().expect("lock connection poisoned");
        let n = conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND token = ?2",
            rusqlite::params![token.name, token.token],
        )?;
        if n == 0 {
            warn!(lock = %token.name, "lock was not held at release (lease expired or already released)");
        } else {
            debug!(lock = %token.name, "lock released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SqliteLockManager {
        let conn = db::open(dir.path().join("locks.db"), Duration::from_secs(5)).unwrap();
        SqliteLockManager::new(conn)
            .unwrap()
            .with_poll_interval(Duration::from_millis(5))
    }

    #[test]
    fn acquire_then_release_frees_the_name() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let token = locks.acquire("a", Duration::from_secs(30)).unwrap();
        assert!(locks.is_locked("a").unwrap());
        locks.release(&token).unwrap();
        assert!(!locks.is_locked("a").unwrap());
    }

    #[test]
    fn live_lease_excludes_other_process() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir);
        let second = manager(&dir).with_acquire_timeout(Some(Duration::from_millis(30)));

        let _held = first.acquire("a", Duration::from_secs(30)).unwrap();
        assert!(second.try_acquire("a", Duration::from_secs(30)).unwrap().is_none());

        let err = second.acquire("a", Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, SchedulerError::LockTimeout { .. }));
        // other names are independent
        assert!(second.try_acquire("b", Duration::from_secs(30)).unwrap().is_some());
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let crashed = manager(&dir);
        let survivor = manager(&dir);

        // holder never releases
        let _lost = crashed.acquire("a", Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(40));

        let token = survivor
            .try_acquire("a", Duration::from_secs(30))
            .unwrap()
            .expect("expired lease must be free");
        assert_eq!(token.name(), "a");
    }

    #[test]
    fn release_by_stale_owner_is_noop() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir);
        let second = manager(&dir);

        let stale = first.acquire("a", Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let _current = second.acquire("a", Duration::from_secs(30)).unwrap();

        first.release(&stale).unwrap();
        first.release(&stale).unwrap();
        assert!(first.is_locked("a").unwrap(), "new owner's lease must survive");
    }

    #[test]
    fn guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        {
            let _guard = LockGuard::acquire(&locks, DISPATCH_LOCK, Duration::from_secs(30)).unwrap();
            assert!(locks.is_locked(DISPATCH_LOCK).unwrap());
        }
        assert!(!locks.is_locked(DISPATCH_LOCK).unwrap());

        let guard = LockGuard::acquire(&locks, DISPATCH_LOCK, Duration::from_secs(30)).unwrap();
        guard.release().unwrap();
        assert!(!locks.is_locked(DISPATCH_LOCK).unwrap());
    }
}
