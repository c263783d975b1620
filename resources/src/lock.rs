//! Named locks used to serialize structural mutations and one-time
//! initialization across store instances.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rusqlite::{params, ErrorCode};
use tracing::{debug, instrument, warn};

use crate::{db::Database, record::now_millis, Error};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(5);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Hands out named locks.
/// Acquisition blocks until the lock is free, or fails with
/// [Error::LockTimeout] after a bounded wait.
pub trait LockProvider: Send + Sync {
    fn acquire(&self, name: &str) -> Result<Lock, Error>;
}

type ReleaseFn = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// A held lock. Released by [Lock::release] or when dropped.
pub struct Lock {
    name: String,
    release: Option<ReleaseFn>,
}

impl Lock {
    fn new(name: String, release: ReleaseFn) -> Self {
        Self {
            name,
            release: Some(release),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the lock. Calling this more than once is a no-op.
    pub fn release(&mut self) -> Result<(), Error> {
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(lock.name = %self.name, err = %e, "failed to release lock");
        }
    }
}

/// The holder of a lock inside this process. The holding thread may take
/// the lock again, it is released once every guard is.
struct Holder {
    thread: ThreadId,
    count: usize,
}

/// Leases stored in the `resourcestore_lock` table, visible to every
/// instance opened on the same database.
///
/// A lease expires after `ttl`; expired leases are taken over by the next
/// acquirer, so a crashed holder can not block others forever. Locks are
/// reentrant for the thread holding them through the same provider.
#[derive(Clone)]
pub struct DatabaseLockProvider {
    db: Arc<Database>,
    owner: String,
    timeout: Duration,
    ttl: Duration,
    tokens: Arc<AtomicU64>,
    held: Arc<Mutex<HashMap<String, (Holder, String)>>>,
}

impl DatabaseLockProvider {
    pub fn new(
        db: Arc<Database>,
        owner: impl Into<String>,
        timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            owner: owner.into(),
            timeout,
            ttl,
            tokens: Arc::new(AtomicU64::new(0)),
            held: Default::default(),
        }
    }

    fn next_token(&self) -> String {
        format!(
            "{}:{}:{}",
            self.owner,
            now_millis(),
            self.tokens.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Inserts the lease, or takes over an expired one.
    /// Returns whether the lease is now held with `token`. A database busy
    /// with another writer counts as not acquired.
    fn try_acquire(&self, name: &str, token: &str) -> Result<bool, Error> {
        let now = now_millis();
        let expires_at = now.saturating_add(self.ttl.as_millis() as i64);

        self.db.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO resourcestore_lock (name, owner, token, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    owner = excluded.owner,
                    token = excluded.token,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE resourcestore_lock.expires_at <= excluded.acquired_at",
                params![name, self.owner, token, now, expires_at],
            );
            match result {
                Ok(changed) => Ok(changed == 1),
                Err(e) if is_busy(&e) => {
                    debug!(lock.name = %name, "database busy");
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// A guard for `name`, which must be in `held` already.
    fn guard(&self, name: &str) -> Lock {
        let db = self.db.clone();
        let held = self.held.clone();
        let lock_name = name.to_owned();

        Lock::new(
            name.to_owned(),
            Box::new(move || {
                let token = {
                    let mut held = held.lock();
                    let last = match held.get_mut(&lock_name) {
                        Some((holder, _)) => {
                            holder.count -= 1;
                            holder.count == 0
                        }
                        None => false,
                    };
                    if last {
                        held.remove(&lock_name).map(|(_, token)| token)
                    } else {
                        None
                    }
                };

                match token {
                    Some(token) => release_lease(&db, &lock_name, &token),
                    None => Ok(()),
                }
            }),
        )
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn release_lease(db: &Database, name: &str, token: &str) -> Result<(), Error> {
    let deleted = db.with_conn(|conn| {
        Ok(conn.execute(
            "DELETE FROM resourcestore_lock WHERE name = ?1 AND token = ?2",
            params![name, token],
        )?)
    })?;

    if deleted == 0 {
        debug!(lock.name = %name, "lease expired or was taken over before release");
    }

    Ok(())
}

impl LockProvider for DatabaseLockProvider {
    #[instrument(skip(self), fields(lock.owner = %self.owner), err)]
    fn acquire(&self, name: &str) -> Result<Lock, Error> {
        let me = thread::current().id();
        {
            let mut held = self.held.lock();
            if let Some((holder, _)) = held.get_mut(name).filter(|(h, _)| h.thread == me) {
                holder.count += 1;
                return Ok(self.guard(name));
            }
        }

        let token = self.next_token();
        let started = Instant::now();
        let mut poll = MIN_POLL_INTERVAL;

        loop {
            if self.try_acquire(name, &token)? {
                debug!(waited = ?started.elapsed(), "acquired lease");
                self.held.lock().insert(
                    name.to_owned(),
                    (
                        Holder {
                            thread: me,
                            count: 1,
                        },
                        token,
                    ),
                );
                return Ok(self.guard(name));
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(Error::LockTimeout {
                    name: name.to_owned(),
                    waited,
                });
            }

            std::thread::sleep(poll.min(self.timeout - waited));
            poll = (poll * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

#[derive(Default)]
struct HeldLocks {
    names: Mutex<HashMap<String, Holder>>,
    released: Condvar,
}

/// Process-local locks, for stores that are the only user of their database.
/// Reentrant for the thread holding them.
#[derive(Clone)]
pub struct MemoryLockProvider {
    held: Arc<HeldLocks>,
    timeout: Duration,
}

impl MemoryLockProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Default::default(),
            timeout,
        }
    }
}

impl Default for MemoryLockProvider {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockProvider for MemoryLockProvider {
    fn acquire(&self, name: &str) -> Result<Lock, Error> {
        let me = thread::current().id();
        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut names = self.held.names.lock();
        loop {
            match names.get(name).map(|holder| holder.thread) {
                None => {
                    names.insert(name.to_owned(), Holder { thread: me, count: 1 });
                    break;
                }
                Some(thread) if thread == me => {
                    if let Some(holder) = names.get_mut(name) {
                        holder.count += 1;
                    }
                    break;
                }
                Some(_) if Instant::now() >= deadline => {
                    return Err(Error::LockTimeout {
                        name: name.to_owned(),
                        waited: started.elapsed(),
                    });
                }
                Some(_) => {
                    self.held.released.wait_until(&mut names, deadline);
                }
            }
        }
        drop(names);

        let held = self.held.clone();
        let lock_name = name.to_owned();
        Ok(Lock::new(
            name.to_owned(),
            Box::new(move || {
                let mut names = held.names.lock();
                if let Some(holder) = names.get_mut(&lock_name) {
                    holder.count -= 1;
                    if holder.count == 0 {
                        names.remove(&lock_name);
                        held.released.notify_all();
                    }
                }
                Ok(())
            }),
        ))
    }
}
