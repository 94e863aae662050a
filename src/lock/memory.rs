use std::{
    collections::HashMap,
    sync::Arc,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{Lock, LockKey, LockService};
use crate::{ProcflowError, Result, TenantId};

#[derive(Debug)]
struct Entry {
    owner: Option<ThreadId>,
    holds: u32,
    waiters: u32,
    cond: Arc<Condvar>,
}

impl Entry {
    fn new() -> Self {
        Self {
            owner: None,
            holds: 0,
            waiters: 0,
            cond: Arc::new(Condvar::new()),
        }
    }

    fn is_removable(&self) -> bool {
        self.holds == 0 && self.waiters == 0
    }
}

/// In-memory lock registry.
///
/// Creating, acquiring, waiting on and removing an entry all happen under the single
/// registry mutex, so a thread can never observe an entry that is about to be removed:
/// an entry with waiters is never removed, and a thread arriving after removal creates
/// a fresh one.
pub struct MemoryLockService {
    registry: Mutex<HashMap<LockKey, Entry>>,
    timeout: Duration,
}

impl MemoryLockService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn acquire(
        &self,
        key: LockKey,
        timeout: Duration,
    ) -> Option<Lock> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock();

        let entry = registry.entry(key.clone()).or_insert_with(Entry::new);
        if entry.owner == Some(me) || entry.owner.is_none() {
            entry.owner = Some(me);
            entry.holds += 1;
            trace!(lock = %key, holds = entry.holds, "lock acquired");
            return Some(Lock {
                key,
                owner: me,
            });
        }

        entry.waiters += 1;
        loop {
            let cond = match registry.get(&key) {
                Some(entry) => entry.cond.clone(),
                None => break,
            };
            let timed_out = cond.wait_until(&mut registry, deadline).timed_out();

            let Some(entry) = registry.get_mut(&key) else {
                break;
            };
            if entry.owner.is_none() {
                entry.waiters -= 1;
                entry.owner = Some(me);
                entry.holds = 1;
                trace!(lock = %key, "lock acquired after wait");
                return Some(Lock {
                    key,
                    owner: me,
                });
            }
            if timed_out {
                entry.waiters -= 1;
                if entry.is_removable() {
                    registry.remove(&key);
                }
                trace!(lock = %key, "lock wait timed out");
                return None;
            }
        }
        // entries with waiters are never removed
        None
    }

    /// True when some thread currently holds the key.
    pub fn is_locked(
        &self,
        object_id: u64,
        object_type: &str,
        tenant_id: TenantId,
    ) -> bool {
        self.hold_count(object_id, object_type, tenant_id) > 0
    }

    pub fn hold_count(
        &self,
        object_id: u64,
        object_type: &str,
        tenant_id: TenantId,
    ) -> u32 {
        let key = LockKey {
            tenant_id,
            object_id,
            object_type: object_type.to_string(),
        };
        self.registry.lock().get(&key).map(|e| e.holds).unwrap_or(0)
    }

    /// Number of live registry entries.
    pub fn registry_len(&self) -> usize {
        self.registry.lock().len()
    }
}

impl LockService for MemoryLockService {
    fn lock(
        &self,
        object_id: u64,
        object_type: &str,
        tenant_id: TenantId,
    ) -> Result<Lock> {
        let key = LockKey {
            tenant_id,
            object_id,
            object_type: object_type.to_string(),
        };
        self.acquire(key, self.timeout).ok_or_else(|| ProcflowError::LockTimeout {
            tenant_id,
            object_id,
            object_type: object_type.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        })
    }

    fn try_lock(
        &self,
        object_id: u64,
        object_type: &str,
        tenant_id: TenantId,
        timeout: Duration,
    ) -> Result<Option<Lock>> {
        let key = LockKey {
            tenant_id,
            object_id,
            object_type: object_type.to_string(),
        };
        Ok(self.acquire(key, timeout))
    }

    fn unlock(
        &self,
        lock: &Lock,
        tenant_id: TenantId,
    ) -> Result<()> {
        if lock.key.tenant_id != tenant_id {
            return Err(ProcflowError::Lock(format!("lock {} does not belong to tenant {}", lock.key, tenant_id)));
        }
        let me = thread::current().id();
        let mut registry = self.registry.lock();
        let Some(entry) = registry.get_mut(&lock.key) else {
            return Err(ProcflowError::Lock(format!("lock {} is not held", lock.key)));
        };
        if entry.owner != Some(me) {
            return Err(ProcflowError::Lock(format!("lock {} is held by another thread", lock.key)));
        }

        entry.holds -= 1;
        if entry.holds > 0 {
            return Ok(());
        }
        entry.owner = None;
        if entry.waiters > 0 {
            entry.cond.notify_all();
        } else {
            registry.remove(&lock.key);
        }
        trace!(lock = %lock.key, "lock released");
        Ok(())
    }
}
