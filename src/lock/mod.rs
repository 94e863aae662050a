//! Per-tenant, per-object reentrant mutual exclusion.
//!
//! A lock is identified by `(tenant_id, object_id, object_type)` and owned by the thread
//! that acquired it. The same thread may acquire it again; every acquisition must be
//! matched by one `unlock` before another thread can get it.

mod memory;

use std::{fmt, thread::ThreadId, time::Duration};

pub use memory::MemoryLockService;

use crate::{Result, TenantId};

/// Registry key of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub tenant_id: TenantId,
    pub object_id: u64,
    pub object_type: String,
}

impl fmt::Display for LockKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}@{}", self.object_type, self.object_id, self.tenant_id)
    }
}

/// Handle returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: LockKey,
    pub owner: ThreadId,
}

impl Lock {
    pub fn object_id(&self) -> u64 {
        self.key.object_id
    }

    pub fn object_type(&self) -> &str {
        &self.key.object_type
    }
}

pub trait LockService: Send + Sync {
    /// Blocks until the lock is acquired or the configured long timeout expires.
    fn lock(
        &self,
        object_id: u64,
        object_type: &str,
        tenant_id: TenantId,
    ) -> Result<Lock>;

    /// Returns `Ok(None)` when the lock could not be acquired within `timeout`.
    fn try_lock(
        &self,
        object_id: u64,
        object_type: &str,
        tenant_id: TenantId,
        timeout: Duration,
    ) -> Result<Option<Lock>>;

    /// Releases one hold of `lock`.
    fn unlock(
        &self,
        lock: &Lock,
        tenant_id: TenantId,
    ) -> Result<()>;
}
