//! Leader-local pool locks.
//!
//! A pool lock serializes multi-step pool workflows on the leader. It is not
//! replicated: it lives in the leader's memory only and every held lock is
//! invalidated when leadership is lost.

use crate::error::{Result, SysdbError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Holder {
    id: Uuid,
    taken_at: DateTime<Utc>,
}

/// Table of currently held pool locks.
#[derive(Debug, Default)]
pub(crate) struct PoolLockRegistry {
    held: Mutex<HashMap<Uuid, Holder>>,
}

impl PoolLockRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn acquire(self: &Arc<Self>, pool_uuid: Uuid) -> Result<PoolLock> {
        let mut held = self.held.lock();
        if let Some(holder) = held.get(&pool_uuid) {
            return Err(SysdbError::PoolLocked {
                pool: pool_uuid,
                lock_id: holder.id,
                taken_at: holder.taken_at,
            });
        }

        let holder = Holder {
            id: Uuid::new_v4(),
            taken_at: Utc::now(),
        };
        held.insert(pool_uuid, holder);
        Ok(PoolLock {
            inner: Arc::new(LockInner {
                id: holder.id,
                pool_uuid,
                taken_at: holder.taken_at,
                registry: Arc::clone(self),
            }),
        })
    }

    pub(crate) fn is_held(&self, lock: &PoolLock) -> bool {
        self.held
            .lock()
            .get(&lock.pool_uuid())
            .map(|h| h.id == lock.id())
            .unwrap_or(false)
    }

    fn release(&self, pool_uuid: &Uuid, id: &Uuid) {
        let mut held = self.held.lock();
        if held.get(pool_uuid).map(|h| h.id == *id).unwrap_or(false) {
            held.remove(pool_uuid);
        }
    }

    /// Forget every held lock.
    pub(crate) fn clear(&self) {
        self.held.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.held.lock().len()
    }
}

struct LockInner {
    id: Uuid,
    pool_uuid: Uuid,
    taken_at: DateTime<Utc>,
    registry: Arc<PoolLockRegistry>,
}

impl Drop for LockInner {
    fn drop(&mut self) {
        self.registry.release(&self.pool_uuid, &self.id);
    }
}

/// Exclusive claim on one pool, released when the last clone is dropped.
#[derive(Clone)]
pub struct PoolLock {
    inner: Arc<LockInner>,
}

impl PoolLock {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn pool_uuid(&self) -> Uuid {
        self.inner.pool_uuid
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.inner.taken_at
    }

    /// True if `other` is a handle on the same lock.
    pub fn same_lock(&self, other: &PoolLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PoolLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLock")
            .field("id", &self.inner.id)
            .field("pool_uuid", &self.inner.pool_uuid)
            .field("taken_at", &self.inner.taken_at)
            .finish()
    }
}

/// Per-request state passed down a call chain.
///
/// Carrying a pool lock in the context lets nested calls on the same pool
/// reuse the lock instead of contending for it.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    pool_lock: Option<PoolLock>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            pool_lock: None,
        }
    }

    /// Copy of this context carrying `lock`.
    pub fn with_pool_lock(&self, lock: PoolLock) -> Self {
        Self {
            cancel: self.cancel.clone(),
            pool_lock: Some(lock),
        }
    }

    pub fn pool_lock(&self) -> Option<&PoolLock> {
        self.pool_lock.as_ref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
