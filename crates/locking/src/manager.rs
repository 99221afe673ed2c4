//! Lock manager
//!
//! Owns the table from [`ResourceKey`] to the lock state machine for that
//! resource. Entries are created on first use and dropped again once no
//! acquisition is in flight and no transaction has bookkeeping left on the
//! resource.
//!
//! Lock order is always table mutex first, then a resource's own mutex. The
//! table mutex is never held while a thread blocks on a resource.

use crate::config::LockConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{LockError, Result};
use crate::lock::{Acquisition, LockSnapshot, ResourceLock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tgraph_common::{ResourceKey, TimeInterval, TransactionId};
use tracing::{debug, error};

/// Table of live resource locks
pub struct LockManager {
    locks: Mutex<HashMap<ResourceKey, Arc<ResourceLock>>>,
    detector: Arc<dyn DeadlockDetector>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(detector: Arc<dyn DeadlockDetector>, config: LockConfig) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            detector,
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    // Plain resources

    /// Block until `transaction` holds a read lock on `resource`
    pub fn get_read_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
    ) -> Result<Acquisition> {
        expect_plain(&resource)?;
        self.with_lock(resource, |lock| lock.as_plain()?.acquire_read(transaction))
    }

    /// Block until `transaction` holds a write lock on `resource`
    pub fn get_write_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
    ) -> Result<Acquisition> {
        expect_plain(&resource)?;
        self.with_lock(resource, |lock| lock.as_plain()?.acquire_write(transaction))
    }

    pub fn try_read_lock(&self, resource: ResourceKey, transaction: TransactionId) -> Result<bool> {
        expect_plain(&resource)?;
        self.with_lock(resource, |lock| {
            Ok(lock.as_plain()?.try_acquire_read(transaction))
        })
    }

    pub fn try_write_lock(&self, resource: ResourceKey, transaction: TransactionId) -> Result<bool> {
        expect_plain(&resource)?;
        self.with_lock(resource, |lock| {
            Ok(lock.as_plain()?.try_acquire_write(transaction))
        })
    }

    pub fn release_read_lock(&self, resource: ResourceKey, transaction: TransactionId) -> Result<()> {
        expect_plain(&resource)?;
        self.with_existing(resource, transaction, |lock| {
            lock.as_plain()?.release_read(transaction)
        })
    }

    pub fn release_write_lock(&self, resource: ResourceKey, transaction: TransactionId) -> Result<()> {
        expect_plain(&resource)?;
        self.with_existing(resource, transaction, |lock| {
            lock.as_plain()?.release_write(transaction)
        })
    }

    // Temporal property resources

    /// Block until `transaction` may read `[start, end]` of `resource`
    pub fn get_temporal_read_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
        start: i64,
        end: i64,
    ) -> Result<Acquisition> {
        expect_temporal(&resource)?;
        let interval = TimeInterval::new(start, end);
        self.with_lock(resource, |lock| {
            lock.as_temporal()?.acquire_read(transaction, interval)
        })
    }

    /// Block until `transaction` may write `resource` at `time`
    pub fn get_temporal_write_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
        time: i64,
    ) -> Result<Acquisition> {
        expect_temporal(&resource)?;
        self.with_lock(resource, |lock| {
            lock.as_temporal()?.acquire_write(transaction, time)
        })
    }

    pub fn try_temporal_read_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
        start: i64,
        end: i64,
    ) -> Result<bool> {
        expect_temporal(&resource)?;
        let interval = TimeInterval::new(start, end);
        self.with_lock(resource, |lock| {
            Ok(lock.as_temporal()?.try_acquire_read(transaction, interval))
        })
    }

    pub fn try_temporal_write_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
        time: i64,
    ) -> Result<bool> {
        expect_temporal(&resource)?;
        self.with_lock(resource, |lock| {
            Ok(lock.as_temporal()?.try_acquire_write(transaction, time))
        })
    }

    /// Release the read range `[start, end]`; the bounds must match an acquired range exactly
    pub fn release_temporal_read_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
        start: i64,
        end: i64,
    ) -> Result<()> {
        expect_temporal(&resource)?;
        let interval = TimeInterval::new(start, end);
        self.with_existing(resource, transaction, |lock| {
            lock.as_temporal()?.release_read(transaction, interval)
        })
    }

    pub fn release_temporal_write_lock(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
        time: i64,
    ) -> Result<()> {
        expect_temporal(&resource)?;
        self.with_existing(resource, transaction, |lock| {
            lock.as_temporal()?.release_write(transaction, time)
        })
    }

    /// Release every read range `transaction` holds on `resource`
    pub fn release_all_temporal_read_locks(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
    ) -> Result<()> {
        expect_temporal(&resource)?;
        self.with_existing(resource, transaction, |lock| {
            lock.as_temporal()?.release_all_reads(transaction)
        })
    }

    pub fn release_all_temporal_write_locks(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
    ) -> Result<()> {
        expect_temporal(&resource)?;
        self.with_existing(resource, transaction, |lock| {
            lock.as_temporal()?.release_all_writes(transaction)
        })
    }

    // Maintenance and diagnostics

    /// Visit every live lock, in resource order.
    ///
    /// The table is not locked while the visitor runs.
    pub fn accept<F>(&self, mut visitor: F)
    where
        F: FnMut(&ResourceLock),
    {
        for lock in self.live_locks() {
            visitor(&lock);
        }
    }

    /// Wake every blocked acquisition of `transaction` and make it fail
    pub fn terminate_waiters(&self, transaction: TransactionId) {
        let locks = self.locks.lock();
        for lock in locks.values() {
            lock.terminate_requests(transaction);
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        self.live_locks().iter().map(|l| l.snapshot()).collect()
    }

    fn live_locks(&self) -> Vec<Arc<ResourceLock>> {
        let mut locks: Vec<_> = self.locks.lock().values().cloned().collect();
        locks.sort_by_key(|l| *l.resource());
        locks
    }

    /// Run `op` on the lock for `resource`, creating it if needed
    fn with_lock<T>(
        &self,
        resource: ResourceKey,
        op: impl FnOnce(&ResourceLock) -> Result<T>,
    ) -> Result<T> {
        let lock = {
            let mut locks = self.locks.lock();
            let lock = locks
                .entry(resource)
                .or_insert_with(|| {
                    debug!("Creating lock for {}", resource);
                    Arc::new(ResourceLock::new(
                        resource,
                        Arc::clone(&self.detector),
                        &self.config,
                    ))
                })
                .clone();
            lock.mark();
            lock
        };

        let result = op(&lock);

        let mut locks = self.locks.lock();
        lock.unmark();
        remove_if_unused(&mut locks, &lock);
        result
    }

    /// Run `op` on the lock for `resource`, which must already exist
    fn with_existing<T>(
        &self,
        resource: ResourceKey,
        transaction: TransactionId,
        op: impl FnOnce(&ResourceLock) -> Result<T>,
    ) -> Result<T> {
        let lock = self.locks.lock().get(&resource).cloned();
        let Some(lock) = lock else {
            error!("{} released a lock it does not hold on {}", transaction, resource);
            return Err(LockError::LockNotFound {
                resource,
                transaction,
            });
        };

        let result = op(&lock);

        let mut locks = self.locks.lock();
        remove_if_unused(&mut locks, &lock);
        result
    }
}

fn remove_if_unused(locks: &mut HashMap<ResourceKey, Arc<ResourceLock>>, lock: &Arc<ResourceLock>) {
    if !lock.is_unused() {
        return;
    }
    let resource = *lock.resource();
    if locks.get(&resource).is_some_and(|l| Arc::ptr_eq(l, lock)) {
        locks.remove(&resource);
        debug!("Removed lock for {}", resource);
    }
}

fn expect_plain(resource: &ResourceKey) -> Result<()> {
    if resource.resource_type.is_temporal() {
        return Err(LockError::ResourceTypeMismatch {
            resource: *resource,
            expected: "plain",
        });
    }
    Ok(())
}

fn expect_temporal(resource: &ResourceKey) -> Result<()> {
    if !resource.resource_type.is_temporal() {
        return Err(LockError::ResourceTypeMismatch {
            resource: *resource,
            expected: "temporal",
        });
    }
    Ok(())
}
