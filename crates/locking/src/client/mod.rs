//! Per-transaction lock client
//!
//! A [`LockClient`] is the entry point a transaction uses to take locks. It
//! keeps its own record of what it holds, separately for shared and exclusive
//! mode and grouped by resource type, so repeated acquisitions of the same
//! resource only reach the [`LockManager`] once.
//!
//! A client moves from active to stopping to closed:
//!
//! 1. [`LockClient::stop`] refuses new operations, terminates the
//!    transaction's blocked acquisitions and waits for in-flight operations
//!    to drain.
//! 2. [`LockClient::close`] stops the client and releases everything it
//!    still holds.

mod resource;
mod state;

use crate::error::{LockError, Result};
use crate::lock::{Acquisition, LockMode};
use crate::manager::LockManager;
use parking_lot::Mutex;
use resource::LockResource;
use state::{ActiveGuard, ClientState};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tgraph_common::{
    ResourceIdentity, ResourceKey, ResourceType, TimeInterval, TransactionId,
};
use tracing::{debug, error};

type LocalLocks = HashMap<ResourceType, HashMap<ResourceIdentity, LockResource>>;

/// Locks held by one client, by mode and resource type
#[derive(Debug, Default)]
struct HeldLocks {
    shared: LocalLocks,
    exclusive: LocalLocks,
}

impl HeldLocks {
    fn locks(&self, mode: LockMode) -> &LocalLocks {
        match mode {
            LockMode::Read => &self.shared,
            LockMode::Write => &self.exclusive,
        }
    }

    fn locks_mut(&mut self, mode: LockMode) -> &mut LocalLocks {
        match mode {
            LockMode::Read => &mut self.shared,
            LockMode::Write => &mut self.exclusive,
        }
    }

    fn get_mut(&mut self, mode: LockMode, key: &ResourceKey) -> Option<&mut LockResource> {
        self.locks_mut(mode)
            .get_mut(&key.resource_type)
            .and_then(|by_id| by_id.get_mut(&key.identity))
    }

    fn contains(&self, mode: LockMode, key: &ResourceKey) -> bool {
        self.locks(mode)
            .get(&key.resource_type)
            .is_some_and(|by_id| by_id.contains_key(&key.identity))
    }

    fn insert(&mut self, mode: LockMode, resource: LockResource) {
        let key = resource.key();
        self.locks_mut(mode)
            .entry(key.resource_type)
            .or_default()
            .insert(key.identity, resource);
    }

    fn remove(&mut self, mode: LockMode, key: &ResourceKey) -> Option<LockResource> {
        let locks = self.locks_mut(mode);
        let by_id = locks.get_mut(&key.resource_type)?;
        let removed = by_id.remove(&key.identity);
        if by_id.is_empty() {
            locks.remove(&key.resource_type);
        }
        removed
    }

    fn count(&self, mode: LockMode) -> usize {
        self.locks(mode).values().map(HashMap::len).sum()
    }
}

/// Lock session of one transaction
pub struct LockClient {
    manager: Arc<LockManager>,
    transaction: TransactionId,
    state: ClientState,
    /// Held across manager calls, so operations of one client run one at a time
    held: Mutex<HeldLocks>,
    closed: AtomicBool,
}

impl LockClient {
    /// Open a client for a fresh transaction
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self::with_transaction(manager, TransactionId::new())
    }

    pub fn with_transaction(manager: Arc<LockManager>, transaction: TransactionId) -> Self {
        Self {
            manager,
            transaction,
            state: ClientState::default(),
            held: Mutex::new(HeldLocks::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction
    }

    // Plain resources

    /// Take shared locks on `ids`, blocking as needed
    pub fn acquire_shared(&self, resource_type: ResourceType, ids: &[i64]) -> Result<()> {
        self.acquire_plain(LockMode::Read, resource_type, ids)
    }

    /// Take exclusive locks on `ids`, blocking as needed
    pub fn acquire_exclusive(&self, resource_type: ResourceType, ids: &[i64]) -> Result<()> {
        self.acquire_plain(LockMode::Write, resource_type, ids)
    }

    pub fn try_shared_lock(&self, resource_type: ResourceType, id: i64) -> Result<bool> {
        self.try_plain(LockMode::Read, resource_type, id)
    }

    pub fn try_exclusive_lock(&self, resource_type: ResourceType, id: i64) -> Result<bool> {
        self.try_plain(LockMode::Write, resource_type, id)
    }

    pub fn release_shared(&self, resource_type: ResourceType, ids: &[i64]) -> Result<()> {
        self.release_plain(LockMode::Read, resource_type, ids)
    }

    pub fn release_exclusive(&self, resource_type: ResourceType, ids: &[i64]) -> Result<()> {
        self.release_plain(LockMode::Write, resource_type, ids)
    }

    fn acquire_plain(&self, mode: LockMode, resource_type: ResourceType, ids: &[i64]) -> Result<()> {
        let _active = self.enter()?;
        let mut held = self.held.lock();
        for &id in ids {
            self.ensure_running()?;
            let key = ResourceKey::normal(resource_type, id);
            if let Some(resource) = held.get_mut(mode, &key) {
                resource.retain();
                continue;
            }

            let acquisition = match mode {
                LockMode::Read => self.manager.get_read_lock(key, self.transaction)?,
                LockMode::Write => self.manager.get_write_lock(key, self.transaction)?,
            };
            self.granted(acquisition)?;
            held.insert(mode, LockResource::new(key));
        }
        Ok(())
    }

    fn try_plain(&self, mode: LockMode, resource_type: ResourceType, id: i64) -> Result<bool> {
        let _active = self.enter()?;
        let mut held = self.held.lock();
        self.ensure_running()?;
        let key = ResourceKey::normal(resource_type, id);
        if let Some(resource) = held.get_mut(mode, &key) {
            resource.retain();
            return Ok(true);
        }

        let acquired = match mode {
            LockMode::Read => self.manager.try_read_lock(key, self.transaction)?,
            LockMode::Write => self.manager.try_write_lock(key, self.transaction)?,
        };
        if acquired {
            held.insert(mode, LockResource::new(key));
        }
        Ok(acquired)
    }

    fn release_plain(&self, mode: LockMode, resource_type: ResourceType, ids: &[i64]) -> Result<()> {
        let _active = self.enter()?;
        let mut held = self.held.lock();
        for &id in ids {
            let key = ResourceKey::normal(resource_type, id);
            let last = match held.get_mut(mode, &key) {
                Some(resource) => resource.release(),
                None => return Err(self.not_held(key)),
            };
            if !last {
                continue;
            }
            held.remove(mode, &key);
            match mode {
                LockMode::Read => self.manager.release_read_lock(key, self.transaction)?,
                LockMode::Write => self.manager.release_write_lock(key, self.transaction)?,
            }
        }
        Ok(())
    }

    // Temporal property resources

    /// Take a shared lock on the range `[start, end]` of one property
    pub fn acquire_temporal_prop_shared(
        &self,
        resource_type: ResourceType,
        entity_id: i64,
        property_key: i32,
        start: i64,
        end: i64,
    ) -> Result<()> {
        let key = ResourceKey::temporal(resource_type, entity_id, property_key);
        self.acquire_temporal(LockMode::Read, key, TimeInterval::new(start, end))
    }

    /// Take an exclusive lock on one property from `time` onward
    pub fn acquire_temporal_prop_exclusive(
        &self,
        resource_type: ResourceType,
        entity_id: i64,
        property_key: i32,
        time: i64,
    ) -> Result<()> {
        let key = ResourceKey::temporal(resource_type, entity_id, property_key);
        self.acquire_temporal(LockMode::Write, key, TimeInterval::point(time))
    }

    pub fn try_temporal_prop_shared(
        &self,
        resource_type: ResourceType,
        entity_id: i64,
        property_key: i32,
        start: i64,
        end: i64,
    ) -> Result<bool> {
        let key = ResourceKey::temporal(resource_type, entity_id, property_key);
        self.try_temporal(LockMode::Read, key, TimeInterval::new(start, end))
    }

    pub fn try_temporal_prop_exclusive(
        &self,
        resource_type: ResourceType,
        entity_id: i64,
        property_key: i32,
        time: i64,
    ) -> Result<bool> {
        let key = ResourceKey::temporal(resource_type, entity_id, property_key);
        self.try_temporal(LockMode::Write, key, TimeInterval::point(time))
    }

    /// Drop one shared reference to the property. When the last one goes,
    /// every range this client reads on the property is released.
    pub fn release_temporal_prop_shared(
        &self,
        resource_type: ResourceType,
        entity_id: i64,
        property_key: i32,
        start: i64,
        end: i64,
    ) -> Result<()> {
        let key = ResourceKey::temporal(resource_type, entity_id, property_key);
        self.release_temporal(LockMode::Read, key, TimeInterval::new(start, end))
    }

    pub fn release_temporal_prop_exclusive(
        &self,
        resource_type: ResourceType,
        entity_id: i64,
        property_key: i32,
        time: i64,
    ) -> Result<()> {
        let key = ResourceKey::temporal(resource_type, entity_id, property_key);
        self.release_temporal(LockMode::Write, key, TimeInterval::point(time))
    }

    fn acquire_temporal(&self, mode: LockMode, key: ResourceKey, interval: TimeInterval) -> Result<()> {
        let _active = self.enter()?;
        let mut held = self.held.lock();
        self.ensure_running()?;
        if let Some(resource) = held.get_mut(mode, &key) {
            if resource.holds_interval(&interval) {
                resource.retain();
                return Ok(());
            }
        }

        let acquisition = match mode {
            LockMode::Read => self.manager.get_temporal_read_lock(
                key,
                self.transaction,
                interval.start(),
                interval.end(),
            )?,
            LockMode::Write => {
                self.manager
                    .get_temporal_write_lock(key, self.transaction, interval.start())?
            }
        };
        self.granted(acquisition)?;
        Self::record_interval(&mut held, mode, key, interval);
        Ok(())
    }

    fn try_temporal(&self, mode: LockMode, key: ResourceKey, interval: TimeInterval) -> Result<bool> {
        let _active = self.enter()?;
        let mut held = self.held.lock();
        self.ensure_running()?;
        if let Some(resource) = held.get_mut(mode, &key) {
            if resource.holds_interval(&interval) {
                resource.retain();
                return Ok(true);
            }
        }

        let acquired = match mode {
            LockMode::Read => self.manager.try_temporal_read_lock(
                key,
                self.transaction,
                interval.start(),
                interval.end(),
            )?,
            LockMode::Write => {
                self.manager
                    .try_temporal_write_lock(key, self.transaction, interval.start())?
            }
        };
        if acquired {
            Self::record_interval(&mut held, mode, key, interval);
        }
        Ok(acquired)
    }

    fn record_interval(held: &mut HeldLocks, mode: LockMode, key: ResourceKey, interval: TimeInterval) {
        match held.get_mut(mode, &key) {
            Some(resource) => resource.retain_interval(interval),
            None => held.insert(mode, LockResource::with_interval(key, interval)),
        }
    }

    fn release_temporal(&self, mode: LockMode, key: ResourceKey, interval: TimeInterval) -> Result<()> {
        let _active = self.enter()?;
        let mut held = self.held.lock();
        let last = match held.get_mut(mode, &key) {
            Some(resource) if resource.holds_interval(&interval) => resource.release(),
            _ => return Err(self.not_held(key)),
        };
        if !last {
            return Ok(());
        }
        held.remove(mode, &key);
        match mode {
            LockMode::Read => self
                .manager
                .release_all_temporal_read_locks(key, self.transaction),
            LockMode::Write => self
                .manager
                .release_all_temporal_write_locks(key, self.transaction),
        }
    }

    // Introspection

    /// Whether this client holds a shared lock on the resource.
    ///
    /// Waits for any operation of this client that is still blocked.
    pub fn holds_shared(&self, resource_type: ResourceType, identity: ResourceIdentity) -> bool {
        self.held
            .lock()
            .contains(LockMode::Read, &ResourceKey::new(resource_type, identity))
    }

    pub fn holds_exclusive(&self, resource_type: ResourceType, identity: ResourceIdentity) -> bool {
        self.held
            .lock()
            .contains(LockMode::Write, &ResourceKey::new(resource_type, identity))
    }

    /// Number of distinct resources held in shared mode
    pub fn shared_count(&self) -> usize {
        self.held.lock().count(LockMode::Read)
    }

    /// Number of distinct resources held in exclusive mode
    pub fn exclusive_count(&self) -> usize {
        self.held.lock().count(LockMode::Write)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    // Lifecycle

    /// Refuse new operations and wait until in-flight ones have left.
    ///
    /// Blocked acquisitions of this transaction are terminated and fail with
    /// [`LockError::ClientStopped`]. Safe to call from another thread.
    pub fn stop(&self) {
        if self.state.stop() {
            debug!("Stopping lock client for {}", self.transaction);
        }
        let poll = self.manager.config().stop_poll_interval;
        loop {
            // repeated each round: a wait may have started after the previous sweep
            self.manager.terminate_waiters(self.transaction);
            if self.state.active_count() == 0 {
                break;
            }
            thread::sleep(poll);
        }
    }

    /// Stop the client and release every lock it holds. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();

        let mut held = self.held.lock();
        let exclusive = std::mem::take(&mut held.exclusive);
        let shared = std::mem::take(&mut held.shared);

        let mut released = 0;
        for (mode, locks) in [(LockMode::Write, exclusive), (LockMode::Read, shared)] {
            for resource in locks.into_values().flat_map(HashMap::into_values) {
                self.release_on_close(mode, &resource);
                released += 1;
            }
        }
        debug!(
            "Closed lock client for {}, released {} resources",
            self.transaction, released
        );
    }

    fn release_on_close(&self, mode: LockMode, resource: &LockResource) {
        let key = resource.key();
        let tx = self.transaction;
        let result = match (mode, key.resource_type.is_temporal()) {
            (LockMode::Read, false) => self.manager.release_read_lock(key, tx),
            (LockMode::Write, false) => self.manager.release_write_lock(key, tx),
            (LockMode::Read, true) => self.manager.release_all_temporal_read_locks(key, tx),
            (LockMode::Write, true) => self.manager.release_all_temporal_write_locks(key, tx),
        };
        if let Err(e) = result {
            error!(
                "Failed to release {:?} lock on {} (held {} times) while closing {}: {}",
                mode,
                key,
                resource.ref_count(),
                tx,
                e
            );
        }
    }

    fn enter(&self) -> Result<ActiveGuard<'_>> {
        self.state.enter().ok_or(LockError::ClientStopped {
            transaction: self.transaction,
        })
    }

    /// Checked again once the local record is locked, as `stop` may have run meanwhile
    fn ensure_running(&self) -> Result<()> {
        if self.state.is_stopped() {
            return Err(LockError::ClientStopped {
                transaction: self.transaction,
            });
        }
        Ok(())
    }

    fn granted(&self, acquisition: Acquisition) -> Result<()> {
        match acquisition {
            Acquisition::Granted => Ok(()),
            Acquisition::Terminated => Err(LockError::ClientStopped {
                transaction: self.transaction,
            }),
        }
    }

    fn not_held(&self, key: ResourceKey) -> LockError {
        error!("{} released {} which it does not hold", self.transaction, key);
        LockError::LockNotFound {
            resource: key,
            transaction: self.transaction,
        }
    }
}

impl Drop for LockClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for LockClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClient")
            .field("transaction", &self.transaction)
            .field("stopped", &self.state.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::deadlock::NoDeadlockDetection;

    fn client() -> (Arc<LockManager>, LockClient) {
        let manager = Arc::new(LockManager::new(
            Arc::new(NoDeadlockDetection),
            LockConfig::default(),
        ));
        let client = LockClient::new(Arc::clone(&manager));
        (manager, client)
    }

    #[test]
    fn test_repeated_acquire_reaches_manager_once() {
        let (manager, client) = client();
        client.acquire_exclusive(ResourceType::Node, &[1]).unwrap();
        client.acquire_exclusive(ResourceType::Node, &[1]).unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot[0].holders,
            vec![crate::lock::HolderSnapshot::Plain {
                transaction: client.transaction_id(),
                read_count: 0,
                write_count: 1,
            }]
        );
    }

    #[test]
    fn test_release_of_unheld_identity() {
        let (_manager, client) = client();
        let err = client.release_shared(ResourceType::Node, &[9]).unwrap_err();
        assert!(matches!(err, LockError::LockNotFound { .. }));
    }

    #[test]
    fn test_temporal_release_needs_held_interval() {
        let (_manager, client) = client();
        client
            .acquire_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 0, 10)
            .unwrap();

        let err = client
            .release_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 0, 5)
            .unwrap_err();
        assert!(matches!(err, LockError::LockNotFound { .. }));
    }

    #[test]
    fn test_new_interval_is_forwarded() {
        let (manager, client) = client();
        let key = ResourceKey::temporal(ResourceType::NodeTemporalProp, 1, 5);
        client
            .acquire_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 0, 2)
            .unwrap();
        client
            .acquire_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 6, 8)
            .unwrap();
        client
            .acquire_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 6, 8)
            .unwrap();

        let mut intervals = None;
        manager.accept(|lock| {
            if *lock.resource() == key {
                intervals = lock.as_temporal().ok().map(|l| l.read_intervals());
            }
        });
        assert_eq!(intervals.map(|l| l.len()), Some(2));

        // three references, so two releases keep everything
        for _ in 0..2 {
            client
                .release_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 6, 8)
                .unwrap();
        }
        assert_eq!(manager.lock_count(), 1);
        client
            .release_temporal_prop_shared(ResourceType::NodeTemporalProp, 1, 5, 0, 2)
            .unwrap();
        assert_eq!(manager.lock_count(), 0);
    }

    #[test]
    fn test_stopped_client_refuses_work() {
        let (_manager, client) = client();
        client.stop();
        assert!(matches!(
            client.try_exclusive_lock(ResourceType::Node, 1),
            Err(LockError::ClientStopped { .. })
        ));
        assert!(client.is_stopped());
    }

    #[test]
    fn test_drop_releases_locks() {
        let (manager, client) = client();
        client.acquire_shared(ResourceType::Relationship, &[1, 2]).unwrap();
        client
            .acquire_temporal_prop_exclusive(ResourceType::RelationshipTemporalProp, 3, 1, 40)
            .unwrap();
        assert_eq!(manager.lock_count(), 3);

        drop(client);
        assert_eq!(manager.lock_count(), 0);
    }
}
