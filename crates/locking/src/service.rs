//! Lock service
//!
//! [`Locks`] bundles one [`LockManager`] with its configuration and hands out
//! clients. The application constructs it, passes it by reference to whoever
//! needs locks, and closes it on shutdown.

use crate::client::LockClient;
use crate::config::LockConfig;
use crate::deadlock::DeadlockDetector;
use crate::error::{LockError, Result};
use crate::lock::ResourceLock;
use crate::manager::LockManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tgraph_common::TransactionId;
use tracing::debug;

pub struct Locks {
    manager: Arc<LockManager>,
    closed: AtomicBool,
}

impl Locks {
    pub fn new(config: LockConfig, detector: Arc<dyn DeadlockDetector>) -> Self {
        Self {
            manager: Arc::new(LockManager::new(detector, config)),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a client for a new transaction
    pub fn new_client(&self) -> Result<LockClient> {
        self.new_client_for(TransactionId::new())
    }

    /// Open a client for an existing transaction id
    pub fn new_client_for(&self, transaction: TransactionId) -> Result<LockClient> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LockError::ServiceClosed);
        }
        Ok(LockClient::with_transaction(
            Arc::clone(&self.manager),
            transaction,
        ))
    }

    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    /// Visit every live resource lock
    pub fn accept<F>(&self, visitor: F)
    where
        F: FnMut(&ResourceLock),
    {
        self.manager.accept(visitor);
    }

    /// Stop handing out clients. Existing clients keep working until closed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(
                "Lock service closed with {} live locks",
                self.manager.lock_count()
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadlock::NoDeadlockDetection;

    #[test]
    fn test_no_clients_after_close() {
        let locks = Locks::new(LockConfig::default(), Arc::new(NoDeadlockDetection));
        let client = locks.new_client().unwrap();

        locks.close();
        locks.close();
        assert!(locks.is_closed());
        assert!(matches!(locks.new_client(), Err(LockError::ServiceClosed)));

        // clients opened before close still work
        assert!(client.try_shared_lock(tgraph_common::ResourceType::Node, 1).unwrap());
    }

    #[test]
    fn test_services_are_isolated() {
        let a = Locks::new(LockConfig::default(), Arc::new(NoDeadlockDetection));
        let b = Locks::new(LockConfig::default(), Arc::new(NoDeadlockDetection));
        let client = a.new_client().unwrap();
        client
            .acquire_exclusive(tgraph_common::ResourceType::Schema, &[0])
            .unwrap();

        assert_eq!(a.manager().lock_count(), 1);
        assert_eq!(b.manager().lock_count(), 0);
    }
}
